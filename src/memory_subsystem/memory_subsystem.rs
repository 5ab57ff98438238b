use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::cpu::CPUConfig;
use crate::instructions::instructions::WordType;
use crate::memory_subsystem::load_store_queue::LSQ;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub address: WordType,
    pub value: WordType,
}

/// Sparse word-addressed memory. Unwritten addresses read as zero.
pub(crate) struct MemoryImage {
    cells: BTreeMap<WordType, WordType>,
    touched: BTreeSet<WordType>,
}

impl MemoryImage {
    pub(crate) fn new() -> Self {
        MemoryImage { cells: BTreeMap::new(), touched: BTreeSet::new() }
    }

    pub(crate) fn read(&self, address: WordType) -> WordType {
        self.cells.get(&address).copied().unwrap_or(0)
    }

    pub(crate) fn touch(&mut self, address: WordType) {
        self.touched.insert(address);
    }

    pub(crate) fn write(&mut self, address: WordType, value: WordType) {
        self.cells.insert(address, value);
        self.touched.insert(address);
    }

    /// The initialized addresses and every address accessed so far, in address order.
    pub(crate) fn touched(&self) -> Vec<MemoryEntry> {
        self.touched
            .iter()
            .map(|&address| MemoryEntry { address, value: self.read(address) })
            .collect()
    }
}

pub(crate) struct MemorySubsystem {
    pub(crate) memory: MemoryImage,
    pub(crate) lsq: LSQ,
}

impl MemorySubsystem {
    pub fn new(cpu_config: &CPUConfig) -> MemorySubsystem {
        MemorySubsystem {
            memory: MemoryImage::new(),
            lsq: LSQ::new(cpu_config.lsq_capacity()),
        }
    }

    pub(crate) fn init(&mut self, entries: &[MemoryEntry]) {
        self.memory = MemoryImage::new();
        for entry in entries {
            self.memory.write(entry.address, entry.value);
        }
        self.lsq.flush();
    }
}
