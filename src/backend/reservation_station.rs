use std::fmt;
use std::fmt::Display;

use serde::Serialize;

use crate::cpu::StationConfig;
use crate::instructions::instructions::{Instr, Opcode, StationClass, WordType};

/// Identifies a reservation station. Unique within its pool and reused once the
/// station is released.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize)]
pub struct StationTag {
    pub class: StationClass,
    pub index: u16,
}

impl Display for StationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.class.name(), self.index + 1)
    }
}

/// A source operand of a station: either a value or the tag of the station producing it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum Operand {
    Value(WordType),
    Pending(StationTag),
    Unused,
}

impl Operand {
    pub fn value(&self) -> Option<WordType> {
        match self {
            Operand::Value(value) => Some(*value),
            _ => None,
        }
    }

    pub fn pending(&self) -> Option<StationTag> {
        match self {
            Operand::Pending(tag) => Some(*tag),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum RSState {
    IDLE,
    // allocated; waiting for operands, the address or a functional unit
    ISSUED,
    EXECUTING,
    // the result is computed and waits for the result bus
    COMPLETED,
}

// A single reservation station
pub(crate) struct RS {
    pub(crate) tag: StationTag,
    pub(crate) state: RSState,
    pub(crate) instr: Option<Instr>,
    pub(crate) pc: usize,
    pub(crate) seq: u64,
    pub(crate) source: [Operand; 2],
    // the first cycle each source value may be used
    pub(crate) source_avail: [u64; 2],
    pub(crate) imm: WordType,
    pub(crate) address: Option<WordType>,
    pub(crate) address_avail: u64,
    pub(crate) addr_cycles_remaining: u8,
    pub(crate) cycles_remaining: u8,
    pub(crate) result: Option<WordType>,
    pub(crate) completed_cycle: u64,
    pub(crate) speculative: bool,
    pub(crate) eu_index: Option<u8>,
    pub(crate) lsq_index: Option<u16>,
}

impl RS {
    fn new(tag: StationTag) -> Self {
        Self {
            tag,
            state: RSState::IDLE,
            instr: None,
            pc: 0,
            seq: 0,
            source: [Operand::Unused, Operand::Unused],
            source_avail: [0, 0],
            imm: 0,
            address: None,
            address_avail: 0,
            addr_cycles_remaining: 0,
            cycles_remaining: 0,
            result: None,
            completed_cycle: 0,
            speculative: false,
            eu_index: None,
            lsq_index: None,
        }
    }

    fn reset(&mut self) {
        *self = RS::new(self.tag);
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.state != RSState::IDLE
    }

    pub(crate) fn value(&self, source_index: usize) -> Option<WordType> {
        self.source[source_index].value()
    }

    pub(crate) fn operand_available(&self, source_index: usize, now: u64) -> bool {
        match self.source[source_index] {
            Operand::Value(_) => self.source_avail[source_index] <= now,
            Operand::Unused => true,
            Operand::Pending(_) => false,
        }
    }

    /// True when the station may begin executing in cycle `now`. Memory operations need
    /// their address; a store's data operand is only needed to broadcast.
    pub(crate) fn exec_ready(&self, now: u64) -> bool {
        if self.state != RSState::ISSUED {
            return false;
        }

        if self.tag.class.is_memory() {
            return self.address.is_some() && self.address_avail <= now;
        }

        self.operand_available(0, now) && self.operand_available(1, now)
    }

    pub(crate) fn wake(&mut self, tag: StationTag, value: WordType, avail: u64) {
        for source_index in 0..self.source.len() {
            if self.source[source_index] == Operand::Pending(tag) {
                self.source[source_index] = Operand::Value(value);
                self.source_avail[source_index] = avail;
            }
        }
    }
}

/// An owned, read-only copy of a station for snapshots.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct StationView {
    pub tag: StationTag,
    pub busy: bool,
    pub state: RSState,
    pub op: Option<Opcode>,
    pub vj: Option<WordType>,
    pub vk: Option<WordType>,
    pub qj: Option<StationTag>,
    pub qk: Option<StationTag>,
    pub imm: WordType,
    pub address: Option<WordType>,
    pub cycles_remaining: u8,
    pub result: Option<WordType>,
    pub speculative: bool,
}

impl RS {
    pub(crate) fn view(&self) -> StationView {
        StationView {
            tag: self.tag,
            busy: self.is_busy(),
            state: self.state,
            op: self.instr.map(|instr| instr.opcode()),
            vj: self.source[0].value(),
            vk: self.source[1].value(),
            qj: self.source[0].pending(),
            qk: self.source[1].pending(),
            imm: self.imm,
            address: self.address,
            cycles_remaining: self.cycles_remaining,
            result: self.result,
            speculative: self.speculative,
        }
    }
}

impl Display for RS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RS {}", self.tag)?;

        if let Some(instr) = self.instr {
            write!(f, " {}", instr)?;
        }

        for source in self.source.iter() {
            match source {
                Operand::Value(value) => write!(f, " {}", value)?,
                Operand::Pending(tag) => write!(f, " <{}>", tag)?,
                Operand::Unused => {}
            }
        }

        Ok(())
    }
}

/// The pool of reservation stations for one station class.
pub(crate) struct RSTable {
    pub(crate) class: StationClass,
    pub(crate) exec_cycles: u8,
    pub(crate) addr_cycles: u8,
    pub(crate) capacity: u16,
    array: Vec<RS>,
}

impl RSTable {
    pub(crate) fn new(class: StationClass, config: &StationConfig) -> Self {
        let capacity = config.station_count;
        let mut array = Vec::with_capacity(capacity as usize);
        for index in 0..capacity {
            array.push(RS::new(StationTag { class, index }));
        }

        RSTable {
            class,
            exec_cycles: config.exec_cycles,
            addr_cycles: config.addr_cycles,
            capacity,
            array,
        }
    }

    pub(crate) fn get(&self, rs_index: u16) -> &RS {
        &self.array[rs_index as usize]
    }

    pub(crate) fn get_mut(&mut self, rs_index: u16) -> &mut RS {
        &mut self.array[rs_index as usize]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item=&RS> {
        self.array.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item=&mut RS> {
        self.array.iter_mut()
    }

    pub(crate) fn has_idle(&self) -> bool {
        self.array.iter().any(|rs| !rs.is_busy())
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.array.iter().any(|rs| rs.is_busy())
    }

    /// Claims the idle station with the lowest index. Returns None when the pool is
    /// exhausted; the caller stalls issue.
    pub(crate) fn allocate(&mut self) -> Option<StationTag> {
        let addr_cycles = self.addr_cycles;
        let rs = self.array.iter_mut().find(|rs| !rs.is_busy())?;
        rs.state = RSState::ISSUED;
        rs.addr_cycles_remaining = addr_cycles;
        Some(rs.tag)
    }

    pub(crate) fn operands_ready(&self, rs_index: u16) -> bool {
        let rs = self.get(rs_index);
        rs.is_busy() && rs.source.iter().all(|source| source.pending().is_none())
    }

    /// Advances every executing station by one cycle. Stations reaching zero become
    /// COMPLETED and are returned so the caller can compute their results.
    pub(crate) fn tick(&mut self, now: u64) -> Vec<u16> {
        let mut completed = Vec::new();
        for rs in self.array.iter_mut() {
            if rs.state != RSState::EXECUTING {
                continue;
            }

            debug_assert!(rs.cycles_remaining > 0);
            rs.cycles_remaining -= 1;
            if rs.cycles_remaining > 0 {
                continue;
            }

            rs.state = RSState::COMPLETED;
            rs.completed_cycle = now;
            completed.push(rs.tag.index);
        }
        completed
    }

    pub(crate) fn wake(&mut self, tag: StationTag, value: WordType, avail: u64) {
        for rs in self.array.iter_mut().filter(|rs| rs.is_busy()) {
            rs.wake(tag, value, avail);
        }
    }

    pub(crate) fn release(&mut self, rs_index: u16) {
        self.array[rs_index as usize].reset();
    }

    pub(crate) fn flush(&mut self) {
        for rs in self.array.iter_mut() {
            rs.reset();
        }
    }
}
