use serde::Serialize;

use crate::backend::reservation_station::StationTag;
use crate::instructions::instructions::WordType;
use LSQEntryState::{ALLOCATED, IDLE, RESOLVED, RETIRED};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum LSQEntryState {
    // not used
    IDLE,
    // allocated at issue; the address is not yet computed
    ALLOCATED,
    // the address is computed
    RESOLVED,
    // the operation is written back; the slot is reclaimed once it reaches the head
    RETIRED,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum MemoryOp {
    LOAD,
    STORE,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub struct LSQEntry {
    pub seq: u64,
    pub op: MemoryOp,
    pub tag: Option<StationTag>,
    pub address: Option<WordType>,
    // the first cycle the address may be compared against
    pub address_avail: u64,
    pub state: LSQEntryState,
}

impl LSQEntry {
    fn idle() -> Self {
        LSQEntry { seq: 0, op: MemoryOp::LOAD, tag: None, address: None, address_avail: 0, state: IDLE }
    }

    fn reset(&mut self) {
        *self = LSQEntry::idle();
    }

    fn in_flight(&self) -> bool {
        matches!(self.state, ALLOCATED | RESOLVED)
    }

    fn blocks(&self, address: WordType, now: u64) -> bool {
        match self.address {
            Some(older_address) => self.address_avail > now || older_address == address,
            None => true,
        }
    }
}

/// The load/store queue, a ring of memory operations in program order. Entries are
/// allocated at issue, resolved when their address is computed and retired at
/// write-back. The head only advances over retired entries.
pub(crate) struct LSQ {
    head: u64,
    tail: u64,
    entries: Vec<LSQEntry>,
    capacity: u16,
}

impl LSQ {
    pub(crate) fn new(capacity: u16) -> LSQ {
        LSQ {
            capacity,
            head: 0,
            tail: 0,
            entries: vec![LSQEntry::idle(); capacity as usize],
        }
    }

    pub(crate) fn size(&self) -> u16 {
        (self.tail - self.head) as u16
    }

    pub(crate) fn has_space(&self) -> bool {
        self.size() < self.capacity
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tail == self.head
    }

    fn to_index(&self, position: u64) -> usize {
        (position % self.capacity as u64) as usize
    }

    pub(crate) fn get(&self, index: u16) -> &LSQEntry {
        &self.entries[index as usize]
    }

    pub(crate) fn allocate(&mut self, seq: u64, op: MemoryOp, tag: StationTag) -> Option<u16> {
        if !self.has_space() {
            return None;
        }

        let index = self.to_index(self.tail);
        self.entries[index] = LSQEntry { seq, op, tag: Some(tag), address: None, address_avail: 0, state: ALLOCATED };
        self.tail += 1;
        Some(index as u16)
    }

    pub(crate) fn resolve_address(&mut self, index: u16, address: WordType, avail: u64) {
        let entry = &mut self.entries[index as usize];
        debug_assert!(entry.state == ALLOCATED);
        entry.address = Some(address);
        entry.address_avail = avail;
        entry.state = RESOLVED;
    }

    /// The in-flight entries older than the entry at `index`, from the head.
    fn older(&self, index: u16) -> impl Iterator<Item=&LSQEntry> {
        let seq = self.entries[index as usize].seq;
        (self.head..self.tail)
            .map(move |position| &self.entries[self.to_index(position)])
            .filter(move |entry| entry.in_flight() && entry.seq < seq)
    }

    /// True when the entry at `index` may access memory in cycle `now`. A load waits for
    /// every older store; a store waits for every older load and store. Waiting ends
    /// once each such entry has a usable address that differs from this one.
    pub(crate) fn may_execute(&self, index: u16, now: u64) -> bool {
        let entry = &self.entries[index as usize];
        let address = match entry.address {
            Some(address) if entry.address_avail <= now => address,
            _ => return false,
        };

        let op = entry.op;
        !self.older(index)
            .filter(|older| op == MemoryOp::STORE || older.op == MemoryOp::STORE)
            .any(|older| older.blocks(address, now))
    }

    pub(crate) fn has_older_store_conflict(&self, index: u16) -> bool {
        let address = self.entries[index as usize].address;
        self.older(index)
            .any(|older| older.op == MemoryOp::STORE && (older.address.is_none() || older.address == address))
    }

    pub(crate) fn retire(&mut self, index: u16) {
        let entry = &mut self.entries[index as usize];
        debug_assert!(entry.state == RESOLVED);
        entry.state = RETIRED;

        while self.head < self.tail {
            let head_index = self.to_index(self.head);
            if self.entries[head_index].state != RETIRED {
                break;
            }
            self.entries[head_index].reset();
            self.head += 1;
        }
    }

    /// Drops every entry younger than `seq`. Such entries were issued after the branch
    /// and always form the tail of the ring.
    pub(crate) fn squash_after(&mut self, seq: u64) -> usize {
        let mut squashed = 0;
        while self.tail > self.head {
            let index = self.to_index(self.tail - 1);
            if self.entries[index].seq <= seq {
                break;
            }
            self.entries[index].reset();
            self.tail -= 1;
            squashed += 1;
        }
        squashed
    }

    /// The occupied entries from head to tail, with their slot indices.
    pub(crate) fn iter(&self) -> impl Iterator<Item=(u16, &LSQEntry)> {
        (self.head..self.tail).map(move |position| {
            let index = self.to_index(position);
            (index as u16, &self.entries[index])
        })
    }

    pub(crate) fn flush(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.reset();
        }
        self.head = 0;
        self.tail = 0;
    }
}

#[cfg(test)]
mod tests {
    use crate::instructions::instructions::StationClass;

    use super::*;

    fn tag(class: StationClass, index: u16) -> StationTag {
        StationTag { class, index }
    }

    #[test]
    fn test_full_queue() {
        let mut lsq = LSQ::new(1);
        assert!(lsq.allocate(0, MemoryOp::LOAD, tag(StationClass::LOAD, 0)).is_some());
        assert!(!lsq.has_space());
        assert_eq!(lsq.allocate(1, MemoryOp::LOAD, tag(StationClass::LOAD, 1)), None);
    }

    #[test]
    fn test_load_waits_for_unresolved_store() {
        let mut lsq = LSQ::new(4);
        let store = lsq.allocate(0, MemoryOp::STORE, tag(StationClass::STORE, 0)).unwrap();
        let load = lsq.allocate(1, MemoryOp::LOAD, tag(StationClass::LOAD, 0)).unwrap();
        lsq.resolve_address(load, 8, 3);
        assert!(!lsq.may_execute(load, 3));

        lsq.resolve_address(store, 4, 6);
        assert!(!lsq.may_execute(load, 5));
        assert!(lsq.may_execute(load, 6));
    }

    #[test]
    fn test_load_waits_for_matching_store_to_retire() {
        let mut lsq = LSQ::new(4);
        let store = lsq.allocate(0, MemoryOp::STORE, tag(StationClass::STORE, 0)).unwrap();
        let load = lsq.allocate(1, MemoryOp::LOAD, tag(StationClass::LOAD, 0)).unwrap();
        lsq.resolve_address(store, 4, 2);
        lsq.resolve_address(load, 4, 2);
        assert!(!lsq.may_execute(load, 5));
        assert!(lsq.has_older_store_conflict(load));

        lsq.retire(store);
        assert!(lsq.may_execute(load, 5));
        assert!(!lsq.has_older_store_conflict(load));
    }

    #[test]
    fn test_loads_do_not_order_loads() {
        let mut lsq = LSQ::new(4);
        lsq.allocate(0, MemoryOp::LOAD, tag(StationClass::LOAD, 0)).unwrap();
        let second = lsq.allocate(1, MemoryOp::LOAD, tag(StationClass::LOAD, 1)).unwrap();
        lsq.resolve_address(second, 4, 2);
        assert!(lsq.may_execute(second, 2));
    }

    #[test]
    fn test_store_waits_for_older_load() {
        let mut lsq = LSQ::new(4);
        let load = lsq.allocate(0, MemoryOp::LOAD, tag(StationClass::LOAD, 0)).unwrap();
        let store = lsq.allocate(1, MemoryOp::STORE, tag(StationClass::STORE, 0)).unwrap();
        lsq.resolve_address(store, 4, 2);
        assert!(!lsq.may_execute(store, 2));

        lsq.resolve_address(load, 5, 2);
        assert!(lsq.may_execute(store, 2));
    }

    #[test]
    fn test_head_skips_retired_holes() {
        let mut lsq = LSQ::new(3);
        let first = lsq.allocate(0, MemoryOp::LOAD, tag(StationClass::LOAD, 0)).unwrap();
        let second = lsq.allocate(1, MemoryOp::LOAD, tag(StationClass::LOAD, 1)).unwrap();
        lsq.resolve_address(first, 1, 1);
        lsq.resolve_address(second, 2, 1);

        lsq.retire(second);
        assert_eq!(lsq.size(), 2);
        lsq.retire(first);
        assert!(lsq.is_empty());
    }

    #[test]
    fn test_squash_trims_tail() {
        let mut lsq = LSQ::new(4);
        lsq.allocate(2, MemoryOp::LOAD, tag(StationClass::LOAD, 0)).unwrap();
        lsq.allocate(5, MemoryOp::STORE, tag(StationClass::STORE, 0)).unwrap();
        lsq.allocate(6, MemoryOp::LOAD, tag(StationClass::LOAD, 1)).unwrap();

        assert_eq!(lsq.squash_after(4), 2);
        let seqs: Vec<u64> = lsq.iter().map(|(_, entry)| entry.seq).collect();
        assert_eq!(seqs, vec![2]);
    }
}
