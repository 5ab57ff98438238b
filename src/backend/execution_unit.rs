use crate::backend::reservation_station::RS;
use crate::cpu::EngineError;
use crate::instructions::instructions::{Instr, WordType};
use crate::memory_subsystem::memory_subsystem::MemoryImage;

// MUL keeps the least significant 16 bits of the product.
const MUL_MASK: WordType = 0xFFFF;

/// A single functional unit of a station class.
pub(crate) struct EU {
    pub(crate) rs_index: Option<u16>,
    pub(crate) state: EUState,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum EUState {
    IDLE,
    EXECUTING,
}

#[allow(non_snake_case)]
impl EU {
    fn reset(&mut self) {
        self.rs_index = None;
        self.state = EUState::IDLE;
    }

    /// Computes the result of a station whose execution latency has elapsed. A STORE has
    /// no result of its own: its data operand is taken at broadcast.
    pub(crate) fn execute(rs: &RS, memory: &MemoryImage) -> Result<Option<WordType>, EngineError> {
        let instr = rs.instr.ok_or_else(|| {
            EngineError::InvariantViolation(format!("{} executed without an instruction", rs.tag))
        })?;

        let result = match instr {
            Instr::ADD { .. } => Self::execute_ADD(rs)?,
            Instr::ADDI { .. } => Self::execute_ADDI(rs)?,
            Instr::MUL { .. } => Self::execute_MUL(rs)?,
            Instr::NOR { .. } => Self::execute_NOR(rs)?,
            Instr::LOAD { .. } => Self::execute_LOAD(rs, memory)?,
            Instr::STORE { .. } => return Ok(None),
            Instr::BEQ { .. } => Self::execute_BEQ(rs)?,
            Instr::CALL { .. } => rs.pc as WordType + 1,
            Instr::RET => Self::source(rs, 0)?,
        };
        Ok(Some(result))
    }

    fn source(rs: &RS, source_index: usize) -> Result<WordType, EngineError> {
        rs.value(source_index).ok_or_else(|| {
            EngineError::InvariantViolation(format!("{} executed with unresolved operand {}", rs.tag, source_index))
        })
    }

    fn execute_ADD(rs: &RS) -> Result<WordType, EngineError> {
        Ok(Self::source(rs, 0)?.wrapping_add(Self::source(rs, 1)?))
    }

    fn execute_ADDI(rs: &RS) -> Result<WordType, EngineError> {
        Ok(Self::source(rs, 0)?.wrapping_add(rs.imm))
    }

    fn execute_MUL(rs: &RS) -> Result<WordType, EngineError> {
        Ok(Self::source(rs, 0)?.wrapping_mul(Self::source(rs, 1)?) & MUL_MASK)
    }

    fn execute_NOR(rs: &RS) -> Result<WordType, EngineError> {
        Ok(!(Self::source(rs, 0)? | Self::source(rs, 1)?))
    }

    fn execute_LOAD(rs: &RS, memory: &MemoryImage) -> Result<WordType, EngineError> {
        let address = rs.address.ok_or_else(|| {
            EngineError::InvariantViolation(format!("{} loaded without an address", rs.tag))
        })?;
        Ok(memory.read(address))
    }

    fn execute_BEQ(rs: &RS) -> Result<WordType, EngineError> {
        let equal = Self::source(rs, 0)? == Self::source(rs, 1)?;
        Ok(if equal { 1 } else { 0 })
    }
}

/// Splits the ready stations of one class into those that start executing this cycle and
/// those that keep waiting for a unit. The oldest instructions in program order go first.
/// Candidates are `(seq, rs_index)` pairs.
pub(crate) fn schedule(mut candidates: Vec<(u64, u16)>, idle_units: usize) -> (Vec<u16>, Vec<u16>) {
    candidates.sort_by_key(|&(seq, _)| seq);
    let split = idle_units.min(candidates.len());
    let waiting = candidates.split_off(split);
    (
        candidates.into_iter().map(|(_, rs_index)| rs_index).collect(),
        waiting.into_iter().map(|(_, rs_index)| rs_index).collect(),
    )
}

/// The functional units of one station class.
pub(crate) struct EUTable {
    pub(crate) capacity: u8,
    idle_stack: Vec<u8>,
    array: Vec<EU>,
}

impl EUTable {
    pub(crate) fn new(capacity: u8) -> EUTable {
        let mut idle_stack = Vec::with_capacity(capacity as usize);
        let mut array = Vec::with_capacity(capacity as usize);
        // popped from the back, so the lowest index is handed out first
        for i in (0..capacity).rev() {
            idle_stack.push(i);
        }
        for _ in 0..capacity {
            array.push(EU { rs_index: None, state: EUState::IDLE });
        }

        EUTable { capacity, array, idle_stack }
    }

    pub(crate) fn flush(&mut self) {
        self.idle_stack.clear();
        for k in (0..self.capacity).rev() {
            self.idle_stack.push(k);
        }
        for eu in self.array.iter_mut() {
            eu.reset();
        }
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle_stack.len()
    }

    pub(crate) fn get(&self, eu_index: u8) -> &EU {
        &self.array[eu_index as usize]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item=&EU> {
        self.array.iter()
    }

    pub(crate) fn allocate(&mut self, rs_index: u16) -> Option<u8> {
        let eu_index = self.idle_stack.pop()?;
        let eu = &mut self.array[eu_index as usize];
        debug_assert!(eu.state == EUState::IDLE);
        debug_assert!(eu.rs_index.is_none());

        eu.state = EUState::EXECUTING;
        eu.rs_index = Some(rs_index);
        Some(eu_index)
    }

    pub(crate) fn deallocate(&mut self, eu_index: u8) {
        let eu = &mut self.array[eu_index as usize];
        debug_assert!(eu.state == EUState::EXECUTING);
        debug_assert!(!self.idle_stack.contains(&eu_index));

        eu.reset();
        self.idle_stack.push(eu_index);
    }
}
