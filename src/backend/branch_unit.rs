use serde::Serialize;

use crate::backend::reservation_station::StationTag;
use crate::cpu::EngineError;
use crate::instructions::instructions::{Instr, WordType};

/// The prediction and outcome of a single dynamic branch.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub struct BranchState {
    // always false: the predictor is static not-taken
    pub predicted_taken: bool,
    pub taken: Option<bool>,
    pub mispredicted: bool,
    pub target: Option<WordType>,
}

impl BranchState {
    fn predicted() -> Self {
        BranchState { predicted_taken: false, taken: None, mispredicted: false, target: None }
    }
}

pub(crate) struct InFlightBranch {
    pub(crate) tag: StationTag,
    pub(crate) seq: u64,
}

/// A control instruction whose result was broadcast this cycle.
pub(crate) struct Resolution {
    pub(crate) seq: u64,
    pub(crate) tag: StationTag,
    pub(crate) instr: Instr,
    pub(crate) pc: usize,
    pub(crate) result: WordType,
}

/// Tracks the single in-flight conditional branch and the stack of return addresses.
pub(crate) struct BranchUnit {
    in_flight: Option<InFlightBranch>,
    call_stack: Vec<WordType>,
}

impl BranchUnit {
    pub(crate) fn new() -> Self {
        BranchUnit { in_flight: None, call_stack: Vec::new() }
    }

    pub(crate) fn predict(&mut self, tag: StationTag, seq: u64) -> BranchState {
        debug_assert!(self.in_flight.is_none());
        self.in_flight = Some(InFlightBranch { tag, seq });
        BranchState::predicted()
    }

    pub(crate) fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub(crate) fn in_flight(&self) -> Option<&InFlightBranch> {
        self.in_flight.as_ref()
    }

    /// Compares the outcome of the in-flight BEQ with the prediction. The offset is relative
    /// to the instruction after the branch.
    pub(crate) fn resolve(&mut self, resolution: &Resolution) -> Result<BranchState, EngineError> {
        let in_flight = self.in_flight.take().ok_or_else(|| {
            EngineError::InvariantViolation(format!("{} resolved without a branch in flight", resolution.tag))
        })?;

        if in_flight.seq != resolution.seq || in_flight.tag != resolution.tag {
            return Err(EngineError::InvariantViolation(format!(
                "resolved branch {} does not match the in-flight branch {}", resolution.tag, in_flight.tag)));
        }

        let taken = resolution.result != 0;
        Ok(BranchState {
            predicted_taken: false,
            taken: Some(taken),
            mispredicted: taken,
            target: Some(resolution.pc as WordType + 1 + resolution.instr.immediate()),
        })
    }

    pub(crate) fn push_call(&mut self, return_address: WordType) {
        self.call_stack.push(return_address);
    }

    pub(crate) fn pop_return(&mut self) -> Option<WordType> {
        self.call_stack.pop()
    }

    pub(crate) fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    pub(crate) fn flush(&mut self) {
        self.in_flight = None;
        self.call_stack.clear();
    }
}
