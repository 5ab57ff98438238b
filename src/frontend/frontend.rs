use std::rc::Rc;

use log::debug;

use crate::instructions::instructions::{Instr, Program, WordType};

/// Supplies instructions in program order. The frontend has no fetch or decode latency:
/// the instruction at the program counter is available to issue every cycle.
pub(crate) struct Frontend {
    program: Rc<Program>,
    pc: WordType,
    // a CALL or RET was issued and the next pc is unknown until it commits
    awaiting_jump: bool,
    exit: bool,
}

impl Frontend {
    pub(crate) fn new(program: &Rc<Program>) -> Frontend {
        Frontend {
            program: Rc::clone(program),
            pc: program.entry_point as WordType,
            awaiting_jump: false,
            exit: false,
        }
    }

    pub(crate) fn pc(&self) -> WordType {
        self.pc
    }

    /// The next instruction to issue with its program index, or None when the frontend
    /// is waiting for a jump, has exited or ran past the end of the program.
    pub(crate) fn peek(&self) -> Option<(usize, Instr)> {
        if self.exit || self.awaiting_jump || self.pc < 0 {
            return None;
        }

        let pc = self.pc as usize;
        self.program.get_instr(pc).map(|instr| (pc, instr))
    }

    pub(crate) fn advance(&mut self) {
        self.pc += 1;
    }

    pub(crate) fn redirect(&mut self, target: WordType) {
        debug!("Frontend: redirect from {} to {}", self.pc, target);
        self.pc = target;
        self.awaiting_jump = false;
    }

    pub(crate) fn await_jump(&mut self) {
        self.awaiting_jump = true;
    }

    pub(crate) fn is_awaiting_jump(&self) -> bool {
        self.awaiting_jump
    }

    pub(crate) fn exit(&mut self) {
        debug!("Frontend: exit at {}", self.pc);
        self.exit = true;
        self.awaiting_jump = false;
    }
}
