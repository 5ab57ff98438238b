use crate::backend::reservation_station::{Operand, StationTag};
use crate::cpu::{ArgRegFile, EngineError};
use crate::instructions::instructions::{RegisterType, REGISTER_COUNT, WordType};

/// The Register Alias Table. The entry for an architectural register names the
/// reservation station that will produce its next value. An empty entry means the
/// value is resident in the architectural register file.
///
/// While a branch is in flight a checkpoint of the table is kept. A misprediction
/// restores it; a correct prediction discards it.
pub(crate) struct RAT {
    pub(crate) table: Vec<Option<StationTag>>,
    checkpoint: Option<Vec<Option<StationTag>>>,
}

impl RAT {
    pub fn new() -> Self {
        Self {
            table: vec![None; REGISTER_COUNT as usize],
            checkpoint: None,
        }
    }

    pub(crate) fn check(reg: RegisterType) -> Result<(), EngineError> {
        if reg >= REGISTER_COUNT {
            return Err(EngineError::InvalidOperand(reg));
        }
        Ok(())
    }

    pub fn get(&self, reg: RegisterType) -> Result<Option<StationTag>, EngineError> {
        Self::check(reg)?;
        Ok(self.table[reg as usize])
    }

    /// Reads the current producer of a register.
    pub fn rename(&self, reg: RegisterType, arch_reg_file: &ArgRegFile) -> Result<Operand, EngineError> {
        match self.get(reg)? {
            Some(tag) => Ok(Operand::Pending(tag)),
            None => Ok(Operand::Value(arch_reg_file.get_value(reg))),
        }
    }

    /// Makes `tag` the newest producer of `reg`. R0 is never renamed.
    pub fn bind(&mut self, reg: RegisterType, tag: StationTag) -> Result<(), EngineError> {
        Self::check(reg)?;
        if reg != 0 {
            self.table[reg as usize] = Some(tag);
        }
        Ok(())
    }

    /// Clears every entry still naming `tag`, in the live table and in the checkpoint.
    pub fn resolve(&mut self, tag: StationTag) {
        for entry in self.table.iter_mut() {
            if *entry == Some(tag) {
                *entry = None;
            }
        }

        if let Some(checkpoint) = self.checkpoint.as_mut() {
            for entry in checkpoint.iter_mut() {
                if *entry == Some(tag) {
                    *entry = None;
                }
            }
        }
    }

    /// Writes back the result of `tag` into `reg`. The architectural register is only
    /// updated when no newer producer was bound in the meantime; a producer that was only
    /// overwritten by speculative bindings still counts because the checkpoint names it.
    /// Returns true when the register file was written.
    pub fn commit(&mut self,
                  reg: RegisterType,
                  tag: StationTag,
                  value: WordType,
                  arch_reg_file: &mut ArgRegFile) -> Result<bool, EngineError> {
        Self::check(reg)?;

        let live = self.table[reg as usize] == Some(tag);
        let checkpointed = self.checkpoint
            .as_ref()
            .map_or(false, |checkpoint| checkpoint[reg as usize] == Some(tag));

        self.resolve(tag);

        if live || checkpointed {
            arch_reg_file.set_value(reg, value);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn checkpoint(&mut self) {
        self.checkpoint = Some(self.table.clone());
    }

    pub fn has_checkpoint(&self) -> bool {
        self.checkpoint.is_some()
    }

    pub(crate) fn checkpoint_entries(&self) -> Option<&Vec<Option<StationTag>>> {
        self.checkpoint.as_ref()
    }

    pub fn restore(&mut self) {
        if let Some(checkpoint) = self.checkpoint.take() {
            self.table = checkpoint;
        }
    }

    pub fn discard_checkpoint(&mut self) {
        self.checkpoint = None;
    }

    pub fn flush(&mut self) {
        for entry in self.table.iter_mut() {
            *entry = None;
        }
        self.checkpoint = None;
    }
}
