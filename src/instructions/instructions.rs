use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::branch_unit::BranchState;
use crate::backend::reservation_station::StationTag;

pub type RegisterType = u16;
pub type WordType = i64;

// R0 is hard-wired to zero.
pub const REGISTER_COUNT: u16 = 8;
// CALL writes the return address into R1 and RET jumps to it.
pub const LINK_REG: RegisterType = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum Opcode {
    ADD,
    ADDI,
    MUL,
    NOR,
    LOAD,
    STORE,
    BEQ,
    CALL,
    RET,
}

pub fn mnemonic(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::ADD => "ADD",
        Opcode::ADDI => "ADDI",
        Opcode::MUL => "MUL",
        Opcode::NOR => "NOR",
        Opcode::LOAD => "LOAD",
        Opcode::STORE => "STORE",
        Opcode::BEQ => "BEQ",
        Opcode::CALL => "CALL",
        Opcode::RET => "RET",
    }
}

pub fn get_opcode(mnemonic: &str) -> Option<Opcode> {
    let string = mnemonic.to_uppercase();

    match string.as_str() {
        "ADD" => Some(Opcode::ADD),
        "ADDI" => Some(Opcode::ADDI),
        "MUL" => Some(Opcode::MUL),
        "NOR" => Some(Opcode::NOR),
        "LOAD" => Some(Opcode::LOAD),
        "STORE" => Some(Opcode::STORE),
        "BEQ" => Some(Opcode::BEQ),
        "CALL" => Some(Opcode::CALL),
        "RET" => Some(Opcode::RET),
        _ => None,
    }
}

/// Parses a register name like `R3` or `r3`. Returns None when the name is not a
/// register at all; the range check is left to the caller so it can report the line.
pub fn get_register(name: &str) -> Option<u32> {
    let name_uppercased = name.trim().to_uppercase();
    let number = name_uppercased.strip_prefix('R')?;
    number.parse().ok()
}

/// The reservation station pool an instruction is issued to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum StationClass {
    LOAD,
    STORE,
    BEQ,
    JUMP,
    ADD,
    MUL,
    NOR,
}

impl StationClass {
    pub const ALL: [StationClass; 7] = [
        StationClass::LOAD,
        StationClass::STORE,
        StationClass::BEQ,
        StationClass::JUMP,
        StationClass::ADD,
        StationClass::MUL,
        StationClass::NOR,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            StationClass::LOAD => "Load",
            StationClass::STORE => "Store",
            StationClass::BEQ => "Beq",
            StationClass::JUMP => "Jump",
            StationClass::ADD => "Add",
            StationClass::MUL => "Mul",
            StationClass::NOR => "Nor",
        }
    }

    pub fn is_memory(self) -> bool {
        matches!(self, StationClass::LOAD | StationClass::STORE)
    }
}

/// A decoded instruction. Each opcode carries exactly the fields it uses.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum Instr {
    ADD { rd: RegisterType, rs: RegisterType, rt: RegisterType },
    ADDI { rd: RegisterType, rs: RegisterType, imm: WordType },
    MUL { rd: RegisterType, rs: RegisterType, rt: RegisterType },
    NOR { rd: RegisterType, rs: RegisterType, rt: RegisterType },
    LOAD { rd: RegisterType, rs: RegisterType, offset: WordType },
    // stores the value of rt at rs + offset
    STORE { rt: RegisterType, rs: RegisterType, offset: WordType },
    BEQ { rs: RegisterType, rt: RegisterType, offset: WordType },
    CALL { offset: WordType },
    RET,
}

impl Instr {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instr::ADD { .. } => Opcode::ADD,
            Instr::ADDI { .. } => Opcode::ADDI,
            Instr::MUL { .. } => Opcode::MUL,
            Instr::NOR { .. } => Opcode::NOR,
            Instr::LOAD { .. } => Opcode::LOAD,
            Instr::STORE { .. } => Opcode::STORE,
            Instr::BEQ { .. } => Opcode::BEQ,
            Instr::CALL { .. } => Opcode::CALL,
            Instr::RET => Opcode::RET,
        }
    }

    pub fn class(&self) -> StationClass {
        match self {
            Instr::ADD { .. } | Instr::ADDI { .. } => StationClass::ADD,
            Instr::MUL { .. } => StationClass::MUL,
            Instr::NOR { .. } => StationClass::NOR,
            Instr::LOAD { .. } => StationClass::LOAD,
            Instr::STORE { .. } => StationClass::STORE,
            Instr::BEQ { .. } => StationClass::BEQ,
            Instr::CALL { .. } | Instr::RET => StationClass::JUMP,
        }
    }

    /// The source registers in operand order (j, k). For memory operations the
    /// first source is always the base register.
    pub fn sources(&self) -> [Option<RegisterType>; 2] {
        match *self {
            Instr::ADD { rs, rt, .. } | Instr::MUL { rs, rt, .. } | Instr::NOR { rs, rt, .. } => [Some(rs), Some(rt)],
            Instr::ADDI { rs, .. } | Instr::LOAD { rs, .. } => [Some(rs), None],
            Instr::STORE { rt, rs, .. } => [Some(rs), Some(rt)],
            Instr::BEQ { rs, rt, .. } => [Some(rs), Some(rt)],
            Instr::CALL { .. } => [None, None],
            Instr::RET => [Some(LINK_REG), None],
        }
    }

    /// The register written at commit. Writes to R0 are discarded, so R0 is never a sink.
    pub fn sink(&self) -> Option<RegisterType> {
        let sink = match *self {
            Instr::ADD { rd, .. }
            | Instr::ADDI { rd, .. }
            | Instr::MUL { rd, .. }
            | Instr::NOR { rd, .. }
            | Instr::LOAD { rd, .. } => Some(rd),
            Instr::CALL { .. } => Some(LINK_REG),
            Instr::STORE { .. } | Instr::BEQ { .. } | Instr::RET => None,
        };
        sink.filter(|&reg| reg != 0)
    }

    pub fn immediate(&self) -> WordType {
        match *self {
            Instr::ADDI { imm, .. } => imm,
            Instr::LOAD { offset, .. }
            | Instr::STORE { offset, .. }
            | Instr::BEQ { offset, .. }
            | Instr::CALL { offset } => offset,
            _ => 0,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Instr::BEQ { .. } | Instr::CALL { .. } | Instr::RET)
    }

    pub fn is_memory(&self) -> bool {
        self.class().is_memory()
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", mnemonic(self.opcode()))?;

        match *self {
            Instr::ADD { rd, rs, rt } | Instr::MUL { rd, rs, rt } | Instr::NOR { rd, rs, rt } =>
                write!(f, " R{}, R{}, R{}", rd, rs, rt),
            Instr::ADDI { rd, rs, imm } => write!(f, " R{}, R{}, {}", rd, rs, imm),
            Instr::LOAD { rd, rs, offset } => write!(f, " R{}, {}(R{})", rd, offset, rs),
            Instr::STORE { rt, rs, offset } => write!(f, " R{}, {}(R{})", rt, offset, rs),
            Instr::BEQ { rs, rt, offset } => write!(f, " R{}, R{}, {}", rs, rt, offset),
            Instr::CALL { offset } => write!(f, " {}", offset),
            Instr::RET => Ok(()),
        }
    }
}

pub struct Program {
    pub code: Vec<Instr>,
    pub entry_point: usize,
}

impl Program {
    pub fn new(code: Vec<Instr>) -> Self {
        Program { code, entry_point: 0 }
    }

    pub fn get_instr(&self, pos: usize) -> Option<Instr> {
        self.code.get(pos).copied()
    }
}

/// The execution record of one dynamic instance of an instruction. Created at issue and
/// never removed; a squashed instance keeps its record with `squashed` set.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InstrRecord {
    pub seq: u64,
    pub pc: usize,
    pub instr: Instr,
    pub tag: StationTag,
    pub issue: u64,
    pub addr_resolved: Option<u64>,
    pub exec_start: Option<u64>,
    pub exec_end: Option<u64>,
    pub write_back: Option<u64>,
    pub speculative: bool,
    pub squashed: bool,
    pub branch: Option<BranchState>,
}

impl InstrRecord {
    pub(crate) fn new(seq: u64, pc: usize, instr: Instr, tag: StationTag, issue: u64, speculative: bool) -> Self {
        InstrRecord {
            seq,
            pc,
            instr,
            tag,
            issue,
            addr_resolved: None,
            exec_start: None,
            exec_end: None,
            write_back: None,
            speculative,
            squashed: false,
            branch: None,
        }
    }

    /// False once the instance wrote back or was squashed; its record no longer changes.
    pub fn is_in_flight(&self) -> bool {
        self.write_back.is_none() && !self.squashed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_sources_base_first() {
        let instr = Instr::STORE { rt: 3, rs: 2, offset: 4 };
        assert_eq!(instr.sources(), [Some(2), Some(3)]);
        assert_eq!(instr.sink(), None);
        assert_eq!(instr.class(), StationClass::STORE);
    }

    #[test]
    fn test_r0_is_never_a_sink() {
        let instr = Instr::ADDI { rd: 0, rs: 1, imm: 3 };
        assert_eq!(instr.sink(), None);
    }

    #[test]
    fn test_call_links_r1() {
        let call = Instr::CALL { offset: 5 };
        assert_eq!(call.sink(), Some(LINK_REG));
        assert_eq!(Instr::RET.sources(), [Some(LINK_REG), None]);
        assert!(call.is_control());
        assert_eq!(call.class(), StationClass::JUMP);
    }

    #[test]
    fn test_display() {
        assert_eq!(Instr::LOAD { rd: 1, rs: 2, offset: -3 }.to_string(), "LOAD R1, -3(R2)");
        assert_eq!(Instr::BEQ { rs: 1, rt: 2, offset: 8 }.to_string(), "BEQ R1, R2, 8");
        assert_eq!(Instr::RET.to_string(), "RET");
    }

    #[test]
    fn test_get_register() {
        assert_eq!(get_register("r7"), Some(7));
        assert_eq!(get_register("R12"), Some(12));
        assert_eq!(get_register("X1"), None);
    }
}
