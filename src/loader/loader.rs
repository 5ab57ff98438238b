use std::fs;

use regex::{Captures, Regex};
use thiserror::Error;

use crate::instructions::instructions::{get_opcode, get_register, Instr, Opcode, Program, REGISTER_COUNT, RegisterType, SourceLocation, WordType};
use crate::memory_subsystem::memory_subsystem::MemoryEntry;

// ADDI, LOAD, STORE and BEQ carry a 5-bit signed immediate, CALL a 7-bit one.
const IMM_RANGE: (WordType, WordType) = (-16, 15);
const CALL_RANGE: (WordType, WordType) = (-64, 63);

const REG: &str = r"(R\d+)";
const IMM: &str = r"([+-]?\d+)";

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("{loc}: {msg}")]
    ParseError { loc: SourceLocation, msg: String },
    #[error("{}", .0.join("\n"))]
    AnalysisError(Vec<String>),
    #[error("failed to read '{path}': {source}")]
    IOError { path: String, source: std::io::Error },
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

struct Patterns {
    reg3: Regex,
    reg2_imm: Regex,
    memory: Regex,
    call: Regex,
    ret: Regex,
}

impl Patterns {
    fn new() -> Result<Self, LoadError> {
        let sep = r"\s*,\s*";
        Ok(Patterns {
            reg3: Regex::new(&format!(r"(?i)^\w+\s+{REG}{sep}{REG}{sep}{REG}$"))?,
            reg2_imm: Regex::new(&format!(r"(?i)^\w+\s+{REG}{sep}{REG}{sep}{IMM}$"))?,
            memory: Regex::new(&format!(r"(?i)^\w+\s+{REG}{sep}{IMM}\s*\(\s*{REG}\s*\)$"))?,
            call: Regex::new(&format!(r"(?i)^\w+\s+{IMM}$"))?,
            ret: Regex::new(r"(?i)^\w+$")?,
        })
    }
}

struct Loader {
    patterns: Patterns,
    code: Vec<Instr>,
    errors: Vec<String>,
}

impl Loader {
    fn load(&mut self, src: &str) -> Result<(), LoadError> {
        for (line_index, raw_line) in src.lines().enumerate() {
            let line = strip_comment(raw_line);
            let text = line.trim();
            if text.is_empty() {
                continue;
            }

            let loc = SourceLocation {
                line: line_index + 1,
                column: line.len() - line.trim_start().len() + 1,
            };
            let instr = self.parse_line(text, loc)?;
            self.code.push(instr);
        }
        Ok(())
    }

    fn parse_line(&mut self, text: &str, loc: SourceLocation) -> Result<Instr, LoadError> {
        let mnemonic = text.split_whitespace().next().unwrap_or("");
        let opcode = get_opcode(mnemonic).ok_or_else(|| LoadError::ParseError {
            loc,
            msg: format!("Unknown opcode '{}'", mnemonic),
        })?;

        let pattern = match opcode {
            Opcode::ADD | Opcode::MUL | Opcode::NOR => &self.patterns.reg3,
            Opcode::ADDI | Opcode::BEQ => &self.patterns.reg2_imm,
            Opcode::LOAD | Opcode::STORE => &self.patterns.memory,
            Opcode::CALL => &self.patterns.call,
            Opcode::RET => &self.patterns.ret,
        };

        let captures = pattern.captures(text).ok_or_else(|| LoadError::ParseError {
            loc,
            msg: format!("Malformed operands in '{}'", text),
        })?;

        let instr = match opcode {
            Opcode::ADD => Instr::ADD {
                rd: self.register(&captures, 1, loc),
                rs: self.register(&captures, 2, loc),
                rt: self.register(&captures, 3, loc),
            },
            Opcode::MUL => Instr::MUL {
                rd: self.register(&captures, 1, loc),
                rs: self.register(&captures, 2, loc),
                rt: self.register(&captures, 3, loc),
            },
            Opcode::NOR => Instr::NOR {
                rd: self.register(&captures, 1, loc),
                rs: self.register(&captures, 2, loc),
                rt: self.register(&captures, 3, loc),
            },
            Opcode::ADDI => Instr::ADDI {
                rd: self.register(&captures, 1, loc),
                rs: self.register(&captures, 2, loc),
                imm: self.immediate(&captures, 3, IMM_RANGE, loc)?,
            },
            Opcode::BEQ => Instr::BEQ {
                rs: self.register(&captures, 1, loc),
                rt: self.register(&captures, 2, loc),
                offset: self.immediate(&captures, 3, IMM_RANGE, loc)?,
            },
            Opcode::LOAD => Instr::LOAD {
                rd: self.register(&captures, 1, loc),
                offset: self.immediate(&captures, 2, IMM_RANGE, loc)?,
                rs: self.register(&captures, 3, loc),
            },
            Opcode::STORE => Instr::STORE {
                rt: self.register(&captures, 1, loc),
                offset: self.immediate(&captures, 2, IMM_RANGE, loc)?,
                rs: self.register(&captures, 3, loc),
            },
            Opcode::CALL => Instr::CALL { offset: self.immediate(&captures, 1, CALL_RANGE, loc)? },
            Opcode::RET => Instr::RET,
        };
        Ok(instr)
    }

    // Out of range registers are collected so that all of them are reported at once.
    fn register(&mut self, captures: &Captures, group: usize, loc: SourceLocation) -> RegisterType {
        let name = captures.get(group).map_or("", |m| m.as_str());
        match get_register(name) {
            Some(reg) if reg < REGISTER_COUNT as u32 => reg as RegisterType,
            _ => {
                self.errors.push(format!("Illegal register '{}' at [{}]", name, loc));
                0
            }
        }
    }

    fn immediate(&mut self,
                 captures: &Captures,
                 group: usize,
                 range: (WordType, WordType),
                 loc: SourceLocation) -> Result<WordType, LoadError> {
        let text = captures.get(group).map_or("", |m| m.as_str());
        let value: WordType = text.parse().map_err(|_| LoadError::ParseError {
            loc,
            msg: format!("Invalid immediate '{}'", text),
        })?;

        if value < range.0 || value > range.1 {
            self.errors.push(format!("Immediate {} out of range [{}, {}] at [{}]", value, range.0, range.1, loc));
        }
        Ok(value)
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn read(path: &str) -> Result<String, LoadError> {
    fs::read_to_string(path).map_err(|source| LoadError::IOError { path: path.to_string(), source })
}

pub fn load(path: &str) -> Result<Program, LoadError> {
    load_from_string(&read(path)?)
}

/// Parses a program, one instruction per line. Mnemonics and register names are case
/// insensitive; blank lines and `#` comments are skipped.
pub fn load_from_string(src: &str) -> Result<Program, LoadError> {
    let mut loader = Loader {
        patterns: Patterns::new()?,
        code: Vec::new(),
        errors: Vec::new(),
    };

    loader.load(src)?;

    if !loader.errors.is_empty() {
        return Err(LoadError::AnalysisError(loader.errors));
    }
    Ok(Program::new(loader.code))
}

pub fn load_memory(path: &str) -> Result<Vec<MemoryEntry>, LoadError> {
    load_memory_from_string(&read(path)?)
}

/// Parses a memory image with one `address value` pair per line.
pub fn load_memory_from_string(src: &str) -> Result<Vec<MemoryEntry>, LoadError> {
    let pattern = Regex::new(&format!(r"^{IMM}\s+{IMM}$"))?;
    let mut entries = Vec::new();

    for (line_index, raw_line) in src.lines().enumerate() {
        let line = strip_comment(raw_line);
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        let loc = SourceLocation { line: line_index + 1, column: line.len() - line.trim_start().len() + 1 };
        let parse_error = || LoadError::ParseError { loc, msg: format!("Expected 'address value', found '{}'", text) };

        let captures = pattern.captures(text).ok_or_else(parse_error)?;
        let address = captures[1].parse().map_err(|_| parse_error())?;
        let value = captures[2].parse().map_err(|_| parse_error())?;
        entries.push(MemoryEntry { address, value });
    }

    Ok(entries)
}
