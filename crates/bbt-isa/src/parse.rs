//! AT&T instruction text parser.
//!
//! Accepts the instruction column of an objdump-style listing, e.g.
//! `lock cmpxchg %rdx,0x8(%rdi)` or `callq ffffffff81000000 <schedule>`.
//! Symbol annotations (`<...>`) and trailing `# ...` comments are dropped.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::operand::{MemoryOperand, Operand};
use crate::reg::RegisterName;

/// Instruction text parse errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty instruction text")]
    Empty,
    #[error("malformed mnemonic '{0}'")]
    BadMnemonic(String),
    #[error("unknown register '%{0}'")]
    UnknownRegister(String),
    #[error("malformed number '{0}'")]
    BadNumber(String),
    #[error("malformed operand '{0}'")]
    BadOperand(String),
    #[error("unbalanced parentheses in '{0}'")]
    Unbalanced(String),
    #[error("{count} operands in '{text}', at most 3 supported")]
    TooManyOperands { count: usize, text: String },
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Maximum explicit operands of any instruction the analysis models.
pub const MAX_OPERANDS: usize = 3;

/// A decoded instruction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Instruction {
    /// Prefix words (`lock`, `rep`, `data16`, segment overrides, ...).
    pub prefixes: Vec<String>,
    /// Lowercase mnemonic including any size suffix (`retq`, `movl`).
    pub mnemonic: String,
    /// Operands in AT&T order: source first, destination last.
    pub operands: Vec<Operand>,
}

impl Instruction {
    /// Parse one instruction.
    pub fn parse(text: &str) -> Result<Self> {
        let text = strip_annotations(text);
        let mut words = text.split_whitespace().peekable();

        let mut prefixes = Vec::new();
        let mnemonic = loop {
            let Some(word) = words.next() else {
                return Err(ParseError::Empty);
            };
            let lower = word.to_ascii_lowercase();
            if words.peek().is_some() && is_prefix(&lower) {
                prefixes.push(lower);
                continue;
            }
            break lower;
        };

        let mnemonic_re = MNEMONIC.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_.]*$").unwrap());
        if !mnemonic_re.is_match(&mnemonic) {
            return Err(ParseError::BadMnemonic(mnemonic));
        }

        let rest: String = words.collect::<Vec<_>>().join("");
        let operands = if rest.is_empty() {
            Vec::new()
        } else {
            split_operands(&rest)?
                .into_iter()
                .map(parse_operand)
                .collect::<Result<Vec<_>>>()?
        };
        if operands.len() > MAX_OPERANDS {
            return Err(ParseError::TooManyOperands {
                count: operands.len(),
                text: text.to_string(),
            });
        }

        Ok(Self {
            prefixes,
            mnemonic,
            operands,
        })
    }

    /// First operand (the source in AT&T order).
    pub fn src(&self) -> Option<&Operand> {
        self.operands.first()
    }

    /// Second operand (the destination of two-operand forms).
    pub fn dst(&self) -> Option<&Operand> {
        self.operands.get(1)
    }

    /// Operand that receives the result: the last one.
    pub fn target(&self) -> Option<&Operand> {
        self.operands.last()
    }

    /// Whether a repeat prefix is present.
    pub fn is_repeated(&self) -> bool {
        self.prefixes
            .iter()
            .any(|p| matches!(p.as_str(), "rep" | "repz" | "repe" | "repnz" | "repne"))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for prefix in &self.prefixes {
            write!(f, "{prefix} ")?;
        }
        f.write_str(&self.mnemonic)?;
        for (i, op) in self.operands.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { "," })?;
            write!(f, "{op}")?;
        }
        Ok(())
    }
}

static MNEMONIC: OnceLock<Regex> = OnceLock::new();
static MEMORY: OnceLock<Regex> = OnceLock::new();

fn is_prefix(word: &str) -> bool {
    matches!(
        word,
        "lock"
            | "rep"
            | "repz"
            | "repe"
            | "repnz"
            | "repne"
            | "data16"
            | "data32"
            | "addr16"
            | "addr32"
            | "notrack"
            | "bnd"
            | "xacquire"
            | "xrelease"
            | "cs"
            | "ds"
            | "es"
            | "fs"
            | "gs"
            | "ss"
    ) || word.starts_with("rex")
}

/// Drop `<symbol+off>` annotations and `#` comments.
fn strip_annotations(text: &str) -> String {
    let text = text.split('#').next().unwrap_or_default();
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '<' => depth += 1,
            '>' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

/// Split on commas that are not inside parentheses.
fn split_operands(text: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(ParseError::Unbalanced(text.to_string()));
                }
            }
            ',' if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ParseError::Unbalanced(text.to_string()));
    }
    parts.push(&text[start..]);
    Ok(parts)
}

fn parse_operand(text: &str) -> Result<Operand> {
    if text.is_empty() {
        return Err(ParseError::BadOperand(text.to_string()));
    }
    let (indirect, body) = match text.strip_prefix('*') {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    if let Some(imm) = body.strip_prefix('$') {
        if indirect {
            return Err(ParseError::BadOperand(text.to_string()));
        }
        return parse_number(imm).map(Operand::Immediate);
    }

    if let Some(name) = body.strip_prefix('%')
        && !name.contains(':')
    {
        return Ok(Operand::Register {
            name: parse_register(name)?,
            indirect,
        });
    }

    if body.contains('(') || body.contains(':') || body.starts_with("0x") || body.starts_with('-') {
        return Ok(Operand::Memory {
            mem: parse_memory(body)?,
            indirect,
        });
    }

    // Bare hex without 0x is how listings print direct branch targets.
    u64::from_str_radix(body, 16)
        .map(Operand::Address)
        .map_err(|_| ParseError::BadOperand(text.to_string()))
}

fn parse_register(name: &str) -> Result<RegisterName> {
    RegisterName::parse(name).ok_or_else(|| ParseError::UnknownRegister(name.to_string()))
}

fn parse_memory(text: &str) -> Result<MemoryOperand> {
    let re = MEMORY.get_or_init(|| {
        Regex::new(
            r"^(?:%([a-z]s):)?(-?(?:0x[0-9a-fA-F]+|[0-9]+))?(?:\((?:%([a-z0-9]+))?(?:,%([a-z0-9]+)(?:,([1248]))?)?\))?$",
        )
        .unwrap()
    });
    let caps = re
        .captures(text)
        .ok_or_else(|| ParseError::BadOperand(text.to_string()))?;

    let segment = caps.get(1).map(|m| m.as_str().to_string());
    let disp = caps.get(2).map(|m| parse_number(m.as_str())).transpose()?.unwrap_or(0);
    let base = caps.get(3).map(|m| parse_register(m.as_str())).transpose()?;
    let index = caps.get(4).map(|m| parse_register(m.as_str())).transpose()?;
    let scale = match caps.get(5) {
        Some(m) => m.as_str().parse().map_err(|_| ParseError::BadNumber(m.as_str().to_string()))?,
        None if index.is_some() => 1,
        None => 0,
    };
    if caps.get(2).is_none() && base.is_none() && index.is_none() {
        return Err(ParseError::BadOperand(text.to_string()));
    }

    Ok(MemoryOperand {
        segment,
        base,
        index,
        scale,
        disp,
    })
}

/// Parse a hex (`0x`) or decimal number, optionally negative. Hex values
/// above `i64::MAX` wrap, matching how listings print sign-extended values.
fn parse_number(text: &str) -> Result<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = if let Some(hex) = digits.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        digits.parse::<u64>()
    }
    .map_err(|_| ParseError::BadNumber(text.to_string()))?;
    let value = magnitude as i64;
    Ok(if negative { value.wrapping_neg() } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::{Reg, Width};

    fn gpr(reg: Reg) -> RegisterName {
        RegisterName::Gpr(reg, Width::Qword)
    }

    #[test]
    fn test_parse_no_operands() {
        let insn = Instruction::parse("retq").unwrap();
        assert_eq!(insn.mnemonic, "retq");
        assert!(insn.operands.is_empty());
        assert!(insn.prefixes.is_empty());
    }

    #[test]
    fn test_parse_register_move() {
        let insn = Instruction::parse("mov    %rsp,%rbp").unwrap();
        assert_eq!(insn.mnemonic, "mov");
        assert_eq!(insn.src().and_then(Operand::full_gpr), Some(Reg::Rsp));
        assert_eq!(insn.dst().and_then(Operand::full_gpr), Some(Reg::Rbp));
    }

    #[test]
    fn test_parse_memory_forms() {
        let insn = Instruction::parse("mov    -0x18(%rbp),%rax").unwrap();
        let mem = insn.src().and_then(Operand::memory).unwrap();
        assert_eq!(mem.base, Some(gpr(Reg::Rbp)));
        assert_eq!(mem.disp, -0x18);

        let insn = Instruction::parse("lea    0x0(,%rax,8),%rdx").unwrap();
        let mem = insn.src().and_then(Operand::memory).unwrap();
        assert_eq!(mem.base, None);
        assert_eq!(mem.index, Some(gpr(Reg::Rax)));
        assert_eq!(mem.scale, 8);

        let insn = Instruction::parse("mov    %gs:0x28,%rax").unwrap();
        let mem = insn.src().and_then(Operand::memory).unwrap();
        assert_eq!(mem.segment.as_deref(), Some("gs"));
        assert_eq!(mem.disp, 0x28);
    }

    #[test]
    fn test_parse_jump_table() {
        let insn = Instruction::parse("jmpq   *0xffffffff81600000(,%rax,8)").unwrap();
        let op = insn.src().unwrap();
        assert!(op.is_indirect());
        let mem = op.memory().unwrap();
        assert_eq!(mem.disp as u64, 0xffff_ffff_8160_0000);
        assert_eq!(mem.index_gpr(), Some(Reg::Rax));
    }

    #[test]
    fn test_parse_branch_with_symbol() {
        let insn = Instruction::parse("callq  ffffffff81000000 <schedule+0x10>").unwrap();
        assert_eq!(insn.src(), Some(&Operand::Address(0xffff_ffff_8100_0000)));
        let insn = Instruction::parse("mov    0x200b(%rip),%rax        # 601040 <x>").unwrap();
        assert_eq!(
            insn.src().and_then(Operand::memory).and_then(|m| m.base.clone()),
            Some(RegisterName::InstructionPointer)
        );
    }

    #[test]
    fn test_parse_prefixes() {
        let insn = Instruction::parse("rep stos %rax,%es:(%rdi)").unwrap();
        assert_eq!(insn.prefixes, vec!["rep"]);
        assert_eq!(insn.mnemonic, "stos");
        assert!(insn.is_repeated());

        let insn = Instruction::parse("data16 nopw %cs:0x0(%rax,%rax,1)").unwrap();
        assert_eq!(insn.prefixes, vec!["data16"]);
        assert!(!insn.is_repeated());
        assert_eq!(insn.mnemonic, "nopw");

        let insn = Instruction::parse("lock cmpxchg %rdx,(%rdi)").unwrap();
        assert_eq!(insn.prefixes, vec!["lock"]);
        assert_eq!(insn.mnemonic, "cmpxchg");
    }

    #[test]
    fn test_parse_immediate_wraps() {
        let insn = Instruction::parse("add    $0xffffffffffffff80,%rsp").unwrap();
        assert_eq!(insn.src().and_then(Operand::immediate), Some(-0x80));
        let insn = Instruction::parse("sub    $0x18,%rsp").unwrap();
        assert_eq!(insn.src().and_then(Operand::immediate), Some(0x18));
    }

    #[test]
    fn test_parse_three_operands() {
        let insn = Instruction::parse("imul   $0x18,%rax,%rdx").unwrap();
        assert_eq!(insn.operands.len(), 3);
        assert_eq!(insn.dst().and_then(Operand::full_gpr), Some(Reg::Rax));
        assert_eq!(insn.target().and_then(Operand::full_gpr), Some(Reg::Rdx));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Instruction::parse("   "), Err(ParseError::Empty));
        assert!(matches!(Instruction::parse("(bad)"), Err(ParseError::BadMnemonic(_))));
        assert!(matches!(
            Instruction::parse("mov %foo,%rax"),
            Err(ParseError::UnknownRegister(_))
        ));
        assert!(matches!(
            Instruction::parse("mov 0x8(%rax,%rbx,3),%rax"),
            Err(ParseError::BadOperand(_))
        ));
        assert!(matches!(
            Instruction::parse("mov (%rax,%rax"),
            Err(ParseError::Unbalanced(_))
        ));
    }

    #[test]
    fn test_display_round_trip_text() {
        let insn = Instruction::parse("mov    %rbx,-0x8(%rbp)").unwrap();
        assert_eq!(insn.to_string(), "mov %rbx,-0x8(%rbp)");
    }
}
