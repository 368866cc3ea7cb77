//! Text dumps of stack memory and register snapshots.
//!
//! Memory dumps hold one or more words per line:
//!
//! ```text
//! ffffc90000a3fe80: ffffffff8108a1c4 0000000000000000
//! ```
//!
//! Register dumps hold one `name value` pair per line, with an optional
//! `:` or `=` separator. `rip` gives the program counter.

use std::path::Path;
use std::sync::OnceLock;

use bbt_cfg::MemoryReader;
use bbt_isa::{RegisterName, WORD_SIZE};
use regex::Regex;
use rustc_hash::FxHashMap;

use crate::reconstruct::{ActualRegisters, StackWindow};
use crate::{Error, Result};

static REGISTER_LINE: OnceLock<Regex> = OnceLock::new();

fn parse_hex(text: &str) -> Option<u64> {
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(digits, 16).ok()
}

fn format_error(line: usize, message: impl Into<String>) -> Error {
    Error::Format {
        line,
        message: message.into(),
    }
}

/// Strip `#` comments and surrounding whitespace.
fn content(line: &str) -> &str {
    line.split_once('#').map_or(line, |(before, _)| before).trim()
}

/// Word-addressed memory loaded from a dump.
#[derive(Clone, Debug, Default)]
pub struct MemoryImage {
    words: FxHashMap<u64, u64>,
}

impl MemoryImage {
    pub fn parse(text: &str) -> Result<Self> {
        let mut words = FxHashMap::default();
        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = content(line);
            if line.is_empty() {
                continue;
            }
            let (address, values) = line
                .split_once(':')
                .ok_or_else(|| format_error(line_no, "expected 'address: words'"))?;
            let address = parse_hex(address.trim())
                .ok_or_else(|| format_error(line_no, format!("bad address '{address}'")))?;
            for (i, word) in values.split_whitespace().enumerate() {
                let value = parse_hex(word)
                    .ok_or_else(|| format_error(line_no, format!("bad word '{word}'")))?;
                let at = (i as u64)
                    .checked_mul(WORD_SIZE as u64)
                    .and_then(|offset| address.checked_add(offset))
                    .ok_or_else(|| format_error(line_no, "words run past the end of the address space"))?;
                words.insert(at, value);
            }
        }
        Ok(Self { words })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn from_words(words: impl IntoIterator<Item = (u64, u64)>) -> Self {
        Self {
            words: words.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Smallest window covering every word in the image.
    pub fn window(&self) -> Option<StackWindow> {
        let start = *self.words.keys().min()?;
        let end = self.words.keys().max()?.saturating_add(WORD_SIZE as u64);
        Some(StackWindow::new(start, end))
    }
}

impl MemoryReader for MemoryImage {
    fn read_word(&self, address: u64) -> Option<u64> {
        self.words.get(&address).copied()
    }
}

/// Registers and program counter of a stopped thread.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub registers: ActualRegisters,
    pub pc: u64,
}

impl RegisterSnapshot {
    pub fn parse(text: &str) -> Result<Self> {
        let re = REGISTER_LINE
            .get_or_init(|| Regex::new(r"^%?([a-z0-9]+)\s*[:=]?\s*(?:0x)?([0-9a-fA-F]+)$").unwrap());
        let mut registers = ActualRegisters::invalid();
        let mut pc = None;
        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = content(line);
            if line.is_empty() {
                continue;
            }
            let caps = re
                .captures(line)
                .ok_or_else(|| format_error(line_no, format!("expected 'register value', got '{line}'")))?;
            let value = u64::from_str_radix(&caps[2], 16)
                .map_err(|e| format_error(line_no, e.to_string()))?;
            match RegisterName::parse(&caps[1]) {
                Some(RegisterName::InstructionPointer) => pc = Some(value),
                Some(name) => match name.full_gpr() {
                    Some(reg) => registers.set(reg, value),
                    None => return Err(format_error(line_no, format!("'{}' is not a full register", &caps[1]))),
                },
                None => return Err(format_error(line_no, format!("unknown register '{}'", &caps[1]))),
            }
        }
        let pc = pc.ok_or_else(|| format_error(0, "missing rip"))?;
        Ok(Self { registers, pc })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }
}

/// Parse `START-END` as a hex address range.
pub fn parse_window(text: &str) -> Result<StackWindow> {
    let bad = || format_error(0, format!("bad stack window '{text}', expected START-END"));
    let (start, end) = text.split_once('-').ok_or_else(bad)?;
    let start = parse_hex(start.trim()).ok_or_else(bad)?;
    let end = parse_hex(end.trim()).ok_or_else(bad)?;
    if start >= end {
        return Err(bad());
    }
    Ok(StackWindow::new(start, end))
}

#[cfg(test)]
mod tests {
    use bbt_isa::Reg;

    use super::*;
    use crate::reconstruct::ActualValue;

    #[test]
    fn test_memory_image() {
        let image = MemoryImage::parse(
            "# saved frame\n\
             7f00: 0000000000001111 ffffffff81000010\n\
             \n\
             0x7f10: 0xaa\n",
        )
        .unwrap();
        assert_eq!(image.len(), 3);
        assert_eq!(image.read_word(0x7f08), Some(0xffff_ffff_8100_0010));
        assert_eq!(image.read_word(0x7f10), Some(0xaa));
        assert_eq!(image.read_word(0x7f18), None);
        assert_eq!(image.window(), Some(StackWindow::new(0x7f00, 0x7f18)));
    }

    #[test]
    fn test_memory_image_errors() {
        let err = MemoryImage::parse("7f00: 1\n7f08 2\n").unwrap_err();
        assert!(matches!(err, Error::Format { line: 2, .. }));
        let err = MemoryImage::parse("7f00: zz\n").unwrap_err();
        assert_eq!(err.to_string(), "line 1: bad word 'zz'");
    }

    #[test]
    fn test_memory_image_top_of_address_space() {
        let image = MemoryImage::parse("fffffffffffffff8: 1\n").unwrap();
        assert_eq!(image.read_word(u64::MAX - 7), Some(1));
        assert_eq!(
            image.window(),
            Some(StackWindow::new(u64::MAX - 7, u64::MAX))
        );

        let err = MemoryImage::parse("fffffffffffffff8: 1 2\n").unwrap_err();
        assert!(matches!(err, Error::Format { line: 1, .. }));
    }

    #[test]
    fn test_register_snapshot() {
        let snapshot = RegisterSnapshot::parse(
            "rip: ffffffff81000004\n\
             rsp = 0x7f00\n\
             %rbx 42\n\
             r12 0x7  # callee-saved\n",
        )
        .unwrap();
        assert_eq!(snapshot.pc, 0xffff_ffff_8100_0004);
        assert_eq!(snapshot.registers[Reg::Rsp], ActualValue::known(0x7f00));
        assert_eq!(snapshot.registers[Reg::Rbx], ActualValue::known(0x42));
        assert_eq!(snapshot.registers[Reg::R12], ActualValue::known(7));
        assert!(!snapshot.registers[Reg::Rax].valid);
    }

    #[test]
    fn test_register_snapshot_errors() {
        assert!(RegisterSnapshot::parse("rsp 0x7f00\n").is_err());
        assert!(RegisterSnapshot::parse("rip 1\nebx 2\n").is_err());
        assert!(RegisterSnapshot::parse("rip 1\nfoo 2\n").is_err());
    }

    #[test]
    fn test_parse_window() {
        assert_eq!(
            parse_window("0x7000-0x8000").unwrap(),
            StackWindow::new(0x7000, 0x8000)
        );
        assert!(parse_window("8000-7000").is_err());
        assert!(parse_window("7000").is_err());
    }
}
