//! `objdump -d` listings as a disassembler and symbol table.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use bbt_cfg::{DecodedLine, Disassembler, SymbolInfo, SymbolResolver, Usage, classify};
use bbt_isa::{Instruction, Operand};
use regex::Regex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{Error, Result};

static HEADER: OnceLock<Regex> = OnceLock::new();
static RAW_BYTES: OnceLock<Regex> = OnceLock::new();

#[derive(Clone, Debug)]
struct ListingLine {
    length: u64,
    text: String,
}

/// Functions and instructions from a disassembly listing.
#[derive(Clone, Debug, Default)]
pub struct Listing {
    /// Sorted by start address.
    functions: Vec<SymbolInfo>,
    by_name: FxHashMap<String, usize>,
    lines: BTreeMap<u64, ListingLine>,
}

/// An instruction line before lengths are known.
struct Pending {
    address: u64,
    bytes: Option<u64>,
    text: String,
}

impl Listing {
    /// Parse `objdump -d` output, with or without raw instruction bytes.
    pub fn parse(text: &str) -> Result<Self> {
        let header = HEADER.get_or_init(|| Regex::new(r"^([0-9a-f]+) <([^>]+)>:$").unwrap());

        let mut starts: Vec<(u64, String)> = Vec::new();
        let mut pending: Vec<Pending> = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim_end();
            if let Some(caps) = header.captures(line) {
                let start = u64::from_str_radix(&caps[1], 16).map_err(|e| Error::Format {
                    line: index + 1,
                    message: e.to_string(),
                })?;
                starts.push((start, caps[2].to_string()));
                continue;
            }
            if starts.is_empty() {
                continue;
            }
            if let Some(item) = parse_instruction(line) {
                match (item.text.is_empty(), pending.last_mut()) {
                    // Continuation of a long encoding.
                    (true, Some(prev)) => {
                        prev.bytes = Some(prev.bytes.unwrap_or(0) + item.bytes.unwrap_or(0));
                    }
                    (true, None) => {}
                    (false, _) => pending.push(item),
                }
            }
        }

        let mut lines = BTreeMap::new();
        for (i, item) in pending.iter().enumerate() {
            let length = item
                .bytes
                .or_else(|| pending.get(i + 1).map(|next| next.address.saturating_sub(item.address)))
                .filter(|&len| len > 0)
                .unwrap_or(1);
            lines.insert(
                item.address,
                ListingLine {
                    length,
                    text: item.text.clone(),
                },
            );
        }

        starts.sort_by_key(|(start, _)| *start);
        starts.dedup_by_key(|(start, _)| *start);
        let mut functions = Vec::with_capacity(starts.len());
        for (i, (start, name)) in starts.iter().enumerate() {
            let limit = starts.get(i + 1).map_or(u64::MAX, |(next, _)| *next);
            let end = lines
                .range(*start..limit)
                .next_back()
                .map_or(*start, |(address, line)| address + line.length);
            functions.push(SymbolInfo {
                name: name.clone(),
                start: *start,
                end,
                module: None,
            });
        }
        let by_name = functions
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();

        debug!(functions = functions.len(), instructions = lines.len(), "listing parsed");
        Ok(Self {
            functions,
            by_name,
            lines,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Tag every function with a module name.
    #[must_use]
    pub fn with_module(mut self, module: &str) -> Self {
        for function in &mut self.functions {
            function.module = Some(module.to_string());
        }
        self
    }

    pub fn functions(&self) -> &[SymbolInfo] {
        &self.functions
    }

    pub fn function(&self, name: &str) -> Option<&SymbolInfo> {
        self.by_name.get(name).map(|&i| &self.functions[i])
    }

    pub fn instruction_count(&self) -> usize {
        self.lines.len()
    }
}

/// Split `addr:\t[bytes\t]text`. Lines with only bytes come back with
/// empty text.
fn parse_instruction(line: &str) -> Option<Pending> {
    let raw_bytes = RAW_BYTES.get_or_init(|| Regex::new(r"^(?:[0-9a-f]{2} )*[0-9a-f]{2}$").unwrap());

    let (address, rest) = line.trim_start().split_once(':')?;
    let address = u64::from_str_radix(address, 16).ok()?;
    let mut fields = rest.split('\t').map(str::trim).filter(|f| !f.is_empty());
    let first = fields.next()?;
    let (bytes, text) = if raw_bytes.is_match(first) {
        let count = first.split(' ').count() as u64;
        (Some(count), fields.next().unwrap_or(""))
    } else {
        (None, first)
    };
    Some(Pending {
        address,
        bytes,
        text: text.to_string(),
    })
}

impl Disassembler for Listing {
    fn decode(&self, address: u64, targets: &mut dyn FnMut(u64)) -> Option<DecodedLine> {
        let line = self.lines.get(&address)?;
        if let Ok(insn) = Instruction::parse(&line.text)
            && classify(&insn.mnemonic)
                .is_some_and(|u| matches!(u, Usage::Jmp | Usage::Branch | Usage::Loop | Usage::Call))
            && let Some(target) = insn.target().and_then(Operand::branch_target)
        {
            targets(target);
        }
        Some(DecodedLine {
            address,
            length: line.length,
            text: line.text.clone(),
        })
    }
}

impl SymbolResolver for Listing {
    fn resolve(&self, address: u64) -> Option<SymbolInfo> {
        let i = self.functions.partition_point(|f| f.start <= address).checked_sub(1)?;
        let function = &self.functions[i];
        function.contains(address).then(|| function.clone())
    }

    fn lookup(&self, name: &str) -> Option<u64> {
        self.function(name).map(|f| f.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WITH_BYTES: &str = "\
vmlinux:     file format elf64-x86-64


Disassembly of section .text:

ffffffff81000000 <leaf>:
ffffffff81000000:\t55                   \tpush   %rbp
ffffffff81000001:\t48 89 e5             \tmov    %rsp,%rbp
ffffffff81000004:\t48 c7 c0 00 00 00 00 \tmov    $0x0,%rax
ffffffff8100000b:\t5d                   \tpop    %rbp
ffffffff8100000c:\tc3                   \tretq
ffffffff8100000d:\t0f 1f 00             \tnopl   (%rax)

ffffffff81000010 <caller>:
ffffffff81000010:\te8 eb ff ff ff       \tcallq  ffffffff81000000 <leaf>
ffffffff81000015:\t66 66 2e 0f 1f 84 00 \tdata16 nopw %cs:0x0(%rax,%rax,1)
ffffffff8100001c:\t00 00 00 00
ffffffff81000020:\tc3                   \tretq
";

    #[test]
    fn test_parse_with_bytes() {
        let listing = Listing::parse(WITH_BYTES).unwrap();
        assert_eq!(listing.functions().len(), 2);
        assert_eq!(listing.instruction_count(), 9);

        let leaf = listing.function("leaf").unwrap();
        assert_eq!(leaf.start, 0xffff_ffff_8100_0000);
        assert_eq!(leaf.end, 0xffff_ffff_8100_0010);

        let line = listing.decode(0xffff_ffff_8100_0015, &mut |_| {}).unwrap();
        assert_eq!(line.length, 11);
        assert_eq!(line.text, "data16 nopw %cs:0x0(%rax,%rax,1)");
    }

    #[test]
    fn test_decode_reports_targets() {
        let listing = Listing::parse(WITH_BYTES).unwrap();
        let mut seen = Vec::new();
        listing.decode(0xffff_ffff_8100_0010, &mut |t| seen.push(t)).unwrap();
        assert_eq!(seen, vec![0xffff_ffff_8100_0000]);

        seen.clear();
        listing.decode(0xffff_ffff_8100_0001, &mut |t| seen.push(t)).unwrap();
        assert!(seen.is_empty());
        assert!(listing.decode(0xffff_ffff_8100_0002, &mut |_| {}).is_none());
    }

    #[test]
    fn test_resolve() {
        let listing = Listing::parse(WITH_BYTES).unwrap();
        assert_eq!(listing.resolve(0xffff_ffff_8100_000c).unwrap().name, "leaf");
        assert_eq!(listing.resolve(0xffff_ffff_8100_0010).unwrap().name, "caller");
        assert!(listing.resolve(0xffff_ffff_8100_0021).is_none());
        assert!(listing.resolve(0x1000).is_none());
        assert_eq!(listing.lookup("caller"), Some(0xffff_ffff_8100_0010));
        assert_eq!(listing.lookup("nope"), None);
    }

    #[test]
    fn test_parse_without_bytes() {
        let listing = Listing::parse(
            "0000000000001000 <f>:\n\
             \x20   1000:\tpush   %rbx\n\
             \x20   1001:\tmov    %rdi,%rbx\n\
             \x20   1004:\tpop    %rbx\n\
             \x20   1005:\tretq\n",
        )
        .unwrap();
        let f = listing.function("f").unwrap();
        assert_eq!((f.start, f.end), (0x1000, 0x1006));
        assert_eq!(listing.decode(0x1001, &mut |_| {}).unwrap().length, 3);
        assert_eq!(listing.decode(0x1005, &mut |_| {}).unwrap().length, 1);
    }
}
