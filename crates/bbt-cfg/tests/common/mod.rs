//! In-memory program for driving the analysis in tests.

use std::collections::{BTreeMap, HashMap};

use bbt_cfg::{DecodedLine, Disassembler, MemoryReader, SymbolInfo, SymbolResolver};
use bbt_isa::Instruction;

#[derive(Default)]
pub struct Program {
    functions: Vec<SymbolInfo>,
    lines: BTreeMap<u64, (u64, String)>,
    words: HashMap<u64, u64>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lay out `body` as `(length, text)` pairs starting at `start`.
    pub fn function(mut self, name: &str, start: u64, body: &[(u64, &str)]) -> Self {
        let mut address = start;
        for &(length, text) in body {
            self.lines.insert(address, (length, text.to_string()));
            address += length;
        }
        self.functions.push(SymbolInfo {
            name: name.to_string(),
            start,
            end: address,
            module: None,
        });
        self
    }

    pub fn word(mut self, address: u64, value: u64) -> Self {
        self.words.insert(address, value);
        self
    }
}

impl Disassembler for Program {
    fn decode(&self, address: u64, targets: &mut dyn FnMut(u64)) -> Option<DecodedLine> {
        let (length, text) = self.lines.get(&address)?;
        if let Ok(insn) = Instruction::parse(text)
            && (insn.mnemonic.starts_with('j') || insn.mnemonic.starts_with("call"))
            && let Some(target) = insn.target().and_then(|op| op.branch_target())
        {
            targets(target);
        }
        Some(DecodedLine {
            address,
            length: *length,
            text: text.clone(),
        })
    }
}

impl SymbolResolver for Program {
    fn resolve(&self, address: u64) -> Option<SymbolInfo> {
        self.functions.iter().find(|f| f.contains(address)).cloned()
    }

    fn lookup(&self, name: &str) -> Option<u64> {
        self.functions.iter().find(|f| f.name == name).map(|f| f.start)
    }
}

impl MemoryReader for Program {
    fn read_word(&self, address: u64) -> Option<u64> {
        self.words.get(&address).copied()
    }
}
