//! Transfer-point contracts.
//!
//! Hand-written entry and exit glue is reached by jumps from ordinary
//! functions, with registers and a saved frame laid out in a fixed way. A
//! [`TransferRule`] describes that layout. Rules seed the entry state when
//! the glue itself is analyzed, and validate the state of any function that
//! jumps to it.

mod data;

use std::fmt;

use bbt_isa::{NUM_REGS, Reg, RegSet};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::source::SymbolResolver;
use crate::value::{MemorySlot, Provenance, RegisterState};

pub use data::linux_x86_64;

/// Expected content of one word of the frame, relative to the stack pointer
/// at the transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpectedSlot {
    pub offset: i64,
    /// `Undefined` only fixes the frame size; the content is not checked.
    pub value: Provenance,
}

/// Contract for a jump target outside the analyzed function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRule {
    pub target: String,
    /// Restrict the rule to jumps from this function.
    pub source: Option<String>,
    /// Expected frame, highest offset first.
    pub memory: Vec<ExpectedSlot>,
    /// Expected registers; `None` leaves registers unchecked.
    pub registers: Option<[Provenance; NUM_REGS]>,
    /// Frame slots expected to hold these registers are not checked.
    pub skip_memory: RegSet,
    pub skip_registers: RegSet,
    /// Added to stack offsets at the transfer before comparing.
    pub osp_adjust: i64,
}

impl TransferRule {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source: None,
            memory: Vec::new(),
            registers: None,
            skip_memory: RegSet::EMPTY,
            skip_registers: RegSet::EMPTY,
            osp_adjust: 0,
        }
    }

    #[must_use]
    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_memory(mut self, mut slots: Vec<ExpectedSlot>) -> Self {
        slots.sort_by(|a, b| b.offset.cmp(&a.offset));
        self.memory = slots;
        self
    }

    #[must_use]
    pub fn with_registers(mut self, registers: [Provenance; NUM_REGS]) -> Self {
        self.registers = Some(registers);
        self
    }

    #[must_use]
    pub fn skip_memory(mut self, regs: RegSet) -> Self {
        self.skip_memory = regs;
        self
    }

    #[must_use]
    pub fn skip_registers(mut self, regs: RegSet) -> Self {
        self.skip_registers = regs;
        self
    }

    #[must_use]
    pub fn with_osp_adjust(mut self, adjust: i64) -> Self {
        self.osp_adjust = adjust;
        self
    }

    fn skips_slot(&self, slot: &ExpectedSlot) -> bool {
        matches!(slot.value, Provenance::Original(r) if self.skip_memory.contains(r))
    }

    /// Entry state for analyzing the target itself.
    pub fn seed_state(&self) -> RegisterState {
        let back = |p: Provenance| p.offset_by(-self.osp_adjust);
        let mut regs = [Provenance::Undefined; NUM_REGS];
        if let Some(expected) = &self.registers {
            for reg in Reg::ALL {
                if !self.skip_registers.contains(reg) {
                    regs[reg.index()] = match expected[reg.index()] {
                        p @ Provenance::Osp(_) => back(p),
                        p => p,
                    };
                }
            }
        }
        regs[Reg::Rsp.index()] = Provenance::Osp(0);

        let memory = self
            .memory
            .iter()
            .filter(|slot| !self.skips_slot(slot))
            .map(|slot| MemorySlot {
                offset: slot.offset - self.osp_adjust,
                value: match slot.value {
                    p @ Provenance::Osp(_) => back(p),
                    p => p,
                },
            })
            .collect();
        RegisterState::from_parts(regs, memory)
    }

    /// Compare a state against this contract, collecting at most `max`
    /// discrepancies.
    pub fn check(&self, state: &RegisterState, max: usize) -> Vec<Discrepancy> {
        let mut found = Vec::new();
        let rsp = state.stack_offset();
        let translate = |p: Provenance| match (p, rsp) {
            (Provenance::Osp(off), Some(sp)) => Provenance::Osp(off - sp + self.osp_adjust),
            (Provenance::Osp(_), None) => Provenance::Undefined,
            (p, _) => p,
        };

        if let Some(expected) = &self.registers {
            for reg in Reg::ALL {
                if found.len() >= max {
                    return found;
                }
                if self.skip_registers.contains(reg) {
                    continue;
                }
                let want = expected[reg.index()];
                let have = translate(state.get(reg));
                if want != have {
                    found.push(Discrepancy {
                        location: Location::Register(reg),
                        expected: want,
                        actual: have,
                    });
                }
            }
        }

        let actual: Vec<(i64, Provenance)> = match rsp {
            Some(sp) => state
                .memory()
                .iter()
                .map(|slot| (slot.offset - sp + self.osp_adjust, translate(slot.value)))
                .collect(),
            None => Vec::new(),
        };

        // Extra slots may sit above the first expected slot and below the
        // last one, not between expected slots.
        let mut next = 0;
        let mut in_frame = false;
        for slot in &self.memory {
            while next < actual.len() && actual[next].0 > slot.offset {
                if in_frame && found.len() < max {
                    found.push(Discrepancy {
                        location: Location::Slot(actual[next].0),
                        expected: Provenance::Undefined,
                        actual: actual[next].1,
                    });
                }
                next += 1;
            }
            let have = if next < actual.len() && actual[next].0 == slot.offset {
                next += 1;
                actual[next - 1].1
            } else {
                Provenance::Undefined
            };
            in_frame = true;
            if self.skips_slot(slot) || !slot.value.is_defined() {
                continue;
            }
            if have != slot.value && found.len() < max {
                found.push(Discrepancy {
                    location: Location::Slot(slot.offset),
                    expected: slot.value,
                    actual: have,
                });
            }
        }
        found
    }
}

/// Where a discrepancy was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Register(Reg),
    /// Frame slot, as an offset from the stack pointer at the transfer.
    Slot(i64),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register(reg) => write!(f, "{reg}"),
            Self::Slot(offset) if *offset < 0 => write!(f, "[rsp-{:#x}]", offset.unsigned_abs()),
            Self::Slot(offset) => write!(f, "[rsp+{offset:#x}]"),
        }
    }
}

/// A mismatch between a contract and the analyzed state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Discrepancy {
    pub location: Location,
    pub expected: Provenance,
    pub actual: Provenance,
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, found {}",
            self.location, self.expected, self.actual
        )
    }
}

#[derive(Clone, Debug)]
struct ResolvedRule {
    target: u64,
    source: Option<u64>,
    rule: TransferRule,
}

/// Transfer rules keyed by resolved target address.
#[derive(Clone, Debug, Default)]
pub struct TransferTable {
    rules: Vec<ResolvedRule>,
    by_target: FxHashMap<u64, Vec<usize>>,
}

impl TransferTable {
    /// Resolve rule names to addresses. Rules naming symbols that do not
    /// exist are dropped.
    pub fn resolve(rules: &[TransferRule], symbols: &dyn SymbolResolver) -> Self {
        let mut table = Self::default();
        for rule in rules {
            let Some(target) = symbols.lookup(&rule.target) else {
                trace!(target = %rule.target, "transfer target not present");
                continue;
            };
            let source = match &rule.source {
                Some(name) => match symbols.lookup(name) {
                    Some(addr) => Some(addr),
                    None => {
                        trace!(source = %name, "transfer source not present");
                        continue;
                    }
                },
                None => None,
            };
            table.by_target.entry(target).or_default().push(table.rules.len());
            table.rules.push(ResolvedRule {
                target,
                source,
                rule: rule.clone(),
            });
        }
        table
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule for `target` that applies to jumps from the function
    /// starting at `source`.
    pub fn find(&self, target: u64, source: u64) -> Option<&TransferRule> {
        self.by_target
            .get(&target)?
            .iter()
            .map(|&i| &self.rules[i])
            .find(|r| r.source.is_none_or(|s| s == source))
            .map(|r| &r.rule)
    }

    /// Rule used to seed analysis of the glue starting at `entry`.
    pub fn seed(&self, entry: u64) -> Option<&TransferRule> {
        self.by_target
            .get(&entry)?
            .iter()
            .map(|&i| &self.rules[i])
            .find(|r| r.source.is_none() && r.target == entry)
            .map(|r| &r.rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> [Provenance; NUM_REGS] {
        *RegisterState::entry().registers()
    }

    fn slots(entries: &[(i64, Reg)]) -> Vec<ExpectedSlot> {
        entries
            .iter()
            .map(|&(offset, reg)| ExpectedSlot {
                offset,
                value: Provenance::Original(reg),
            })
            .collect()
    }

    #[test]
    fn test_register_mismatch() {
        let rule = TransferRule::new("glue")
            .with_registers(identity())
            .skip_registers(RegSet::of(&[Reg::Rax]));
        let mut state = RegisterState::entry();
        state.set(Reg::Rax, Provenance::Undefined);
        assert!(rule.check(&state, 8).is_empty());

        state.set(Reg::R12, Provenance::Original(Reg::R13));
        let found = rule.check(&state, 8);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].location, Location::Register(Reg::R12));
        assert_eq!(found[0].to_string(), "r12: expected r12, found r13");
    }

    #[test]
    fn test_stack_offsets_are_relative() {
        let mut expected = identity();
        expected[Reg::Rbp.index()] = Provenance::Osp(0x10);
        let rule = TransferRule::new("glue").with_registers(expected);
        let mut state = RegisterState::entry();
        state.set(Reg::Rsp, Provenance::Osp(-0x20));
        state.set(Reg::Rbp, Provenance::Osp(-0x10));
        assert!(rule.check(&state, 8).is_empty());
    }

    #[test]
    fn test_memory_layout() {
        let rule = TransferRule::new("glue")
            .with_memory(slots(&[(0x8, Reg::Rbx), (0x0, Reg::Rbp)]))
            .skip_memory(RegSet::EMPTY);
        let mut state = RegisterState::entry();
        state.set(Reg::Rsp, Provenance::Osp(-0x10));
        state.store(0x0, Provenance::Original(Reg::R12));
        state.store(-0x8, Provenance::Original(Reg::Rbx));
        state.store(-0x10, Provenance::Original(Reg::Rbp));
        // The slot above the frame is tolerated.
        assert!(rule.check(&state, 8).is_empty());

        state.store(-0x10, Provenance::Original(Reg::R15));
        let found = rule.check(&state, 8);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].location, Location::Slot(0));
    }

    #[test]
    fn test_interleaved_slot_rejected() {
        let rule = TransferRule::new("glue").with_memory(slots(&[(0x10, Reg::Rbx), (0x0, Reg::Rbp)]));
        let mut state = RegisterState::entry();
        state.set(Reg::Rsp, Provenance::Osp(-0x18));
        state.store(-0x8, Provenance::Original(Reg::Rbx));
        state.store(-0x10, Provenance::Original(Reg::R12));
        state.store(-0x18, Provenance::Original(Reg::Rbp));
        let found = rule.check(&state, 8);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].location, Location::Slot(0x8));
    }

    #[test]
    fn test_skip_memory() {
        let rule = TransferRule::new("glue")
            .with_memory(slots(&[(0x8, Reg::Rax), (0x0, Reg::Rbx)]))
            .skip_memory(RegSet::of(&[Reg::Rax]));
        let mut state = RegisterState::entry();
        state.set(Reg::Rsp, Provenance::Osp(-0x10));
        state.store(-0x10, Provenance::Original(Reg::Rbx));
        assert!(rule.check(&state, 8).is_empty());
    }

    #[test]
    fn test_seed_satisfies_rule() {
        let rule = TransferRule::new("glue")
            .with_memory(slots(&[(0x10, Reg::Rdi), (0x8, Reg::Rsi), (0x0, Reg::Rax)]))
            .with_registers(identity())
            .skip_memory(RegSet::of(&[Reg::Rax]));
        let seed = rule.seed_state();
        assert_eq!(seed.memory().len(), 2);
        assert_eq!(seed.slot(0x10), Provenance::Original(Reg::Rdi));
        assert!(rule.check(&seed, 8).is_empty());
    }

    #[test]
    fn test_max_discrepancies() {
        let rule = TransferRule::new("glue").with_registers(identity());
        let found = rule.check(&RegisterState::undefined(), 3);
        assert_eq!(found.len(), 3);
    }
}
