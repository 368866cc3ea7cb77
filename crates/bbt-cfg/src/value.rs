//! Register and stack provenance tracking.
//!
//! A [`Provenance`] records which entry-time value a register or stack slot
//! still holds. Stack slots are keyed by their offset from the original
//! stack pointer (OSP), so they stay put while the stack pointer moves.

use std::fmt;

use bbt_isa::{NUM_REGS, Reg, WORD_SIZE};

/// What a storage location holds, in terms of values live on function entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Provenance {
    /// Contents unknown or unrelated to any entry value.
    #[default]
    Undefined,
    /// The entry-time value of this register.
    Original(Reg),
    /// The entry stack pointer plus an offset.
    Osp(i64),
}

impl Provenance {
    /// Check if anything is known.
    #[inline]
    pub fn is_defined(self) -> bool {
        self != Self::Undefined
    }

    /// Stack pointer offset, if this holds a derived stack pointer.
    #[inline]
    pub fn osp_offset(self) -> Option<i64> {
        match self {
            Self::Osp(offset) => Some(offset),
            _ => None,
        }
    }

    /// Shift a derived stack pointer by `delta`; other values become unknown.
    #[must_use]
    pub fn offset_by(self, delta: i64) -> Self {
        match self {
            Self::Osp(offset) => Self::Osp(offset.wrapping_add(delta)),
            _ => Self::Undefined,
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Original(reg) => write!(f, "{reg}"),
            Self::Osp(0) => f.write_str("osp"),
            Self::Osp(offset) if *offset < 0 => write!(f, "osp-{:#x}", offset.unsigned_abs()),
            Self::Osp(offset) => write!(f, "osp+{offset:#x}"),
        }
    }
}

/// Stack-resident copy of an entry value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemorySlot {
    /// Offset of the slot from the original stack pointer.
    pub offset: i64,
    pub value: Provenance,
}

/// Provenance of every register plus tracked stack slots.
///
/// The memory list is canonical when sorted by descending offset, free of
/// undefined slots and free of duplicate offsets. Every mutator here keeps it
/// canonical; [`RegisterState::canonicalize`] repairs states built by hand.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegisterState {
    regs: [Provenance; NUM_REGS],
    memory: Vec<MemorySlot>,
}

impl Default for RegisterState {
    fn default() -> Self {
        Self::entry()
    }
}

impl RegisterState {
    /// State on function entry: every register holds itself, the stack
    /// pointer is OSP and no stack slot is known.
    pub fn entry() -> Self {
        let mut regs = [Provenance::Undefined; NUM_REGS];
        for reg in Reg::ALL {
            regs[reg.index()] = Provenance::Original(reg);
        }
        regs[Reg::Rsp.index()] = Provenance::Osp(0);
        Self {
            regs,
            memory: Vec::new(),
        }
    }

    /// State with nothing known.
    pub fn undefined() -> Self {
        Self {
            regs: [Provenance::Undefined; NUM_REGS],
            memory: Vec::new(),
        }
    }

    /// Build a state from raw parts, canonicalizing the memory list.
    pub fn from_parts(regs: [Provenance; NUM_REGS], memory: Vec<MemorySlot>) -> Self {
        let mut state = Self { regs, memory };
        state.canonicalize();
        state
    }

    #[inline]
    pub fn get(&self, reg: Reg) -> Provenance {
        self.regs[reg.index()]
    }

    #[inline]
    pub fn set(&mut self, reg: Reg, value: Provenance) {
        self.regs[reg.index()] = value;
    }

    pub fn registers(&self) -> &[Provenance; NUM_REGS] {
        &self.regs
    }

    /// Tracked stack slots, highest offset first.
    pub fn memory(&self) -> &[MemorySlot] {
        &self.memory
    }

    /// Current stack pointer offset from OSP, if known.
    pub fn stack_offset(&self) -> Option<i64> {
        self.get(Reg::Rsp).osp_offset()
    }

    /// Provenance of the slot at exactly `offset`.
    pub fn slot(&self, offset: i64) -> Provenance {
        self.memory
            .iter()
            .find(|s| s.offset == offset)
            .map_or(Provenance::Undefined, |s| s.value)
    }

    /// Record a word-sized store at `offset`. Slots partially overlapped by
    /// the store are forgotten.
    pub fn store(&mut self, offset: i64, value: Provenance) {
        self.memory
            .retain(|s| s.offset.abs_diff(offset) >= WORD_SIZE as u64);
        if value.is_defined() {
            let pos = self.memory.partition_point(|s| s.offset > offset);
            self.memory.insert(pos, MemorySlot { offset, value });
        }
    }

    /// Forget every stack slot.
    pub fn clear_memory(&mut self) {
        self.memory.clear();
    }

    /// Forget slots below `offset`; they are no longer part of the live stack.
    pub fn drop_below(&mut self, offset: i64) {
        self.memory.retain(|s| s.offset >= offset);
    }

    /// Sort the memory list descending, drop undefined slots and keep the
    /// first slot seen for each offset.
    pub fn canonicalize(&mut self) {
        self.memory.retain(|s| s.value.is_defined());
        self.memory.sort_by(|a, b| b.offset.cmp(&a.offset));
        self.memory.dedup_by_key(|s| s.offset);
    }

    /// Check the canonical-form invariant.
    pub fn is_canonical(&self) -> bool {
        self.memory.iter().all(|s| s.value.is_defined())
            && self.memory.windows(2).all(|w| w[0].offset > w[1].offset)
    }

    /// Merge another state into this one. Any cell that differs between the
    /// two becomes undefined, and only slots present and equal in both are
    /// kept. Returns true if anything changed.
    pub fn merge(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for i in 0..NUM_REGS {
            if self.regs[i] != other.regs[i] && self.regs[i].is_defined() {
                self.regs[i] = Provenance::Undefined;
                changed = true;
            }
        }
        let before = self.memory.len();
        self.memory
            .retain(|s| other.memory.iter().any(|o| o == s));
        changed || self.memory.len() != before
    }

    /// Merge a set of states. Returns `None` for an empty set.
    pub fn merge_all<'a>(mut states: impl Iterator<Item = &'a Self>) -> Option<Self> {
        let mut merged = states.next()?.clone();
        for state in states {
            merged.merge(state);
        }
        Some(merged)
    }
}

impl fmt::Display for RegisterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for reg in Reg::ALL {
            let value = self.get(reg);
            if !value.is_defined() {
                continue;
            }
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{reg}={value}")?;
        }
        for slot in &self.memory {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "[{}]={}", Provenance::Osp(slot.offset), slot.value)?;
        }
        if first {
            f.write_str("<nothing known>")?;
        }
        Ok(())
    }
}
