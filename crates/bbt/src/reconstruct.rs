//! Rolling a concrete register snapshot back into the caller.

use std::fmt;
use std::ops::{Index, IndexMut};

use bbt_cfg::{MemoryReader, Provenance, RegisterState};
use bbt_isa::{ARGUMENT_REGS, NUM_REGS, Reg, WORD_SIZE};
use tracing::trace;

use crate::{Error, Result};

const WORD: u64 = WORD_SIZE as u64;

/// A concrete register or memory value and whether it is known.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActualValue {
    pub value: u64,
    pub valid: bool,
}

impl ActualValue {
    pub const INVALID: Self = Self {
        value: 0,
        valid: false,
    };

    pub const fn known(value: u64) -> Self {
        Self { value, valid: true }
    }

    /// The value, if known.
    pub const fn get(self) -> Option<u64> {
        if self.valid { Some(self.value) } else { None }
    }
}

impl fmt::Display for ActualValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid {
            write!(f, "{:#x}", self.value)
        } else {
            f.write_str("invalid")
        }
    }
}

/// Concrete values of the general-purpose registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActualRegisters([ActualValue; NUM_REGS]);

impl ActualRegisters {
    /// Every register unknown.
    pub const fn invalid() -> Self {
        Self([ActualValue::INVALID; NUM_REGS])
    }

    pub fn set(&mut self, reg: Reg, value: u64) {
        self.0[reg.index()] = ActualValue::known(value);
    }

    pub fn stack_pointer(&self) -> Option<u64> {
        self[Reg::Rsp].get()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Reg, ActualValue)> + '_ {
        Reg::ALL.into_iter().map(|reg| (reg, self[reg]))
    }
}

impl Index<Reg> for ActualRegisters {
    type Output = ActualValue;

    fn index(&self, reg: Reg) -> &ActualValue {
        &self.0[reg.index()]
    }
}

impl IndexMut<Reg> for ActualRegisters {
    fn index_mut(&mut self, reg: Reg) -> &mut ActualValue {
        &mut self.0[reg.index()]
    }
}

impl fmt::Display for ActualRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (reg, value) in self.iter().filter(|(_, v)| v.valid) {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{reg}={value}")?;
        }
        Ok(())
    }
}

/// Mapped stack memory, `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackWindow {
    pub start: u64,
    pub end: u64,
}

impl StackWindow {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Whether a whole word at `address` lies inside the window.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address.checked_add(WORD).is_some_and(|e| e <= self.end)
    }

    fn read(&self, memory: &dyn MemoryReader, address: u64) -> ActualValue {
        if !self.contains(address) {
            return ActualValue::INVALID;
        }
        memory
            .read_word(address)
            .map_or(ActualValue::INVALID, ActualValue::known)
    }
}

/// Registers as they were when the analyzed function was entered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rollback {
    pub registers: ActualRegisters,
    /// Stack pointer on entry.
    pub original_stack_pointer: u64,
}

/// Recover entry-time register values from `current` using the
/// function's state at the point `current` was captured.
pub fn rollback(
    exit: &RegisterState,
    current: &ActualRegisters,
    window: StackWindow,
    memory: &dyn MemoryReader,
) -> Result<Rollback> {
    // Prefer rsp itself, then any register holding a derived stack pointer.
    let osp = std::iter::once(Reg::Rsp)
        .chain(Reg::ALL)
        .find_map(|reg| {
            let offset = exit.get(reg).osp_offset()?;
            let value = current[reg].get()?;
            Some(value.wrapping_add_signed(offset.wrapping_neg()))
        })
        .ok_or(Error::NoStackPointer)?;

    let mut registers = ActualRegisters::invalid();
    for reg in Reg::ALL {
        if let Provenance::Original(original) = exit.get(reg)
            && (current[reg].valid || !registers[original].valid)
        {
            registers[original] = current[reg];
        }
    }

    for slot in exit.memory() {
        let Provenance::Original(original) = slot.value else {
            continue;
        };
        let address = osp.wrapping_add_signed(slot.offset);
        let value = window.read(memory, address);
        if value.valid || !registers[original].valid {
            registers[original] = value;
        }
    }

    registers.set(Reg::Rsp, osp);
    trace!(osp = format_args!("{osp:#x}"), registers = %registers, "rolled back");
    Ok(Rollback {
        registers,
        original_stack_pointer: osp,
    })
}

/// The caller's view after returning from the analyzed function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerFrame {
    /// Registers at the callee's entry. Argument registers hold the
    /// values passed in; `rsp` is the caller's stack pointer after return.
    pub registers: ActualRegisters,
    pub return_address: u64,
    /// Address to resolve the caller with. One less than the return
    /// address when the callee never returns, since the call may be the
    /// last instruction of the caller.
    pub lookup_address: u64,
    pub original_stack_pointer: u64,
}

impl CallerFrame {
    pub fn stack_pointer(&self) -> u64 {
        self.original_stack_pointer.wrapping_add(WORD)
    }
}

/// Roll back the callee and read the return address it will use.
pub fn reconstruct_caller(
    exit: &RegisterState,
    current: &ActualRegisters,
    window: StackWindow,
    memory: &dyn MemoryReader,
    callee_never_returns: bool,
) -> Result<CallerFrame> {
    let Rollback {
        mut registers,
        original_stack_pointer,
    } = rollback(exit, current, window, memory)?;

    let return_address = window
        .read(memory, original_stack_pointer)
        .get()
        .ok_or(Error::UnreadableReturnAddress(original_stack_pointer))?;
    let caller_sp = original_stack_pointer.wrapping_add(WORD);
    registers.set(Reg::Rsp, caller_sp);

    let lookup_address = if callee_never_returns {
        return_address.wrapping_sub(1)
    } else {
        return_address
    };
    Ok(CallerFrame {
        registers,
        return_address,
        lookup_address,
        original_stack_pointer,
    })
}

/// Arguments the callee was passed: the leading argument registers it read,
/// then the stack words above the return address.
pub fn argument_list(
    register_count: usize,
    memory_count: usize,
    caller: &CallerFrame,
    window: StackWindow,
    memory: &dyn MemoryReader,
) -> Vec<ActualValue> {
    let registers = ARGUMENT_REGS
        .iter()
        .take(register_count)
        .map(|&reg| caller.registers[reg]);
    let base = caller.stack_pointer();
    let words = (0..memory_count as u64).map(|i| window.read(memory, base.wrapping_add(i * WORD)));
    registers.chain(words).collect()
}
