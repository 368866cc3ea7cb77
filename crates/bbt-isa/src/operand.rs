//! Decoded operand shapes.

use std::fmt;

use crate::reg::{Reg, RegisterName};

/// A `[segment:]disp(base,index,scale)` memory reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct MemoryOperand {
    pub segment: Option<String>,
    pub base: Option<RegisterName>,
    pub index: Option<RegisterName>,
    pub scale: u8,
    pub disp: i64,
}

impl MemoryOperand {
    /// Full-width base register, if it is a tracked integer register.
    pub fn base_gpr(&self) -> Option<Reg> {
        self.base.as_ref().and_then(RegisterName::full_gpr)
    }

    /// Integer index register. The zero-index pseudo register does not count.
    pub fn index_gpr(&self) -> Option<Reg> {
        self.index.as_ref().and_then(RegisterName::gpr)
    }
}

impl fmt::Display for MemoryOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(seg) = &self.segment {
            write!(f, "%{seg}:")?;
        }
        if self.disp < 0 {
            write!(f, "-{:#x}", self.disp.unsigned_abs())?;
        } else if self.disp > 0 || (self.base.is_none() && self.index.is_none()) {
            write!(f, "{:#x}", self.disp)?;
        }
        if self.base.is_none() && self.index.is_none() {
            return Ok(());
        }
        f.write_str("(")?;
        if let Some(base) = &self.base {
            write!(f, "{base}")?;
        }
        if let Some(index) = &self.index {
            write!(f, ",{index},{}", self.scale)?;
        }
        f.write_str(")")
    }
}

/// One operand of an AT&T instruction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operand {
    /// `$imm`.
    Immediate(i64),
    /// `%reg` or `*%reg`.
    Register { name: RegisterName, indirect: bool },
    /// Memory reference, `*` marks an indirect branch through it.
    Memory { mem: MemoryOperand, indirect: bool },
    /// Bare address, as printed for direct branch and call targets.
    Address(u64),
}

impl Operand {
    /// Register name, if this is a register operand.
    pub fn register(&self) -> Option<&RegisterName> {
        match self {
            Self::Register { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Integer register at any width.
    pub fn gpr(&self) -> Option<Reg> {
        self.register().and_then(RegisterName::gpr)
    }

    /// Integer register named at full width.
    pub fn full_gpr(&self) -> Option<Reg> {
        self.register().and_then(RegisterName::full_gpr)
    }

    /// Memory reference, if any.
    pub fn memory(&self) -> Option<&MemoryOperand> {
        match self {
            Self::Memory { mem, .. } => Some(mem),
            _ => None,
        }
    }

    /// Immediate value, if any.
    pub fn immediate(&self) -> Option<i64> {
        match self {
            Self::Immediate(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether the operand carries the `*` indirect-branch marker.
    pub fn is_indirect(&self) -> bool {
        matches!(
            self,
            Self::Register { indirect: true, .. } | Self::Memory { indirect: true, .. }
        )
    }

    /// Direct branch target: a bare address, or an absolute memory form
    /// without registers that is not marked indirect.
    pub fn branch_target(&self) -> Option<u64> {
        match self {
            Self::Address(addr) => Some(*addr),
            Self::Memory { mem, indirect: false }
                if mem.base.is_none() && mem.index.is_none() && mem.segment.is_none() =>
            {
                Some(mem.disp as u64)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate(v) => write!(f, "${:#x}", *v as u64),
            Self::Register { name, indirect } => {
                if *indirect {
                    f.write_str("*")?;
                }
                write!(f, "{name}")
            }
            Self::Memory { mem, indirect } => {
                if *indirect {
                    f.write_str("*")?;
                }
                write!(f, "{mem}")
            }
            Self::Address(addr) => write!(f, "{addr:x}"),
        }
    }
}
