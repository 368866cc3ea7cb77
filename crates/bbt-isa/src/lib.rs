//! x86-64 register definitions and instruction text parser.
//!
//! This crate holds the architecture data used by the analysis: integer
//! registers and their sub-register names, the calling convention, and a
//! parser for AT&T-syntax instruction text as printed by disassemblers.

mod operand;
mod parse;
mod reg;

pub use operand::*;
pub use parse::*;
pub use reg::*;
