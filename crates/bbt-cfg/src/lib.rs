//! Per-function register and stack provenance analysis for x86-64.
//!
//! Given a function's code, the analysis tells, for any reachable
//! instruction, which registers and stack slots still hold values the
//! function was entered with and where the stack pointer is relative to
//! its value on entry.

mod analyzer;
mod block_table;
mod config;
mod context;
mod effect;
mod error;
mod source;
mod special;
pub mod transfer;
mod usage;
mod value;

pub use analyzer::*;
pub use block_table::*;
pub use config::*;
pub use context::*;
pub use effect::*;
pub use error::*;
pub use source::*;
pub use special::*;
pub use transfer::{Discrepancy, ExpectedSlot, Location, TransferRule, TransferTable};
pub use usage::*;
pub use value::*;
