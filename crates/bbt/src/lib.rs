//! BBT - backtraces with arguments for x86-64
//!
//! Walks a stopped thread's stack one frame at a time. Each function on the
//! stack is analyzed to learn where its caller's registers went, and the
//! caller's registers, return address and arguments are recovered from a
//! concrete register snapshot and stack memory.
//!
//! # Example
//!
//! ```ignore
//! use bbt::{Analyzer, AnalysisConfig, Backtracer, Listing, MemoryImage, RegisterSnapshot};
//!
//! let listing = Listing::load("vmlinux.dis")?;
//! let memory = MemoryImage::load("stack.txt")?;
//! let snapshot = RegisterSnapshot::load("regs.txt")?;
//! let analyzer = Analyzer::new(&listing, &listing, &memory, AnalysisConfig::default());
//! let window = memory.window().unwrap();
//! let frames = Backtracer::new(analyzer, window).walk(snapshot.pc, &snapshot.registers)?;
//! ```

// Re-export from sub-crates
pub use bbt_cfg::{
    AnalysisConfig, AnalysisContext, AnalysisError, Analyzer, ErrorKind, FunctionAnalysis,
    MemoryReader, NoMemory, Provenance, RegisterState, SymbolInfo, SymbolResolver, TransferRule,
    UnknownInstructionPolicy,
};
pub use bbt_isa::{ARGUMENT_REGS, Reg};

mod dump;
mod listing;
pub mod metrics;
mod reconstruct;
mod walker;

pub use dump::*;
pub use listing::*;
pub use reconstruct::*;
pub use walker::*;

use thiserror::Error;

/// Backtrace errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("analysis failed: {0}")]
    Analysis(#[from] AnalysisError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no register holds a known stack pointer")]
    NoStackPointer,
    #[error("no function contains 0x{0:x}")]
    UnknownFunction(u64),
    #[error("return address at 0x{0:x} is outside the stack window")]
    UnreadableReturnAddress(u64),
    #[error("line {line}: {message}")]
    Format { line: usize, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
