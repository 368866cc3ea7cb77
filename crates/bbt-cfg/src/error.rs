//! Analysis errors.

use std::fmt;

use bbt_isa::{ParseError, Reg};
use thiserror::Error;

use crate::transfer::Discrepancy;
use crate::value::Provenance;

/// Broad failure class, used by callers to pick a fallback and to label
/// metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Instruction text or mnemonic the analysis cannot interpret.
    Unparseable,
    /// An instruction, stack slot or jump table word could not be read.
    UnreadableMemory,
    /// Blocks could not be formed or the fixpoint did not settle.
    Structural,
    /// A transfer-point or preserved-register contract did not hold.
    ContractViolation,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unparseable => "unparseable",
            Self::UnreadableMemory => "unreadable_memory",
            Self::Structural => "structural",
            Self::ContractViolation => "contract_violation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the analysis of one function was abandoned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("{function} {address:#x}: cannot parse '{text}': {source}")]
    Unparseable {
        function: String,
        address: u64,
        text: String,
        #[source]
        source: ParseError,
    },
    #[error("{function} {address:#x}: unknown mnemonic '{mnemonic}'")]
    UnknownMnemonic {
        function: String,
        address: u64,
        mnemonic: String,
    },
    #[error("{function} {address:#x}: unexpected operands for '{instruction}'")]
    BadOperands {
        function: String,
        address: u64,
        instruction: String,
    },
    #[error("no function contains {address:#x}")]
    UnknownFunction { address: u64 },
    #[error("{function} {address:#x}: cannot read instruction")]
    UnreadableInstruction { function: String, address: u64 },
    #[error("{function} {address:#x}: cannot read memory at {target:#x}")]
    UnreadableMemory {
        function: String,
        address: u64,
        target: u64,
    },
    #[error("{function}: block at {start:#x} never ends")]
    BlockNotClosed { function: String, start: u64 },
    #[error("{function}: branch target {target:#x} is not an instruction boundary")]
    MisalignedTarget { function: String, target: u64 },
    #[error("{function}: no instructions in range")]
    EmptyFunction { function: String },
    #[error("{function}: no progress after {sweeps} sweeps")]
    IterationLimit { function: String, sweeps: usize },
    #[error("{function}: exit address {exit:#x} is not reached by any analyzed path")]
    ExitNotReached { function: String, exit: u64 },
    #[error("{function}: no return instruction is reachable")]
    NoReturnPath { function: String },
    #[error("{function} {address:#x}: transfer to {target} does not match its contract: {}", join(.discrepancies))]
    ContractViolation {
        function: String,
        address: u64,
        target: String,
        discrepancies: Vec<Discrepancy>,
    },
    #[error("{function} {address:#x}: jump into the middle of {target_name} ({target:#x})")]
    UnexpectedTransfer {
        function: String,
        address: u64,
        target: u64,
        target_name: String,
    },
    #[error("{function} {address:#x}: {register} is {actual} at return")]
    PreservedRegister {
        function: String,
        address: u64,
        register: Reg,
        actual: Provenance,
    },
}

impl AnalysisError {
    /// Failure class.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unparseable { .. } | Self::UnknownMnemonic { .. } | Self::BadOperands { .. } => {
                ErrorKind::Unparseable
            }
            Self::UnreadableInstruction { .. } | Self::UnreadableMemory { .. } => {
                ErrorKind::UnreadableMemory
            }
            Self::UnknownFunction { .. }
            | Self::BlockNotClosed { .. }
            | Self::MisalignedTarget { .. }
            | Self::EmptyFunction { .. }
            | Self::IterationLimit { .. }
            | Self::ExitNotReached { .. }
            | Self::NoReturnPath { .. } => ErrorKind::Structural,
            Self::ContractViolation { .. }
            | Self::UnexpectedTransfer { .. }
            | Self::PreservedRegister { .. } => ErrorKind::ContractViolation,
        }
    }
}

fn join(discrepancies: &[Discrepancy]) -> String {
    discrepancies
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = AnalysisError::UnknownMnemonic {
            function: "f".into(),
            address: 0x10,
            mnemonic: "vfoo".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Unparseable);
        assert_eq!(err.to_string(), "f 0x10: unknown mnemonic 'vfoo'");

        let err = AnalysisError::IterationLimit {
            function: "f".into(),
            sweeps: 3,
        };
        assert_eq!(err.kind(), ErrorKind::Structural);

        let err = AnalysisError::PreservedRegister {
            function: "f".into(),
            address: 0x20,
            register: Reg::Rbx,
            actual: Provenance::Undefined,
        };
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert_eq!(err.to_string(), "f 0x20: rbx is undefined at return");
    }
}
