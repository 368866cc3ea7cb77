//! Per-function analysis state.

use bbt_isa::{Instruction, PRESERVED_REGS, Reg};
use tracing::{trace, warn};

use crate::block_table::{BasicBlock, Edge, ExternalJump};
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, ErrorKind, Result};
use crate::source::{SymbolInfo, SymbolResolver};
use crate::transfer::TransferTable;
use crate::usage::Usage;
use crate::value::{Provenance, RegisterState};

/// A decoded and classified instruction, cached by pass 1 for pass 2.
#[derive(Clone, Debug)]
pub struct DecodedInstruction {
    pub address: u64,
    pub length: u64,
    pub text: String,
    pub insn: Instruction,
    pub usage: Usage,
}

impl DecodedInstruction {
    #[inline]
    pub fn end(&self) -> u64 {
        self.address + self.length
    }

    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address < self.end()
    }
}

/// How many arguments the function was seen to read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParamUsage {
    /// Leading argument registers read while still holding their entry value.
    pub registers: usize,
    /// Stack words above the return address that were read.
    pub memory: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AnalysisStats {
    pub blocks_processed: usize,
    pub sweeps: usize,
}

/// Everything built while analyzing one function. Dropped as a whole
/// before the next function is analyzed.
#[derive(Debug)]
pub struct AnalysisContext<'a> {
    pub(crate) function: SymbolInfo,
    pub(crate) config: &'a AnalysisConfig,
    pub(crate) instructions: Vec<DecodedInstruction>,
    pub(crate) blocks: Vec<BasicBlock>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) external_jumps: Vec<ExternalJump>,
    pub(crate) has_return: bool,
    pub(crate) has_tail_call: bool,
    pub(crate) params: ParamUsage,
    pub(crate) stats: AnalysisStats,
    pub(crate) exit_state: Option<RegisterState>,
    abandoned: Option<AnalysisError>,
}

impl<'a> AnalysisContext<'a> {
    pub fn new(function: SymbolInfo, config: &'a AnalysisConfig) -> Self {
        Self {
            function,
            config,
            instructions: Vec::new(),
            blocks: Vec::new(),
            edges: Vec::new(),
            external_jumps: Vec::new(),
            has_return: false,
            has_tail_call: false,
            params: ParamUsage::default(),
            stats: AnalysisStats::default(),
            exit_state: None,
            abandoned: None,
        }
    }

    pub fn function(&self) -> &SymbolInfo {
        &self.function
    }

    pub fn config(&self) -> &AnalysisConfig {
        self.config
    }

    pub fn instructions(&self) -> &[DecodedInstruction] {
        &self.instructions
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn external_jumps(&self) -> &[ExternalJump] {
        &self.external_jumps
    }

    pub fn params(&self) -> ParamUsage {
        self.params
    }

    pub fn stats(&self) -> AnalysisStats {
        self.stats
    }

    pub fn exit_state(&self) -> Option<&RegisterState> {
        self.exit_state.as_ref()
    }

    /// A function never returns if it is listed as such, or if it has no
    /// return instruction and never leaves by jumping elsewhere.
    pub fn never_returns(&self) -> bool {
        self.config.is_noreturn(&self.function.name)
            || (!self.has_return && !self.has_tail_call && self.external_jumps.is_empty())
    }

    /// Record a failure. The first failure sticks; later calls keep it.
    pub fn abandon(&mut self, err: AnalysisError) -> AnalysisError {
        if self.abandoned.is_none() {
            warn!(function = %self.function.name, kind = %err.kind(), "analysis abandoned: {err}");
            self.abandoned = Some(err.clone());
        }
        err
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.is_some()
    }

    /// Kind of the failure that abandoned this analysis.
    pub fn abandoned(&self) -> Option<ErrorKind> {
        self.abandoned.as_ref().map(AnalysisError::kind)
    }

    /// Fail fast once abandoned.
    pub fn ensure_live(&self) -> Result<()> {
        match &self.abandoned {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Check a jump to `target`, outside this function, against the
    /// transfer table.
    pub fn validate_transfer(
        &mut self,
        table: &TransferTable,
        symbols: &dyn SymbolResolver,
        address: u64,
        target: u64,
        state: &RegisterState,
    ) -> Result<()> {
        self.ensure_live()?;
        if let Some(rule) = table.find(target, self.function.start) {
            let discrepancies = rule.check(state, self.config.max_discrepancies);
            if discrepancies.is_empty() {
                trace!(target = %rule.target, "transfer contract holds");
                return Ok(());
            }
            for d in &discrepancies {
                warn!(function = %self.function.name, target = %rule.target, "{d}");
            }
            return Err(self.abandon(AnalysisError::ContractViolation {
                function: self.function.name.clone(),
                address,
                target: rule.target.clone(),
                discrepancies,
            }));
        }

        match symbols.resolve(target) {
            Some(sym) if sym.start == target => {
                trace!(target = %sym.name, "tail call");
                Ok(())
            }
            other => Err(self.abandon(AnalysisError::UnexpectedTransfer {
                function: self.function.name.clone(),
                address,
                target,
                target_name: other.map_or_else(|| "<unknown>".to_string(), |s| s.name),
            })),
        }
    }

    /// Check that callee-saved registers hold their entry values and the
    /// stack pointer is back at OSP before a return.
    pub fn check_preserved(&mut self, address: u64, state: &RegisterState) -> Result<()> {
        self.ensure_live()?;
        for reg in PRESERVED_REGS {
            let expected = if reg == Reg::Rsp {
                Provenance::Osp(0)
            } else {
                Provenance::Original(reg)
            };
            let actual = state.get(reg);
            if actual != expected {
                return Err(self.abandon(AnalysisError::PreservedRegister {
                    function: self.function.name.clone(),
                    address,
                    register: reg,
                    actual,
                }));
            }
        }
        Ok(())
    }
}
