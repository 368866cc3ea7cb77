//! Two-pass provenance analysis of one function.
//!
//! Pass 1 decodes the function into blocks. Pass 2 sweeps the blocks in
//! address order, merging the states on incoming edges and pushing the
//! result through each instruction, until no edge state changes. The state
//! at the requested exit is then replayed from the settled block inputs.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, trace, trace_span};

use crate::block_table::{Edge, build_blocks};
use crate::config::AnalysisConfig;
use crate::context::{AnalysisContext, AnalysisStats, DecodedInstruction};
use crate::effect::Interpreter;
use crate::error::{AnalysisError, Result};
use crate::source::{Disassembler, MemoryReader, SymbolInfo, SymbolResolver};
use crate::transfer::{TransferRule, TransferTable, linux_x86_64};
use crate::usage::Usage;
use crate::value::RegisterState;

/// Result of analyzing one function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionAnalysis {
    pub function: SymbolInfo,
    /// Provenance at the exit point.
    pub exit_state: RegisterState,
    /// Leading argument registers the function reads.
    pub register_params: usize,
    /// Stack words above the return address the function reads.
    pub memory_params: usize,
    pub never_returns: bool,
    pub stats: AnalysisStats,
}

/// Per-function analyzer over a disassembler, a symbol table and memory.
pub struct Analyzer<'a> {
    disassembler: &'a dyn Disassembler,
    symbols: &'a dyn SymbolResolver,
    memory: &'a dyn MemoryReader,
    transfers: TransferTable,
    config: AnalysisConfig,
}

impl<'a> Analyzer<'a> {
    /// Create an analyzer with the built-in transfer rules.
    pub fn new(
        disassembler: &'a dyn Disassembler,
        symbols: &'a dyn SymbolResolver,
        memory: &'a dyn MemoryReader,
        config: AnalysisConfig,
    ) -> Self {
        let transfers = TransferTable::resolve(&linux_x86_64(), symbols);
        Self {
            disassembler,
            symbols,
            memory,
            transfers,
            config,
        }
    }

    /// Replace the transfer rules.
    pub fn with_rules(mut self, rules: &[TransferRule]) -> Self {
        self.transfers = TransferTable::resolve(rules, self.symbols);
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn transfers(&self) -> &TransferTable {
        &self.transfers
    }

    pub fn symbols(&self) -> &dyn SymbolResolver {
        self.symbols
    }

    pub fn memory(&self) -> &dyn MemoryReader {
        self.memory
    }

    /// Fresh context for the function containing `address`.
    pub fn context(&self, address: u64) -> Result<AnalysisContext<'_>> {
        let function = self
            .symbols
            .resolve(address)
            .ok_or(AnalysisError::UnknownFunction { address })?;
        Ok(AnalysisContext::new(function, &self.config))
    }

    /// Analyze the function containing `address`. With `exit` set, the
    /// result describes the state just before the instruction at `exit`;
    /// otherwise it merges the states at every reachable return.
    pub fn analyze(&self, address: u64, exit: Option<u64>) -> Result<FunctionAnalysis> {
        let mut ctx = self.context(address)?;
        self.run(&mut ctx, exit)
    }

    /// Run both passes on `ctx`. Failures abandon the context.
    pub fn run(&self, ctx: &mut AnalysisContext<'_>, exit: Option<u64>) -> Result<FunctionAnalysis> {
        ctx.ensure_live()?;
        let _span = trace_span!("analyze", function = %ctx.function.name).entered();
        match self.run_passes(ctx, exit) {
            Ok(analysis) => Ok(analysis),
            Err(err) => Err(ctx.abandon(err)),
        }
    }

    fn run_passes(&self, ctx: &mut AnalysisContext<'_>, exit: Option<u64>) -> Result<FunctionAnalysis> {
        build_blocks(ctx, self.disassembler, self.symbols, self.memory)?;

        let instructions = std::mem::take(&mut ctx.instructions);
        let mut edges = std::mem::take(&mut ctx.edges);
        let result = self.dataflow(ctx, &instructions, &mut edges, exit);
        ctx.instructions = instructions;
        ctx.edges = edges;
        let exit_state = result?;

        debug!(
            function = %ctx.function.name,
            blocks = ctx.blocks.len(),
            processed = ctx.stats.blocks_processed,
            sweeps = ctx.stats.sweeps,
            register_params = ctx.params.registers,
            memory_params = ctx.params.memory,
            exit = %exit_state,
            "analysis complete"
        );
        ctx.exit_state = Some(exit_state.clone());
        Ok(FunctionAnalysis {
            function: ctx.function.clone(),
            exit_state,
            register_params: ctx.params.registers,
            memory_params: ctx.params.memory,
            never_returns: ctx.never_returns(),
            stats: ctx.stats,
        })
    }

    fn dataflow(
        &self,
        ctx: &mut AnalysisContext<'_>,
        instructions: &[DecodedInstruction],
        edges: &mut [Edge],
        exit: Option<u64>,
    ) -> Result<RegisterState> {
        let layout = Layout::new(ctx, edges);
        let inputs = {
            let _span = trace_span!("pass2").entered();
            self.sweep(ctx, instructions, edges, &layout)?
        };
        let _span = trace_span!("exit_replay").entered();
        match exit {
            Some(exit) => replay_to(ctx, instructions, &inputs, exit),
            None => replay_returns(ctx, instructions, &inputs),
        }
    }

    /// Sweep blocks until no edge state changes. Returns the last input
    /// state of every block that was reached.
    fn sweep(
        &self,
        ctx: &mut AnalysisContext<'_>,
        instructions: &[DecodedInstruction],
        edges: &mut [Edge],
        layout: &Layout,
    ) -> Result<Vec<Option<RegisterState>>> {
        let block_count = ctx.blocks.len();
        let seed = self
            .transfers
            .seed(ctx.function.start)
            .map_or_else(RegisterState::entry, TransferRule::seed_state);

        let mut inputs: Vec<Option<RegisterState>> = vec![None; block_count];
        let mut pending = vec![false; block_count];
        pending[0] = true;
        let mut allowed_missing = 0;

        while pending.iter().any(|&p| p) {
            ctx.stats.sweeps += 1;
            if ctx.stats.sweeps > ctx.config.max_sweeps {
                return Err(AnalysisError::IterationLimit {
                    function: ctx.function.name.clone(),
                    sweeps: ctx.stats.sweeps - 1,
                });
            }

            let mut progress = false;
            for b in 0..block_count {
                if !pending[b] {
                    continue;
                }
                let missing = layout.incoming[b]
                    .iter()
                    .filter(|&&e| edges[e].state.is_none())
                    .count();
                // The entry block starts from its seed on the first visit.
                let first_entry = b == 0 && inputs[0].is_none();
                if missing > allowed_missing && !first_entry {
                    continue;
                }

                pending[b] = false;
                progress = true;
                let mut state = if b == 0 { Some(seed.clone()) } else { None };
                for &e in &layout.incoming[b] {
                    if let Some(edge_state) = &edges[e].state {
                        match &mut state {
                            Some(s) => {
                                s.merge(edge_state);
                            }
                            None => state = Some(RegisterState::clone(edge_state)),
                        }
                    }
                }
                let Some(state) = state else { continue };
                inputs[b] = Some(state.clone());
                self.process_block(ctx, instructions, edges, layout, b, state, &mut pending)?;
            }

            if progress {
                allowed_missing = 0;
            } else {
                allowed_missing += 1;
                trace!(allowed_missing, "relaxing incoming edge requirement");
                if allowed_missing > edges.len() {
                    return Err(AnalysisError::IterationLimit {
                        function: ctx.function.name.clone(),
                        sweeps: ctx.stats.sweeps,
                    });
                }
            }
        }
        Ok(inputs)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_block(
        &self,
        ctx: &mut AnalysisContext<'_>,
        instructions: &[DecodedInstruction],
        edges: &mut [Edge],
        layout: &Layout,
        b: usize,
        mut state: RegisterState,
        pending: &mut [bool],
    ) -> Result<()> {
        ctx.stats.blocks_processed += 1;
        let block = &ctx.blocks[b];
        let range = block.instructions.clone();
        let last = block.end;
        trace!(block = format_args!("{:#x}", block.start), input = %state, "processing block");

        for decoded in &instructions[range] {
            if decoded.usage == Usage::Ret {
                ctx.check_preserved(decoded.address, &state)?;
            }
            if let Some(targets) = layout.external.get(&decoded.address) {
                for &target in targets {
                    ctx.validate_transfer(&self.transfers, self.symbols, decoded.address, target, &state)?;
                }
            }
            Interpreter::new(&ctx.function.name, ctx.config, &mut ctx.params)
                .execute(&mut state, decoded)?;
        }

        state.canonicalize();
        let Some(outgoing) = layout.outgoing.get(&last) else {
            return Ok(());
        };
        let mut shared: Option<Arc<RegisterState>> = None;
        for &e in outgoing {
            if edges[e].state.as_deref() == Some(&state) {
                continue;
            }
            let arc = match &shared {
                Some(arc) => Arc::clone(arc),
                None => {
                    let arc = edges
                        .iter()
                        .filter_map(|edge| edge.state.as_ref())
                        .find(|s| ***s == state)
                        .map_or_else(|| Arc::new(state.clone()), Arc::clone);
                    shared = Some(Arc::clone(&arc));
                    arc
                }
            };
            edges[e].state = Some(arc);
            if let Some(&target) = layout.block_of_start.get(&edges[e].to) {
                pending[target] = true;
            }
        }
        Ok(())
    }
}

/// Index structures over blocks and edges, fixed after pass 1.
struct Layout {
    block_of_start: FxHashMap<u64, usize>,
    /// Edge indices entering each block.
    incoming: Vec<Vec<usize>>,
    /// Edge indices leaving each block, keyed by its last instruction.
    outgoing: FxHashMap<u64, Vec<usize>>,
    external: FxHashMap<u64, Vec<u64>>,
}

impl Layout {
    fn new(ctx: &AnalysisContext<'_>, edges: &[Edge]) -> Self {
        let block_of_start: FxHashMap<u64, usize> = ctx
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.start, i))
            .collect();
        let mut incoming = vec![Vec::new(); ctx.blocks.len()];
        let mut outgoing: FxHashMap<u64, Vec<usize>> = FxHashMap::default();
        for (i, edge) in edges.iter().enumerate() {
            if let Some(&b) = block_of_start.get(&edge.to) {
                incoming[b].push(i);
            }
            outgoing.entry(edge.from).or_default().push(i);
        }
        let mut external: FxHashMap<u64, Vec<u64>> = FxHashMap::default();
        for jump in &ctx.external_jumps {
            external.entry(jump.from).or_default().push(jump.to);
        }
        Self {
            block_of_start,
            incoming,
            outgoing,
            external,
        }
    }
}

/// Replay a block's instructions up to, not including, index `stop`.
fn replay(
    ctx: &mut AnalysisContext<'_>,
    instructions: &[DecodedInstruction],
    mut state: RegisterState,
    from: usize,
    stop: usize,
) -> Result<RegisterState> {
    for decoded in &instructions[from..stop] {
        Interpreter::new(&ctx.function.name, ctx.config, &mut ctx.params).execute(&mut state, decoded)?;
    }
    Ok(state)
}

fn replay_to(
    ctx: &mut AnalysisContext<'_>,
    instructions: &[DecodedInstruction],
    inputs: &[Option<RegisterState>],
    exit: u64,
) -> Result<RegisterState> {
    let not_reached = || AnalysisError::ExitNotReached {
        function: ctx.function.name.clone(),
        exit,
    };
    let index = instructions
        .iter()
        .position(|d| d.contains(exit))
        .ok_or_else(not_reached)?;
    let (first, input) = ctx
        .blocks
        .iter()
        .zip(inputs)
        .find(|(block, _)| block.instructions.contains(&index))
        .and_then(|(block, input)| Some((block.instructions.start, input.clone()?)))
        .ok_or_else(not_reached)?;
    replay(ctx, instructions, input, first, index)
}

fn replay_returns(
    ctx: &mut AnalysisContext<'_>,
    instructions: &[DecodedInstruction],
    inputs: &[Option<RegisterState>],
) -> Result<RegisterState> {
    let mut exits = Vec::new();
    let blocks = ctx.blocks.clone();
    for (block, input) in blocks.iter().zip(inputs) {
        let Some(input) = input else { continue };
        let mut state = input.clone();
        let mut from = block.instructions.start;
        for index in block.instructions.clone() {
            if instructions[index].usage.is_return() {
                state = replay(ctx, instructions, state, from, index)?;
                from = index;
                exits.push(state.clone());
            }
        }
    }
    let mut merged = RegisterState::merge_all(exits.iter()).ok_or_else(|| AnalysisError::NoReturnPath {
        function: ctx.function.name.clone(),
    })?;
    merged.canonicalize();
    Ok(merged)
}
