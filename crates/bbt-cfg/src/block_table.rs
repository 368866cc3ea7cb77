//! Pass 1: decode a function and split it into basic blocks.

use std::ops::Range;
use std::sync::Arc;

use bbt_isa::{Instruction, Operand};
use rustc_hash::FxHashSet;
use tracing::{debug, trace, trace_span, warn};

use crate::config::UnknownInstructionPolicy;
use crate::context::{AnalysisContext, DecodedInstruction};
use crate::error::{AnalysisError, Result};
use crate::source::{Disassembler, MemoryReader, SymbolResolver};
use crate::usage::{Access, Usage, classify};
use crate::value::RegisterState;

/// Basic block with start/end addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicBlock {
    /// Address of the first instruction.
    pub start: u64,
    /// Address of the last instruction.
    pub end: u64,
    /// Control falls into the next block.
    pub drop_through: bool,
    /// Indices into the decoded instruction list.
    pub(crate) instructions: Range<usize>,
}

/// Control flow between two instructions of the same function.
#[derive(Clone, Debug)]
pub struct Edge {
    /// Last instruction of the source block.
    pub from: u64,
    /// First instruction of the target block.
    pub to: u64,
    pub drop_through: bool,
    /// Provenance flowing along this edge. Equal states share one
    /// allocation.
    pub state: Option<Arc<RegisterState>>,
}

impl Edge {
    pub fn new(from: u64, to: u64, drop_through: bool) -> Self {
        Self {
            from,
            to,
            drop_through,
            state: None,
        }
    }

    fn key(&self) -> (u64, u64, bool) {
        (self.from, self.to, self.drop_through)
    }
}

/// A jump leaving the function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExternalJump {
    pub from: u64,
    pub to: u64,
}

/// Decode the function in `ctx`, then fill in its blocks, edges and
/// external jumps.
pub fn build_blocks(
    ctx: &mut AnalysisContext<'_>,
    disassembler: &dyn Disassembler,
    symbols: &dyn SymbolResolver,
    memory: &dyn MemoryReader,
) -> Result<()> {
    ctx.ensure_live()?;
    let _span = trace_span!("pass1", function = %ctx.function.name).entered();

    let mut starts = FxHashSet::default();
    let mut ends = FxHashSet::default();
    starts.insert(ctx.function.start);

    decode_all(ctx, disassembler, symbols, memory, &mut starts, &mut ends)?;
    form_blocks(ctx, &starts, &ends)?;

    debug!(
        function = %ctx.function.name,
        instructions = ctx.instructions.len(),
        blocks = ctx.blocks.len(),
        edges = ctx.edges.len(),
        external = ctx.external_jumps.len(),
        "blocks built"
    );
    Ok(())
}

fn decode_all(
    ctx: &mut AnalysisContext<'_>,
    disassembler: &dyn Disassembler,
    symbols: &dyn SymbolResolver,
    memory: &dyn MemoryReader,
    starts: &mut FxHashSet<u64>,
    ends: &mut FxHashSet<u64>,
) -> Result<()> {
    let (start, end) = (ctx.function.start, ctx.function.end);
    let mut address = start;

    while address < end {
        let mut targets = Vec::new();
        let line = disassembler
            .decode(address, &mut |t| targets.push(t))
            .filter(|line| line.length > 0)
            .ok_or_else(|| AnalysisError::UnreadableInstruction {
                function: ctx.function.name.clone(),
                address,
            })?;
        let insn = Instruction::parse(&line.text).map_err(|source| AnalysisError::Unparseable {
            function: ctx.function.name.clone(),
            address,
            text: line.text.clone(),
            source,
        })?;
        let usage = match classify(&insn.mnemonic) {
            Some(usage) => usage,
            None => match ctx.config.unknown_instruction {
                UnknownInstructionPolicy::Abandon => {
                    return Err(AnalysisError::UnknownMnemonic {
                        function: ctx.function.name.clone(),
                        address,
                        mnemonic: insn.mnemonic.clone(),
                    });
                }
                UnknownInstructionPolicy::EraseOperands => {
                    warn!(address = format_args!("{address:#x}"), mnemonic = %insn.mnemonic, "unknown mnemonic, erasing operands");
                    Usage::Generic(Access::RS_RD_WS_WD)
                }
            },
        };
        let next = address + line.length;

        if targets.is_empty()
            && matches!(usage, Usage::Jmp | Usage::Branch | Usage::Loop | Usage::Call)
            && let Some(target) = insn.target().and_then(Operand::branch_target)
        {
            targets.push(target);
        }

        if usage.is_jump() {
            if usage == Usage::Jmp
                && targets.is_empty()
                && let Some(op) = insn.target()
                && op.is_indirect()
            {
                match jump_table(ctx, memory, address, op)? {
                    Some(entries) => targets = entries,
                    None => {
                        trace!(address = format_args!("{address:#x}"), "indirect tail call");
                        ctx.has_tail_call = true;
                    }
                }
            }
            for target in targets.iter().copied() {
                if target >= start && target < end {
                    starts.insert(target);
                    ctx.edges.push(Edge::new(address, target, false));
                } else {
                    ctx.external_jumps.push(ExternalJump { from: address, to: target });
                }
            }
            if usage != Usage::Jmp {
                starts.insert(next);
            }
        } else if usage == Usage::Call
            && let Some(&target) = targets.first()
            && let Some(callee) = symbols.resolve(target)
            && callee.start == target
            && ctx.config.is_noreturn(&callee.name)
        {
            trace!(callee = %callee.name, "call never returns");
            ends.insert(address);
        }

        if usage.ends_block() {
            ends.insert(address);
        }
        if usage.is_return() {
            ctx.has_return = true;
        }

        ctx.instructions.push(DecodedInstruction {
            address,
            length: line.length,
            text: line.text,
            insn,
            usage,
        });
        address = next;
    }
    Ok(())
}

/// Read the targets of `jmp *table(,%reg,8)`. Returns `None` for any
/// other indirect jump. Entries are read until one falls outside the
/// function.
fn jump_table(
    ctx: &AnalysisContext<'_>,
    memory: &dyn MemoryReader,
    address: u64,
    op: &Operand,
) -> Result<Option<Vec<u64>>> {
    let Some(mem) = op.memory() else {
        return Ok(None);
    };
    if mem.base.is_some() || mem.index_gpr().is_none() || mem.scale != 8 || mem.segment.is_some() {
        return Ok(None);
    }

    let table = mem.disp as u64;
    let mut entries = Vec::new();
    for i in 0..ctx.config.max_jump_table_entries as u64 {
        let slot = table.wrapping_add(i * 8);
        let Some(word) = memory.read_word(slot) else {
            if i == 0 {
                return Err(AnalysisError::UnreadableMemory {
                    function: ctx.function.name.clone(),
                    address,
                    target: slot,
                });
            }
            break;
        };
        if !ctx.function.contains(word) {
            break;
        }
        entries.push(word);
    }
    trace!(table = format_args!("{table:#x}"), entries = entries.len(), "jump table");
    Ok(Some(entries))
}

fn form_blocks(
    ctx: &mut AnalysisContext<'_>,
    starts: &FxHashSet<u64>,
    ends: &FxHashSet<u64>,
) -> Result<()> {
    if ctx.instructions.is_empty() {
        return Err(AnalysisError::EmptyFunction {
            function: ctx.function.name.clone(),
        });
    }

    let boundaries: FxHashSet<u64> = ctx.instructions.iter().map(|d| d.address).collect();
    let mut misaligned: Vec<u64> = starts.difference(&boundaries).copied().collect();
    misaligned.sort_unstable();
    if let Some(&target) = misaligned.first() {
        return Err(AnalysisError::MisalignedTarget {
            function: ctx.function.name.clone(),
            target,
        });
    }

    let mut dead = FxHashSet::default();
    let mut open: Option<(u64, usize)> = None;
    for (i, decoded) in ctx.instructions.iter().enumerate() {
        if starts.contains(&decoded.address) {
            if let Some((start, first)) = open.take() {
                let last = ctx.instructions[i - 1].address;
                ctx.blocks.push(BasicBlock {
                    start,
                    end: last,
                    drop_through: true,
                    instructions: first..i,
                });
                ctx.edges.push(Edge::new(last, decoded.address, true));
            }
            open = Some((decoded.address, i));
        }

        let Some((start, first)) = open else {
            dead.insert(decoded.address);
            continue;
        };
        if ends.contains(&decoded.address) {
            ctx.blocks.push(BasicBlock {
                start,
                end: decoded.address,
                drop_through: false,
                instructions: first..i + 1,
            });
            open = None;
        }
    }

    if let Some((start, _)) = open {
        return Err(AnalysisError::BlockNotClosed {
            function: ctx.function.name.clone(),
            start,
        });
    }

    if !dead.is_empty() {
        trace!(count = dead.len(), "unreachable instructions");
    }
    ctx.edges.retain(|e| !dead.contains(&e.from));
    ctx.edges.sort_by_key(Edge::key);
    ctx.edges.dedup_by_key(|e| e.key());
    ctx.external_jumps.retain(|j| !dead.contains(&j.from));
    Ok(())
}
