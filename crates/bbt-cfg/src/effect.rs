//! Instruction effects on register and stack provenance.
//!
//! Anything the model cannot express exactly becomes undefined. Named
//! idioms (moves, pushes, stack arithmetic) carry provenance through.

use bbt_isa::{
    CLOBBERED_REGS, MemoryOperand, Operand, Reg, RegisterName, WORD_SIZE,
};
use tracing::trace;

use crate::config::AnalysisConfig;
use crate::context::{DecodedInstruction, ParamUsage};
use crate::error::{AnalysisError, Result};
use crate::special::SpecialCase;
use crate::usage::{Access, Usage};
use crate::value::{Provenance, RegisterState};

/// Where a memory operand points, relative to the tracked stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StackRef {
    /// A known offset from OSP.
    Slot(i64),
    /// Somewhere on the stack, at an offset the model cannot compute.
    Unknown,
    /// Not stack-relative as far as the model knows.
    Elsewhere,
}

fn stack_ref(state: &RegisterState, mem: &MemoryOperand) -> StackRef {
    if mem.segment.is_some() {
        return StackRef::Elsewhere;
    }
    let base = mem.base_gpr().and_then(|r| state.get(r).osp_offset());
    let index_on_stack = mem
        .index_gpr()
        .is_some_and(|r| state.get(r).osp_offset().is_some());
    match base {
        Some(k) if mem.index_gpr().is_none() => StackRef::Slot(k.wrapping_add(mem.disp)),
        Some(_) => StackRef::Unknown,
        None if index_on_stack => StackRef::Unknown,
        None => StackRef::Elsewhere,
    }
}

fn set_register(state: &mut RegisterState, reg: Reg, value: Provenance) {
    state.set(reg, value);
    if reg == Reg::Rsp
        && let Some(offset) = value.osp_offset()
    {
        state.drop_below(offset);
    }
}

/// `op %r,%r` with the same register on both sides.
fn is_self_operation(operands: &[Operand]) -> bool {
    matches!(operands, [a, b] if a.register().is_some() && a.register() == b.register())
}

/// Current provenance of a full-width register or a tracked stack word.
fn value_of(state: &RegisterState, op: &Operand) -> Provenance {
    match op {
        Operand::Register { name, .. } => name
            .full_gpr()
            .map_or(Provenance::Undefined, |r| state.get(r)),
        Operand::Memory { mem, .. } => match stack_ref(state, mem) {
            StackRef::Slot(offset) => state.slot(offset),
            _ => Provenance::Undefined,
        },
        _ => Provenance::Undefined,
    }
}

/// Applies instruction effects for one function, recording which
/// parameters it reads.
pub struct Interpreter<'c> {
    function: &'c str,
    config: &'c AnalysisConfig,
    params: &'c mut ParamUsage,
}

impl<'c> Interpreter<'c> {
    pub fn new(function: &'c str, config: &'c AnalysisConfig, params: &'c mut ParamUsage) -> Self {
        Self {
            function,
            config,
            params,
        }
    }

    /// Apply one instruction to `state`.
    pub fn execute(&mut self, state: &mut RegisterState, decoded: &DecodedInstruction) -> Result<()> {
        let insn = &decoded.insn;
        let usage = decoded.usage;

        if let Some(case) = SpecialCase::find(self.function, self.config, insn, usage) {
            trace!(address = format_args!("{:#x}", decoded.address), case = case.name(), "special case");
            if matches!(
                case,
                SpecialCase::SchedulerStackSwitch | SpecialCase::ResumeStackSwitch
            ) && let Some(src) = insn.src()
            {
                self.read(state, src);
            }
            return Ok(());
        }

        match usage {
            Usage::Generic(access) => self.generic(state, &insn.operands, access),
            Usage::Nop
            | Usage::Ud2
            | Usage::Ret
            | Usage::Iret
            | Usage::Sysret
            | Usage::Sysexit => {}
            Usage::Jmp | Usage::Branch => {
                if let Some(op) = insn.src()
                    && op.is_indirect()
                {
                    self.read(state, op);
                }
            }
            Usage::Loop => self.clobber(state, &[Reg::Rcx], &[Reg::Rcx]),
            Usage::Call => {
                if let Some(op) = insn.src()
                    && op.is_indirect()
                {
                    self.read(state, op);
                }
                for reg in CLOBBERED_REGS {
                    state.set(reg, Provenance::Undefined);
                }
            }
            Usage::Mov => {
                let [src, dst] = insn.operands.as_slice() else {
                    return Err(self.bad_operands(decoded));
                };
                self.read(state, src);
                let value = value_of(state, src);
                self.write(state, dst, value);
            }
            Usage::Lea => {
                let [Operand::Memory { mem, .. }, dst] = insn.operands.as_slice() else {
                    return Err(self.bad_operands(decoded));
                };
                self.read_address(state, mem);
                let value = match mem.base_gpr() {
                    Some(base) if mem.segment.is_none() && mem.index_gpr().is_none() => {
                        state.get(base).offset_by(mem.disp)
                    }
                    _ => Provenance::Undefined,
                };
                self.write(state, dst, value);
            }
            Usage::Add | Usage::Sub => self.add_sub(state, &insn.operands, usage == Usage::Add),
            Usage::Xor => {
                if is_self_operation(&insn.operands) {
                    self.write(state, &insn.operands[1], Provenance::Undefined);
                } else {
                    self.generic(state, &insn.operands, Access::RS_RD_WD);
                }
            }
            Usage::Push | Usage::Pushf => {
                let value = if usage == Usage::Push {
                    let [src] = insn.operands.as_slice() else {
                        return Err(self.bad_operands(decoded));
                    };
                    self.read(state, src);
                    value_of(state, src)
                } else {
                    Provenance::Undefined
                };
                if let Some(sp) = state.stack_offset() {
                    let sp = sp - WORD_SIZE;
                    state.set(Reg::Rsp, Provenance::Osp(sp));
                    state.store(sp, value);
                } else {
                    // The store lands somewhere untracked.
                    state.set(Reg::Rsp, Provenance::Undefined);
                    state.clear_memory();
                }
            }
            Usage::Pop | Usage::Popf => {
                let dst = if usage == Usage::Pop {
                    let [dst] = insn.operands.as_slice() else {
                        return Err(self.bad_operands(decoded));
                    };
                    Some(dst)
                } else {
                    None
                };
                let value = self.pop(state);
                if let Some(dst) = dst {
                    self.write(state, dst, value);
                }
            }
            Usage::Leave => {
                self.read_reg(state, Reg::Rbp);
                let frame = state.get(Reg::Rbp);
                set_register(state, Reg::Rsp, frame);
                let value = self.pop(state);
                set_register(state, Reg::Rbp, value);
            }
            Usage::Cbw => self.clobber(state, &[Reg::Rax], &[Reg::Rax]),
            Usage::Cwd => self.clobber(state, &[Reg::Rax], &[Reg::Rdx]),
            Usage::Cmov => {
                let [src, dst] = insn.operands.as_slice() else {
                    return Err(self.bad_operands(decoded));
                };
                self.read(state, src);
                self.read(state, dst);
                match dst.full_gpr() {
                    Some(reg) if value_of(state, src) == state.get(reg) => {}
                    _ => self.write(state, dst, Provenance::Undefined),
                }
            }
            Usage::Cmpxchg => {
                self.read_reg(state, Reg::Rax);
                self.generic(state, &insn.operands, Access::RS_RD_WD);
                state.set(Reg::Rax, Provenance::Undefined);
            }
            Usage::Cmpxchgd => {
                self.clobber(
                    state,
                    &[Reg::Rax, Reg::Rbx, Reg::Rcx, Reg::Rdx],
                    &[Reg::Rax, Reg::Rdx],
                );
                self.generic(state, &insn.operands, Access::RS_WS);
            }
            Usage::Cpuid => self.clobber(
                state,
                &[Reg::Rax, Reg::Rcx],
                &[Reg::Rax, Reg::Rbx, Reg::Rcx, Reg::Rdx],
            ),
            Usage::Div | Usage::Idiv => {
                self.generic(state, &insn.operands, Access::RS);
                self.clobber(state, &[Reg::Rax, Reg::Rdx], &[Reg::Rax, Reg::Rdx]);
            }
            Usage::Mul => {
                if let [src, low, high] = insn.operands.as_slice() {
                    // mulx: rdx times src, rax untouched.
                    self.read(state, src);
                    self.read_reg(state, Reg::Rdx);
                    self.write(state, low, Provenance::Undefined);
                    self.write(state, high, Provenance::Undefined);
                } else {
                    self.generic(state, &insn.operands, Access::RS);
                    self.clobber(state, &[Reg::Rax], &[Reg::Rax, Reg::Rdx]);
                }
            }
            Usage::Imul => {
                if insn.operands.len() == 1 {
                    self.generic(state, &insn.operands, Access::RS);
                    self.clobber(state, &[Reg::Rax], &[Reg::Rax, Reg::Rdx]);
                } else {
                    self.generic(state, &insn.operands, Access::RS_RD_WD);
                }
            }
            Usage::Lahf => self.clobber(state, &[], &[Reg::Rax]),
            Usage::Sahf => self.clobber(state, &[Reg::Rax], &[]),
            Usage::Lods => self.string_op(state, decoded, &[Reg::Rsi], &[Reg::Rax, Reg::Rsi], false),
            Usage::Stos => self.string_op(state, decoded, &[Reg::Rax, Reg::Rdi], &[Reg::Rdi], true),
            Usage::Movs => self.string_op(
                state,
                decoded,
                &[Reg::Rsi, Reg::Rdi],
                &[Reg::Rsi, Reg::Rdi],
                true,
            ),
            Usage::Scas => self.string_op(state, decoded, &[Reg::Rax, Reg::Rdi], &[Reg::Rdi], false),
            Usage::Cmps => self.string_op(
                state,
                decoded,
                &[Reg::Rsi, Reg::Rdi],
                &[Reg::Rsi, Reg::Rdi],
                false,
            ),
            Usage::Outs => self.string_op(state, decoded, &[Reg::Rsi, Reg::Rdx], &[Reg::Rsi], false),
            Usage::Ins => self.string_op(state, decoded, &[Reg::Rdx, Reg::Rdi], &[Reg::Rdi], true),
            Usage::Lss => self.generic(state, &insn.operands, Access::RS_WD),
            Usage::Monitor => self.clobber(state, &[Reg::Rax, Reg::Rcx, Reg::Rdx], &[]),
            Usage::Mwait => self.clobber(state, &[Reg::Rax, Reg::Rcx], &[]),
            Usage::Rdmsr => self.clobber(state, &[Reg::Rcx], &[Reg::Rax, Reg::Rdx]),
            Usage::Rdtsc => self.clobber(state, &[], &[Reg::Rax, Reg::Rdx]),
            Usage::Rdtscp => self.clobber(state, &[], &[Reg::Rax, Reg::Rcx, Reg::Rdx]),
            Usage::Wrmsr => self.clobber(state, &[Reg::Rax, Reg::Rcx, Reg::Rdx], &[]),
            Usage::Xadd => {
                let [src, dst] = insn.operands.as_slice() else {
                    return Err(self.bad_operands(decoded));
                };
                self.read(state, src);
                self.read(state, dst);
                let old = value_of(state, dst);
                self.write(state, dst, Provenance::Undefined);
                self.write(state, src, old);
            }
            Usage::Xchg => {
                let [a, b] = insn.operands.as_slice() else {
                    return Err(self.bad_operands(decoded));
                };
                self.read(state, a);
                self.read(state, b);
                let (va, vb) = (value_of(state, a), value_of(state, b));
                let exact = |op: &Operand| {
                    op.full_gpr().is_some()
                        || op.memory().is_some_and(|m| matches!(stack_ref(state, m), StackRef::Slot(_)))
                };
                if exact(a) && exact(b) {
                    self.write(state, a, vb);
                    self.write(state, b, va);
                } else {
                    self.write(state, a, Provenance::Undefined);
                    self.write(state, b, Provenance::Undefined);
                }
            }
        }
        Ok(())
    }

    fn bad_operands(&self, decoded: &DecodedInstruction) -> AnalysisError {
        AnalysisError::BadOperands {
            function: self.function.to_string(),
            address: decoded.address,
            instruction: decoded.text.clone(),
        }
    }

    fn read_reg(&mut self, state: &RegisterState, reg: Reg) {
        if let Some(i) = reg.argument_index()
            && state.get(reg) == Provenance::Original(reg)
        {
            self.params.registers = self.params.registers.max(i + 1);
        }
    }

    fn read_address(&mut self, state: &RegisterState, mem: &MemoryOperand) {
        if let Some(base) = mem.base.as_ref().and_then(RegisterName::gpr) {
            self.read_reg(state, base);
        }
        if let Some(index) = mem.index_gpr() {
            self.read_reg(state, index);
        }
    }

    /// Read an operand's value.
    fn read(&mut self, state: &RegisterState, op: &Operand) {
        match op {
            Operand::Register { name, .. } => {
                if let Some(reg) = name.gpr() {
                    self.read_reg(state, reg);
                }
            }
            Operand::Memory { mem, .. } => {
                self.read_address(state, mem);
                if let StackRef::Slot(offset) = stack_ref(state, mem)
                    && offset > 0
                {
                    let words = offset.unsigned_abs().div_ceil(WORD_SIZE as u64) as usize;
                    self.params.memory = self.params.memory.max(words);
                }
            }
            Operand::Immediate(_) | Operand::Address(_) => {}
        }
    }

    /// Write `value` to an operand. Partial-width register writes and
    /// writes of untracked values leave the location undefined.
    fn write(&mut self, state: &mut RegisterState, op: &Operand, value: Provenance) {
        match op {
            Operand::Register {
                name: RegisterName::Gpr(reg, width),
                ..
            } => {
                let value = if width.is_full() { value } else { Provenance::Undefined };
                set_register(state, *reg, value);
            }
            Operand::Memory { mem, .. } => {
                self.read_address(state, mem);
                match stack_ref(state, mem) {
                    StackRef::Slot(offset) => state.store(offset, value),
                    StackRef::Unknown => state.clear_memory(),
                    StackRef::Elsewhere => {}
                }
            }
            _ => {}
        }
    }

    fn pop(&mut self, state: &mut RegisterState) -> Provenance {
        let Some(sp) = state.stack_offset() else {
            state.set(Reg::Rsp, Provenance::Undefined);
            return Provenance::Undefined;
        };
        let value = state.slot(sp);
        set_register(state, Reg::Rsp, Provenance::Osp(sp + WORD_SIZE));
        value
    }

    fn add_sub(&mut self, state: &mut RegisterState, operands: &[Operand], add: bool) {
        if let [src, dst] = operands
            && let Some(imm) = src.immediate()
            && let Some(reg) = dst.full_gpr()
        {
            self.read_reg(state, reg);
            let delta = if add { imm } else { imm.wrapping_neg() };
            let value = state.get(reg).offset_by(delta);
            set_register(state, reg, value);
            return;
        }
        if !add && is_self_operation(operands) {
            self.write(state, &operands[1], Provenance::Undefined);
            return;
        }
        self.generic(state, operands, Access::RS_RD_WD);
    }

    fn generic(&mut self, state: &mut RegisterState, operands: &[Operand], access: Access) {
        match operands {
            [] => {}
            [op] => {
                if access.read_src || access.read_dst {
                    self.read(state, op);
                }
                if access.write_src || access.write_dst {
                    self.write(state, op, Provenance::Undefined);
                }
            }
            [src, dst] => {
                if access.read_src {
                    self.read(state, src);
                }
                if access.read_dst {
                    self.read(state, dst);
                }
                if access.write_src {
                    self.write(state, src, Provenance::Undefined);
                }
                if access.write_dst {
                    self.write(state, dst, Provenance::Undefined);
                }
            }
            [src, middle @ .., dst] => {
                if access.read_src {
                    self.read(state, src);
                    for op in middle {
                        self.read(state, op);
                    }
                }
                if access.read_dst {
                    self.read(state, dst);
                }
                if access.write_src {
                    self.write(state, src, Provenance::Undefined);
                }
                if access.write_dst {
                    self.write(state, dst, Provenance::Undefined);
                }
            }
        }
    }

    /// Read and then clobber fixed registers.
    fn clobber(&mut self, state: &mut RegisterState, reads: &[Reg], writes: &[Reg]) {
        for &reg in reads {
            self.read_reg(state, reg);
        }
        for &reg in writes {
            set_register(state, reg, Provenance::Undefined);
        }
    }

    fn string_op(
        &mut self,
        state: &mut RegisterState,
        decoded: &DecodedInstruction,
        reads: &[Reg],
        writes: &[Reg],
        stores: bool,
    ) {
        // Stores through a stack-based rdi hit an unknown range of slots.
        if stores && state.get(Reg::Rdi).osp_offset().is_some() {
            state.clear_memory();
        }
        self.clobber(state, reads, writes);
        if decoded.insn.is_repeated() {
            self.clobber(state, &[Reg::Rcx], &[Reg::Rcx]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbt_isa::Instruction;

    use crate::usage::classify;

    struct Run {
        config: AnalysisConfig,
        params: ParamUsage,
        state: RegisterState,
    }

    impl Run {
        fn new() -> Self {
            Self {
                config: AnalysisConfig::default(),
                params: ParamUsage::default(),
                state: RegisterState::entry(),
            }
        }

        fn exec(&mut self, function: &str, lines: &[&str]) {
            for (i, text) in lines.iter().enumerate() {
                let insn = Instruction::parse(text).unwrap();
                let usage = classify(&insn.mnemonic).unwrap();
                let decoded = DecodedInstruction {
                    address: 0x1000 + i as u64 * 4,
                    length: 4,
                    text: (*text).to_string(),
                    insn,
                    usage,
                };
                Interpreter::new(function, &self.config, &mut self.params)
                    .execute(&mut self.state, &decoded)
                    .unwrap();
            }
        }

        fn run(lines: &[&str]) -> Self {
            let mut run = Self::new();
            run.exec("f", lines);
            run
        }
    }

    #[test]
    fn test_push_pop_round_trip() {
        let run = Run::run(&["push %r12", "push %rbx", "mov $0x1,%eax", "pop %rbx", "pop %r12"]);
        assert_eq!(run.state.get(Reg::Rbx), Provenance::Original(Reg::Rbx));
        assert_eq!(run.state.get(Reg::R12), Provenance::Original(Reg::R12));
        assert_eq!(run.state.get(Reg::Rsp), Provenance::Osp(0));
        assert_eq!(run.state.get(Reg::Rax), Provenance::Undefined);
        assert!(run.state.memory().is_empty());
    }

    #[test]
    fn test_swap_via_temp() {
        let run = Run::run(&["mov %rdi,%rax", "mov %rsi,%rdi", "mov %rax,%rsi"]);
        assert_eq!(run.state.get(Reg::Rdi), Provenance::Original(Reg::Rsi));
        assert_eq!(run.state.get(Reg::Rsi), Provenance::Original(Reg::Rdi));
        assert_eq!(run.params.registers, 2);
    }

    #[test]
    fn test_stack_ops_on_foreign_stack() {
        let run = Run::run(&["push %rbx", "mov %rdi,%rsp", "push %rbx"]);
        assert_eq!(run.state.get(Reg::Rsp), Provenance::Undefined);
        assert!(run.state.memory().is_empty());

        let run = Run::run(&["mov %rdi,%rsp", "pop %rax"]);
        assert_eq!(run.state.get(Reg::Rsp), Provenance::Undefined);
        assert_eq!(run.state.get(Reg::Rax), Provenance::Undefined);

        // No frame was set up, so rbp is the caller's and rsp ends at rbp+8.
        let run = Run::run(&["leaveq"]);
        assert_eq!(run.state.get(Reg::Rsp), Provenance::Undefined);
        assert_eq!(run.state.get(Reg::Rbp), Provenance::Undefined);
    }

    #[test]
    fn test_mulx_writes_destinations() {
        let run = Run::run(&["mulx %r8,%rbx,%rcx"]);
        assert_eq!(run.state.get(Reg::Rbx), Provenance::Undefined);
        assert_eq!(run.state.get(Reg::Rcx), Provenance::Undefined);
        assert_eq!(run.state.get(Reg::Rax), Provenance::Original(Reg::Rax));
        assert_eq!(run.params.registers, 5);
    }

    #[test]
    fn test_frame_pointer_and_locals() {
        let run = Run::run(&[
            "push %rbp",
            "mov %rsp,%rbp",
            "sub $0x20,%rsp",
            "mov %rbx,-0x8(%rbp)",
            "lea -0x10(%rbp),%rax",
        ]);
        assert_eq!(run.state.get(Reg::Rbp), Provenance::Osp(-8));
        assert_eq!(run.state.get(Reg::Rsp), Provenance::Osp(-0x28));
        assert_eq!(run.state.slot(-0x10), Provenance::Original(Reg::Rbx));
        assert_eq!(run.state.slot(-0x8), Provenance::Original(Reg::Rbp));
        assert_eq!(run.state.get(Reg::Rax), Provenance::Osp(-0x18));
    }

    #[test]
    fn test_leave_restores_frame() {
        let run = Run::run(&["push %rbp", "mov %rsp,%rbp", "sub $0x10,%rsp", "leaveq"]);
        assert_eq!(run.state.get(Reg::Rbp), Provenance::Original(Reg::Rbp));
        assert_eq!(run.state.get(Reg::Rsp), Provenance::Osp(0));
        assert!(run.state.memory().is_empty());
    }

    #[test]
    fn test_partial_writes_and_self_xor() {
        let run = Run::run(&["mov %edi,%ebx", "xor %eax,%eax", "mov %rcx,%rdx"]);
        assert_eq!(run.state.get(Reg::Rbx), Provenance::Undefined);
        assert_eq!(run.state.get(Reg::Rax), Provenance::Undefined);
        assert_eq!(run.state.get(Reg::Rdx), Provenance::Original(Reg::Rcx));
        // rdi and rcx were read, rax was only written.
        assert_eq!(run.params.registers, 4);
    }

    #[test]
    fn test_call_clobbers() {
        let run = Run::run(&["callq *%rax"]);
        for reg in CLOBBERED_REGS {
            assert_eq!(run.state.get(reg), Provenance::Undefined);
        }
        assert_eq!(run.state.get(Reg::Rbx), Provenance::Original(Reg::Rbx));
        assert_eq!(run.state.get(Reg::Rsp), Provenance::Osp(0));
    }

    #[test]
    fn test_stack_argument_read() {
        let run = Run::run(&["mov 0x10(%rsp),%rax", "mov 0x0(%rsp),%rcx"]);
        assert_eq!(run.params.memory, 2);
        let run = Run::run(&["lea 0x18(%rsp),%rax"]);
        assert_eq!(run.params.memory, 0);
    }

    #[test]
    fn test_indexed_store_clears_memory() {
        let run = Run::run(&["push %rbx", "mov %rax,(%rsp,%rcx,8)"]);
        assert!(run.state.memory().is_empty());
        assert_eq!(run.state.get(Reg::Rsp), Provenance::Osp(-8));
    }

    #[test]
    fn test_cmov_keeps_equal_values() {
        let run = Run::run(&["mov %rbx,%rax", "cmove %rbx,%rax", "cmovne %rcx,%rdx"]);
        assert_eq!(run.state.get(Reg::Rax), Provenance::Original(Reg::Rbx));
        assert_eq!(run.state.get(Reg::Rdx), Provenance::Undefined);
    }

    #[test]
    fn test_xchg_swaps() {
        let run = Run::run(&["xchg %rbx,%r12"]);
        assert_eq!(run.state.get(Reg::Rbx), Provenance::Original(Reg::R12));
        assert_eq!(run.state.get(Reg::R12), Provenance::Original(Reg::Rbx));

        let run = Run::run(&["push %rbx", "xchg %r13,(%rsp)"]);
        assert_eq!(run.state.get(Reg::R13), Provenance::Original(Reg::Rbx));
        assert_eq!(run.state.slot(-8), Provenance::Original(Reg::R13));
    }

    #[test]
    fn test_string_ops() {
        let run = Run::run(&["push %rbx", "mov %rsp,%rdi", "rep stos %rax,%es:(%rdi)"]);
        assert!(run.state.memory().is_empty());
        assert_eq!(run.state.get(Reg::Rdi), Provenance::Undefined);
        assert_eq!(run.state.get(Reg::Rcx), Provenance::Undefined);
    }

    #[test]
    fn test_scheduler_switch_keeps_stack() {
        let mut run = Run::new();
        run.exec("__schedule", &["push %rbp", "mov 0x10(%rsi),%rsp"]);
        assert_eq!(run.state.get(Reg::Rsp), Provenance::Osp(-8));
        assert_eq!(run.state.slot(-8), Provenance::Original(Reg::Rbp));

        let mut run = Run::new();
        run.exec("do_fork", &["mov 0x10(%rsi),%rsp"]);
        assert_eq!(run.state.get(Reg::Rsp), Provenance::Undefined);
    }

    #[test]
    fn test_padding_nops() {
        let run = Run::run(&["lea 0x0(%rsi,%riz,1),%rsi", "xchg %ax,%ax"]);
        assert_eq!(run.state, RegisterState::entry());
        assert_eq!(run.params.registers, 0);
    }

    #[test]
    fn test_mul_div() {
        let run = Run::run(&["mul %rbx", "mov %r8,%rcx", "div %rcx"]);
        assert_eq!(run.state.get(Reg::Rax), Provenance::Undefined);
        assert_eq!(run.state.get(Reg::Rdx), Provenance::Undefined);
        assert_eq!(run.state.get(Reg::Rcx), Provenance::Original(Reg::R8));
        assert_eq!(run.params.registers, 5);
    }
}
