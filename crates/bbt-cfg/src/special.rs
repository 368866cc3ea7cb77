//! Named exceptions to the generic instruction effects.
//!
//! Each case matches one instruction shape and may be restricted to a set of
//! functions. A matching instruction leaves the stack pointer's provenance
//! untouched instead of making it undefined.

use bbt_isa::{Instruction, Operand, Reg, RegisterName, Width};

use crate::config::AnalysisConfig;
use crate::usage::Usage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpecialCase {
    /// `mov <saved>,%rsp` in the scheduler. The task being analyzed resumes
    /// on the stack it saved, so from its point of view the stack pointer is
    /// unchanged.
    SchedulerStackSwitch,
    /// `mov <saved>,%rsp` in resume paths (hibernation image restore, probe
    /// return, FPU abort) that reload a previously saved stack pointer.
    ResumeStackSwitch,
    /// `lea 0x0(%r[,%riz,1]),%r`, a multi-byte padding encoding.
    PaddingLea,
    /// `xchg %ax,%ax`, a two-byte padding encoding.
    PaddingXchg,
}

impl SpecialCase {
    pub const ALL: [Self; 4] = [
        Self::SchedulerStackSwitch,
        Self::ResumeStackSwitch,
        Self::PaddingLea,
        Self::PaddingXchg,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::SchedulerStackSwitch => "scheduler_stack_switch",
            Self::ResumeStackSwitch => "resume_stack_switch",
            Self::PaddingLea => "padding_lea",
            Self::PaddingXchg => "padding_xchg",
        }
    }

    /// Functions this case is limited to; `None` means any function.
    pub fn gate(self, config: &AnalysisConfig) -> Option<&[String]> {
        match self {
            Self::SchedulerStackSwitch => Some(&config.scheduler_functions),
            Self::ResumeStackSwitch => Some(&config.stack_switch_functions),
            Self::PaddingLea | Self::PaddingXchg => None,
        }
    }

    /// Check the instruction shape alone.
    pub fn matches_shape(self, insn: &Instruction, usage: Usage) -> bool {
        match self {
            Self::SchedulerStackSwitch | Self::ResumeStackSwitch => {
                usage == Usage::Mov
                    && insn.operands.len() == 2
                    && insn.dst().and_then(Operand::full_gpr) == Some(Reg::Rsp)
                    && matches!(
                        insn.src(),
                        Some(Operand::Memory { .. } | Operand::Register { .. })
                    )
            }
            Self::PaddingLea => {
                let (Some(Operand::Memory { mem, .. }), Some(dst)) = (insn.src(), insn.dst()) else {
                    return false;
                };
                usage == Usage::Lea
                    && mem.disp == 0
                    && mem.segment.is_none()
                    && matches!(mem.index, None | Some(RegisterName::ZeroIndex))
                    && mem.base.is_some()
                    && mem.base.as_ref() == dst.register()
            }
            Self::PaddingXchg => {
                let ax = RegisterName::Gpr(Reg::Rax, Width::Word);
                usage == Usage::Xchg
                    && insn.operands.len() == 2
                    && insn.operands.iter().all(|op| op.register() == Some(&ax))
            }
        }
    }

    /// Check shape and function gate.
    pub fn applies(
        self,
        function: &str,
        config: &AnalysisConfig,
        insn: &Instruction,
        usage: Usage,
    ) -> bool {
        let gated_in = self
            .gate(config)
            .is_none_or(|names| names.iter().any(|n| n == function));
        gated_in && self.matches_shape(insn, usage)
    }

    /// First case that applies to this instruction.
    pub fn find(
        function: &str,
        config: &AnalysisConfig,
        insn: &Instruction,
        usage: Usage,
    ) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|case| case.applies(function, config, insn, usage))
    }
}
