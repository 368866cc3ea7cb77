//! Linux x86-64 entry and exit glue.

use bbt_isa::{NUM_REGS, Reg, RegSet};

use super::{ExpectedSlot, TransferRule};
use crate::value::{Provenance, RegisterState};

/// Full `pt_regs` save area, offsets from the stack pointer.
const FULL_PT_REGS: &[(i64, Reg)] = &[
    (0x70, Reg::Rdi),
    (0x68, Reg::Rsi),
    (0x60, Reg::Rdx),
    (0x58, Reg::Rcx),
    (0x50, Reg::Rax),
    (0x48, Reg::R8),
    (0x40, Reg::R9),
    (0x38, Reg::R10),
    (0x30, Reg::R11),
    (0x28, Reg::Rbx),
    (0x20, Reg::Rbp),
    (0x18, Reg::R12),
    (0x10, Reg::R13),
    (0x08, Reg::R14),
    (0x00, Reg::R15),
];

/// Caller-clobbered half of `pt_regs`.
const PARTIAL_PT_REGS: &[(i64, Reg)] = &[
    (0x40, Reg::Rdi),
    (0x38, Reg::Rsi),
    (0x30, Reg::Rdx),
    (0x28, Reg::Rcx),
    (0x20, Reg::Rax),
    (0x18, Reg::R8),
    (0x10, Reg::R9),
    (0x08, Reg::R10),
    (0x00, Reg::R11),
];

fn frame(layout: &[(i64, Reg)], shift: i64) -> Vec<ExpectedSlot> {
    layout
        .iter()
        .map(|&(offset, reg)| ExpectedSlot {
            offset: offset + shift,
            value: Provenance::Original(reg),
        })
        .collect()
}

/// Hardware-pushed words whose content is not tracked.
fn opaque(words: i64) -> Vec<ExpectedSlot> {
    (0..words)
        .rev()
        .map(|i| ExpectedSlot {
            offset: i * 8,
            value: Provenance::Undefined,
        })
        .collect()
}

fn all_registers() -> [Provenance; NUM_REGS] {
    *RegisterState::entry().registers()
}

/// Default contracts for the kernel's hand-written entry code. Rules with
/// a source come before the general rule for the same target.
pub fn linux_x86_64() -> Vec<TransferRule> {
    let rax = RegSet::of(&[Reg::Rax]);
    vec![
        TransferRule::new("ret_from_intr").with_memory(frame(PARTIAL_PT_REGS, 0)),
        TransferRule::new("retint_kernel")
            .with_memory(frame(PARTIAL_PT_REGS, 0))
            .skip_memory(rax),
        TransferRule::new("retint_swapgs")
            .with_memory(frame(PARTIAL_PT_REGS, 0))
            .skip_memory(rax),
        TransferRule::new("retint_restore_args")
            .with_memory(frame(PARTIAL_PT_REGS, 0))
            .skip_memory(rax),
        TransferRule::new("error_exit")
            .with_memory(frame(FULL_PT_REGS, 0))
            .skip_memory(rax),
        TransferRule::new("paranoid_exit").with_memory(frame(FULL_PT_REGS, 0)),
        TransferRule::new("int_ret_from_sys_call")
            .from_source("ia32_badsys")
            .with_memory(frame(PARTIAL_PT_REGS, 0))
            .skip_memory(rax),
        TransferRule::new("int_ret_from_sys_call")
            .with_memory(frame(PARTIAL_PT_REGS, 0))
            .skip_memory(rax),
        TransferRule::new("ia32_badsys")
            .from_source("ia32_sysenter_target")
            .with_memory(frame(PARTIAL_PT_REGS, 0))
            .skip_memory(rax),
        // Reached by call from a stub, so the return address sits below the frame.
        TransferRule::new("ptregscall_common").with_memory(frame(PARTIAL_PT_REGS, 8)),
        TransferRule::new("stub_execve").with_memory(frame(PARTIAL_PT_REGS, 8)),
        TransferRule::new("error_entry")
            .with_memory(opaque(1))
            .with_registers(all_registers()),
        TransferRule::new("common_interrupt")
            .with_memory(opaque(1))
            .with_registers(all_registers()),
        TransferRule::new("system_call_after_swapgs")
            .with_memory(opaque(2))
            .with_registers(all_registers())
            .skip_registers(RegSet::of(&[Reg::Rcx, Reg::R11])),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_descend() {
        for rule in linux_x86_64() {
            assert!(
                rule.memory.windows(2).all(|w| w[0].offset > w[1].offset),
                "{} frame out of order",
                rule.target
            );
        }
    }

    #[test]
    fn test_specific_rule_first() {
        let rules = linux_x86_64();
        let positions: Vec<_> = rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.target == "int_ret_from_sys_call")
            .map(|(i, r)| (i, r.source.is_some()))
            .collect();
        assert_eq!(positions.len(), 2);
        assert!(positions[0].1);
        assert!(!positions[1].1);
    }

    #[test]
    fn test_opaque_frame() {
        let slots = opaque(2);
        assert_eq!(slots[0].offset, 8);
        assert_eq!(slots[1].offset, 0);
    }
}
