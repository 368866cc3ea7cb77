//! Analysis configuration.

/// What to do with a mnemonic the classifier has no entry for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnknownInstructionPolicy {
    /// Abandon the function.
    #[default]
    Abandon,
    /// Treat every explicit operand as read and written, then continue.
    EraseOperands,
}

/// Functions that never return to their caller.
pub const DEFAULT_NORETURN_FUNCTIONS: &[&str] = &[
    "panic",
    "do_exit",
    "do_group_exit",
    "complete_and_exit",
    "__stack_chk_fail",
    "__ubsan_handle_builtin_unreachable",
    "machine_restart",
    "machine_halt",
    "machine_power_off",
    "emergency_restart",
    "kernel_halt",
    "kernel_restart",
    "kernel_power_off",
    "rewind_stack_do_exit",
    "cpu_startup_entry",
    "abort",
    "exit",
    "_exit",
];

/// Scheduler functions whose context switch reloads the stack pointer.
pub const DEFAULT_SCHEDULER_FUNCTIONS: &[&str] = &[
    "schedule",
    "__schedule",
    "thread_return",
    "context_switch",
    "__switch_to",
    "__switch_to_asm",
];

/// Resume paths that load a saved stack pointer.
pub const DEFAULT_STACK_SWITCH_FUNCTIONS: &[&str] = &[
    "restore_image",
    "restore_registers",
    "jprobe_return",
    "math_abort",
];

/// Configuration for the per-function analysis.
#[derive(Clone, Debug)]
pub struct AnalysisConfig {
    pub unknown_instruction: UnknownInstructionPolicy,
    /// Discrepancies collected per transfer check before giving up.
    pub max_discrepancies: usize,
    /// Upper bound on words read from an indirect jump table.
    pub max_jump_table_entries: usize,
    /// Upper bound on dataflow sweeps.
    pub max_sweeps: usize,
    pub noreturn_functions: Vec<String>,
    pub scheduler_functions: Vec<String>,
    pub stack_switch_functions: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            unknown_instruction: UnknownInstructionPolicy::default(),
            max_discrepancies: 8,
            max_jump_table_entries: 256,
            max_sweeps: 10_000,
            noreturn_functions: to_owned(DEFAULT_NORETURN_FUNCTIONS),
            scheduler_functions: to_owned(DEFAULT_SCHEDULER_FUNCTIONS),
            stack_switch_functions: to_owned(DEFAULT_STACK_SWITCH_FUNCTIONS),
        }
    }
}

impl AnalysisConfig {
    pub fn with_unknown_instruction(mut self, policy: UnknownInstructionPolicy) -> Self {
        self.unknown_instruction = policy;
        self
    }

    pub fn with_max_discrepancies(mut self, max: usize) -> Self {
        self.max_discrepancies = max.max(1);
        self
    }

    pub fn with_max_jump_table_entries(mut self, max: usize) -> Self {
        self.max_jump_table_entries = max;
        self
    }

    pub fn with_max_sweeps(mut self, max: usize) -> Self {
        self.max_sweeps = max;
        self
    }

    /// Add functions known never to return.
    pub fn with_noreturn<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.noreturn_functions.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_scheduler_functions(mut self, names: Vec<String>) -> Self {
        self.scheduler_functions = names;
        self
    }

    pub fn with_stack_switch_functions(mut self, names: Vec<String>) -> Self {
        self.stack_switch_functions = names;
        self
    }

    /// Check if a function is known never to return.
    pub fn is_noreturn(&self, name: &str) -> bool {
        self.noreturn_functions.iter().any(|n| n == name)
    }
}

fn to_owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AnalysisConfig::default();
        assert_eq!(config.unknown_instruction, UnknownInstructionPolicy::Abandon);
        assert!(config.is_noreturn("panic"));
        assert!(!config.is_noreturn("printk"));
    }

    #[test]
    fn test_builders() {
        let config = AnalysisConfig::default()
            .with_unknown_instruction(UnknownInstructionPolicy::EraseOperands)
            .with_max_discrepancies(0)
            .with_noreturn(["fatal"]);
        assert_eq!(config.max_discrepancies, 1);
        assert!(config.is_noreturn("fatal"));
        assert!(config.is_noreturn("do_exit"));
    }
}
