//! CLI definitions and argument types.

use std::path::PathBuf;

use bbt::UnknownInstructionPolicy;
use clap::{Parser, Subcommand, ValueEnum};

/// Exit code for success.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for failure.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "bbt")]
#[command(about = "x86-64 backtraces with arguments from disassembly and stack dumps")]
#[command(version)]
pub struct Cli {
    /// Show metrics summary after execution
    #[arg(long, global = true)]
    pub metrics: bool,

    /// Enable verbose output (sets RUST_LOG=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output (only show errors)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub silent: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Analyze functions and print their exit state
    Analyze {
        /// `objdump -d` listing
        #[arg(value_name = "LISTING")]
        listing: PathBuf,

        /// Function to analyze
        #[arg(short, long, required_unless_present = "all")]
        function: Option<String>,

        /// Analyze every function in the listing
        #[arg(long, conflicts_with_all = ["function", "exit"])]
        all: bool,

        /// Report the state just before this address (hex) instead of at the returns
        #[arg(long, value_name = "ADDR", value_parser = parse_address)]
        exit: Option<u64>,

        /// Memory dump used to read jump tables
        #[arg(long, value_name = "FILE")]
        memory: Option<PathBuf>,

        #[command(flatten)]
        analysis: AnalysisArgs,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Walk a stopped thread's stack and print frames with arguments
    Backtrace {
        /// `objdump -d` listing
        #[arg(value_name = "LISTING")]
        listing: PathBuf,

        /// Register dump (`name value` per line, must include rip)
        #[arg(short, long, value_name = "FILE")]
        registers: PathBuf,

        /// Stack memory dump (`address: word...` per line)
        #[arg(short, long, value_name = "FILE")]
        memory: PathBuf,

        /// Mapped stack range as START-END (hex). Defaults to the dump's extent.
        #[arg(long, value_name = "RANGE")]
        stack: Option<String>,

        /// Maximum number of frames
        #[arg(long, default_value = "64")]
        max_frames: usize,

        /// Maximum stack words scanned for a degraded frame's caller
        #[arg(long, default_value = "512")]
        max_scan_words: usize,

        #[command(flatten)]
        analysis: AnalysisArgs,
    },
}

/// Analysis options shared by the commands.
#[derive(Clone, Debug, clap::Args)]
pub struct AnalysisArgs {
    /// What to do with an unknown mnemonic
    #[arg(long, value_enum, default_value = "abandon")]
    pub unknown_insn: UnknownInsnArg,

    /// Maximum dataflow sweeps per function
    #[arg(long, value_name = "N")]
    pub max_sweeps: Option<usize>,

    /// Additional functions that never return (comma-separated)
    #[arg(long, value_delimiter = ',', value_name = "NAMES")]
    pub noreturn: Vec<String>,
}

impl AnalysisArgs {
    pub fn config(&self) -> bbt::AnalysisConfig {
        let mut config = bbt::AnalysisConfig::default()
            .with_unknown_instruction(self.unknown_insn.into())
            .with_noreturn(self.noreturn.iter().cloned());
        if let Some(max) = self.max_sweeps {
            config = config.with_max_sweeps(max);
        }
        config
    }
}

#[derive(Clone, Copy, Debug, ValueEnum, Default)]
pub enum UnknownInsnArg {
    /// Give up on the function
    #[default]
    Abandon,
    /// Treat every explicit operand as read and overwritten
    Erase,
}

impl From<UnknownInsnArg> for UnknownInstructionPolicy {
    fn from(arg: UnknownInsnArg) -> Self {
        match arg {
            UnknownInsnArg::Abandon => Self::Abandon,
            UnknownInsnArg::Erase => Self::EraseOperands,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable output (default)
    #[default]
    Text,
    /// Raw key-value output (for scripting)
    Raw,
}

fn parse_address(text: &str) -> Result<u64, String> {
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid address '{text}': {e}"))
}
