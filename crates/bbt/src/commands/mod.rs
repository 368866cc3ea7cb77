//! Command implementations.

mod analyze;
mod backtrace;

use std::path::Path;

use tracing::error;

use crate::cli::{Cli, Commands};

/// Dispatch CLI command to the appropriate handler.
pub fn run_command(cli: &Cli) -> i32 {
    match &cli.command {
        Commands::Analyze { .. } => handle_analyze(cli),
        Commands::Backtrace { .. } => handle_backtrace(cli),
    }
}

fn handle_analyze(cli: &Cli) -> i32 {
    let Commands::Analyze {
        listing,
        function,
        all,
        exit,
        memory,
        analysis,
        format,
    } = &cli.command
    else {
        unreachable!("analyze command variant mismatch");
    };

    let config = analysis.config();
    if *all {
        analyze::cmd_analyze_all(listing, memory.as_deref(), config, *format, !cli.silent)
    } else {
        let Some(function) = function else {
            unreachable!("clap requires --function without --all");
        };
        analyze::cmd_analyze(listing, function, *exit, memory.as_deref(), config, *format)
    }
}

fn handle_backtrace(cli: &Cli) -> i32 {
    let Commands::Backtrace {
        listing,
        registers,
        memory,
        stack,
        max_frames,
        max_scan_words,
        analysis,
    } = &cli.command
    else {
        unreachable!("backtrace command variant mismatch");
    };

    let walk = bbt::WalkConfig::default()
        .with_max_frames(*max_frames)
        .with_max_scan_words(*max_scan_words);
    backtrace::cmd_backtrace(
        listing,
        registers,
        memory,
        stack.as_deref(),
        analysis.config(),
        walk,
    )
}

/// Load a listing, logging failures.
fn load_listing(path: &Path) -> Option<bbt::Listing> {
    match bbt::Listing::load(path) {
        Ok(listing) => Some(listing),
        Err(e) => {
            error!(error = %e, path = %path.display(), "failed to load listing");
            None
        }
    }
}

/// Load a memory dump, logging failures.
fn load_memory(path: &Path) -> Option<bbt::MemoryImage> {
    match bbt::MemoryImage::load(path) {
        Ok(memory) => Some(memory),
        Err(e) => {
            error!(error = %e, path = %path.display(), "failed to load memory dump");
            None
        }
    }
}
