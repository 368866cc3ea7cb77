//! Backtrace command.

use std::path::Path;

use bbt::{AnalysisConfig, Analyzer, Backtracer, FrameMode, RegisterSnapshot, WalkConfig, parse_window};
use tracing::{debug, error};

use crate::cli::{EXIT_FAILURE, EXIT_SUCCESS};
use crate::commands::{load_listing, load_memory};
use crate::terminal;

/// Handle the `backtrace` command.
pub fn cmd_backtrace(
    listing_path: &Path,
    registers_path: &Path,
    memory_path: &Path,
    stack: Option<&str>,
    config: AnalysisConfig,
    walk: WalkConfig,
) -> i32 {
    let Some(listing) = load_listing(listing_path) else {
        return EXIT_FAILURE;
    };
    let Some(memory) = load_memory(memory_path) else {
        return EXIT_FAILURE;
    };
    let snapshot = match RegisterSnapshot::load(registers_path) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(error = %e, path = %registers_path.display(), "failed to load registers");
            return EXIT_FAILURE;
        }
    };
    let window = match stack.map(parse_window) {
        Some(Ok(window)) => window,
        Some(Err(e)) => {
            error!(error = %e, "invalid --stack");
            return EXIT_FAILURE;
        }
        None => match memory.window() {
            Some(window) => window,
            None => {
                terminal::error("memory dump is empty and no --stack range was given");
                return EXIT_FAILURE;
            }
        },
    };
    debug!(
        start = format_args!("{:#x}", window.start),
        end = format_args!("{:#x}", window.end),
        words = memory.len(),
        "stack window"
    );

    let analyzer = Analyzer::new(&listing, &listing, &memory, config);
    let backtracer = Backtracer::new(analyzer, window).with_config(walk);
    let frames = match backtracer.walk(snapshot.pc, &snapshot.registers) {
        Ok(frames) => frames,
        Err(e) => {
            error!(error = %e, "backtrace failed");
            return EXIT_FAILURE;
        }
    };

    for frame in &frames {
        println!("{frame}");
    }
    let degraded = frames.iter().filter(|f| f.mode == FrameMode::Degraded).count();
    if degraded > 0 {
        terminal::warning(&format!(
            "{degraded} of {} frames without arguments",
            frames.len()
        ));
        for frame in &frames {
            if let Some(e) = &frame.error {
                terminal::info(&format!("{:#x}: {e}", frame.pc));
            }
        }
    }
    EXIT_SUCCESS
}
