//! Analyze command.

use std::path::Path;

use bbt::{
    ARGUMENT_REGS, AnalysisConfig, Analyzer, FunctionAnalysis, MemoryImage, MemoryReader, NoMemory,
};
use tracing::error;

use crate::cli::{EXIT_FAILURE, EXIT_SUCCESS, OutputFormat};
use crate::commands::{load_listing, load_memory};
use crate::terminal::{self, Progress};

/// Handle `analyze --function NAME`.
pub fn cmd_analyze(
    listing_path: &Path,
    name: &str,
    exit: Option<u64>,
    memory_path: Option<&Path>,
    config: AnalysisConfig,
    format: OutputFormat,
) -> i32 {
    let Some(listing) = load_listing(listing_path) else {
        return EXIT_FAILURE;
    };
    let Some(image) = memory_image(memory_path) else {
        return EXIT_FAILURE;
    };
    let Some(function) = listing.function(name) else {
        terminal::error(&format!("no function named '{name}'"));
        return EXIT_FAILURE;
    };
    let memory: &dyn MemoryReader = match &image {
        Some(image) => image,
        None => &NoMemory,
    };

    let analyzer = Analyzer::new(&listing, &listing, memory, config);
    let result = analyzer.analyze(function.start, exit);
    bbt::metrics::record_analysis(&result);
    match result {
        Ok(analysis) => {
            print_analysis(format, &analysis);
            EXIT_SUCCESS
        }
        Err(e) => {
            error!(error = %e, kind = %e.kind(), "analysis abandoned");
            EXIT_FAILURE
        }
    }
}

/// Handle `analyze --all`: one line per function, failures counted.
pub fn cmd_analyze_all(
    listing_path: &Path,
    memory_path: Option<&Path>,
    config: AnalysisConfig,
    format: OutputFormat,
    show_progress: bool,
) -> i32 {
    let Some(listing) = load_listing(listing_path) else {
        return EXIT_FAILURE;
    };
    let Some(image) = memory_image(memory_path) else {
        return EXIT_FAILURE;
    };
    let memory: &dyn MemoryReader = match &image {
        Some(image) => image,
        None => &NoMemory,
    };

    let analyzer = Analyzer::new(&listing, &listing, memory, config);
    let functions = listing.functions();
    let progress = Progress::new(functions.len() as u64, "Analyzing", show_progress);
    let mut abandoned = 0usize;
    for function in functions {
        let result = analyzer.analyze(function.start, None);
        bbt::metrics::record_analysis(&result);
        progress.suspend(|| match (&result, format) {
            (Ok(analysis), OutputFormat::Text) => println!(
                "{}: {} register, {} stack arguments{}",
                function.name,
                analysis.register_params,
                analysis.memory_params,
                if analysis.never_returns { ", never returns" } else { "" }
            ),
            (Ok(analysis), OutputFormat::Raw) => println!(
                "{} ok {} {}",
                function.name, analysis.register_params, analysis.memory_params
            ),
            (Err(e), OutputFormat::Text) => println!("{}: abandoned: {e}", function.name),
            (Err(e), OutputFormat::Raw) => println!("{} {}", function.name, e.kind()),
        });
        if result.is_err() {
            abandoned += 1;
        }
        progress.inc();
    }
    progress.finish();

    let total = functions.len();
    if abandoned == 0 {
        terminal::success(&format!("{total} functions analyzed"));
    } else {
        terminal::warning(&format!(
            "{} of {total} functions analyzed, {abandoned} abandoned",
            total - abandoned
        ));
    }
    EXIT_SUCCESS
}

/// `Some(None)` when no dump was given, `None` when loading failed.
#[allow(clippy::option_option)]
fn memory_image(path: Option<&Path>) -> Option<Option<MemoryImage>> {
    match path {
        Some(path) => load_memory(path).map(Some),
        None => Some(None),
    }
}

fn print_analysis(format: OutputFormat, analysis: &FunctionAnalysis) {
    let function = &analysis.function;
    match format {
        OutputFormat::Text => {
            println!(
                "Function: {} [{:#x}-{:#x}]",
                function.name, function.start, function.end
            );
            println!("Exit state: {}", analysis.exit_state);
            let names: Vec<String> = ARGUMENT_REGS
                .iter()
                .take(analysis.register_params)
                .map(ToString::to_string)
                .collect();
            println!(
                "Register arguments: {} ({})",
                analysis.register_params,
                names.join(", ")
            );
            println!("Stack arguments: {}", analysis.memory_params);
            println!(
                "Never returns: {}",
                if analysis.never_returns { "yes" } else { "no" }
            );
            println!(
                "Blocks processed: {} in {} sweeps",
                analysis.stats.blocks_processed, analysis.stats.sweeps
            );
        }
        OutputFormat::Raw => {
            println!("function: {}", function.name);
            println!("exit: {}", analysis.exit_state);
            println!("register_params: {}", analysis.register_params);
            println!("memory_params: {}", analysis.memory_params);
            println!("never_returns: {}", analysis.never_returns);
            println!("sweeps: {}", analysis.stats.sweeps);
        }
    }
}
