//! Frame-by-frame stack walking.
//!
//! Each frame's function is analyzed with the frame's PC as the exit
//! address, and the result rolls the registers back into the caller. A
//! frame whose analysis fails is walked in degraded mode: no arguments, and
//! the caller is found by scanning the stack for a word inside a function.

use std::fmt;

use bbt_cfg::{AnalysisError, Analyzer, SymbolInfo};
use bbt_isa::{Reg, WORD_SIZE};
use tracing::{debug, trace, warn};

use crate::metrics;
use crate::reconstruct::{ActualRegisters, ActualValue, StackWindow, argument_list, reconstruct_caller};
use crate::{Error, Result};

const WORD: u64 = WORD_SIZE as u64;

/// How a frame's caller was recovered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameMode {
    /// From a completed analysis, with arguments.
    Full,
    /// From a stack scan, without arguments.
    Degraded,
}

impl FrameMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Degraded => "degraded",
        }
    }
}

/// Stack walker limits.
#[derive(Clone, Debug)]
pub struct WalkConfig {
    pub max_frames: usize,
    /// Words examined when scanning for a return address.
    pub max_scan_words: usize,
    /// Cap on stack-passed arguments shown per frame.
    pub max_memory_arguments: usize,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            max_frames: 64,
            max_scan_words: 512,
            max_memory_arguments: 6,
        }
    }
}

impl WalkConfig {
    #[must_use]
    pub const fn with_max_frames(mut self, max: usize) -> Self {
        self.max_frames = max;
        self
    }

    #[must_use]
    pub const fn with_max_scan_words(mut self, max: usize) -> Self {
        self.max_scan_words = max;
        self
    }

    #[must_use]
    pub const fn with_max_memory_arguments(mut self, max: usize) -> Self {
        self.max_memory_arguments = max;
        self
    }
}

/// One line of a backtrace.
#[derive(Debug)]
pub struct Frame {
    pub pc: u64,
    pub function: Option<SymbolInfo>,
    pub mode: FrameMode,
    /// Register arguments first, then stack arguments.
    pub arguments: Vec<ActualValue>,
    /// Stack pointer while this frame was executing at `pc`.
    pub stack_pointer: Option<u64>,
    /// Why the frame is degraded.
    pub error: Option<Error>,
}

impl Frame {
    pub fn offset(&self) -> Option<u64> {
        self.function.as_ref().map(|f| self.pc.wrapping_sub(f.start))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stack_pointer {
            Some(sp) => write!(f, "{sp:#018x} ")?,
            None => write!(f, "{:>18} ", "?")?,
        }
        write!(f, "{:#018x}", self.pc)?;
        if let (Some(function), Some(offset)) = (&self.function, self.offset()) {
            write!(f, " {}+{offset:#x}", function.name)?;
            if let Some(module) = &function.module {
                write!(f, " [{module}]")?;
            }
        }
        f.write_str(" (")?;
        for (i, arg) in self.arguments.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")?;
        if self.mode == FrameMode::Degraded {
            f.write_str(" <degraded>")?;
        }
        Ok(())
    }
}

/// Where to continue the walk.
struct Next {
    pc: u64,
    lookup: u64,
    registers: ActualRegisters,
}

/// Walks a stack, analyzing one function per frame.
pub struct Backtracer<'a> {
    analyzer: Analyzer<'a>,
    window: StackWindow,
    config: WalkConfig,
}

impl<'a> Backtracer<'a> {
    pub fn new(analyzer: Analyzer<'a>, window: StackWindow) -> Self {
        Self {
            analyzer,
            window,
            config: WalkConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: WalkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn analyzer(&self) -> &Analyzer<'a> {
        &self.analyzer
    }

    /// Walk from a stopped thread's PC and registers.
    pub fn walk(&self, pc: u64, registers: &ActualRegisters) -> Result<Vec<Frame>> {
        if self.analyzer.symbols().resolve(pc).is_none() {
            return Err(Error::UnknownFunction(pc));
        }

        let mut frames = Vec::new();
        let mut next = Some(Next {
            pc,
            lookup: pc,
            registers: *registers,
        });
        while let Some(current) = next.take() {
            if frames.len() >= self.config.max_frames {
                debug!(max = self.config.max_frames, "frame limit reached");
                break;
            }
            let Some(function) = self.analyzer.symbols().resolve(current.lookup) else {
                debug!(pc = format_args!("{:#x}", current.pc), "no function, stopping");
                break;
            };
            let sp = current.registers.stack_pointer();
            let (frame, caller) = self.frame(&current, function);
            metrics::record_frame(frame.mode);
            frames.push(frame);

            next = caller.filter(|caller| match (sp, caller.registers.stack_pointer()) {
                (Some(sp), Some(caller_sp)) => caller_sp > sp && self.window.contains(caller_sp),
                (None, Some(caller_sp)) => self.window.contains(caller_sp),
                (_, None) => false,
            });
        }

        metrics::record_depth(frames.len());
        Ok(frames)
    }

    fn frame(&self, current: &Next, function: SymbolInfo) -> (Frame, Option<Next>) {
        let result = self.analyzer.analyze(current.lookup, Some(current.lookup));
        metrics::record_analysis(&result);

        let full = result.map_err(Error::from).and_then(|analysis| {
            let caller = reconstruct_caller(
                &analysis.exit_state,
                &current.registers,
                self.window,
                self.analyzer.memory(),
                analysis.never_returns,
            )?;
            let memory_count = analysis.memory_params.min(self.config.max_memory_arguments);
            let arguments = argument_list(
                analysis.register_params,
                memory_count,
                &caller,
                self.window,
                self.analyzer.memory(),
            );
            Ok((caller, arguments))
        });

        match full {
            Ok((caller, arguments)) => {
                trace!(
                    function = %function.name,
                    return_address = format_args!("{:#x}", caller.return_address),
                    "caller recovered"
                );
                let frame = Frame {
                    pc: current.pc,
                    function: Some(function),
                    mode: FrameMode::Full,
                    arguments,
                    stack_pointer: current.registers.stack_pointer(),
                    error: None,
                };
                let next = Next {
                    pc: caller.return_address,
                    lookup: caller.lookup_address,
                    registers: caller.registers,
                };
                (frame, Some(next))
            }
            Err(err) => {
                warn!(function = %function.name, error = %err, "falling back to stack scan");
                let next = self.scan(&current.registers);
                let frame = Frame {
                    pc: current.pc,
                    function: Some(function),
                    mode: FrameMode::Degraded,
                    arguments: Vec::new(),
                    stack_pointer: current.registers.stack_pointer(),
                    error: Some(err),
                };
                (frame, next)
            }
        }
    }

    /// Find the nearest stack word above the stack pointer that points
    /// into a function.
    fn scan(&self, registers: &ActualRegisters) -> Option<Next> {
        let sp = registers.stack_pointer()?;
        (0..self.config.max_scan_words as u64)
            .map(|i| sp.wrapping_add(i * WORD))
            .take_while(|&address| self.window.contains(address))
            .find_map(|address| {
                let word = self.analyzer.memory().read_word(address)?;
                self.analyzer.symbols().resolve(word)?;
                trace!(
                    slot = format_args!("{address:#x}"),
                    word = format_args!("{word:#x}"),
                    "scan hit"
                );
                let mut caller = ActualRegisters::invalid();
                caller.set(Reg::Rsp, address.wrapping_add(WORD));
                Some(Next {
                    pc: word,
                    lookup: word,
                    registers: caller,
                })
            })
    }
}

/// Analysis failure behind a degraded frame, if any.
pub fn analysis_error(frame: &Frame) -> Option<&AnalysisError> {
    match &frame.error {
        Some(Error::Analysis(err)) => Some(err),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use bbt_cfg::AnalysisConfig;

    use super::*;
    use crate::{Listing, MemoryImage};

    const PROGRAM: &str = "\
0000000000001000 <callee>:
    1000:\tpush   %rbx
    1001:\tmov    %rdi,%rbx
    1004:\tmov    0x10(%rsp),%rax
    1009:\tpop    %rbx
    100a:\tretq
0000000000001010 <caller>:
    1010:\tpush   %rbp
    1011:\tmov    %rsp,%rbp
    1014:\tmov    $0x5,%edi
    1019:\tcallq  1000 <callee>
    101e:\tpop    %rbp
    101f:\tretq
0000000000001020 <top>:
    1020:\tcallq  1010 <caller>
    1025:\tretq
";

    /// Stopped in `callee` before `pop %rbx`.
    const STACK: &str = "\
7f00: 1111 101e
7f10: 7f40 1025
7f20: dead
";

    fn registers() -> ActualRegisters {
        let mut regs = ActualRegisters::invalid();
        regs.set(Reg::Rsp, 0x7f00);
        regs.set(Reg::Rbx, 0x42);
        regs.set(Reg::Rbp, 0x7f10);
        regs
    }

    #[test]
    fn test_full_walk() {
        let listing = Listing::parse(PROGRAM).unwrap();
        let memory = MemoryImage::parse(STACK).unwrap();
        let analyzer = Analyzer::new(&listing, &listing, &memory, AnalysisConfig::default());
        let window = StackWindow::new(0x7f00, 0x8000);
        let frames = Backtracer::new(analyzer, window).walk(0x1009, &registers()).unwrap();

        let names: Vec<_> = frames
            .iter()
            .map(|f| f.function.as_ref().unwrap().name.as_str())
            .collect();
        assert_eq!(names, ["callee", "caller", "top"]);
        assert!(frames.iter().all(|f| f.mode == FrameMode::Full));

        // rdi was moved into rbx; one stack word above the return address.
        assert_eq!(
            frames[0].arguments,
            vec![ActualValue::known(0x42), ActualValue::known(0x7f40)]
        );
        assert_eq!(frames[1].pc, 0x101e);
        assert_eq!(frames[1].offset(), Some(0xe));
        assert_eq!(frames[1].stack_pointer, Some(0x7f10));
        assert_eq!(frames[2].stack_pointer, Some(0x7f20));
        assert_eq!(
            frames[0].to_string(),
            "0x0000000000007f00 0x0000000000001009 callee+0x9 (0x42, 0x7f40)"
        );
    }

    #[test]
    fn test_degraded_frame() {
        let program = PROGRAM.replace("mov    0x10(%rsp),%rax", "frob   0x10(%rsp),%rax");
        let listing = Listing::parse(&program).unwrap();
        let memory = MemoryImage::parse(STACK).unwrap();
        let analyzer = Analyzer::new(&listing, &listing, &memory, AnalysisConfig::default());
        let window = StackWindow::new(0x7f00, 0x8000);
        let frames = Backtracer::new(analyzer, window).walk(0x1009, &registers()).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].mode, FrameMode::Degraded);
        assert!(frames[0].arguments.is_empty());
        assert!(analysis_error(&frames[0]).is_some());
        assert!(frames[0].to_string().ends_with("() <degraded>"));
        assert_eq!(frames[1].mode, FrameMode::Full);
        assert_eq!(frames[1].stack_pointer, Some(0x7f10));
    }

    #[test]
    fn test_frame_limit() {
        let listing = Listing::parse(PROGRAM).unwrap();
        let memory = MemoryImage::parse(STACK).unwrap();
        let analyzer = Analyzer::new(&listing, &listing, &memory, AnalysisConfig::default());
        let frames = Backtracer::new(analyzer, StackWindow::new(0x7f00, 0x8000))
            .with_config(WalkConfig::default().with_max_frames(2))
            .walk(0x1009, &registers())
            .unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_window_stops_walk() {
        let listing = Listing::parse(PROGRAM).unwrap();
        let memory = MemoryImage::parse(STACK).unwrap();
        let analyzer = Analyzer::new(&listing, &listing, &memory, AnalysisConfig::default());
        // The caller's return address at 0x7f18 is outside the window.
        let frames = Backtracer::new(analyzer, StackWindow::new(0x7f00, 0x7f18))
            .walk(0x1009, &registers())
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].mode, FrameMode::Degraded);
        assert!(matches!(frames[1].error, Some(Error::UnreadableReturnAddress(0x7f18))));
    }

    #[test]
    fn test_unknown_start() {
        let listing = Listing::parse(PROGRAM).unwrap();
        let memory = MemoryImage::default();
        let analyzer = Analyzer::new(&listing, &listing, &memory, AnalysisConfig::default());
        let err = Backtracer::new(analyzer, StackWindow::new(0x7f00, 0x8000))
            .walk(0x5000, &registers())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownFunction(0x5000)));
    }
}
