//! End-to-end backtraces from files on disk.

use std::path::Path;

use bbt::{
    ActualValue, AnalysisConfig, Analyzer, Backtracer, Error, ErrorKind, FrameMode, Listing,
    MemoryImage, RegisterSnapshot, parse_window,
};
use tempfile::TempDir;

const LISTING: &str = "\
vmlinux:     file format elf64-x86-64


Disassembly of section .text:

ffffffff81002000 <panic>:
ffffffff81002000:\t55                   \tpush   %rbp
ffffffff81002001:\t48 89 e5             \tmov    %rsp,%rbp
ffffffff81002004:\teb fe                \tjmp    ffffffff81002004 <panic+0x4>

ffffffff81002010 <oops>:
ffffffff81002010:\t53                   \tpush   %rbx
ffffffff81002011:\t48 89 f3             \tmov    %rsi,%rbx
ffffffff81002014:\te8 e7 ff ff ff       \tcallq  ffffffff81002000 <panic>

ffffffff81002019 <next>:
ffffffff81002019:\tc3                   \tretq
";

/// Spinning in `panic`, called from `oops(5, 0x77)`.
const REGISTERS: &str = "\
rip: ffffffff81002004
rsp: ffffc90000003f00
rbp: ffffc90000003f00
rbx: 77
rdi: 5
";

const MEMORY: &str = "\
ffffc90000003f00: ffffc90000003f40 ffffffff81002019
ffffc90000003f10: 0000000000001234 000000000000dead
";

struct Dumps {
    _dir: TempDir,
    listing: Listing,
    memory: MemoryImage,
    snapshot: RegisterSnapshot,
}

fn write(dir: &Path, name: &str, text: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

fn load() -> Dumps {
    let dir = tempfile::tempdir().unwrap();
    let listing = Listing::load(write(dir.path(), "vmlinux.dis", LISTING)).unwrap();
    let memory = MemoryImage::load(write(dir.path(), "stack.txt", MEMORY)).unwrap();
    let snapshot = RegisterSnapshot::load(write(dir.path(), "regs.txt", REGISTERS)).unwrap();
    Dumps {
        _dir: dir,
        listing,
        memory,
        snapshot,
    }
}

#[test]
fn test_backtrace_through_noreturn_call() {
    let dumps = load();
    let analyzer = Analyzer::new(
        &dumps.listing,
        &dumps.listing,
        &dumps.memory,
        AnalysisConfig::default(),
    );
    let window = dumps.memory.window().unwrap();
    let frames = Backtracer::new(analyzer, window)
        .walk(dumps.snapshot.pc, &dumps.snapshot.registers)
        .unwrap();

    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f.mode == FrameMode::Full));

    assert_eq!(frames[0].function.as_ref().unwrap().name, "panic");
    assert!(frames[0].arguments.is_empty());

    // The return address points past `oops`, into `next`.
    let oops = &frames[1];
    assert_eq!(oops.pc, 0xffff_ffff_8100_2019);
    assert_eq!(oops.function.as_ref().unwrap().name, "oops");
    assert_eq!(oops.offset(), Some(9));
    assert_eq!(oops.stack_pointer, Some(0xffff_c900_0000_3f10));
    assert_eq!(
        oops.arguments,
        vec![ActualValue::known(5), ActualValue::known(0x77)]
    );
    assert!(oops.to_string().ends_with("oops+0x9 (0x5, 0x77)"));
}

#[test]
fn test_explicit_stack_window() {
    let dumps = load();
    let analyzer = Analyzer::new(
        &dumps.listing,
        &dumps.listing,
        &dumps.memory,
        AnalysisConfig::default(),
    );
    // Only the top word is mapped, so the saved rbp and return address are not.
    let window = parse_window("ffffc90000003f00-ffffc90000003f08").unwrap();
    let frames = Backtracer::new(analyzer, window)
        .walk(dumps.snapshot.pc, &dumps.snapshot.registers)
        .unwrap();

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].mode, FrameMode::Degraded);
    assert!(matches!(
        frames[0].error,
        Some(Error::UnreadableReturnAddress(0xffff_c900_0000_3f08))
    ));
}

#[test]
fn test_analyze_every_function() {
    let dumps = load();
    let analyzer = Analyzer::new(
        &dumps.listing,
        &dumps.listing,
        &dumps.memory,
        AnalysisConfig::default(),
    );

    let outcomes: Vec<_> = dumps
        .listing
        .functions()
        .iter()
        .map(|f| (f.name.as_str(), analyzer.analyze(f.start, None)))
        .collect();
    assert_eq!(outcomes.len(), 3);

    for (name, result) in &outcomes {
        match *name {
            "panic" | "oops" => {
                let err = result.as_ref().unwrap_err();
                assert_eq!(err.kind(), ErrorKind::Structural, "{name}: {err}");
            }
            "next" => {
                let analysis = result.as_ref().unwrap();
                assert_eq!(analysis.register_params, 0);
                assert!(!analysis.never_returns);
            }
            other => panic!("unexpected function {other}"),
        }
    }
}

#[test]
fn test_input_errors() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.txt");
    assert!(matches!(Listing::load(&missing), Err(Error::Io(_))));

    let regs = write(dir.path(), "regs.txt", "rsp 7f00\n");
    assert!(matches!(
        RegisterSnapshot::load(regs),
        Err(Error::Format { .. })
    ));

    let stack = write(dir.path(), "stack.txt", "7f00 1\n");
    assert!(matches!(
        MemoryImage::load(stack),
        Err(Error::Format { line: 1, .. })
    ));
}
