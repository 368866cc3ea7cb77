//! Mnemonic classification.
//!
//! Every mnemonic maps to a [`Usage`]: either a generic combination of operand
//! reads and writes, or a named idiom whose effect on provenance is modelled
//! exactly. Lookup is by longest matching prefix, so `cmovne` resolves to the
//! `cmov` entry and size suffixes (`pushq`, `retq`) need no entries of their own.

use std::sync::OnceLock;

use rustc_hash::FxHashMap;

/// Which operands a generic instruction reads and writes.
///
/// With one operand, source and destination are the same operand. With three,
/// the middle operand is read as a source and the last one is the destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Access {
    pub read_src: bool,
    pub read_dst: bool,
    pub write_src: bool,
    pub write_dst: bool,
}

impl Access {
    const fn new(read_src: bool, read_dst: bool, write_src: bool, write_dst: bool) -> Self {
        Self {
            read_src,
            read_dst,
            write_src,
            write_dst,
        }
    }

    pub const RS: Self = Self::new(true, false, false, false);
    pub const WS: Self = Self::new(false, false, true, false);
    pub const RS_WS: Self = Self::new(true, false, true, false);
    pub const RS_RD: Self = Self::new(true, true, false, false);
    pub const RS_WD: Self = Self::new(true, false, false, true);
    pub const RS_RD_WD: Self = Self::new(true, true, false, true);
    pub const RS_RD_WS_WD: Self = Self::new(true, true, true, true);
}

/// Semantic effect of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Usage {
    Generic(Access),
    Add,
    Branch,
    Call,
    Cbw,
    Cmov,
    Cmps,
    Cmpxchg,
    Cmpxchgd,
    Cpuid,
    Cwd,
    Div,
    Idiv,
    Imul,
    Ins,
    Iret,
    Jmp,
    Lahf,
    Lea,
    Leave,
    Lods,
    Loop,
    Lss,
    Monitor,
    Mov,
    Movs,
    Mul,
    Mwait,
    Nop,
    Outs,
    Pop,
    Popf,
    Push,
    Pushf,
    Rdmsr,
    Rdtsc,
    Rdtscp,
    Ret,
    Sahf,
    Scas,
    Stos,
    Sub,
    Sysexit,
    Sysret,
    Ud2,
    Wrmsr,
    Xadd,
    Xchg,
    Xor,
}

impl Usage {
    /// Control never reaches the next instruction.
    pub const fn ends_block(self) -> bool {
        matches!(
            self,
            Self::Ret | Self::Iret | Self::Sysret | Self::Sysexit | Self::Jmp | Self::Ud2
        )
    }

    /// Returns to a caller or to another privilege level.
    pub const fn is_return(self) -> bool {
        matches!(self, Self::Ret | Self::Iret | Self::Sysret | Self::Sysexit)
    }

    /// Branch targets of this instruction are edges inside the function.
    pub const fn is_jump(self) -> bool {
        matches!(self, Self::Jmp | Self::Branch | Self::Loop)
    }
}

use Access as A;
use Usage as U;

const TABLE: &[(&str, Usage)] = &[
    ("adc", U::Generic(A::RS_RD_WD)),
    ("add", U::Add),
    ("and", U::Generic(A::RS_RD_WD)),
    ("andn", U::Generic(A::RS_RD_WD)),
    ("bsf", U::Generic(A::RS_WD)),
    ("bsr", U::Generic(A::RS_WD)),
    ("bswap", U::Generic(A::RS_WS)),
    ("bt", U::Generic(A::RS_RD)),
    ("btc", U::Generic(A::RS_RD_WD)),
    ("btr", U::Generic(A::RS_RD_WD)),
    ("bts", U::Generic(A::RS_RD_WD)),
    ("call", U::Call),
    ("cbtw", U::Cbw),
    ("clac", U::Nop),
    ("clc", U::Nop),
    ("cld", U::Nop),
    ("clflush", U::Generic(A::RS)),
    ("cli", U::Nop),
    ("cltd", U::Cwd),
    ("cltq", U::Cbw),
    ("clts", U::Nop),
    ("cmc", U::Nop),
    ("cmov", U::Cmov),
    ("cmp", U::Generic(A::RS_RD)),
    ("cmps", U::Cmps),
    ("cmpsd", U::Generic(A::RS_RD_WD)),
    ("cmpss", U::Generic(A::RS_RD_WD)),
    ("cmpxchg", U::Cmpxchg),
    ("cmpxchg16b", U::Cmpxchgd),
    ("cmpxchg8b", U::Cmpxchgd),
    ("comis", U::Generic(A::RS_RD)),
    ("cpuid", U::Cpuid),
    ("cqto", U::Cwd),
    ("crc32", U::Generic(A::RS_RD_WD)),
    ("cvt", U::Generic(A::RS_WD)),
    ("cwtd", U::Cwd),
    ("cwtl", U::Cbw),
    ("dec", U::Generic(A::RS_WS)),
    ("div", U::Div),
    ("divp", U::Generic(A::RS_RD_WD)),
    ("divs", U::Generic(A::RS_RD_WD)),
    ("endbr", U::Nop),
    ("f", U::Generic(A::RS_WD)),
    ("hlt", U::Nop),
    ("idiv", U::Idiv),
    ("imul", U::Imul),
    ("in", U::Generic(A::RS_WD)),
    ("inc", U::Generic(A::RS_WS)),
    ("ins", U::Ins),
    ("insertps", U::Generic(A::RS_RD_WD)),
    ("int", U::Nop),
    ("inv", U::Nop),
    ("iret", U::Iret),
    ("j", U::Branch),
    ("jmp", U::Jmp),
    ("lahf", U::Lahf),
    ("lar", U::Generic(A::RS_WD)),
    ("ldmxcsr", U::Generic(A::RS)),
    ("lea", U::Lea),
    ("leave", U::Leave),
    ("lfence", U::Nop),
    ("lgdt", U::Generic(A::RS)),
    ("lidt", U::Generic(A::RS)),
    ("lldt", U::Generic(A::RS)),
    ("lmsw", U::Generic(A::RS)),
    ("lods", U::Lods),
    ("loop", U::Loop),
    ("lsl", U::Generic(A::RS_WD)),
    ("lss", U::Lss),
    ("ltr", U::Generic(A::RS)),
    ("lzcnt", U::Generic(A::RS_WD)),
    ("max", U::Generic(A::RS_RD_WD)),
    ("mfence", U::Nop),
    ("min", U::Generic(A::RS_RD_WD)),
    ("monitor", U::Monitor),
    ("mov", U::Mov),
    ("movbe", U::Generic(A::RS_WD)),
    ("movs", U::Movs),
    ("movsbl", U::Generic(A::RS_WD)),
    ("movsbq", U::Generic(A::RS_WD)),
    ("movsbw", U::Generic(A::RS_WD)),
    ("movsd", U::Mov),
    ("movshdup", U::Mov),
    ("movsldup", U::Mov),
    ("movslq", U::Generic(A::RS_WD)),
    ("movss", U::Mov),
    ("movswl", U::Generic(A::RS_WD)),
    ("movswq", U::Generic(A::RS_WD)),
    ("movsx", U::Generic(A::RS_WD)),
    ("movz", U::Generic(A::RS_WD)),
    ("mul", U::Mul),
    ("mulp", U::Generic(A::RS_RD_WD)),
    ("muls", U::Generic(A::RS_RD_WD)),
    ("mulx", U::Mul),
    ("mwait", U::Mwait),
    ("neg", U::Generic(A::RS_WS)),
    ("nop", U::Nop),
    ("not", U::Generic(A::RS_WS)),
    ("or", U::Generic(A::RS_RD_WD)),
    ("out", U::Generic(A::RS_RD)),
    ("outs", U::Outs),
    ("p", U::Generic(A::RS_RD_WD)),
    ("pause", U::Nop),
    ("pop", U::Pop),
    ("popcnt", U::Generic(A::RS_WD)),
    ("popf", U::Popf),
    ("prefetch", U::Nop),
    ("push", U::Push),
    ("pushf", U::Pushf),
    ("rcl", U::Generic(A::RS_RD_WD)),
    ("rcp", U::Generic(A::RS_WD)),
    ("rcr", U::Generic(A::RS_RD_WD)),
    ("rdmsr", U::Rdmsr),
    ("rdpmc", U::Rdmsr),
    ("rdrand", U::Generic(A::WS)),
    ("rdtsc", U::Rdtsc),
    ("rdtscp", U::Rdtscp),
    ("ret", U::Ret),
    ("rol", U::Generic(A::RS_RD_WD)),
    ("ror", U::Generic(A::RS_RD_WD)),
    ("rsqrt", U::Generic(A::RS_WD)),
    ("sahf", U::Sahf),
    ("sar", U::Generic(A::RS_RD_WD)),
    ("sbb", U::Generic(A::RS_RD_WD)),
    ("scas", U::Scas),
    ("set", U::Generic(A::WS)),
    ("sfence", U::Nop),
    ("sgdt", U::Generic(A::WS)),
    ("sh", U::Generic(A::RS_RD_WD)),
    ("shuf", U::Generic(A::RS_RD_WD)),
    ("sidt", U::Generic(A::WS)),
    ("sldt", U::Generic(A::WS)),
    ("sqrt", U::Generic(A::RS_WD)),
    ("stac", U::Nop),
    ("stc", U::Nop),
    ("std", U::Nop),
    ("sti", U::Nop),
    ("stmxcsr", U::Generic(A::WS)),
    ("stos", U::Stos),
    ("str", U::Generic(A::WS)),
    ("sub", U::Sub),
    ("swapgs", U::Nop),
    ("sysexit", U::Sysexit),
    ("sysret", U::Sysret),
    ("test", U::Generic(A::RS_RD)),
    ("tzcnt", U::Generic(A::RS_WD)),
    ("ucomis", U::Generic(A::RS_RD)),
    ("ud2", U::Ud2),
    ("unpck", U::Generic(A::RS_RD_WD)),
    ("v", U::Generic(A::RS_RD_WD)),
    ("verr", U::Generic(A::RS)),
    ("verw", U::Generic(A::RS)),
    ("wbinvd", U::Nop),
    ("wrmsr", U::Wrmsr),
    ("xadd", U::Xadd),
    ("xchg", U::Xchg),
    ("xgetbv", U::Rdtsc),
    ("xor", U::Xor),
    ("xrstor", U::Generic(A::RS)),
    ("xsave", U::Generic(A::WS)),
];

static BY_FIRST_BYTE: OnceLock<FxHashMap<u8, Vec<(&'static str, Usage)>>> = OnceLock::new();

/// Classify a mnemonic. Returns `None` when no entry matches.
pub fn classify(mnemonic: &str) -> Option<Usage> {
    let index = BY_FIRST_BYTE.get_or_init(|| {
        let mut map: FxHashMap<u8, Vec<(&'static str, Usage)>> = FxHashMap::default();
        for &(prefix, usage) in TABLE {
            map.entry(prefix.as_bytes()[0]).or_default().push((prefix, usage));
        }
        for entries in map.values_mut() {
            entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        }
        map
    });

    let first = *mnemonic.as_bytes().first()?;
    index
        .get(&first)?
        .iter()
        .find(|(prefix, _)| mnemonic.starts_with(*prefix))
        .map(|&(_, usage)| usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        assert_eq!(classify("cmovne"), Some(Usage::Cmov));
        assert_eq!(classify("cmpq"), Some(Usage::Generic(Access::RS_RD)));
        assert_eq!(classify("cmpxchg16b"), Some(Usage::Cmpxchgd));
        assert_eq!(classify("leaveq"), Some(Usage::Leave));
        assert_eq!(classify("leaq"), Some(Usage::Lea));
        assert_eq!(classify("pushfq"), Some(Usage::Pushf));
        assert_eq!(classify("pushq"), Some(Usage::Push));
        assert_eq!(classify("popcnt"), Some(Usage::Generic(Access::RS_WD)));
        assert_eq!(classify("jmpq"), Some(Usage::Jmp));
        assert_eq!(classify("jne"), Some(Usage::Branch));
    }

    #[test]
    fn test_move_family() {
        assert_eq!(classify("movq"), Some(Usage::Mov));
        assert_eq!(classify("movsbl"), Some(Usage::Generic(Access::RS_WD)));
        assert_eq!(classify("movslq"), Some(Usage::Generic(Access::RS_WD)));
        assert_eq!(classify("movzbl"), Some(Usage::Generic(Access::RS_WD)));
        assert_eq!(classify("movsq"), Some(Usage::Movs));
        assert_eq!(classify("movsd"), Some(Usage::Mov));
        assert_eq!(classify("movabs"), Some(Usage::Mov));
    }

    #[test]
    fn test_multiply_family() {
        assert_eq!(classify("mulq"), Some(Usage::Mul));
        assert_eq!(classify("mulx"), Some(Usage::Mul));
        assert_eq!(classify("mulsd"), Some(Usage::Generic(Access::RS_RD_WD)));
        assert_eq!(classify("imul"), Some(Usage::Imul));
    }

    #[test]
    fn test_unknown() {
        assert_eq!(classify("zzz"), None);
        assert_eq!(classify(""), None);
    }

    #[test]
    fn test_block_enders() {
        assert!(classify("retq").is_some_and(Usage::ends_block));
        assert!(classify("ud2").is_some_and(Usage::ends_block));
        assert!(!classify("je").is_some_and(Usage::ends_block));
        assert!(classify("loopne").is_some_and(Usage::is_jump));
        assert!(!classify("callq").is_some_and(Usage::is_jump));
    }
}
