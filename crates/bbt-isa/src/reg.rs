//! x86-64 integer registers, sub-register names and the calling convention.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use rustc_hash::FxHashMap;

/// Number of tracked integer registers.
pub const NUM_REGS: usize = 16;

/// Bytes per machine word.
pub const WORD_SIZE: i64 = 8;

/// Physical integer register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    /// All registers in index order.
    pub const ALL: [Self; NUM_REGS] = [
        Self::Rax,
        Self::Rbx,
        Self::Rcx,
        Self::Rdx,
        Self::Rsi,
        Self::Rdi,
        Self::Rbp,
        Self::Rsp,
        Self::R8,
        Self::R9,
        Self::R10,
        Self::R11,
        Self::R12,
        Self::R13,
        Self::R14,
        Self::R15,
    ];

    /// Index into per-register arrays.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Register for an array index.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Canonical 64-bit name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Rax => "rax",
            Self::Rbx => "rbx",
            Self::Rcx => "rcx",
            Self::Rdx => "rdx",
            Self::Rsi => "rsi",
            Self::Rdi => "rdi",
            Self::Rbp => "rbp",
            Self::Rsp => "rsp",
            Self::R8 => "r8",
            Self::R9 => "r9",
            Self::R10 => "r10",
            Self::R11 => "r11",
            Self::R12 => "r12",
            Self::R13 => "r13",
            Self::R14 => "r14",
            Self::R15 => "r15",
        }
    }

    /// Position in the argument-passing sequence, if this is an argument register.
    pub fn argument_index(self) -> Option<usize> {
        ARGUMENT_REGS.iter().position(|&r| r == self)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registers carrying the first integer arguments, in order.
pub const ARGUMENT_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Registers a callee must hand back unchanged.
pub const PRESERVED_REGS: [Reg; 7] = [
    Reg::Rbx,
    Reg::Rbp,
    Reg::Rsp,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

/// Registers a call may clobber.
pub const CLOBBERED_REGS: [Reg; 9] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
];

/// Small bit set of registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RegSet(u32);

impl RegSet {
    /// Empty set.
    pub const EMPTY: Self = Self(0);

    /// Build a set from a list of registers.
    pub const fn of(regs: &[Reg]) -> Self {
        let mut bits = 0u32;
        let mut i = 0;
        while i < regs.len() {
            bits |= 1 << regs[i] as u32;
            i += 1;
        }
        Self(bits)
    }

    /// Check membership.
    #[inline]
    pub const fn contains(self, reg: Reg) -> bool {
        self.0 & (1 << reg as u32) != 0
    }

    /// Add a register.
    #[inline]
    pub fn insert(&mut self, reg: Reg) {
        self.0 |= 1 << reg as u32;
    }

    /// Union of two sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Check if empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate members in index order.
    pub fn iter(self) -> impl Iterator<Item = Reg> {
        Reg::ALL.into_iter().filter(move |&r| self.contains(r))
    }
}

/// Operand width of a register name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Width {
    /// Low byte (`al`, `sil`, `r8b`).
    Byte,
    /// Second byte of the legacy registers (`ah`, `bh`, `ch`, `dh`).
    HighByte,
    /// 16 bits (`ax`, `r8w`).
    Word,
    /// 32 bits (`eax`, `r8d`).
    Dword,
    /// Full 64-bit register.
    Qword,
}

impl Width {
    /// Whether a write at this width replaces the whole register.
    #[inline]
    pub fn is_full(self) -> bool {
        self == Self::Qword
    }
}

/// A register as named in instruction text.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RegisterName {
    /// General purpose integer register at some width.
    Gpr(Reg, Width),
    /// `%rip`/`%eip`, used for position-relative addressing.
    InstructionPointer,
    /// `%riz`/`%eiz`, the pseudo-register for a zero index in padding encodings.
    ZeroIndex,
    /// Segment, control, debug, vector or x87 register; not tracked.
    Other(String),
}

impl RegisterName {
    /// Parse a register name without the leading `%`.
    pub fn parse(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if let Some(&(reg, width)) = gpr_names().get(lower.as_str()) {
            return Some(Self::Gpr(reg, width));
        }
        match lower.as_str() {
            "rip" | "eip" => return Some(Self::InstructionPointer),
            "riz" | "eiz" => return Some(Self::ZeroIndex),
            _ => {}
        }
        let other = OTHER_PATTERN.get_or_init(|| {
            Regex::new(r"^(cs|ds|es|fs|gs|ss|cr\d+|db\d+|dr\d+|[xyz]mm\d+|mm\d|st(\(\d\))?|k[0-7])$")
                .unwrap()
        });
        other.is_match(&lower).then_some(Self::Other(lower))
    }

    /// The integer register, at any width.
    pub fn gpr(&self) -> Option<Reg> {
        match self {
            Self::Gpr(reg, _) => Some(*reg),
            _ => None,
        }
    }

    /// The integer register, only when named at full width.
    pub fn full_gpr(&self) -> Option<Reg> {
        match self {
            Self::Gpr(reg, width) if width.is_full() => Some(*reg),
            _ => None,
        }
    }
}

impl fmt::Display for RegisterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpr(reg, width) => {
                let name = gpr_names()
                    .iter()
                    .find(|(_, v)| **v == (*reg, *width))
                    .map_or(reg.name(), |(k, _)| *k);
                write!(f, "%{name}")
            }
            Self::InstructionPointer => f.write_str("%rip"),
            Self::ZeroIndex => f.write_str("%riz"),
            Self::Other(name) => write!(f, "%{name}"),
        }
    }
}

static GPR_NAMES: OnceLock<FxHashMap<&'static str, (Reg, Width)>> = OnceLock::new();
static OTHER_PATTERN: OnceLock<Regex> = OnceLock::new();

fn gpr_names() -> &'static FxHashMap<&'static str, (Reg, Width)> {
    GPR_NAMES.get_or_init(|| {
        const LEGACY: [(Reg, [&str; 4]); 8] = [
            (Reg::Rax, ["rax", "eax", "ax", "al"]),
            (Reg::Rbx, ["rbx", "ebx", "bx", "bl"]),
            (Reg::Rcx, ["rcx", "ecx", "cx", "cl"]),
            (Reg::Rdx, ["rdx", "edx", "dx", "dl"]),
            (Reg::Rsi, ["rsi", "esi", "si", "sil"]),
            (Reg::Rdi, ["rdi", "edi", "di", "dil"]),
            (Reg::Rbp, ["rbp", "ebp", "bp", "bpl"]),
            (Reg::Rsp, ["rsp", "esp", "sp", "spl"]),
        ];
        const NUMBERED: [(Reg, [&str; 4]); 8] = [
            (Reg::R8, ["r8", "r8d", "r8w", "r8b"]),
            (Reg::R9, ["r9", "r9d", "r9w", "r9b"]),
            (Reg::R10, ["r10", "r10d", "r10w", "r10b"]),
            (Reg::R11, ["r11", "r11d", "r11w", "r11b"]),
            (Reg::R12, ["r12", "r12d", "r12w", "r12b"]),
            (Reg::R13, ["r13", "r13d", "r13w", "r13b"]),
            (Reg::R14, ["r14", "r14d", "r14w", "r14b"]),
            (Reg::R15, ["r15", "r15d", "r15w", "r15b"]),
        ];
        let widths = [Width::Qword, Width::Dword, Width::Word, Width::Byte];

        let mut map = FxHashMap::default();
        for (reg, names) in LEGACY.iter().chain(NUMBERED.iter()) {
            for (name, width) in names.iter().zip(widths) {
                map.insert(*name, (*reg, width));
            }
        }
        map.insert("ah", (Reg::Rax, Width::HighByte));
        map.insert("bh", (Reg::Rbx, Width::HighByte));
        map.insert("ch", (Reg::Rcx, Width::HighByte));
        map.insert("dh", (Reg::Rdx, Width::HighByte));
        map
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_widths() {
        assert_eq!(RegisterName::parse("rax"), Some(RegisterName::Gpr(Reg::Rax, Width::Qword)));
        assert_eq!(RegisterName::parse("r12d"), Some(RegisterName::Gpr(Reg::R12, Width::Dword)));
        assert_eq!(RegisterName::parse("sil"), Some(RegisterName::Gpr(Reg::Rsi, Width::Byte)));
        assert_eq!(RegisterName::parse("ah"), Some(RegisterName::Gpr(Reg::Rax, Width::HighByte)));
        assert_eq!(RegisterName::parse("bp"), Some(RegisterName::Gpr(Reg::Rbp, Width::Word)));
    }

    #[test]
    fn test_parse_special() {
        assert_eq!(RegisterName::parse("rip"), Some(RegisterName::InstructionPointer));
        assert_eq!(RegisterName::parse("eiz"), Some(RegisterName::ZeroIndex));
        assert_eq!(RegisterName::parse("gs"), Some(RegisterName::Other("gs".into())));
        assert_eq!(RegisterName::parse("xmm12"), Some(RegisterName::Other("xmm12".into())));
        assert_eq!(RegisterName::parse("bogus"), None);
    }

    #[test]
    fn test_full_gpr() {
        assert_eq!(RegisterName::parse("rsp").and_then(|r| r.full_gpr()), Some(Reg::Rsp));
        assert_eq!(RegisterName::parse("esp").and_then(|r| r.full_gpr()), None);
        assert_eq!(RegisterName::parse("esp").and_then(|r| r.gpr()), Some(Reg::Rsp));
    }

    #[test]
    fn test_argument_index() {
        assert_eq!(Reg::Rdi.argument_index(), Some(0));
        assert_eq!(Reg::R9.argument_index(), Some(5));
        assert_eq!(Reg::Rbx.argument_index(), None);
    }

    #[test]
    fn test_reg_set() {
        let mut set = RegSet::of(&[Reg::Rbx, Reg::R12]);
        assert!(set.contains(Reg::Rbx));
        assert!(!set.contains(Reg::Rax));
        set.insert(Reg::Rax);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Reg::Rax, Reg::Rbx, Reg::R12]);
        assert!(RegSet::EMPTY.is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(RegisterName::Gpr(Reg::R9, Width::Dword).to_string(), "%r9d");
        assert_eq!(Reg::R15.to_string(), "r15");
    }
}
