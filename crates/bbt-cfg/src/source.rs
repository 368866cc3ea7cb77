//! Services the analysis consumes: disassembly, symbols and memory.

/// One disassembled instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedLine {
    pub address: u64,
    /// Encoded length in bytes.
    pub length: u64,
    /// AT&T instruction text.
    pub text: String,
}

/// Streaming disassembler.
pub trait Disassembler {
    /// Decode the instruction at `address`. Direct branch and call targets
    /// are reported through `targets` while decoding. Returns `None` when the
    /// bytes cannot be read.
    fn decode(&self, address: u64, targets: &mut dyn FnMut(u64)) -> Option<DecodedLine>;
}

/// Function bounds and naming.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
    pub start: u64,
    /// First address past the function.
    pub end: u64,
    pub module: Option<String>,
}

impl SymbolInfo {
    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }
}

/// Address to symbol resolution.
pub trait SymbolResolver {
    /// Function containing `address`.
    fn resolve(&self, address: u64) -> Option<SymbolInfo>;

    /// Start address of the function called `name`.
    fn lookup(&self, name: &str) -> Option<u64>;
}

/// Word reads from the target's memory.
pub trait MemoryReader {
    fn read_word(&self, address: u64) -> Option<u64>;
}

/// Reader for when no memory is available.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoMemory;

impl MemoryReader for NoMemory {
    fn read_word(&self, _address: u64) -> Option<u64> {
        None
    }
}
