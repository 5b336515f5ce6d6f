/// Class of an operand, compared before anything else
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Register,
    Memory,
    Immediate,
    NearBranch,
    FarBranch,
}

/// Where an operand's immediate or displacement sits inside the instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub offset: u8,
    pub size: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    /// Register operand, or base register of a memory operand
    pub base: u32,
    pub index: u32,
    pub scale: u32,
    /// Segment register of a memory operand, selector of a far branch
    pub segment: u32,
    /// Absolute target of a branch
    pub target: u64,
    pub field: Option<Field>,
}

impl Operand {
    pub fn new(kind: OperandKind) -> Self {
        Self {
            kind,
            base: 0,
            index: 0,
            scale: 0,
            segment: 0,
            target: 0,
            field: None,
        }
    }
}

/// Architecture-neutral view of one decoded instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    /// Decoder-defined operation id; equal ids mean equal operations
    pub mnemonic: u32,
    pub len: usize,
    pub operands: Vec<Operand>,
    /// Padding or an idiom with no effect
    pub nop: bool,
    /// Control never falls through to the next instruction
    pub unconditional: bool,
    pub call: bool,
    /// Deliberate trap, e.g. `ud2`
    pub trap: bool,
    pub invalid: bool,
}

impl Insn {
    /// Direct call target, if this is a direct call
    pub fn call_target(&self) -> Option<u64> {
        if !self.call {
            return None;
        }
        self.operands
            .iter()
            .find(|op| op.kind == OperandKind::NearBranch)
            .map(|op| op.target)
    }
}

/// Turns bytes into [`Insn`]s. The matcher only ever talks to this.
pub trait InsnDecoder: Send + Sync {
    /// Longest encodable instruction
    fn max_len(&self) -> usize;

    /// Decodes the instruction at the start of `bytes`, located at `ip`.
    /// Returns `None` only if `bytes` is empty.
    fn decode(&self, bytes: &[u8], ip: u64) -> Option<Insn>;
}
