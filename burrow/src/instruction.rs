use core::fmt;

/// Opcodes understood by the default processor.
///
/// Every instruction is one fixed-width record: an opcode, three register
/// operands and a 32-bit immediate. Operands an opcode does not use are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    /// Stop the process normally.
    Halt = 0x00,

    /// Do nothing.
    Nop,

    /// Copy a register.
    /// Operands: `ra` dst, `rb` src
    Mov,

    /// Load the immediate into a register (sign extended).
    /// Operands: `ra` dst, `immediate`
    Movl,

    /// 64-bit wrapping integer addition.
    /// Operands: `ra` dst, `rb` lhs, `rc` rhs
    Add,

    /// 64-bit wrapping integer subtraction.
    /// Operands: `ra` dst, `rb` lhs, `rc` rhs
    Sub,

    /// Load a cell through the virtual address space.
    /// Operands: `ra` dst, `rb` base address register, `immediate` offset
    Ldr,

    /// Store a cell through the virtual address space.
    /// Operands: `ra` src, `rb` base address register, `immediate` offset
    Str,

    /// Unconditional absolute branch.
    /// Operands: `immediate` target instruction index
    Br,

    /// Branch when a register is non zero.
    /// Operands: `ra` condition, `immediate` target instruction index
    Bnz,

    /// Call a host peripheral function.
    /// Operands: `ra` first argument register, `rb` argument count,
    /// `rc` result register, `immediate` packed peripheral function id
    Callp,
}

impl Op {
    pub const COUNT: usize = Op::Callp as usize + 1;

    pub const fn mnemonic(self) -> &'static str {
        match self {
            Op::Halt => "halt",
            Op::Nop => "nop",
            Op::Mov => "mov",
            Op::Movl => "movl",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Ldr => "ldr",
            Op::Str => "str",
            Op::Br => "br",
            Op::Bnz => "bnz",
            Op::Callp => "callp",
        }
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}

/// One encoded instruction record.
///
/// Packed into 64 bits as `op | ra << 8 | rb << 16 | rc << 24 | imm << 32`,
/// which is also how it is stored inside a program segment cell and how it
/// travels in a compiled module stream. The opcode byte is kept raw so that
/// undecodable records survive a load and only fault when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Instruction {
    pub op: u8,
    pub ra: u8,
    pub rb: u8,
    pub rc: u8,
    pub immediate: i32,
}

impl Instruction {
    pub const fn new(op: Op, ra: u8, rb: u8, rc: u8, immediate: i32) -> Self {
        Self {
            op: op as u8,
            ra,
            rb,
            rc,
            immediate,
        }
    }

    pub const fn halt() -> Self {
        Self::new(Op::Halt, 0, 0, 0, 0)
    }

    pub fn opcode(&self) -> Result<Op, u8> {
        Op::try_from(self.op)
    }

    pub const fn to_u64(self) -> u64 {
        (self.op as u64)
            | (self.ra as u64) << 8
            | (self.rb as u64) << 16
            | (self.rc as u64) << 24
            | (self.immediate as u32 as u64) << 32
    }

    pub const fn from_u64(raw: u64) -> Self {
        Self {
            op: raw as u8,
            ra: (raw >> 8) as u8,
            rb: (raw >> 16) as u8,
            rc: (raw >> 24) as u8,
            immediate: (raw >> 32) as u32 as i32,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Ok(op) => write!(
                f,
                "{:<6} r{}, r{}, r{}, #{}",
                op.mnemonic(),
                self.ra,
                self.rb,
                self.rc,
                self.immediate
            ),
            Err(byte) => write!(f, "<invalid 0x{byte:02x}>"),
        }
    }
}
