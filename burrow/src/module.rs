//! Compiled module stream.
//!
//! ```text
//! u32 magic 0x5752_5242
//! u16 version
//! i32 instruction count, then one u64 per instruction
//! i32 global count, then per global a u8 tag and its payload
//!     0 int    i64
//!     1 float  f64
//!     2 string i32 length + UTF-8
//! ```
//!
//! Writers pick a byte order. Readers find it from the magic.
use std::io::{Cursor, Read, Write};

use byteorder::ByteOrder;

use crate::{
    BigEndian, EndianReader, EndianWriter, Instruction, LittleEndian, ValueCell, VmError,
    VmResult,
};

pub const MODULE_MAGIC: u32 = 0x5752_5242;
pub const MODULE_VERSION: u16 = 1;

const TAG_INT: u8 = 0;
const TAG_FLOAT: u8 = 1;
const TAG_STRING: u8 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum GlobalValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl GlobalValue {
    pub fn to_cell(&self) -> ValueCell {
        match self {
            GlobalValue::Int(v) => ValueCell::from(*v),
            GlobalValue::Float(v) => ValueCell::from(*v),
            GlobalValue::Str(s) => ValueCell::from_string(s.clone()),
        }
    }
}

/// Instructions plus the resolved global table, as handed over by the
/// assembler.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompiledModule {
    pub instructions: Vec<Instruction>,
    pub globals: Vec<GlobalValue>,
}

impl CompiledModule {
    pub fn new(instructions: Vec<Instruction>, globals: Vec<GlobalValue>) -> Self {
        Self {
            instructions,
            globals,
        }
    }

    pub fn encode<O: ByteOrder, W: Write>(&self, out: W) -> VmResult<W> {
        let mut w = EndianWriter::<W, O>::new(out);
        w.write_u32(MODULE_MAGIC)?;
        w.write_u16(MODULE_VERSION)?;

        w.write_i32(count(self.instructions.len())?)?;
        for instruction in &self.instructions {
            w.write_u64(instruction.to_u64())?;
        }

        w.write_i32(count(self.globals.len())?)?;
        for global in &self.globals {
            match global {
                GlobalValue::Int(v) => {
                    w.write_u8(TAG_INT)?;
                    w.write_i64(*v)?;
                }
                GlobalValue::Float(v) => {
                    w.write_u8(TAG_FLOAT)?;
                    w.write_f64(*v)?;
                }
                GlobalValue::Str(s) => {
                    w.write_u8(TAG_STRING)?;
                    w.write_string(s)?;
                }
            }
        }
        Ok(w.into_inner())
    }

    pub fn to_bytes<O: ByteOrder>(&self) -> VmResult<Vec<u8>> {
        self.encode::<O, _>(Vec::new())
    }

    /// Decodes a stream in either byte order.
    pub fn decode(bytes: &[u8]) -> VmResult<Self> {
        let magic: [u8; 4] = bytes
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| VmError::InvalidModule("stream is shorter than the header".into()))?;

        if LittleEndian::read_u32(&magic) == MODULE_MAGIC {
            Self::decode_with::<LittleEndian>(bytes)
        } else if BigEndian::read_u32(&magic) == MODULE_MAGIC {
            Self::decode_with::<BigEndian>(bytes)
        } else {
            Err(VmError::InvalidModule(format!(
                "bad magic 0x{:08X}",
                LittleEndian::read_u32(&magic)
            )))
        }
    }

    fn decode_with<O: ByteOrder>(bytes: &[u8]) -> VmResult<Self> {
        let mut r = EndianReader::<_, O>::new(Cursor::new(bytes));
        r.read_u32()?;
        let version = r.read_u16()?;
        if version != MODULE_VERSION {
            return Err(VmError::InvalidModule(format!(
                "unsupported version {version}"
            )));
        }

        let instruction_count = read_count(&mut r, "instruction")?;
        let mut instructions = Vec::with_capacity(instruction_count.min(bytes.len() / 8));
        for _ in 0..instruction_count {
            instructions.push(Instruction::from_u64(r.read_u64()?));
        }

        let global_count = read_count(&mut r, "global")?;
        let mut globals = Vec::with_capacity(global_count.min(bytes.len()));
        for _ in 0..global_count {
            let global = match r.read_u8()? {
                TAG_INT => GlobalValue::Int(r.read_i64()?),
                TAG_FLOAT => GlobalValue::Float(r.read_f64()?),
                TAG_STRING => GlobalValue::Str(r.read_string()?),
                tag => {
                    return Err(VmError::InvalidModule(format!("unknown global tag {tag}")));
                }
            };
            globals.push(global);
        }

        let mut rest = Vec::new();
        r.into_inner().read_to_end(&mut rest)?;
        if !rest.is_empty() {
            return Err(VmError::InvalidModule(format!(
                "{} trailing bytes",
                rest.len()
            )));
        }
        Ok(Self {
            instructions,
            globals,
        })
    }
}

fn count(len: usize) -> VmResult<i32> {
    i32::try_from(len).map_err(|_| VmError::InvalidModule(format!("{len} entries do not fit")))
}

fn read_count<R: Read, O: ByteOrder>(r: &mut EndianReader<R, O>, what: &str) -> VmResult<usize> {
    let raw = r.read_i32()?;
    usize::try_from(raw).map_err(|_| VmError::InvalidModule(format!("negative {what} count {raw}")))
}
