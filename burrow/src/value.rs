//! ValueCell: the 8 byte unit every pool is made of.
//!
//! A cell carries raw primitive bits and, next to them, an optional reference
//! to a host managed object. There is no stored discriminant: the reader picks
//! the interpretation (the bytecode knows its types statically), and reading as
//! the wrong primitive type simply returns the stored bits reinterpreted.
//!
//! Bits are laid out little-endian on every host. Narrow writes zero the rest
//! of the cell and narrow reads take the low bytes, so an `i32` written through
//! `from_i32` reads back through `as_i64` with its upper half cleared, not sign
//! extended.
use std::{any::Any, fmt, mem::size_of, sync::Arc};

use crate::Instruction;

pub const CELL_SIZE: usize = 8;

/// Host object carried by a cell. The engine never traces or frees these;
/// the reference count owns them.
pub type HostObject = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Default)]
pub struct ValueCell {
    bits: [u8; CELL_SIZE],
    object: Option<HostObject>,
}

macro_rules! primitive_conversions {
    ($($ty:ty => $from:ident, $as:ident;)*) => {
        impl ValueCell {
            $(
                #[inline]
                pub fn $from(value: $ty) -> Self {
                    let mut cell = Self::default();
                    cell.bits[..size_of::<$ty>()].copy_from_slice(&value.to_le_bytes());
                    cell
                }

                #[inline]
                pub fn $as(&self) -> $ty {
                    let mut buf = [0u8; size_of::<$ty>()];
                    buf.copy_from_slice(&self.bits[..size_of::<$ty>()]);
                    <$ty>::from_le_bytes(buf)
                }
            )*
        }

        $(
            impl From<$ty> for ValueCell {
                #[inline]
                fn from(value: $ty) -> Self {
                    Self::$from(value)
                }
            }

            impl From<&ValueCell> for $ty {
                #[inline]
                fn from(cell: &ValueCell) -> Self {
                    cell.$as()
                }
            }
        )*
    };
}

primitive_conversions! {
    i8 => from_i8, as_i8;
    u8 => from_u8, as_u8;
    i16 => from_i16, as_i16;
    u16 => from_u16, as_u16;
    i32 => from_i32, as_i32;
    u32 => from_u32, as_u32;
    i64 => from_i64, as_i64;
    u64 => from_u64, as_u64;
    f32 => from_f32, as_f32;
    f64 => from_f64, as_f64;
}

impl ValueCell {
    pub const fn zero() -> Self {
        Self {
            bits: [0; CELL_SIZE],
            object: None,
        }
    }

    pub fn from_raw_bits(bits: [u8; CELL_SIZE]) -> Self {
        Self { bits, object: None }
    }

    pub fn raw_bits(&self) -> [u8; CELL_SIZE] {
        self.bits
    }

    /// A UTF-16 code unit, the width script characters are stored with.
    pub fn from_char_unit(unit: u16) -> Self {
        Self::from_u16(unit)
    }

    pub fn as_char_unit(&self) -> u16 {
        self.as_u16()
    }

    /// Two 32-bit halves, low half first.
    pub fn from_i32_pair(low: i32, high: i32) -> Self {
        let mut cell = Self::default();
        cell.set_i32_pair(low, high);
        cell
    }

    pub fn i32_pair(&self) -> (i32, i32) {
        let mut low = [0u8; 4];
        let mut high = [0u8; 4];
        low.copy_from_slice(&self.bits[..4]);
        high.copy_from_slice(&self.bits[4..]);
        (i32::from_le_bytes(low), i32::from_le_bytes(high))
    }

    /// Overwrites only the primitive half; a host object, if any, stays.
    pub fn set_i32_pair(&mut self, low: i32, high: i32) {
        self.bits[..4].copy_from_slice(&low.to_le_bytes());
        self.bits[4..].copy_from_slice(&high.to_le_bytes());
    }

    pub fn from_instruction(instruction: Instruction) -> Self {
        Self::from_u64(instruction.to_u64())
    }

    pub fn as_instruction(&self) -> Instruction {
        Instruction::from_u64(self.as_u64())
    }

    pub fn from_object(object: HostObject) -> Self {
        Self {
            bits: [0; CELL_SIZE],
            object: Some(object),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self::from_object(Arc::new(value.into()))
    }

    pub fn host_object(&self) -> Option<&HostObject> {
        self.object.as_ref()
    }

    pub fn set_host_object(&mut self, object: Option<HostObject>) {
        self.object = object;
    }

    pub fn take_host_object(&mut self) -> Option<HostObject> {
        self.object.take()
    }

    /// The host object downcast to `T`, `None` when absent or of another type.
    pub fn host_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.object.as_ref()?.downcast_ref::<T>()
    }

    pub fn host_string(&self) -> Option<&str> {
        self.host_ref::<String>().map(String::as_str)
    }
}

impl From<Instruction> for ValueCell {
    fn from(value: Instruction) -> Self {
        Self::from_instruction(value)
    }
}

impl From<&ValueCell> for Instruction {
    fn from(cell: &ValueCell) -> Self {
        cell.as_instruction()
    }
}

impl From<String> for ValueCell {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}

impl From<&str> for ValueCell {
    fn from(value: &str) -> Self {
        Self::from_string(value)
    }
}

impl fmt::Debug for ValueCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("ValueCell");
        dbg.field("bits", &format_args!("0x{:016x}", self.as_u64()));
        match (&self.object, self.host_string()) {
            (_, Some(s)) => dbg.field("object", &s),
            (Some(_), None) => dbg.field("object", &"<host object>"),
            (None, None) => dbg.field("object", &"none"),
        };
        dbg.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Op;

    #[test]
    fn test_primitive_roundtrip_each_width() {
        assert_eq!(ValueCell::from(-5i8).as_i8(), -5);
        assert_eq!(ValueCell::from(250u8).as_u8(), 250);
        assert_eq!(ValueCell::from(-30_000i16).as_i16(), -30_000);
        assert_eq!(ValueCell::from(65_000u16).as_u16(), 65_000);
        assert_eq!(ValueCell::from(123_456i32).as_i32(), 123_456);
        assert_eq!(ValueCell::from(u32::MAX).as_u32(), u32::MAX);
        assert_eq!(ValueCell::from(i64::MIN).as_i64(), i64::MIN);
        assert_eq!(ValueCell::from(u64::MAX).as_u64(), u64::MAX);
        assert_eq!(ValueCell::from(1.5f32).as_f32(), 1.5);
        assert_eq!(ValueCell::from(-2.25f64).as_f64(), -2.25);
    }

    #[test]
    fn test_float_bits_preserved() {
        let nan = f64::from_bits(0x7ff8_0000_dead_beef);
        let cell = ValueCell::from(nan);
        assert_eq!(cell.as_f64().to_bits(), 0x7ff8_0000_dead_beef);
        assert_eq!(cell.as_u64(), 0x7ff8_0000_dead_beef);
    }

    #[test]
    fn test_wrong_type_read_reinterprets_bits() {
        let cell = ValueCell::from(-1i32);
        // the upper half was zeroed by the narrow write
        assert_eq!(cell.as_u32(), u32::MAX);
        assert_eq!(cell.as_i64(), u32::MAX as i64);
        assert_eq!(ValueCell::from(1.0f64).as_u64(), 1.0f64.to_bits());
    }

    #[test]
    fn test_i32_pair_keeps_object() {
        let mut cell = ValueCell::from_string("label");
        cell.set_i32_pair(7, -1);
        assert_eq!(cell.i32_pair(), (7, -1));
        assert_eq!(cell.host_string(), Some("label"));
        assert_eq!(ValueCell::from_i32_pair(-3, 9).i32_pair(), (-3, 9));
    }

    #[test]
    fn test_host_object_and_bits_are_independent() {
        let mut cell = ValueCell::from(42i64);
        assert!(cell.host_object().is_none());
        cell.set_host_object(Some(Arc::new(String::from("hello"))));
        assert_eq!(cell.as_i64(), 42);
        assert_eq!(cell.host_string(), Some("hello"));
        assert!(cell.host_ref::<u32>().is_none());
        let taken = cell.take_host_object();
        assert!(taken.is_some());
        assert!(cell.host_string().is_none());
    }

    #[test]
    fn test_clone_copies_bits_and_shares_object() {
        let original = ValueCell::from_string("shared");
        let copy = original.clone();
        let a = original.host_object().unwrap();
        let b = copy.host_object().unwrap();
        assert!(Arc::ptr_eq(a, b));
    }

    #[test]
    fn test_instruction_cell() {
        let inst = Instruction::new(Op::Movl, 3, 0, 0, 99);
        let cell = ValueCell::from(inst);
        assert_eq!(cell.as_instruction(), inst);
        assert_eq!(Instruction::from(&cell).immediate, 99);
    }
}
