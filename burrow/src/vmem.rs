//! Segmented virtual address space.
//!
//! A 32-bit address carries a segment selector in its top 12 bits and a cell
//! offset in the low 20 bits. Each selector names one [`MemoryView`]; the
//! views are sized and bounds checked independently.
use core::fmt;

use crate::{MemoryView, ValueCell, VmError, VmResult};

pub const SEGMENT_SHIFT: u32 = 20;
pub const OFFSET_MASK: u32 = (1 << SEGMENT_SHIFT) - 1;
/// Largest cell offset an address can express inside one segment.
pub const MAX_SEGMENT_CELLS: usize = OFFSET_MASK as usize + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Segment {
    Program = 0,
    Global = 1,
    Heap = 2,
    Stack = 3,
}

impl Segment {
    pub const ALL: [Segment; 4] = [
        Segment::Program,
        Segment::Global,
        Segment::Heap,
        Segment::Stack,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Segment::Program => "program",
            Segment::Global => "global",
            Segment::Heap => "heap",
            Segment::Stack => "stack",
        }
    }

    fn from_selector(selector: u32) -> Option<Self> {
        Self::ALL.get(selector as usize).copied()
    }
}

/// A decoded virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualAddress {
    pub segment: Segment,
    pub offset: usize,
}

impl VirtualAddress {
    /// Composes the raw address for `offset` inside `segment`.
    pub fn new(segment: Segment, offset: usize) -> VmResult<u32> {
        if offset >= MAX_SEGMENT_CELLS {
            return Err(VmError::invalid_argument(format!(
                "offset {offset} does not fit a segment of {MAX_SEGMENT_CELLS} cells"
            )));
        }
        Ok(((segment as u32) << SEGMENT_SHIFT) | offset as u32)
    }

    pub fn decode(address: u32) -> VmResult<Self> {
        let segment = Segment::from_selector(address >> SEGMENT_SHIFT)
            .ok_or(VmError::AddressingError(address))?;
        Ok(Self {
            segment,
            offset: (address & OFFSET_MASK) as usize,
        })
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment.name(), self.offset)
    }
}

#[derive(Debug, Clone)]
pub struct VirtualMemory {
    segments: [MemoryView; 4],
}

impl VirtualMemory {
    pub fn new(program: MemoryView, global: MemoryView, heap: MemoryView, stack: MemoryView) -> Self {
        Self {
            segments: [program, global, heap, stack],
        }
    }

    pub fn segment(&self, segment: Segment) -> &MemoryView {
        &self.segments[segment as usize]
    }

    pub fn segments(&self) -> impl Iterator<Item = (Segment, &MemoryView)> {
        Segment::ALL.into_iter().zip(self.segments.iter())
    }

    /// The view and in-segment index an address refers to.
    pub fn resolve(&self, address: u32) -> VmResult<(&MemoryView, usize)> {
        let decoded = VirtualAddress::decode(address)?;
        Ok((self.segment(decoded.segment), decoded.offset))
    }

    pub fn read(&self, address: u32) -> VmResult<ValueCell> {
        let (view, offset) = self.resolve(address)?;
        view.get(offset)
    }

    pub fn write(&self, address: u32, value: impl Into<ValueCell>) -> VmResult<()> {
        let (view, offset) = self.resolve(address)?;
        view.set(offset, value)
    }

    pub fn with_mut<R>(&self, address: u32, f: impl FnOnce(&mut ValueCell) -> R) -> VmResult<R> {
        let (view, offset) = self.resolve(address)?;
        view.with_mut(offset, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Pool;

    fn ten_cell_space() -> VirtualMemory {
        let view = || MemoryView::whole(Pool::new(10));
        VirtualMemory::new(view(), view(), view(), view())
    }

    #[test]
    fn test_global_address_routes_to_global_segment() {
        let vm = ten_cell_space();
        vm.write(0x0010_0005, 42i64).unwrap();
        assert_eq!(vm.segment(Segment::Global).get(5).unwrap().as_i64(), 42);
        assert_eq!(vm.segment(Segment::Heap).get(5).unwrap().as_i64(), 0);
        assert_eq!(vm.read(0x0010_0005).unwrap().as_i64(), 42);
    }

    #[test]
    fn test_unknown_selector_is_addressing_error() {
        let vm = ten_cell_space();
        assert!(matches!(
            vm.read(0x0040_0000),
            Err(VmError::AddressingError(0x0040_0000))
        ));
        assert!(matches!(
            vm.write(0xFFF0_0000, 1i32),
            Err(VmError::AddressingError(_))
        ));
    }

    #[test]
    fn test_offset_past_segment_is_out_of_range() {
        let vm = ten_cell_space();
        assert!(matches!(
            vm.read(0x0030_000A),
            Err(VmError::OutOfRange { index: 10, length: 10 })
        ));
    }

    #[test]
    fn test_address_composition() {
        assert_eq!(VirtualAddress::new(Segment::Program, 0).unwrap(), 0);
        assert_eq!(VirtualAddress::new(Segment::Global, 5).unwrap(), 0x0010_0005);
        assert_eq!(VirtualAddress::new(Segment::Stack, 9).unwrap(), 0x0030_0009);
        assert!(VirtualAddress::new(Segment::Heap, MAX_SEGMENT_CELLS).is_err());

        let decoded = VirtualAddress::decode(0x0020_0003).unwrap();
        assert_eq!(decoded.segment, Segment::Heap);
        assert_eq!(decoded.offset, 3);
        assert_eq!(decoded.to_string(), "heap:3");
    }

    #[test]
    fn test_with_mut_edits_in_place() {
        let vm = ten_cell_space();
        let stack = VirtualAddress::new(Segment::Stack, 2).unwrap();
        vm.write(stack, 10i64).unwrap();
        vm.with_mut(stack, |cell| *cell = ValueCell::from(cell.as_i64() * 3))
            .unwrap();
        assert_eq!(vm.read(stack).unwrap().as_i64(), 30);
    }
}
