//! Default memory part.
//!
//! Carves the five segments of a process out of one allocator and fills the
//! program and global segments from the compiled module.
use crate::{
    AllocationKind, CompiledModule, HostAllocator, MachineConfig, Memory, MemoryAllocator,
    MemoryView, PoolAllocator, ProcessSegments, ValueCell, VmError, VmResult,
    cell_count_to_byte_size, vmem::MAX_SEGMENT_CELLS,
};

/// Per process segment sizes, in cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub heap_cells: usize,
    pub stack_cells: usize,
    pub register_count: usize,
}

impl From<&MachineConfig> for SegmentLayout {
    fn from(config: &MachineConfig) -> Self {
        Self {
            heap_cells: config.heap_cells,
            stack_cells: config.stack_cells,
            register_count: config.register_count,
        }
    }
}

pub struct StandardMemory {
    allocator: Box<dyn MemoryAllocator>,
    layout: SegmentLayout,
}

impl StandardMemory {
    pub fn new(allocator: Box<dyn MemoryAllocator>, layout: SegmentLayout) -> Self {
        Self { allocator, layout }
    }

    pub fn from_config(config: &MachineConfig) -> VmResult<Self> {
        let allocator: Box<dyn MemoryAllocator> = if config.host_allocator {
            Box::new(HostAllocator)
        } else {
            Box::new(PoolAllocator::new(config.pool_size)?)
        };
        Ok(Self::new(allocator, SegmentLayout::from(config)))
    }

    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }

    fn allocate_cells(&mut self, cells: usize, kind: AllocationKind) -> VmResult<MemoryView> {
        if cells > MAX_SEGMENT_CELLS {
            return Err(VmError::invalid_argument(format!(
                "{kind:?} segment of {cells} cells exceeds the addressable {MAX_SEGMENT_CELLS}"
            )));
        }
        let bytes = i64::try_from(cell_count_to_byte_size(cells))
            .map_err(|_| VmError::invalid_argument("segment size overflows"))?;
        let view = self.allocator.allocate(bytes, kind)?;
        // reused runs still hold whatever the previous owner left behind
        view.clear();
        Ok(view)
    }

    fn release_all(&mut self, views: &[MemoryView]) -> VmResult<()> {
        let mut first_error = None;
        for view in views {
            if let Err(err) = self.allocator.deallocate(view) {
                log::warn!("failed to release segment: {err}");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Memory for StandardMemory {
    fn create_process(&mut self, module: &CompiledModule) -> VmResult<ProcessSegments> {
        // empty tables still get one cell, allocations must be non empty
        let plan = [
            (module.instructions.len().max(1), AllocationKind::Program),
            (module.globals.len().max(1), AllocationKind::Global),
            (self.layout.heap_cells, AllocationKind::Heap),
            (self.layout.stack_cells, AllocationKind::Stack),
            (self.layout.register_count, AllocationKind::Context),
        ];

        let mut views = Vec::with_capacity(plan.len());
        for (cells, kind) in plan {
            match self.allocate_cells(cells, kind) {
                Ok(view) => views.push(view),
                Err(err) => {
                    log::debug!("segment allocation failed, rolling back {} segments", views.len());
                    // the allocation error is the one worth reporting
                    let _ = self.release_all(&views);
                    return Err(err);
                }
            }
        }

        let [program, global, heap, stack, registers]: [MemoryView; 5] = views
            .try_into()
            .map_err(|_| VmError::invalid_argument("segment plan size mismatch"))?;

        let code: Vec<ValueCell> = module.instructions.iter().map(|&i| ValueCell::from(i)).collect();
        program.write_slice(0, &code)?;
        let globals: Vec<ValueCell> = module.globals.iter().map(|g| g.to_cell()).collect();
        global.write_slice(0, &globals)?;

        Ok(ProcessSegments {
            program,
            global,
            heap,
            stack,
            registers,
        })
    }

    fn release_process(&mut self, segments: &ProcessSegments) -> VmResult<()> {
        let views: Vec<MemoryView> = segments.views().into_iter().cloned().collect();
        self.release_all(&views)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GlobalValue, Instruction, Op};

    fn layout() -> SegmentLayout {
        SegmentLayout {
            heap_cells: 8,
            stack_cells: 4,
            register_count: 4,
        }
    }

    fn module() -> CompiledModule {
        CompiledModule::new(
            vec![Instruction::new(Op::Movl, 1, 0, 0, 5), Instruction::halt()],
            vec![GlobalValue::Int(11), GlobalValue::Str("g".into())],
        )
    }

    #[test]
    fn test_segments_are_sized_and_loaded() {
        let allocator = PoolAllocator::new(cell_count_to_byte_size(64)).unwrap();
        let mut memory = StandardMemory::new(Box::new(allocator), layout());
        let segments = memory.create_process(&module()).unwrap();

        assert_eq!(segments.program.len(), 2);
        assert_eq!(segments.global.len(), 2);
        assert_eq!(segments.heap.len(), 8);
        assert_eq!(segments.stack.len(), 4);
        assert_eq!(segments.registers.len(), 4);
        assert_eq!(
            segments.program.get(0).unwrap().as_instruction(),
            Instruction::new(Op::Movl, 1, 0, 0, 5)
        );
        assert_eq!(segments.global.get(0).unwrap().as_i64(), 11);
        assert_eq!(segments.global.get(1).unwrap().host_string(), Some("g"));

        // every segment lives in the one shared pool and none overlap
        let views = segments.views();
        for (i, a) in views.iter().enumerate() {
            for b in &views[i + 1..] {
                assert!(a.pool().ptr_eq(b.pool()));
                assert!(!a.aliases(b));
            }
        }
    }

    #[test]
    fn test_release_makes_room_for_more_processes() {
        let allocator = PoolAllocator::new(cell_count_to_byte_size(64)).unwrap();
        let mut memory = StandardMemory::new(Box::new(allocator), layout());
        let first = memory.create_process(&module()).unwrap();
        memory.release_process(&first).unwrap();

        // a second release finds the runs already free
        assert!(matches!(
            memory.release_process(&first),
            Err(VmError::InvalidArgument(_))
        ));

        assert!(memory.create_process(&module()).is_ok());
        assert!(memory.create_process(&module()).is_ok());
        assert!(memory.create_process(&module()).is_err());
    }

    #[test]
    fn test_failed_creation_rolls_back() {
        let allocator = PoolAllocator::new(cell_count_to_byte_size(20)).unwrap();
        let mut memory = StandardMemory::new(Box::new(allocator), layout());
        assert!(matches!(
            memory.create_process(&module()),
            Err(VmError::OutOfMemory { .. })
        ));
        // program, global and heap were handed back, a smaller layout fits now
        memory.layout = SegmentLayout {
            heap_cells: 1,
            stack_cells: 1,
            register_count: 1,
        };
        assert!(memory.create_process(&module()).is_ok());
    }

    #[test]
    fn test_reused_cells_are_cleared() {
        // exactly one process worth of cells and records
        let allocator = PoolAllocator::new(cell_count_to_byte_size(30)).unwrap();
        let mut memory = StandardMemory::new(Box::new(allocator), layout());
        let first = memory.create_process(&module()).unwrap();
        first.heap.set(0, 99i64).unwrap();
        first.registers.set(3, -1i64).unwrap();
        memory.release_process(&first).unwrap();

        let second = memory.create_process(&module()).unwrap();
        assert_eq!(second.heap.offset(), first.heap.offset());
        second.heap.with_cells(|cells| assert!(cells.iter().all(|c| c.as_i64() == 0)));
        assert_eq!(second.registers.get(3).unwrap().as_i64(), 0);
    }

    #[test]
    fn test_host_allocator_gives_each_segment_its_own_pool() {
        let config = MachineConfig {
            host_allocator: true,
            heap_cells: 3,
            stack_cells: 3,
            register_count: 2,
            ..Default::default()
        };
        let mut memory = StandardMemory::from_config(&config).unwrap();
        let segments = memory.create_process(&CompiledModule::default()).unwrap();
        assert_eq!(segments.program.len(), 1);
        assert_eq!(segments.global.len(), 1);
        assert!(!segments.heap.pool().ptr_eq(segments.stack.pool()));
        memory.release_process(&segments).unwrap();
    }
}
