use std::path::PathBuf;

use crate::{
    DEFAULT_WATCHDOG_MS, MAX_SEGMENT_CELLS, MINIMUM_POOL_BYTES, VmError, VmResult,
};

/// Settings the standard machine parts are built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// Bytes of the shared pool the pool allocator carves segments from.
    /// Rounded up to whole 8 byte cells.
    pub pool_size: usize,
    /// Cells of heap segment per process.
    pub heap_cells: usize,
    /// Cells of stack segment per process.
    pub stack_cells: usize,
    /// Registers per process. Register operands are one byte wide.
    pub register_count: usize,
    /// Watchdog threshold new processes start with, zero disables it.
    pub watchdog_ms: u64,
    /// Give every segment its own pool instead of sharing one.
    pub host_allocator: bool,
    /// Directory compiled modules are loaded from.
    pub storage_root: PathBuf,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            pool_size: 1 << 20,  // 1 MB = 131072 cells
            heap_cells: 4096,
            stack_cells: 1024,
            register_count: 16,
            watchdog_ms: DEFAULT_WATCHDOG_MS,
            host_allocator: false,
            storage_root: PathBuf::from("."),
        }
    }
}

impl MachineConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.pool_size < MINIMUM_POOL_BYTES {
            return Err("pool_size is below the minimum of 24 bytes");
        }
        if self.heap_cells == 0 || self.stack_cells == 0 || self.register_count == 0 {
            return Err("segment sizes must be > 0");
        }
        if self.heap_cells > MAX_SEGMENT_CELLS || self.stack_cells > MAX_SEGMENT_CELLS {
            return Err("segments must fit the 20 bit address offset");
        }
        if self.register_count > u8::MAX as usize + 1 {
            return Err("register_count must be addressable by a one byte operand");
        }
        Ok(())
    }

    pub fn validated(self) -> VmResult<Self> {
        self.validate().map_err(VmError::InvalidConfig)?;
        Ok(self)
    }
}
