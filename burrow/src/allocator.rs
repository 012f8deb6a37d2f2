//! Segment allocators.
//!
//! [`PoolAllocator`] partitions one fixed pool into runs. Every run carries its
//! bookkeeping in band, in the cells right before and right after the caller's
//! window:
//!
//! ```text
//! [ head | allocated_count cells ... | tail ]
//!   head = (allocated_count, kind)
//!   tail = (allocated_count + 2, next_free)
//! ```
//!
//! Free runs form a forward, singly linked list threaded through the tails.
//! The tail's total count lets a run find the head of the run right before it,
//! which is how a release merges into a free predecessor. There is no forward
//! merge: a free successor is only folded in when the successor itself is
//! released later.
//!
//! [`HostAllocator`] hands out a fresh pool per request and leaves reclamation
//! to the reference count.
use crate::{MemoryView, Pool, ValueCell, VmError, VmResult};

pub const HEAD_RECORD_CELLS: usize = 1;
pub const TAIL_RECORD_CELLS: usize = 1;
pub const RECORD_CELLS: usize = HEAD_RECORD_CELLS + TAIL_RECORD_CELLS;
/// Records plus one usable cell: the smallest run worth keeping.
pub const MINIMUM_RUN_CELLS: usize = RECORD_CELLS + 1;
pub const MINIMUM_POOL_BYTES: usize = MINIMUM_RUN_CELLS * 8;

const INDEX_NOT_FOUND: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum AllocationKind {
    Free = 0,
    Program = 1,
    Global = 2,
    Heap = 3,
    Stack = 4,
    /// Processor context, i.e. a process's register file.
    Context = 5,
}

impl AllocationKind {
    fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => Self::Free,
            1 => Self::Program,
            2 => Self::Global,
            3 => Self::Heap,
            4 => Self::Stack,
            5 => Self::Context,
            _ => return None,
        })
    }
}

/// Rounds a byte size up to whole 8 byte cells.
#[inline]
pub const fn byte_size_to_cell_count(size: usize) -> usize {
    size.div_ceil(8)
}

#[inline]
pub const fn cell_count_to_byte_size(count: usize) -> usize {
    count << 3
}

/// The allocate / deallocate contract shared by every allocator.
pub trait MemoryAllocator: Send {
    /// Allocates at least `size` bytes, rounded up to whole cells.
    fn allocate(&mut self, size: i64, kind: AllocationKind) -> VmResult<MemoryView>;

    /// Returns a view obtained from [`MemoryAllocator::allocate`]. The view must
    /// not be used afterwards.
    fn deallocate(&mut self, view: &MemoryView) -> VmResult<()>;
}

fn validate_request(size: i64, kind: AllocationKind) -> VmResult<usize> {
    if size <= 0 {
        return Err(VmError::invalid_argument(format!(
            "allocation size must be positive, got {size}"
        )));
    }
    if kind == AllocationKind::Free {
        return Err(VmError::invalid_argument("cannot allocate with kind 'Free'"));
    }
    Ok(byte_size_to_cell_count(size as usize))
}

// ── Pool allocator ────────────────────────────────────────────────────

/// One run as described by its head and tail records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunInfo {
    /// Index of the head record.
    pub head: usize,
    /// Cells usable by the caller, metadata excluded.
    pub allocated: usize,
    pub kind: AllocationKind,
    /// Head index of the next free run, `-1` at the end of the list.
    pub next_free: i32,
}

/// First fit, boundary tag allocator over a single fixed pool.
///
/// Not synchronized: at most one allocate or deallocate may be in flight.
#[derive(Debug)]
pub struct PoolAllocator {
    pool: Pool,
    first_free: i32,
}

impl PoolAllocator {
    /// A new pool of `pool_size` bytes rounded up to whole cells.
    pub fn new(pool_size: usize) -> VmResult<Self> {
        if pool_size < MINIMUM_POOL_BYTES {
            return Err(VmError::invalid_argument(format!(
                "pool size {pool_size} is below the minimum of {MINIMUM_POOL_BYTES} bytes"
            )));
        }
        Self::with_pool(Pool::new(byte_size_to_cell_count(pool_size)))
    }

    /// Takes over an existing pool. Its contents are overwritten by the
    /// initial free run.
    pub fn with_pool(pool: Pool) -> VmResult<Self> {
        let len = pool.len();
        if len < MINIMUM_RUN_CELLS {
            return Err(VmError::invalid_argument(format!(
                "pool of {len} cells is below the minimum of {MINIMUM_RUN_CELLS} cells"
            )));
        }
        if len > i32::MAX as usize {
            return Err(VmError::invalid_argument("pool exceeds the addressable cell count"));
        }
        let allocator = Self {
            pool,
            first_free: 0,
        };
        allocator.pool.with_cells_mut(|cells| {
            write_run(cells, 0, len - RECORD_CELLS, AllocationKind::Free, INDEX_NOT_FOUND);
        });
        Ok(allocator)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn capacity(&self) -> usize {
        self.pool.len()
    }

    /// Head index of the free list, `-1` when nothing is free.
    pub fn first_free(&self) -> i32 {
        self.first_free
    }

    /// Free runs in list order.
    pub fn free_runs(&self) -> Vec<RunInfo> {
        self.pool.with_cells(|cells| {
            let mut runs = Vec::new();
            let mut index = self.first_free;
            while index != INDEX_NOT_FOUND {
                let run = read_run(cells, index as usize);
                index = run.next_free;
                runs.push(run);
            }
            runs
        })
    }

    /// Cells usable by callers across every free run.
    pub fn free_cells(&self) -> usize {
        self.free_runs().iter().map(|run| run.allocated).sum()
    }

    /// Every run in address order, walking forward through the tail records.
    pub fn runs(&self) -> Vec<RunInfo> {
        self.pool.with_cells(|cells| {
            let mut runs = Vec::new();
            let mut head = 0;
            while head < cells.len() {
                let run = read_run(cells, head);
                head += run.allocated + RECORD_CELLS;
                runs.push(run);
            }
            runs
        })
    }

    /// First free run whose usable size fits `count`, with the head index of
    /// the free run linking to it.
    fn find_first_fit(cells: &[ValueCell], first: i32, count: usize) -> Option<(usize, i32)> {
        let mut previous = INDEX_NOT_FOUND;
        let mut index = first;
        while index != INDEX_NOT_FOUND {
            let run = read_run(cells, index as usize);
            if run.allocated >= count {
                return Some((index as usize, previous));
            }
            previous = index;
            index = run.next_free;
        }
        None
    }

    /// Carves `count` cells out of the free run at `head`. Returns the index
    /// that replaces `head` in the free list.
    fn divide(cells: &mut [ValueCell], head: usize, count: usize, kind: AllocationKind) -> i32 {
        let run = read_run(cells, head);
        // the remainder could not hold a run of its own, or the fit is exact
        if run.allocated - count < MINIMUM_RUN_CELLS || run.allocated == count {
            write_run(cells, head, run.allocated, kind, INDEX_NOT_FOUND);
            return run.next_free;
        }

        write_run(cells, head, count, kind, INDEX_NOT_FOUND);
        let rest = head + RECORD_CELLS + count;
        let rest_count = run.allocated - (RECORD_CELLS + count);
        write_run(cells, rest, rest_count, AllocationKind::Free, run.next_free);
        rest as i32
    }

    /// Head index of the run right before `head`, if any.
    fn previous_run(cells: &[ValueCell], head: usize) -> Option<usize> {
        if head == 0 {
            return None;
        }
        let (total, _) = cells[head - 1].i32_pair();
        head.checked_sub(total as usize)
    }

    fn last_free(cells: &[ValueCell], first: i32) -> Option<usize> {
        if first == INDEX_NOT_FOUND {
            return None;
        }
        let mut index = first as usize;
        loop {
            let next = read_run(cells, index).next_free;
            if next == INDEX_NOT_FOUND {
                return Some(index);
            }
            index = next as usize;
        }
    }
}

impl MemoryAllocator for PoolAllocator {
    fn allocate(&mut self, size: i64, kind: AllocationKind) -> VmResult<MemoryView> {
        let count = validate_request(size, kind)?;
        let first_free = self.first_free;

        let head = self.pool.with_cells_mut(|cells| {
            let (head, previous) = Self::find_first_fit(cells, first_free, count)?;
            let replacement = Self::divide(cells, head, count, kind);
            if previous == INDEX_NOT_FOUND {
                self.first_free = replacement;
            } else {
                let prev = read_run(cells, previous as usize);
                write_run(cells, prev.head, prev.allocated, prev.kind, replacement);
            }
            Some(head)
        });

        match head {
            Some(head) => {
                log::trace!("allocated {count} cells of {kind:?} at {head}");
                MemoryView::new(self.pool.clone(), head + HEAD_RECORD_CELLS, count)
            }
            None => {
                log::debug!("pool allocator could not fit {count} cells of {kind:?}");
                Err(VmError::OutOfMemory { requested: count })
            }
        }
    }

    fn deallocate(&mut self, view: &MemoryView) -> VmResult<()> {
        if !view.pool().ptr_eq(&self.pool) {
            return Err(VmError::invalid_argument("view does not belong to this allocator"));
        }
        if view.offset() < HEAD_RECORD_CELLS {
            return Err(VmError::invalid_argument("view does not start at an allocation"));
        }
        let head = view.offset() - HEAD_RECORD_CELLS;
        let first_free = self.first_free;

        let length = view.len();

        let new_first = self.pool.with_cells_mut(|cells| {
            let (allocated, _) = cells[head].i32_pair();
            let fits = usize::try_from(allocated)
                .is_ok_and(|a| a >= length && head + RECORD_CELLS + a <= cells.len());
            if !fits {
                return Err(VmError::invalid_argument(format!(
                    "no run record at {head} covers a view of {length} cells"
                )));
            }
            let run = read_run(cells, head);
            if run.kind == AllocationKind::Free {
                return Err(VmError::invalid_argument(format!(
                    "run at {head} is already free"
                )));
            }

            if let Some(previous) = Self::previous_run(cells, head) {
                let prev = read_run(cells, previous);
                if prev.kind == AllocationKind::Free {
                    let merged = prev.allocated + run.allocated + RECORD_CELLS;
                    write_run(cells, previous, merged, AllocationKind::Free, prev.next_free);
                    // the stale head now sits inside free space; keep it marked free
                    cells[head].set_i32_pair(run.allocated as i32, AllocationKind::Free as i32);
                    return Ok(first_free);
                }
            }

            write_run(cells, head, run.allocated, AllocationKind::Free, INDEX_NOT_FOUND);
            match Self::last_free(cells, first_free) {
                None => Ok(head as i32),
                Some(last) => {
                    let tail = read_run(cells, last);
                    write_run(cells, last, tail.allocated, AllocationKind::Free, head as i32);
                    Ok(first_free)
                }
            }
        })?;

        self.first_free = new_first;
        Ok(())
    }
}

fn write_run(
    cells: &mut [ValueCell],
    head: usize,
    allocated: usize,
    kind: AllocationKind,
    next_free: i32,
) {
    let tail = head + HEAD_RECORD_CELLS + allocated;
    cells[head].set_i32_pair(allocated as i32, kind as i32);
    cells[tail].set_i32_pair((allocated + RECORD_CELLS) as i32, next_free);
}

fn read_run(cells: &[ValueCell], head: usize) -> RunInfo {
    let (allocated, kind) = cells[head].i32_pair();
    let allocated = allocated as usize;
    let (_, next_free) = cells[head + HEAD_RECORD_CELLS + allocated].i32_pair();
    RunInfo {
        head,
        allocated,
        // records are only ever written by this module
        kind: AllocationKind::from_raw(kind).unwrap_or(AllocationKind::Free),
        next_free,
    }
}

// ── Host allocator ────────────────────────────────────────────────────

/// Gives every request its own pool; deallocation is left to the reference
/// count of the pool.
#[derive(Debug, Default)]
pub struct HostAllocator;

impl HostAllocator {
    pub fn new() -> Self {
        Self
    }
}

impl MemoryAllocator for HostAllocator {
    fn allocate(&mut self, size: i64, kind: AllocationKind) -> VmResult<MemoryView> {
        let count = validate_request(size, kind)?;
        Ok(MemoryView::whole(Pool::new(count)))
    }

    fn deallocate(&mut self, _view: &MemoryView) -> VmResult<()> {
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
