use std::{fmt, sync::Arc};

use parking_lot::RwLock;

use crate::{ValueCell, VmError, VmResult};

/// Backing array of cells shared by every view carved out of it.
///
/// Cloning a pool clones the handle, never the cells. The pool lives as long
/// as its longest holder.
#[derive(Clone)]
pub struct Pool(Arc<RwLock<Box<[ValueCell]>>>);

impl Pool {
    pub fn new(cell_count: usize) -> Self {
        Self::from_cells(vec![ValueCell::zero(); cell_count])
    }

    pub fn from_cells(cells: Vec<ValueCell>) -> Self {
        Self(Arc::new(RwLock::new(cells.into_boxed_slice())))
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ptr_eq(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Runs `f` over the whole pool under the write lock.
    pub fn with_cells_mut<R>(&self, f: impl FnOnce(&mut [ValueCell]) -> R) -> R {
        f(&mut self.0.write())
    }

    /// Runs `f` over the whole pool under the read lock.
    pub fn with_cells<R>(&self, f: impl FnOnce(&[ValueCell]) -> R) -> R {
        f(&self.0.read())
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("cells", &self.len()).finish()
    }
}

/// A bounds checked window `[offset, offset + length)` over a [`Pool`].
///
/// Views never own the pool and never resize. Several views may alias the
/// same cells; writes through one are visible through the others.
#[derive(Debug, Clone)]
pub struct MemoryView {
    pool: Pool,
    offset: usize,
    length: usize,
}

impl MemoryView {
    pub fn new(pool: Pool, start: usize, length: usize) -> VmResult<Self> {
        let pool_len = pool.len();
        match start.checked_add(length) {
            Some(end) if end <= pool_len => Ok(Self {
                pool,
                offset: start,
                length,
            }),
            _ => Err(VmError::InvalidArgument(format!(
                "start({start}) + length({length}) exceeds pool of {pool_len} cells"
            ))),
        }
    }

    /// Construction from untrusted signed inputs, e.g. values read out of
    /// script memory. A missing pool or a negative bound is rejected.
    pub fn try_from_signed(pool: Option<Pool>, start: i64, length: i64) -> VmResult<Self> {
        let pool = pool.ok_or_else(|| VmError::invalid_argument("pool is absent"))?;
        if start < 0 {
            return Err(VmError::invalid_argument(format!("start({start}) is negative")));
        }
        if length < 0 {
            return Err(VmError::invalid_argument(format!("length({length}) is negative")));
        }
        Self::new(pool, start as usize, length as usize)
    }

    /// A view over the entire pool.
    pub fn whole(pool: Pool) -> Self {
        let length = pool.len();
        Self {
            pool,
            offset: 0,
            length,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Whether both views refer to overlapping cells of the same pool.
    pub fn aliases(&self, other: &MemoryView) -> bool {
        self.pool.ptr_eq(&other.pool)
            && self.offset < other.offset + other.length
            && other.offset < self.offset + self.length
    }

    #[inline]
    fn check(&self, index: usize) -> VmResult<usize> {
        if index < self.length {
            Ok(self.offset + index)
        } else {
            Err(VmError::OutOfRange {
                index,
                length: self.length,
            })
        }
    }

    pub fn get(&self, index: usize) -> VmResult<ValueCell> {
        let at = self.check(index)?;
        Ok(self.pool.0.read()[at].clone())
    }

    pub fn set(&self, index: usize, value: impl Into<ValueCell>) -> VmResult<()> {
        let at = self.check(index)?;
        self.pool.0.write()[at] = value.into();
        Ok(())
    }

    /// Mutable access to one cell in place.
    pub fn with_mut<R>(&self, index: usize, f: impl FnOnce(&mut ValueCell) -> R) -> VmResult<R> {
        let at = self.check(index)?;
        Ok(f(&mut self.pool.0.write()[at]))
    }

    /// Runs `f` over the window's cells under the read lock.
    pub fn with_cells<R>(&self, f: impl FnOnce(&[ValueCell]) -> R) -> R {
        let cells = self.pool.0.read();
        f(&cells[self.offset..self.offset + self.length])
    }

    /// Copies `values` into the window starting at `start`.
    pub fn write_slice(&self, start: usize, values: &[ValueCell]) -> VmResult<()> {
        let end = match start.checked_add(values.len()) {
            Some(end) if end <= self.length => end,
            _ => {
                return Err(VmError::OutOfRange {
                    index: start,
                    length: self.length,
                });
            }
        };
        let mut cells = self.pool.0.write();
        cells[self.offset + start..self.offset + end].clone_from_slice(values);
        Ok(())
    }

    /// Resets every cell of the window to zero bits and no object.
    pub fn clear(&self) {
        let mut cells = self.pool.0.write();
        cells[self.offset..self.offset + self.length].fill(ValueCell::zero());
    }
}
