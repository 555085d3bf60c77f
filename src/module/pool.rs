//! Address bookkeeping for the external memory modules are loaded into.
//!
//! The pool hands out address ranges inside `[base, base + capacity)`; the
//! backing bytes are owned by the module instance itself. First-fit with
//! coalescing on release.

use log::{debug, warn};

use crate::error::{Error, Result};

const ALIGN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    start: u32,
    len: usize,
}

#[derive(Debug)]
pub struct ExternalMemory {
    base: u32,
    capacity: usize,
    free: Vec<Block>,
}

impl ExternalMemory {
    pub const DEFAULT_BASE: u32 = 0x3F80_0000;
    pub const DEFAULT_CAPACITY: usize = 0x40_0000; // 4MB

    pub fn new(base: u32, capacity: usize) -> Self {
        Self {
            base,
            capacity,
            free: vec![Block {
                start: base,
                len: capacity,
            }],
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total free bytes (may be fragmented).
    pub fn available(&self) -> usize {
        self.free.iter().map(|b| b.len).sum()
    }

    fn rounded(size: usize) -> usize {
        size.max(1).div_ceil(ALIGN) * ALIGN
    }

    /// Reserve `size` bytes and return the start address. Fails fast.
    pub fn allocate(&mut self, size: usize) -> Result<u32> {
        let size = Self::rounded(size);
        let idx = self
            .free
            .iter()
            .position(|b| b.len >= size)
            .ok_or_else(|| {
                Error::out_of_resources(format!(
                    "no {} byte block in external memory ({} bytes free)",
                    size,
                    self.available()
                ))
            })?;
        let block = &mut self.free[idx];
        let start = block.start;
        block.start += size as u32;
        block.len -= size;
        if block.len == 0 {
            self.free.remove(idx);
        }
        debug!("pool: allocated {} bytes at {:#010x}", size, start);
        Ok(start)
    }

    /// Return a block previously handed out by [`Self::allocate`].
    ///
    /// Ranges outside the pool or overlapping free space are ignored.
    pub fn release(&mut self, start: u32, size: usize) {
        let block = Block {
            start,
            len: Self::rounded(size),
        };
        let begin = start as usize;
        let end = begin + block.len;
        let pool_start = self.base as usize;
        if begin < pool_start || end > pool_start + self.capacity {
            warn!("pool: {:#010x}+{} is not pool memory", start, block.len);
            return;
        }
        let idx = self.free.partition_point(|b| b.start < start);
        let overlaps_prev = idx > 0 && {
            let prev = self.free[idx - 1];
            prev.start as usize + prev.len > begin
        };
        let overlaps_next = self
            .free
            .get(idx)
            .is_some_and(|next| (next.start as usize) < end);
        if overlaps_prev || overlaps_next {
            warn!("pool: {:#010x}+{} is already free", start, block.len);
            return;
        }
        self.free.insert(idx, block);

        // merge with neighbours
        if idx + 1 < self.free.len() {
            let next = self.free[idx + 1];
            if block.start as usize + block.len == next.start as usize {
                self.free[idx].len += next.len;
                self.free.remove(idx + 1);
            }
        }
        if idx > 0 {
            let prev = self.free[idx - 1];
            if prev.start as usize + prev.len == self.free[idx].start as usize {
                self.free[idx - 1].len += self.free[idx].len;
                self.free.remove(idx);
            }
        }
        debug!("pool: released {} bytes at {:#010x}", block.len, start);
    }
}

impl Default for ExternalMemory {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_sequential() {
        let mut pool = ExternalMemory::new(0x1000, 0x100);
        assert_eq!(pool.allocate(10).unwrap(), 0x1000);
        assert_eq!(pool.allocate(16).unwrap(), 0x1010);
        assert_eq!(pool.available(), 0x100 - 32);
    }

    #[test]
    fn exhausted_pool_fails_fast() {
        let mut pool = ExternalMemory::new(0, 64);
        pool.allocate(64).unwrap();
        assert!(matches!(pool.allocate(1), Err(Error::OutOfResources(_))));
    }

    #[test]
    fn release_coalesces_neighbours() {
        let mut pool = ExternalMemory::new(0, 96);
        let a = pool.allocate(32).unwrap();
        let b = pool.allocate(32).unwrap();
        let c = pool.allocate(32).unwrap();
        pool.release(a, 32);
        pool.release(c, 32);
        pool.release(b, 32);
        assert_eq!(pool.available(), 96);
        // one contiguous block again
        assert_eq!(pool.allocate(96).unwrap(), 0);
    }

    #[test]
    fn double_and_foreign_releases_are_ignored() {
        let mut pool = ExternalMemory::new(0x1000, 0x100);
        let a = pool.allocate(32).unwrap();
        pool.allocate(32).unwrap();
        pool.release(a, 32);
        pool.release(a, 32);
        assert_eq!(pool.available(), 0x100 - 32);

        // outside the pool, straddling its end, overlapping the free tail
        pool.release(0x10, 32);
        pool.release(0x10F0, 32);
        pool.release(0x1050, 16);
        assert_eq!(pool.available(), 0x100 - 32);
        assert!(pool.available() <= pool.capacity());
    }
}
