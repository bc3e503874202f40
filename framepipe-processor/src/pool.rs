// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reusable data-block pools, keyed by block size. The decoder-facing
//! plugins allocate frame-sized blocks at sustained rates; freeing through
//! the allocator is expensive under contention, so released blocks go back
//! on a per-size free list instead. The registry is a context object owned
//! by the processor controller so tests can create fresh instances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct DataBlock {
    index: usize,
    data: Vec<u8>,
}

impl DataBlock {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

struct PoolInner {
    free_list: Vec<DataBlock>,
    free_blocks: usize,
    used_blocks: usize,
    total_blocks: usize,
    memory_allocated: usize,
}

struct Pool {
    block_size: usize,
    inner: Mutex<PoolInner>,
}

impl Pool {
    fn new(block_size: usize) -> Pool {
        Pool {
            block_size,
            inner: Mutex::new(PoolInner {
                free_list: Vec::new(),
                free_blocks: 0,
                used_blocks: 0,
                total_blocks: 0,
                memory_allocated: 0,
            }),
        }
    }

    fn allocate_locked(inner: &mut PoolInner, block_size: usize, count: usize, ids: &AtomicUsize) {
        debug!("allocating {count} additional data blocks of {block_size} bytes");
        for _ in 0..count {
            inner.free_list.push(DataBlock {
                index: ids.fetch_add(1, Ordering::Relaxed),
                data: vec![0; block_size],
            });
            inner.free_blocks += 1;
            inner.total_blocks += 1;
            inner.memory_allocated += block_size;
        }
    }
}

/// Registry of per-size pools.
#[derive(Clone)]
pub struct DataBlockPools {
    pools: Arc<Mutex<HashMap<usize, Arc<Pool>>>>,
    next_index: Arc<AtomicUsize>,
}

impl Default for DataBlockPools {
    fn default() -> Self {
        DataBlockPools {
            pools: Arc::new(Mutex::new(HashMap::new())),
            next_index: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl DataBlockPools {
    fn pool(&self, block_size: usize) -> Arc<Pool> {
        let mut pools = self.pools.lock().expect("pool registry poisoned");
        pools
            .entry(block_size)
            .or_insert_with(|| Arc::new(Pool::new(block_size)))
            .clone()
    }

    /// Pre-allocate blocks into the pool for the given size.
    pub fn allocate(&self, block_count: usize, block_size: usize) {
        let pool = self.pool(block_size);
        let mut inner = pool.inner.lock().expect("pool poisoned");
        Pool::allocate_locked(&mut inner, block_size, block_count, &self.next_index);
    }

    /// Take a block of at least `block_size` bytes, growing the pool in
    /// doubling batches (minimum 2) when the free list is empty.
    pub fn take(&self, block_size: usize) -> DataBlockHandle {
        let pool = self.pool(block_size);
        let block = {
            let mut inner = pool.inner.lock().expect("pool poisoned");
            if inner.free_blocks == 0 {
                let batch = if inner.total_blocks == 0 {
                    2
                } else {
                    inner.total_blocks
                };
                Pool::allocate_locked(&mut inner, block_size, batch, &self.next_index);
            }
            let block = inner.free_list.pop().expect("free list replenished above");
            inner.free_blocks -= 1;
            inner.used_blocks += 1;
            block
        };
        debug!("providing data block [id={}]", block.index);
        DataBlockHandle {
            block: Some(block),
            pool,
        }
    }

    pub fn free_blocks(&self, block_size: usize) -> usize {
        self.pool(block_size).inner.lock().expect("pool poisoned").free_blocks
    }

    pub fn used_blocks(&self, block_size: usize) -> usize {
        self.pool(block_size).inner.lock().expect("pool poisoned").used_blocks
    }

    pub fn total_blocks(&self, block_size: usize) -> usize {
        self.pool(block_size).inner.lock().expect("pool poisoned").total_blocks
    }

    pub fn memory_allocated(&self, block_size: usize) -> usize {
        self.pool(block_size)
            .inner
            .lock()
            .expect("pool poisoned")
            .memory_allocated
    }
}

/// Scoped handle to a pooled block; returns the block to its pool's free
/// list on drop without freeing the memory.
pub struct DataBlockHandle {
    block: Option<DataBlock>,
    pool: Arc<Pool>,
}

impl DataBlockHandle {
    pub fn index(&self) -> usize {
        self.block.as_ref().expect("block present until drop").index
    }

    pub fn size(&self) -> usize {
        self.pool.block_size
    }

    pub fn data(&self) -> &[u8] {
        &self.block.as_ref().expect("block present until drop").data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.block.as_mut().expect("block present until drop").data
    }

    pub fn copy_from(&mut self, source: &[u8]) {
        let n = source.len().min(self.size());
        self.data_mut()[..n].copy_from_slice(&source[..n]);
    }
}

impl Drop for DataBlockHandle {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            debug!("releasing data block [id={}]", block.index);
            let mut inner = self.pool.inner.lock().expect("pool poisoned");
            inner.free_list.push(block);
            inner.free_blocks += 1;
            inner.used_blocks -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_and_release_counts() {
        let pools = DataBlockPools::default();
        pools.allocate(100, 1024);
        assert_eq!(pools.free_blocks(1024), 100);
        assert_eq!(pools.used_blocks(1024), 0);
        assert_eq!(pools.total_blocks(1024), 100);
        assert_eq!(pools.memory_allocated(1024), 102_400);

        let block1 = pools.take(1024);
        let block2 = pools.take(1024);
        assert_eq!(pools.free_blocks(1024), 98);
        assert_eq!(pools.used_blocks(1024), 2);
        assert_ne!(block1.index(), block2.index());

        drop(block1);
        assert_eq!(pools.free_blocks(1024), 99);
        assert_eq!(pools.used_blocks(1024), 1);
        assert_eq!(pools.total_blocks(1024), 100);

        // A different size creates a separate pool
        let block3 = pools.take(1025);
        assert_eq!(pools.used_blocks(1025), 1);
        assert_eq!(pools.total_blocks(1025), 2);
        assert_eq!(pools.memory_allocated(1025), 2050);
        assert_eq!(pools.total_blocks(1024), 100);
        assert_ne!(block2.index(), block3.index());
    }

    #[test]
    fn empty_pool_doubles() {
        let pools = DataBlockPools::default();
        let a = pools.take(64);
        // First allocation batch is 2
        assert_eq!(pools.total_blocks(64), 2);
        let b = pools.take(64);
        assert_eq!(pools.total_blocks(64), 2);
        // Pool exhausted: doubles the current total
        let c = pools.take(64);
        assert_eq!(pools.total_blocks(64), 4);
        drop((a, b, c));
        assert_eq!(pools.free_blocks(64), 4);
    }

    #[test]
    fn block_data_is_writable() {
        let pools = DataBlockPools::default();
        let mut block = pools.take(16);
        block.copy_from(&[1, 2, 3, 4]);
        assert_eq!(&block.data()[..4], &[1, 2, 3, 4]);
        assert_eq!(block.size(), 16);
    }
}
