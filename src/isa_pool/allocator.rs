//! Pool allocator for kernel instruction code
//!
//! Small kernels are packed into page-sized pool allocations so a module
//! with many kernels costs one residency entry instead of one per kernel.
//! A kernel's code is never split across pages: a batch that does not fit
//! one page falls back to dedicated allocations.

use std::sync::{Arc, Mutex};

use super::allocation::{IsaAllocation, SharedIsaRange};
use crate::config::RuntimeConfig;
use crate::device::{AllocationRequest, DeviceAllocator, GpuAllocation, MemoryClass};
use crate::error::ForgeResult;

/// One page of shared instruction memory
#[derive(Debug)]
struct IsaPool {
    allocation: GpuAllocation,
    page_size: usize,
    used_bytes: usize,
    /// Padding held back after the last range when that range was carved
    /// without its own; counted in `used_bytes`, reclaimed by the next range
    tail_reserve: usize,
    ref_count: usize,
}

impl IsaPool {
    fn free_bytes(&self) -> usize {
        self.page_size - self.used_bytes
    }

    /// Bytes a new reservation may use, including a reclaimable tail
    fn reusable_bytes(&self) -> usize {
        self.free_bytes() + self.tail_reserve
    }
}

/// Allocation counters, for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsaPoolStats {
    pub pools_opened: usize,
    pub pools_released: usize,
    pub live_pools: usize,
    pub shared_requests: usize,
    pub dedicated_requests: usize,
    /// Bytes handed out from live pools
    pub pooled_bytes_in_use: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    pools: Vec<IsaPool>,
    stats: IsaPoolStats,
}

/// Hands out instruction memory for kernels
///
/// # Thread Safety
///
/// All pool bookkeeping sits behind one `Mutex`; the allocator is shared via
/// `Arc` between a device and every kernel that sub-allocates from it.
#[derive(Debug)]
pub struct IsaPoolAllocator {
    allocator: Arc<dyn DeviceAllocator>,
    page_size: usize,
    padding: usize,
    start_alignment: usize,
    debugger_attached: bool,
    uncached: bool,
    state: Mutex<PoolState>,
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

impl IsaPoolAllocator {
    pub fn new(allocator: Arc<dyn DeviceAllocator>, config: &RuntimeConfig) -> Self {
        IsaPoolAllocator {
            allocator,
            page_size: config.isa_page_size(),
            padding: config.isa_padding,
            start_alignment: config.isa_start_alignment.max(1),
            debugger_attached: config.debugger_attached,
            uncached: config.force_uncached_isa,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Size of one pool page; also the largest sharable request
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes reserved for `size` bytes of code
    pub fn compute_aligned_size(&self, size: usize, add_padding: bool) -> usize {
        let padding = if add_padding { self.padding } else { 0 };
        align_up(size + padding, self.start_alignment)
    }

    /// Whether a kernel of `size` bytes may live in a shared page
    pub fn is_sharable(&self, size: usize) -> bool {
        !self.debugger_attached && self.compute_aligned_size(size, true) <= self.page_size
    }

    /// Allocate instruction memory for a single kernel.
    ///
    /// A shared request that is not last in its batch carries no padding of
    /// its own, but the page keeps room for it in case nothing follows.
    pub fn request_allocation(
        &self,
        size: usize,
        is_last_in_batch: bool,
        memory_class: MemoryClass,
    ) -> ForgeResult<IsaAllocation> {
        if !self.is_sharable(size) {
            return self.allocate_dedicated(size, memory_class);
        }

        let aligned = self.compute_aligned_size(size, is_last_in_batch);
        let tail = self.compute_aligned_size(size, true) - aligned;
        let mut ranges = self.reserve_shared(&[aligned], tail, memory_class)?;
        ranges
            .pop()
            .ok_or_else(|| crate::internal_error!("empty shared reservation"))
    }

    /// Allocate instruction memory for every kernel of one module.
    ///
    /// Either all kernels share one contiguous range of a single page, or all
    /// get dedicated allocations. On failure nothing from the batch survives.
    /// Debuggable modules go through [`Self::allocate_dedicated_batch`]
    /// instead; an attached debugger alone does not split a batch.
    pub fn allocate_batch(
        &self,
        sizes: &[usize],
        memory_class: MemoryClass,
    ) -> ForgeResult<Vec<IsaAllocation>> {
        if sizes.is_empty() {
            return Ok(Vec::new());
        }

        let last = sizes.len() - 1;
        let aligned: Vec<usize> = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| self.compute_aligned_size(size, i == last))
            .collect();
        let total: usize = aligned.iter().sum();

        if total > self.page_size {
            tracing::debug!(
                "IsaPoolAllocator: batch of {} kernels ({} bytes) exceeds one page",
                sizes.len(),
                total
            );
            return self.allocate_dedicated_batch(sizes, memory_class);
        }

        self.reserve_shared(&aligned, 0, memory_class)
    }

    /// One dedicated allocation per kernel, as debugging requires.
    pub fn allocate_dedicated_batch(
        &self,
        sizes: &[usize],
        memory_class: MemoryClass,
    ) -> ForgeResult<Vec<IsaAllocation>> {
        // Dropping the partial vector releases whatever was allocated.
        sizes
            .iter()
            .map(|&size| self.allocate_dedicated(size, memory_class))
            .collect()
    }

    /// Release one sub-allocation; the page is freed with its last range.
    pub fn free_shared_allocation(&self, range: &SharedIsaRange) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("IsaPoolAllocator: cannot release range: {}", e);
                return;
            }
        };

        let Some(index) = state
            .pools
            .iter()
            .position(|p| p.allocation.id() == range.parent_id())
        else {
            tracing::warn!(
                "IsaPoolAllocator: release of range in unknown page #{}",
                range.parent_id()
            );
            return;
        };

        state.stats.pooled_bytes_in_use = state
            .stats
            .pooled_bytes_in_use
            .saturating_sub(range.sub_allocation_size);

        let pool = &mut state.pools[index];
        pool.ref_count = pool.ref_count.saturating_sub(1);
        tracing::trace!(
            "IsaPoolAllocator: released {} bytes from page #{} (refs={})",
            range.sub_allocation_size,
            range.parent_id(),
            pool.ref_count
        );

        if pool.ref_count == 0 {
            let pool = state.pools.remove(index);
            state.stats.pools_released += 1;
            state.stats.live_pools = state.pools.len();
            tracing::debug!(
                "IsaPoolAllocator: page #{} at 0x{:x} released",
                pool.allocation.id(),
                pool.allocation.gpu_address()
            );
        }
    }

    pub fn pool_count(&self) -> usize {
        self.state.lock().map(|s| s.pools.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> IsaPoolStats {
        self.state.lock().map(|s| s.stats).unwrap_or_default()
    }

    fn request(&self, size: usize, memory_class: MemoryClass) -> AllocationRequest {
        AllocationRequest::new(size, memory_class)
            .with_alignment(self.start_alignment)
            .with_uncached(self.uncached)
    }

    fn allocate_dedicated(
        &self,
        size: usize,
        memory_class: MemoryClass,
    ) -> ForgeResult<IsaAllocation> {
        let aligned = self.compute_aligned_size(size, true);
        let allocation = GpuAllocation::allocate(&self.allocator, &self.request(aligned, memory_class))?;
        if let Ok(mut state) = self.state.lock() {
            state.stats.dedicated_requests += 1;
        }
        tracing::trace!(
            "IsaPoolAllocator: dedicated {} bytes at 0x{:x}",
            aligned,
            allocation.gpu_address()
        );
        Ok(IsaAllocation::Dedicated(allocation))
    }

    /// Carve consecutive ranges of `aligned_sizes` from one page, keeping
    /// `tail` more bytes free after them.
    fn reserve_shared(
        &self,
        aligned_sizes: &[usize],
        tail: usize,
        memory_class: MemoryClass,
    ) -> ForgeResult<Vec<IsaAllocation>> {
        let total: usize = aligned_sizes.iter().sum();
        let mut state = self.state.lock()?;

        let index = match state.pools.iter().position(|p| {
            p.allocation.memory_class() == memory_class && p.reusable_bytes() >= total + tail
        })
        {
            Some(index) => index,
            None => {
                let allocation = GpuAllocation::allocate(
                    &self.allocator,
                    &self.request(self.page_size, memory_class),
                )?;
                tracing::debug!(
                    "IsaPoolAllocator: opened page #{} ({} bytes at 0x{:x})",
                    allocation.id(),
                    self.page_size,
                    allocation.gpu_address()
                );
                state.pools.push(IsaPool {
                    allocation,
                    page_size: self.page_size,
                    used_bytes: 0,
                    tail_reserve: 0,
                    ref_count: 0,
                });
                state.stats.pools_opened += 1;
                state.stats.live_pools = state.pools.len();
                state.pools.len() - 1
            }
        };

        let pool = &mut state.pools[index];
        let parent = pool.allocation.downgrade();
        let base = pool.allocation.gpu_address();
        let mut ranges = Vec::with_capacity(aligned_sizes.len());
        pool.used_bytes -= pool.tail_reserve;
        for &size in aligned_sizes {
            let offset = pool.used_bytes;
            pool.used_bytes += size;
            pool.ref_count += 1;
            ranges.push(IsaAllocation::Shared(SharedIsaRange {
                parent: parent.clone(),
                offset_in_parent: offset,
                sub_allocation_size: size,
                gpu_address: base + offset as u64,
            }));
        }
        pool.used_bytes += tail;
        pool.tail_reserve = tail;
        tracing::trace!(
            "IsaPoolAllocator: {} ranges ({} bytes) from page #{} (used {}/{})",
            ranges.len(),
            total,
            parent.id(),
            pool.used_bytes,
            pool.page_size
        );

        state.stats.shared_requests += aligned_sizes.len();
        state.stats.pooled_bytes_in_use += total;
        Ok(ranges)
    }
}
