//! Host-backed simulated device allocator
//!
//! Hands out addresses from a synthetic GPU virtual address range and keeps
//! the bytes in host memory. Used by the CLI and by tests; supports failure
//! injection and live-allocation accounting.

use std::collections::HashMap;
use std::sync::Mutex;

use super::error::{DeviceError, DeviceResult};
use super::memory::{AllocationRequest, DeviceAllocator, DeviceMemory};

/// First address handed out by the simulated address space
pub const HOST_ALLOCATOR_BASE_ADDRESS: u64 = 0x0000_0001_0000_0000;

#[derive(Debug, Default)]
struct HostState {
    next_address: u64,
    next_id: u64,
    buffers: HashMap<u64, Vec<u8>>,
    live_bytes: usize,
    total_allocations: usize,
    /// Remaining successful allocations before failures start
    fail_after: Option<usize>,
    capacity: Option<usize>,
}

#[derive(Debug)]
pub struct HostMemoryAllocator {
    state: Mutex<HostState>,
}

impl Default for HostMemoryAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMemoryAllocator {
    pub fn new() -> Self {
        HostMemoryAllocator {
            state: Mutex::new(HostState {
                next_address: HOST_ALLOCATOR_BASE_ADDRESS,
                next_id: 1,
                ..HostState::default()
            }),
        }
    }

    /// Limit the number of live bytes; requests beyond fail with OutOfMemory
    pub fn with_capacity(capacity: usize) -> Self {
        let allocator = Self::new();
        if let Ok(mut state) = allocator.state.lock() {
            state.capacity = Some(capacity);
        }
        allocator
    }

    /// Let `successes` more allocations succeed, then fail every request
    pub fn fail_after(&self, successes: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_after = Some(successes);
        }
    }

    pub fn clear_failure_injection(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_after = None;
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().map(|s| s.buffers.len()).unwrap_or(0)
    }

    pub fn live_bytes(&self) -> usize {
        self.state.lock().map(|s| s.live_bytes).unwrap_or(0)
    }

    /// Count of every successful allocation since creation
    pub fn total_allocations(&self) -> usize {
        self.state.lock().map(|s| s.total_allocations).unwrap_or(0)
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn check_bounds(memory: &DeviceMemory, offset: usize, len: usize) -> DeviceResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= memory.size => Ok(()),
        _ => Err(DeviceError::OutOfBounds {
            id: memory.id,
            offset,
            len,
            size: memory.size,
        }),
    }
}

impl DeviceAllocator for HostMemoryAllocator {
    fn allocate(&self, request: &AllocationRequest) -> DeviceResult<DeviceMemory> {
        if request.size == 0 {
            return Err(DeviceError::InvalidRequest("zero-size allocation".to_string()));
        }
        if request.alignment == 0 || !request.alignment.is_power_of_two() {
            return Err(DeviceError::InvalidRequest(format!(
                "alignment {} is not a power of two",
                request.alignment
            )));
        }

        let mut state = self.state.lock()?;

        if let Some(remaining) = state.fail_after.as_mut() {
            if *remaining == 0 {
                tracing::debug!("HostMemoryAllocator: injected failure for {} bytes", request.size);
                return Err(DeviceError::OutOfMemory {
                    requested: request.size,
                });
            }
            *remaining -= 1;
        }
        if let Some(capacity) = state.capacity {
            if state.live_bytes + request.size > capacity {
                return Err(DeviceError::OutOfMemory {
                    requested: request.size,
                });
            }
        }

        // Page-align every allocation so distinct allocations never share a page.
        let alignment = (request.alignment as u64).max(4096);
        let gpu_address = align_up(state.next_address, alignment);
        state.next_address = gpu_address + request.size as u64;

        let id = state.next_id;
        state.next_id += 1;
        state.buffers.insert(id, vec![0u8; request.size]);
        state.live_bytes += request.size;
        state.total_allocations += 1;

        Ok(DeviceMemory {
            id,
            gpu_address,
            size: request.size,
            memory_class: request.memory_class,
            uncached: request.uncached,
        })
    }

    fn free(&self, memory: &DeviceMemory) {
        match self.state.lock() {
            Ok(mut state) => {
                if state.buffers.remove(&memory.id).is_some() {
                    state.live_bytes -= memory.size;
                } else {
                    tracing::warn!("HostMemoryAllocator: double free of #{}", memory.id);
                }
            }
            Err(e) => tracing::error!("HostMemoryAllocator: free of #{} failed: {}", memory.id, e),
        }
    }

    fn copy_to(&self, memory: &DeviceMemory, offset: usize, bytes: &[u8]) -> DeviceResult<()> {
        check_bounds(memory, offset, bytes.len())?;
        let mut state = self.state.lock()?;
        let buffer = state
            .buffers
            .get_mut(&memory.id)
            .ok_or(DeviceError::UnknownAllocation(memory.id))?;
        buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, memory: &DeviceMemory, offset: usize, len: usize) -> DeviceResult<Vec<u8>> {
        check_bounds(memory, offset, len)?;
        let state = self.state.lock()?;
        let buffer = state
            .buffers
            .get(&memory.id)
            .ok_or(DeviceError::UnknownAllocation(memory.id))?;
        Ok(buffer[offset..offset + len].to_vec())
    }
}
