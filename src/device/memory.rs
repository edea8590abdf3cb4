//! Reference-counted device allocation handles

use std::fmt;
use std::sync::{Arc, Weak};

use super::error::DeviceResult;

/// Hint passed to the allocator describing what an allocation holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// Instruction code of user modules
    KernelIsa,
    /// Instruction code of builtin modules
    KernelIsaInternal,
    /// Global variables surface
    GlobalVariables,
    /// Global constants surface
    GlobalConstants,
}

/// Parameters of a single device allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    pub size: usize,
    pub alignment: usize,
    pub memory_class: MemoryClass,
    pub uncached: bool,
}

impl AllocationRequest {
    pub fn new(size: usize, memory_class: MemoryClass) -> Self {
        AllocationRequest {
            size,
            alignment: 1,
            memory_class,
            uncached: false,
        }
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_uncached(mut self, uncached: bool) -> Self {
        self.uncached = uncached;
        self
    }
}

/// Raw record of memory handed out by an allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemory {
    pub id: u64,
    pub gpu_address: u64,
    pub size: usize,
    pub memory_class: MemoryClass,
    pub uncached: bool,
}

/// Low-level device memory allocator
///
/// Implementations must be internally synchronised; handles call `free`
/// from whatever thread drops the last reference.
pub trait DeviceAllocator: Send + Sync + fmt::Debug {
    fn allocate(&self, request: &AllocationRequest) -> DeviceResult<DeviceMemory>;

    fn free(&self, memory: &DeviceMemory);

    /// Copy host bytes into the allocation at `offset`
    fn copy_to(&self, memory: &DeviceMemory, offset: usize, bytes: &[u8]) -> DeviceResult<()>;

    /// Read `len` bytes back from the allocation at `offset`
    fn read(&self, memory: &DeviceMemory, offset: usize, len: usize) -> DeviceResult<Vec<u8>>;
}

/// Shared handle to a device allocation.
///
/// Cloning is cheap; the memory is returned to its allocator when the last
/// clone is dropped.
#[derive(Clone)]
pub struct GpuAllocation {
    inner: Arc<GpuAllocationInner>,
}

struct GpuAllocationInner {
    memory: DeviceMemory,
    allocator: Arc<dyn DeviceAllocator>,
}

impl Drop for GpuAllocationInner {
    fn drop(&mut self) {
        tracing::trace!(
            "GpuAllocation: freeing #{} ({} bytes at 0x{:x})",
            self.memory.id,
            self.memory.size,
            self.memory.gpu_address
        );
        self.allocator.free(&self.memory);
    }
}

impl GpuAllocation {
    pub fn allocate(
        allocator: &Arc<dyn DeviceAllocator>,
        request: &AllocationRequest,
    ) -> DeviceResult<Self> {
        let memory = allocator.allocate(request)?;
        tracing::trace!(
            "GpuAllocation: #{} {:?} {} bytes at 0x{:x}",
            memory.id,
            memory.memory_class,
            memory.size,
            memory.gpu_address
        );
        Ok(GpuAllocation {
            inner: Arc::new(GpuAllocationInner {
                memory,
                allocator: Arc::clone(allocator),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.memory.id
    }

    pub fn gpu_address(&self) -> u64 {
        self.inner.memory.gpu_address
    }

    pub fn size(&self) -> usize {
        self.inner.memory.size
    }

    pub fn memory_class(&self) -> MemoryClass {
        self.inner.memory.memory_class
    }

    pub fn is_uncached(&self) -> bool {
        self.inner.memory.uncached
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> DeviceResult<()> {
        self.inner.allocator.copy_to(&self.inner.memory, offset, bytes)
    }

    pub fn read(&self, offset: usize, len: usize) -> DeviceResult<Vec<u8>> {
        self.inner.allocator.read(&self.inner.memory, offset, len)
    }

    pub fn downgrade(&self) -> WeakGpuAllocation {
        WeakGpuAllocation {
            inner: Arc::downgrade(&self.inner),
            id: self.id(),
        }
    }

    /// Number of live handles, for diagnostics and tests
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl PartialEq for GpuAllocation {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for GpuAllocation {}

impl fmt::Debug for GpuAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuAllocation")
            .field("id", &self.id())
            .field("gpu_address", &format_args!("0x{:x}", self.gpu_address()))
            .field("size", &self.size())
            .field("class", &self.memory_class())
            .finish()
    }
}

/// Non-owning reference to a [`GpuAllocation`]
#[derive(Clone)]
pub struct WeakGpuAllocation {
    inner: Weak<GpuAllocationInner>,
    id: u64,
}

impl WeakGpuAllocation {
    pub fn upgrade(&self) -> Option<GpuAllocation> {
        self.inner.upgrade().map(|inner| GpuAllocation { inner })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for WeakGpuAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakGpuAllocation(#{})", self.id)
    }
}
