pub mod allocator;
pub mod chunks;
pub mod mapping;
pub mod registry;
pub mod reserve;
pub mod rollback;
pub mod split;

use crate::driver::{DeviceId, DevicePtr, PhysicalHandle};

/// Chunks stay `Allocated` while registered. Teardown marks each one whose handle was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Allocated,
    Released,
}

/// One physical memory handle backing part of a [`VirtualRange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalChunk {
    pub device: DeviceId,
    pub handle: PhysicalHandle,
    /// Size in bytes, a multiple of the device granularity.
    pub size: usize,
    /// Offset of the chunk inside its range.
    pub offset: usize,
    pub state: ChunkState,
}

/// A reserved, contiguous interval of device address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualRange {
    pub base: DevicePtr,
    pub size: usize,
    pub alignment: usize,
}

impl VirtualRange {
    #[must_use]
    pub const fn end(&self) -> DevicePtr {
        self.base + self.size as u64
    }

    /// Address of byte `offset` inside the range.
    #[must_use]
    pub const fn at(&self, offset: usize) -> DevicePtr {
        self.base + offset as u64
    }
}

/// A live multi-device allocation, as handed out by
/// [`MultiDeviceAllocator::allocate`](allocator::MultiDeviceAllocator::allocate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub range: VirtualRange,
    /// Chunks in backing-set order, mapped at ascending contiguous offsets.
    pub chunks: Vec<PhysicalChunk>,
    /// Devices granted read/write access to the whole range.
    pub mapping_set: Vec<DeviceId>,
    /// Size the caller asked for, before rounding.
    pub requested: usize,
}

impl Allocation {
    #[must_use]
    pub const fn ptr(&self) -> DevicePtr {
        self.range.base
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.range.size
    }

    /// The range base as a typed host pointer.
    ///
    /// Only meaningful for drivers whose device addresses are host addresses, such as
    /// [`HostDriver`](crate::driver::host::HostDriver).
    #[must_use]
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.range.base as *mut T
    }
}

pub use allocator::MultiDeviceAllocator;
