pub mod fault;
pub mod host;

use crate::error::DriverResult;
use std::fmt;

/// Device virtual address handed out to callers.
pub type DevicePtr = u64;

/// Ordinal of a compute device, in enumeration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl DeviceId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to a sized physical memory object owned by one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalHandle(pub u64);

/// Which allocation granularity to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GranularityKind {
    Minimum,
    #[default]
    Recommended,
}

/// Access rights of a device over a mapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessFlags {
    #[default]
    None,
    Read,
    ReadWrite,
}

/// Per-device entry passed to [`VmmDriver::set_access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessDesc {
    pub device: DeviceId,
    pub flags: AccessFlags,
}

impl AccessDesc {
    #[must_use]
    pub const fn read_write(device: DeviceId) -> Self {
        Self {
            device,
            flags: AccessFlags::ReadWrite,
        }
    }
}

/// The device/runtime layer the allocator is built on.
///
/// Mirrors the virtual memory management primitives of accelerator drivers:
/// physical handles are created per device, address ranges are reserved with no
/// backing, handles are mapped into ranges, and access is granted per device.
/// Every call is blocking and implementations must be safe to call from several
/// threads at once.
pub trait VmmDriver: Send + Sync {
    /// Number of enumerable devices. Valid ids are `0..device_count()`.
    fn device_count(&self) -> u32;

    /// Whether `from` can access physical memory owned by `to`.
    fn can_access_peer(&self, from: DeviceId, to: DeviceId) -> DriverResult<bool>;

    /// Whether `device` supports the virtual address management primitives.
    fn supports_vmm(&self, device: DeviceId) -> DriverResult<bool>;

    /// Allocation granularity of `device`, in bytes.
    fn granularity(&self, device: DeviceId, kind: GranularityKind) -> DriverResult<usize>;

    /// Currently unallocated physical memory on `device`, in bytes.
    fn free_memory(&self, device: DeviceId) -> DriverResult<usize>;

    /// Create a physical memory handle of `size` bytes on `device`.
    fn create_physical(&self, device: DeviceId, size: usize) -> DriverResult<PhysicalHandle>;

    /// Release a handle created by `create_physical`.
    fn release_physical(&self, handle: PhysicalHandle) -> DriverResult<()>;

    /// Reserve `size` bytes of address space aligned to `alignment`.
    fn reserve_address(&self, size: usize, alignment: usize) -> DriverResult<DevicePtr>;

    /// Free a reservation. All mappings inside it must be gone.
    fn free_address(&self, ptr: DevicePtr, size: usize) -> DriverResult<()>;

    /// Map the first `size` bytes of `handle` at `ptr`, inside a reservation.
    fn map(&self, ptr: DevicePtr, size: usize, handle: PhysicalHandle) -> DriverResult<()>;

    /// Unmap a mapping previously created with `map`.
    fn unmap(&self, ptr: DevicePtr, size: usize) -> DriverResult<()>;

    /// Set access for every descriptor over `[ptr, ptr + size)`.
    ///
    /// Either all descriptors are applied or none is.
    fn set_access(&self, ptr: DevicePtr, size: usize, descs: &[AccessDesc]) -> DriverResult<()>;

    /// Access rights of `device` at `ptr`.
    fn get_access(&self, device: DeviceId, ptr: DevicePtr) -> DriverResult<AccessFlags>;
}

macro_rules! forward_vmm_driver {
    ($($ty:ty),*) => {$(
        impl<D: VmmDriver + ?Sized> VmmDriver for $ty {
            fn device_count(&self) -> u32 {
                (**self).device_count()
            }
            fn can_access_peer(&self, from: DeviceId, to: DeviceId) -> DriverResult<bool> {
                (**self).can_access_peer(from, to)
            }
            fn supports_vmm(&self, device: DeviceId) -> DriverResult<bool> {
                (**self).supports_vmm(device)
            }
            fn granularity(&self, device: DeviceId, kind: GranularityKind) -> DriverResult<usize> {
                (**self).granularity(device, kind)
            }
            fn free_memory(&self, device: DeviceId) -> DriverResult<usize> {
                (**self).free_memory(device)
            }
            fn create_physical(&self, device: DeviceId, size: usize) -> DriverResult<PhysicalHandle> {
                (**self).create_physical(device, size)
            }
            fn release_physical(&self, handle: PhysicalHandle) -> DriverResult<()> {
                (**self).release_physical(handle)
            }
            fn reserve_address(&self, size: usize, alignment: usize) -> DriverResult<DevicePtr> {
                (**self).reserve_address(size, alignment)
            }
            fn free_address(&self, ptr: DevicePtr, size: usize) -> DriverResult<()> {
                (**self).free_address(ptr, size)
            }
            fn map(&self, ptr: DevicePtr, size: usize, handle: PhysicalHandle) -> DriverResult<()> {
                (**self).map(ptr, size, handle)
            }
            fn unmap(&self, ptr: DevicePtr, size: usize) -> DriverResult<()> {
                (**self).unmap(ptr, size)
            }
            fn set_access(&self, ptr: DevicePtr, size: usize, descs: &[AccessDesc]) -> DriverResult<()> {
                (**self).set_access(ptr, size, descs)
            }
            fn get_access(&self, device: DeviceId, ptr: DevicePtr) -> DriverResult<AccessFlags> {
                (**self).get_access(device, ptr)
            }
        }
    )*};
}

forward_vmm_driver!(&D, Box<D>, std::sync::Arc<D>);
