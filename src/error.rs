use crate::driver::{DeviceId, DevicePtr};
use crate::vmm::memory::PhysicalChunk;
use thiserror::Error;

/// Failures reported by a [`VmmDriver`](crate::driver::VmmDriver) primitive.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("I/O Error: {0}")]
    Os(#[from] std::io::Error),

    #[error("Out of device memory")]
    OutOfMemory,

    #[error("Invalid device: {0}")]
    InvalidDevice(DeviceId),

    #[error("Operation not supported by device {0}")]
    NotSupported(DeviceId),

    #[error("Virtual address space exhausted")]
    AddressSpaceExhausted,

    #[error("Device {from} cannot access memory of device {to}")]
    PeerAccessDenied { from: DeviceId, to: DeviceId },

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Failures surfaced by the multi-device allocator.
#[derive(Error, Debug)]
pub enum VmmError {
    #[error("Device {0} does not support virtual address management")]
    CapabilityUnsupported(DeviceId),

    #[error("Physical allocation of {size} bytes failed on device {device}: {source}")]
    PhysicalAllocationFailed {
        device: DeviceId,
        size: usize,
        source: DriverError,
    },

    #[error("Could not reserve {size} bytes of address space (align {alignment}): {source}")]
    AddressReservationFailed {
        size: usize,
        alignment: usize,
        source: DriverError,
    },

    #[error("Mapping failed: {source}")]
    MappingFailed { source: DriverError },

    #[error("Unknown allocation at 0x{0:x}")]
    UnknownAllocation(DevicePtr),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Size mismatch freeing 0x{ptr:x}: allocated {expected} bytes, got {got}")]
    SizeMismatch {
        ptr: DevicePtr,
        expected: usize,
        got: usize,
    },

    /// `chunks` is the allocation's chunks after teardown. The ones still `Allocated` could not
    /// be released.
    #[error("Teardown of 0x{ptr:x} failed: {source}")]
    TeardownFailed {
        ptr: DevicePtr,
        source: DriverError,
        chunks: Vec<PhysicalChunk>,
    },

    #[error("Driver Error: {0}")]
    Driver(#[from] DriverError),
}

// A convenient alias
pub type VmmResult<T> = Result<T, VmmError>;
pub type DriverResult<T> = Result<T, DriverError>;
