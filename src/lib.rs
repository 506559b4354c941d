//! Contiguous virtual memory allocations backed by several devices.
//!
//! [`MultiDeviceAllocator`] reserves one address range, backs it with physical chunks taken
//! from a set of backing devices and grants access to a set of mapping devices. The device
//! layer is abstracted by [`VmmDriver`]; [`HostDriver`] implements it on top of host memory.

pub mod driver;
pub mod error;
pub mod utils;
pub mod vmm;

pub use driver::host::{HostDeviceSpec, HostDriver};
pub use driver::{AccessDesc, AccessFlags, DeviceId, DevicePtr, GranularityKind, VmmDriver};
pub use error::{DriverError, DriverResult, VmmError, VmmResult};
pub use vmm::config::{AllocatorConfig, SplitStrategy};
pub use vmm::memory::{Allocation, ChunkState, MultiDeviceAllocator, PhysicalChunk};
pub use vmm::topology::DeviceTable;
