use crate::driver::{DeviceId, DevicePtr, VmmDriver};
use crate::error::{DriverError, VmmError, VmmResult};
use crate::vmm::config::AllocatorConfig;
use crate::vmm::granularity::{governing_alignment, granularity_of};
use crate::vmm::memory::chunks::allocate_chunks;
use crate::vmm::memory::mapping::map_and_grant;
use crate::vmm::memory::registry::AllocationRegistry;
use crate::vmm::memory::reserve::reserve_range;
use crate::vmm::memory::rollback::Rollback;
use crate::vmm::memory::split::{BackingSlot, SplitPolicy, validate_plan};
use crate::vmm::memory::{Allocation, ChunkState};
use crate::vmm::topology::DeviceTable;
use log::{debug, error, info, warn};
use std::sync::Arc;

/// Contiguous allocations backed by physical memory spread over several devices.
///
/// A call to [`allocate`](Self::allocate) creates one physical chunk per backing device,
/// reserves a single address range for all of them, maps the chunks back to back and grants
/// access to the mapping devices. The caller sees one pointer, usable like any single-device
/// allocation. [`free`](Self::free) undoes the whole thing.
///
/// The allocator is `Sync`: the registry is behind its own lock, and the driver calls happen
/// outside of it.
pub struct MultiDeviceAllocator<D: VmmDriver> {
    driver: D,
    config: AllocatorConfig,
    policy: Arc<dyn SplitPolicy>,
    registry: AllocationRegistry,
}

impl<D: VmmDriver> MultiDeviceAllocator<D> {
    pub fn new(driver: D) -> Self {
        Self::with_config(driver, AllocatorConfig::default())
    }

    pub fn with_config(driver: D, config: AllocatorConfig) -> Self {
        let policy = config.policy();
        debug!("allocator: {config:?}");
        Self {
            driver,
            config,
            policy,
            registry: AllocationRegistry::new(),
        }
    }

    pub const fn driver(&self) -> &D {
        &self.driver
    }

    pub const fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Devices that can back an allocation mapped on `device`, `device` first.
    ///
    /// # Errors
    /// Propagates topology query failures from the driver.
    pub fn backing_devices_for(&self, device: DeviceId) -> VmmResult<Vec<DeviceId>> {
        Ok(DeviceTable::probe(&self.driver)?.backing_devices_for(device))
    }

    /// Metadata of the live allocation starting at `ptr`.
    pub fn allocation(&self, ptr: DevicePtr) -> Option<Allocation> {
        self.registry.get(ptr)
    }

    pub fn live_allocations(&self) -> usize {
        self.registry.len()
    }

    fn check_capability(&self, device: DeviceId) -> VmmResult<()> {
        match self.driver.supports_vmm(device) {
            Ok(true) => Ok(()),
            Ok(false) | Err(DriverError::InvalidDevice(_)) => {
                Err(VmmError::CapabilityUnsupported(device))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Allocates at least `size` bytes backed by `backing` and accessible from `mapping`.
    ///
    /// Returns the base pointer and the actual size, which is `size` rounded up so that every
    /// chunk is a multiple of the governing alignment.
    ///
    /// # Errors
    /// - `InvalidArgument` for a zero size, an empty or repeated device set, or an invalid split
    ///   plan.
    /// - `CapabilityUnsupported` if a backing or mapping device lacks virtual memory support.
    /// - `PhysicalAllocationFailed`, `AddressReservationFailed` or `MappingFailed` when the
    ///   corresponding step fails. Everything acquired before the failure is released first.
    ///   A reservation at an address that is already live counts as a failed reservation.
    pub fn allocate(
        &self,
        size: usize,
        backing: &[DeviceId],
        mapping: &[DeviceId],
    ) -> VmmResult<(DevicePtr, usize)> {
        if size == 0 {
            return Err(VmmError::InvalidArgument("zero-sized allocation".into()));
        }
        if backing.is_empty() || mapping.is_empty() {
            return Err(VmmError::InvalidArgument(
                "backing and mapping sets must not be empty".into(),
            ));
        }
        if has_duplicates(backing) || has_duplicates(mapping) {
            return Err(VmmError::InvalidArgument(
                "device listed twice in one set".into(),
            ));
        }
        for &device in backing.iter().chain(mapping) {
            self.check_capability(device)?;
        }

        // 1. Granularity and alignment
        let preference = self.config.granularity;
        let mut slots = Vec::with_capacity(backing.len());
        for &device in backing {
            slots.push(BackingSlot {
                device,
                granularity: granularity_of(&self.driver, device, preference)?,
                free_bytes: 0,
            });
        }
        let mut grans: Vec<usize> = slots.iter().map(|s| s.granularity).collect();
        for &device in mapping {
            grans.push(granularity_of(&self.driver, device, preference)?);
        }
        let alignment = governing_alignment(grans)?;

        // 2. Split plan
        if self.policy.needs_free_memory() {
            for slot in &mut slots {
                slot.free_bytes = self.driver.free_memory(slot.device)?;
            }
        }
        let sizes = self
            .policy
            .split(size, alignment, &slots)
            .ok_or_else(|| VmmError::InvalidArgument(format!("size {size} overflows")))?;
        validate_plan(size, alignment, &slots, &sizes)?;
        let plan: Vec<(DeviceId, usize)> = slots.iter().map(|s| s.device).zip(sizes).collect();

        // 3. Physical chunks, reservation, mapping. Any failure unwinds `rollback`.
        let mut rollback = Rollback::new(&self.driver);
        let chunks = allocate_chunks(&plan, &mut rollback)?;
        let total = chunks.iter().map(|c| c.size).sum();
        let range = reserve_range(total, alignment, &mut rollback)?;
        map_and_grant(&range, &chunks, mapping, &mut rollback)?;

        // 4. Publish. A base that is already live means the driver handed out an address
        // twice; the new allocation unwinds and the registered one is left alone.
        let device_count = chunks.len();
        let allocation = Allocation {
            range,
            chunks,
            mapping_set: mapping.to_vec(),
            requested: size,
        };
        if let Err(rejected) = self.registry.try_insert(allocation) {
            error!("driver reused live address 0x{:x}", rejected.ptr());
            return Err(VmmError::AddressReservationFailed {
                size: range.size,
                alignment,
                source: DriverError::InvalidValue(format!(
                    "address 0x{:x} is already allocated",
                    rejected.ptr()
                )),
            });
        }
        rollback.commit();

        info!(
            "allocated 0x{:x} ({} bytes, {size} requested) over {device_count} device(s)",
            range.base, range.size
        );
        Ok((range.base, range.size))
    }

    /// Releases the allocation starting at `ptr`.
    ///
    /// `size` may be either the size originally requested or the actual size returned by
    /// [`allocate`](Self::allocate); the recorded size is always what gets torn down.
    ///
    /// # Errors
    /// - `UnknownAllocation` if `ptr` is not live. Nothing is changed.
    /// - `SizeMismatch` for an unexpected `size` with `strict_free_size` set. Nothing is changed.
    /// - `TeardownFailed` if a driver call failed. Every remaining step is still attempted, the
    ///   allocation is forgotten and its chunks come back in the error with their final state.
    pub fn free(&self, ptr: DevicePtr, size: usize) -> VmmResult<()> {
        let strict = self.config.strict_free_size;
        let mut allocation = self.registry.remove_with(ptr, |a| {
            if size == a.size() || size == a.requested {
                return Ok(());
            }
            if strict {
                return Err(VmmError::SizeMismatch {
                    ptr,
                    expected: a.size(),
                    got: size,
                });
            }
            warn!(
                "free(0x{ptr:x}, {size}): allocation is {} bytes, using recorded size",
                a.size()
            );
            Ok(())
        })?;

        let result = self.teardown(&mut allocation);
        match &result {
            Ok(()) => info!("freed 0x{ptr:x} ({} bytes)", allocation.size()),
            Err(e) => error!("teardown of 0x{ptr:x} incomplete: {e}"),
        }
        result.map_err(|source| VmmError::TeardownFailed {
            ptr,
            source,
            chunks: allocation.chunks,
        })
    }

    /// Unmaps, releases and frees, in that order. Keeps going after a failure and reports the
    /// first one.
    fn teardown(&self, allocation: &mut Allocation) -> Result<(), DriverError> {
        let mut first_err = None;
        let range = allocation.range;

        for chunk in allocation.chunks.iter().rev() {
            if let Err(e) = self.driver.unmap(range.at(chunk.offset), chunk.size) {
                first_err.get_or_insert(e);
            }
        }
        for chunk in &mut allocation.chunks {
            match self.driver.release_physical(chunk.handle) {
                Ok(()) => chunk.state = ChunkState::Released,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Err(e) = self.driver.free_address(range.base, range.size) {
            first_err.get_or_insert(e);
        }

        first_err.map_or(Ok(()), Err)
    }
}

fn has_duplicates(devices: &[DeviceId]) -> bool {
    devices
        .iter()
        .enumerate()
        .any(|(i, d)| devices[..i].contains(d))
}

impl<D: VmmDriver> Drop for MultiDeviceAllocator<D> {
    fn drop(&mut self) {
        let leftovers = self.registry.drain();
        if leftovers.is_empty() {
            return;
        }
        warn!(
            "allocator dropped with {} live allocation(s), releasing them",
            leftovers.len()
        );
        for mut allocation in leftovers {
            if let Err(e) = self.teardown(&mut allocation) {
                error!("teardown of 0x{:x} failed: {e}", allocation.ptr());
            }
        }
    }
}
