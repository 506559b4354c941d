use crate::driver::{
    AccessDesc, AccessFlags, DeviceId, DevicePtr, GranularityKind, PhysicalHandle, VmmDriver,
};
use crate::error::{DriverError, DriverResult};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Driver primitives that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    CreatePhysical,
    ReleasePhysical,
    ReserveAddress,
    FreeAddress,
    Map,
    Unmap,
    SetAccess,
}

#[derive(Debug, Default)]
struct FaultState {
    calls: HashMap<Op, usize>,
    // Op -> 1-based call numbers that must fail
    armed: HashMap<Op, Vec<usize>>,
}

/// Wraps a driver and fails chosen calls of chosen primitives.
///
/// Queries (topology, granularity, free memory) are never failed.
#[derive(Debug)]
pub struct FaultyDriver<D> {
    inner: D,
    state: Mutex<FaultState>,
}

impl<D: VmmDriver> FaultyDriver<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            state: Mutex::new(FaultState::default()),
        }
    }

    pub const fn inner(&self) -> &D {
        &self.inner
    }

    /// Makes the `n`-th call (1-based, counted from construction) of `op` fail.
    pub fn fail_nth(&self, op: Op, n: usize) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.armed.entry(op).or_default().push(n);
    }

    /// Number of times `op` has been invoked so far.
    pub fn calls(&self, op: Op) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.calls.get(&op).copied().unwrap_or(0)
    }

    fn tick(&self, op: Op) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let count = state.calls.entry(op).or_insert(0);
        *count += 1;
        let n = *count;

        let hit = state.armed.get(&op).is_some_and(|v| v.contains(&n));
        if !hit {
            return Ok(());
        }
        log::debug!("fault injection: failing call {n} of {op:?}");
        Err(match op {
            Op::CreatePhysical => DriverError::OutOfMemory,
            Op::ReserveAddress => DriverError::AddressSpaceExhausted,
            _ => DriverError::InvalidValue("injected fault".into()),
        })
    }
}

impl<D: VmmDriver> VmmDriver for FaultyDriver<D> {
    fn device_count(&self) -> u32 {
        self.inner.device_count()
    }

    fn can_access_peer(&self, from: DeviceId, to: DeviceId) -> DriverResult<bool> {
        self.inner.can_access_peer(from, to)
    }

    fn supports_vmm(&self, device: DeviceId) -> DriverResult<bool> {
        self.inner.supports_vmm(device)
    }

    fn granularity(&self, device: DeviceId, kind: GranularityKind) -> DriverResult<usize> {
        self.inner.granularity(device, kind)
    }

    fn free_memory(&self, device: DeviceId) -> DriverResult<usize> {
        self.inner.free_memory(device)
    }

    fn create_physical(&self, device: DeviceId, size: usize) -> DriverResult<PhysicalHandle> {
        self.tick(Op::CreatePhysical)?;
        self.inner.create_physical(device, size)
    }

    fn release_physical(&self, handle: PhysicalHandle) -> DriverResult<()> {
        self.tick(Op::ReleasePhysical)?;
        self.inner.release_physical(handle)
    }

    fn reserve_address(&self, size: usize, alignment: usize) -> DriverResult<DevicePtr> {
        self.tick(Op::ReserveAddress)?;
        self.inner.reserve_address(size, alignment)
    }

    fn free_address(&self, ptr: DevicePtr, size: usize) -> DriverResult<()> {
        self.tick(Op::FreeAddress)?;
        self.inner.free_address(ptr, size)
    }

    fn map(&self, ptr: DevicePtr, size: usize, handle: PhysicalHandle) -> DriverResult<()> {
        self.tick(Op::Map)?;
        self.inner.map(ptr, size, handle)
    }

    fn unmap(&self, ptr: DevicePtr, size: usize) -> DriverResult<()> {
        self.tick(Op::Unmap)?;
        self.inner.unmap(ptr, size)
    }

    fn set_access(&self, ptr: DevicePtr, size: usize, descs: &[AccessDesc]) -> DriverResult<()> {
        self.tick(Op::SetAccess)?;
        self.inner.set_access(ptr, size, descs)
    }

    fn get_access(&self, device: DeviceId, ptr: DevicePtr) -> DriverResult<AccessFlags> {
        self.inner.get_access(device, ptr)
    }
}
