use crate::driver::DevicePtr;
use crate::error::{VmmError, VmmResult};
use crate::vmm::memory::Allocation;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Live allocations keyed by base pointer.
///
/// Every operation takes the lock once, so a lookup and the removal that follows it cannot
/// interleave with another thread's.
#[derive(Debug, Default)]
pub struct AllocationRegistry {
    entries: Mutex<HashMap<DevicePtr, Allocation>>,
}

impl AllocationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DevicePtr, Allocation>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a finished allocation.
    ///
    /// An entry already registered at the same base is never replaced; `allocation` is handed
    /// back instead.
    pub fn try_insert(&self, allocation: Allocation) -> Result<(), Allocation> {
        match self.lock().entry(allocation.ptr()) {
            Entry::Occupied(_) => Err(allocation),
            Entry::Vacant(slot) => {
                slot.insert(allocation);
                Ok(())
            }
        }
    }

    /// Removes the entry for `ptr` once `check` accepts it.
    ///
    /// # Errors
    /// Returns `VmmError::UnknownAllocation` if `ptr` is not registered, or whatever `check`
    /// returns. The registry is left untouched in both cases.
    pub fn remove_with<F>(&self, ptr: DevicePtr, check: F) -> VmmResult<Allocation>
    where
        F: FnOnce(&Allocation) -> VmmResult<()>,
    {
        let mut entries = self.lock();
        let entry = entries
            .get(&ptr)
            .ok_or(VmmError::UnknownAllocation(ptr))?;
        check(entry)?;
        entries
            .remove(&ptr)
            .ok_or(VmmError::UnknownAllocation(ptr))
    }

    #[must_use]
    pub fn get(&self, ptr: DevicePtr) -> Option<Allocation> {
        self.lock().get(&ptr).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<Allocation> {
        self.lock().drain().map(|(_, a)| a).collect()
    }
}
