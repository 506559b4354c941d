use crate::driver::VmmDriver;
use crate::driver::host::HostDriver;
use crate::error::VmmResult;
use crate::vmm::config::AllocatorConfig;
use crate::vmm::memory::MultiDeviceAllocator;
use log::{debug, warn};
use std::sync::{Arc, Mutex, PoisonError};

/// The allocator type held by the process-wide context.
pub type SharedAllocator = Arc<MultiDeviceAllocator<Box<dyn VmmDriver>>>;

// Capacity of the single device `acquire` falls back to.
const DEFAULT_HOST_CAPACITY: usize = 1 << 30;

// ===============================================================================================
// Global Singleton Management
// ===============================================================================================

// Empty at startup. Should be empty again at process exit.
static GLOBAL_ALLOCATOR: Mutex<Option<SharedAllocator>> = Mutex::new(None);

/// Installs an allocator over `driver` as the process-wide allocator, unless one exists.
///
/// If the context was already initialised, the existing allocator is returned and `driver` is
/// dropped.
pub fn acquire_with<D: VmmDriver + 'static>(driver: D, config: AllocatorConfig) -> SharedAllocator {
    let mut guard = GLOBAL_ALLOCATOR
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    if let Some(existing) = guard.as_ref() {
        debug!("context: already initialised, ignoring new driver");
        return Arc::clone(existing);
    }

    let driver: Box<dyn VmmDriver> = Box::new(driver);
    let allocator = Arc::new(MultiDeviceAllocator::with_config(driver, config));
    *guard = Some(Arc::clone(&allocator));
    allocator
}

/// Returns the process-wide allocator, creating it on first use.
///
/// The default is a single host device, configured from the environment (see
/// [`AllocatorConfig::from_env`]).
///
/// # Errors
/// Returns an error if the default host driver cannot reserve its aperture.
pub fn acquire() -> VmmResult<SharedAllocator> {
    if let Some(existing) = current() {
        return Ok(existing);
    }
    let driver = HostDriver::uniform(1, DEFAULT_HOST_CAPACITY)?;
    Ok(acquire_with(driver, AllocatorConfig::from_env()))
}

/// The process-wide allocator, if initialised.
pub fn current() -> Option<SharedAllocator> {
    GLOBAL_ALLOCATOR
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Drops the process-wide allocator.
///
/// Returns the number of allocations that were still live. They are torn down when the last
/// clone of the allocator goes away.
pub fn release() -> usize {
    let Some(allocator) = GLOBAL_ALLOCATOR
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
    else {
        return 0;
    };

    let live = allocator.live_allocations();
    if live > 0 {
        warn!("context: released with {live} live allocation(s)");
    }
    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DeviceId;

    // The context is process-wide, so everything touching it lives in this one test.
    #[test]
    fn acquire_release_lifecycle() {
        release();
        assert!(current().is_none());

        let drv = HostDriver::uniform(2, 64 << 20).unwrap();
        let a = acquire_with(drv, AllocatorConfig::new());
        let b = acquire().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.driver().device_count(), 2);

        let dev = [DeviceId(0)];
        let (ptr, size) = a.allocate(4096, &dev, &dev).unwrap();
        assert_eq!(release(), 1);
        assert!(current().is_none());

        a.free(ptr, size).unwrap();
        assert_eq!(a.live_allocations(), 0);
        drop((a, b));

        let c = acquire().unwrap();
        assert_eq!(c.driver().device_count(), 1);
        assert_eq!(release(), 0);
    }
}
