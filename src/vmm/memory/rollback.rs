use crate::driver::{DevicePtr, PhysicalHandle, VmmDriver};
use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Undo {
    Release(PhysicalHandle),
    FreeAddress { ptr: DevicePtr, size: usize },
    Unmap { ptr: DevicePtr, size: usize },
}

/// Reverse-order cleanup stack for a partially built allocation.
///
/// Every completed step pushes its inverse. Unless [`commit`](Rollback::commit) is called, the
/// stack unwinds when dropped, so an early `?` return releases everything acquired so far.
pub struct Rollback<'d, D: VmmDriver + ?Sized> {
    driver: &'d D,
    stack: Vec<Undo>,
}

impl<'d, D: VmmDriver + ?Sized> Rollback<'d, D> {
    pub const fn new(driver: &'d D) -> Self {
        Self {
            driver,
            stack: Vec::new(),
        }
    }

    pub const fn driver(&self) -> &'d D {
        self.driver
    }

    pub fn release_on_failure(&mut self, handle: PhysicalHandle) {
        self.stack.push(Undo::Release(handle));
    }

    pub fn free_address_on_failure(&mut self, ptr: DevicePtr, size: usize) {
        self.stack.push(Undo::FreeAddress { ptr, size });
    }

    pub fn unmap_on_failure(&mut self, ptr: DevicePtr, size: usize) {
        self.stack.push(Undo::Unmap { ptr, size });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Keeps everything acquired so far.
    pub fn commit(mut self) {
        self.stack.clear();
    }

    /// Runs every pending inverse, newest first. Returns how many of them failed.
    pub fn unwind(&mut self) -> usize {
        let mut failures = 0;
        while let Some(undo) = self.stack.pop() {
            let result = match undo {
                Undo::Unmap { ptr, size } => self.driver.unmap(ptr, size),
                Undo::FreeAddress { ptr, size } => self.driver.free_address(ptr, size),
                Undo::Release(handle) => self.driver.release_physical(handle),
            };
            match result {
                Ok(()) => debug!("rollback: {undo:?}"),
                Err(e) => {
                    warn!("rollback: {undo:?} failed: {e}");
                    failures += 1;
                }
            }
        }
        failures
    }
}

impl<D: VmmDriver + ?Sized> Drop for Rollback<'_, D> {
    fn drop(&mut self) {
        if !self.stack.is_empty() {
            self.unwind();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DeviceId;
    use crate::driver::host::HostDriver;

    const MB: usize = 1024 * 1024;

    #[test]
    fn dropped_stack_releases_everything() {
        let drv = HostDriver::uniform(1, 16 * MB).unwrap();
        {
            let mut rb = Rollback::new(&drv);
            let h = drv.create_physical(DeviceId(0), 2 * MB).unwrap();
            rb.release_on_failure(h);
            let va = drv.reserve_address(2 * MB, 2 * MB).unwrap();
            rb.free_address_on_failure(va, 2 * MB);
            drv.map(va, 2 * MB, h).unwrap();
            rb.unmap_on_failure(va, 2 * MB);
            assert_eq!(rb.len(), 3);
        }
        assert_eq!(drv.live_handles(), 0);
        assert_eq!(drv.live_reservations(), 0);
        assert_eq!(drv.live_mappings(), 0);
    }

    #[test]
    fn committed_stack_keeps_resources() {
        let drv = HostDriver::uniform(1, 16 * MB).unwrap();
        let mut rb = Rollback::new(&drv);
        let h = drv.create_physical(DeviceId(0), 2 * MB).unwrap();
        rb.release_on_failure(h);
        rb.commit();
        assert_eq!(drv.live_handles(), 1);
        drv.release_physical(h).unwrap();
    }

    #[test]
    fn unwind_counts_failures() {
        let drv = HostDriver::uniform(1, 16 * MB).unwrap();
        let mut rb = Rollback::new(&drv);
        rb.release_on_failure(PhysicalHandle(42));
        assert_eq!(rb.unwind(), 1);
        assert!(rb.is_empty());
    }
}
