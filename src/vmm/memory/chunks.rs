use crate::driver::{DeviceId, VmmDriver};
use crate::error::{VmmError, VmmResult};
use crate::vmm::memory::rollback::Rollback;
use crate::vmm::memory::{ChunkState, PhysicalChunk};
use log::debug;

/// Creates one physical handle per `(device, size)` entry of `plan`, in order.
///
/// Offsets are assigned as the running sum of the previous sizes. Every handle is registered
/// with `rollback`, so a failure here (or later) releases all of them.
///
/// # Errors
/// Returns `VmmError::PhysicalAllocationFailed` naming the device that could not provide its
/// chunk.
pub fn allocate_chunks<D: VmmDriver + ?Sized>(
    plan: &[(DeviceId, usize)],
    rollback: &mut Rollback<'_, D>,
) -> VmmResult<Vec<PhysicalChunk>> {
    let driver = rollback.driver();
    let mut chunks = Vec::with_capacity(plan.len());
    let mut offset = 0usize;

    for (idx, &(device, size)) in plan.iter().enumerate() {
        let handle = driver
            .create_physical(device, size)
            .map_err(|source| VmmError::PhysicalAllocationFailed {
                device,
                size,
                source,
            })?;
        rollback.release_on_failure(handle);

        debug!(
            "chunk {}/{}: {size} bytes on device {device} at offset 0x{offset:x}",
            idx + 1,
            plan.len()
        );
        chunks.push(PhysicalChunk {
            device,
            handle,
            size,
            offset,
            state: ChunkState::Allocated,
        });
        offset += size;
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::host::{HostDeviceSpec, HostDriver};

    const MB: usize = 1024 * 1024;

    #[test]
    fn chunks_follow_plan_order() {
        let drv = HostDriver::uniform(3, 16 * MB).unwrap();
        let mut rb = Rollback::new(&drv);
        let plan = [(DeviceId(2), 2 * MB), (DeviceId(0), 4 * MB), (DeviceId(1), 2 * MB)];
        let chunks = allocate_chunks(&plan, &mut rb).unwrap();
        rb.commit();

        let offsets: Vec<_> = chunks.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 2 * MB, 6 * MB]);
        let devices: Vec<_> = chunks.iter().map(|c| c.device).collect();
        assert_eq!(devices, vec![DeviceId(2), DeviceId(0), DeviceId(1)]);
        assert_eq!(drv.used_memory(DeviceId(0)), 4 * MB);

        for c in chunks {
            drv.release_physical(c.handle).unwrap();
        }
    }

    #[test]
    fn failure_names_device_and_releases_earlier_chunks() {
        let drv = HostDriver::builder()
            .device(HostDeviceSpec::new("big", 16 * MB))
            .device(HostDeviceSpec::new("small", 2 * MB))
            .fully_connected()
            .aperture_size(64 * MB)
            .build()
            .unwrap();
        let result = {
            let mut rb = Rollback::new(&drv);
            allocate_chunks(&[(DeviceId(0), 4 * MB), (DeviceId(1), 4 * MB)], &mut rb)
        };

        match result {
            Err(VmmError::PhysicalAllocationFailed { device, size, .. }) => {
                assert_eq!(device, DeviceId(1));
                assert_eq!(size, 4 * MB);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(drv.live_handles(), 0);
    }
}
