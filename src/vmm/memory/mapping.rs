use crate::driver::{AccessDesc, DeviceId, VmmDriver};
use crate::error::{VmmError, VmmResult};
use crate::vmm::memory::rollback::Rollback;
use crate::vmm::memory::{PhysicalChunk, VirtualRange};
use log::debug;

/// Maps `chunks` back to back into `range`, then grants read/write on the whole range to every
/// device of `mapping_set` in a single access call.
///
/// Each successful map is registered with `rollback`.
///
/// # Errors
/// Returns `VmmError::MappingFailed` if any map call or the access grant fails.
pub fn map_and_grant<D: VmmDriver + ?Sized>(
    range: &VirtualRange,
    chunks: &[PhysicalChunk],
    mapping_set: &[DeviceId],
    rollback: &mut Rollback<'_, D>,
) -> VmmResult<()> {
    let driver = rollback.driver();
    let mut offset = 0usize;

    for chunk in chunks {
        debug_assert_eq!(chunk.offset, offset);
        let ptr = range.at(offset);
        driver
            .map(ptr, chunk.size, chunk.handle)
            .map_err(|source| VmmError::MappingFailed { source })?;
        rollback.unmap_on_failure(ptr, chunk.size);
        offset += chunk.size;
    }

    if offset != range.size {
        return Err(VmmError::InvalidArgument(format!(
            "chunks cover {offset} bytes of a {} byte range",
            range.size
        )));
    }

    let descs: Vec<AccessDesc> = mapping_set
        .iter()
        .map(|&device| AccessDesc::read_write(device))
        .collect();
    driver
        .set_access(range.base, range.size, &descs)
        .map_err(|source| VmmError::MappingFailed { source })?;

    debug!(
        "mapped {} chunks at 0x{:x}, access granted to {mapping_set:?}",
        chunks.len(),
        range.base
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::AccessFlags;
    use crate::driver::host::{HostDeviceSpec, HostDriver};
    use crate::error::DriverError;
    use crate::vmm::memory::chunks::allocate_chunks;
    use crate::vmm::memory::reserve::reserve_range;

    const MB: usize = 1024 * 1024;

    #[test]
    fn chunks_from_two_devices_form_one_range() {
        let drv = HostDriver::uniform(2, 16 * MB).unwrap();
        let mut rb = Rollback::new(&drv);
        let chunks = allocate_chunks(&[(DeviceId(0), 2 * MB), (DeviceId(1), 2 * MB)], &mut rb)
            .unwrap();
        let range = reserve_range(4 * MB, 2 * MB, &mut rb).unwrap();
        map_and_grant(&range, &chunks, &[DeviceId(0)], &mut rb).unwrap();

        assert_eq!(
            drv.get_access(DeviceId(0), range.base).unwrap(),
            AccessFlags::ReadWrite
        );
        let bytes = range.base as *mut u8;
        unsafe {
            bytes.write(0xAB);
            bytes.add(4 * MB - 1).write(0xCD);
            assert_eq!(bytes.read(), 0xAB);
            assert_eq!(bytes.add(4 * MB - 1).read(), 0xCD);
        }

        drop(rb);
        assert_eq!(drv.live_mappings(), 0);
        assert_eq!(drv.live_handles(), 0);
        assert_eq!(drv.live_reservations(), 0);
    }

    #[test]
    fn grant_to_non_peer_fails() {
        let drv = HostDriver::builder()
            .device(HostDeviceSpec::new("a", 16 * MB))
            .device(HostDeviceSpec::new("b", 16 * MB))
            .aperture_size(64 * MB)
            .build()
            .unwrap();
        let mut rb = Rollback::new(&drv);
        let chunks = allocate_chunks(&[(DeviceId(0), 2 * MB)], &mut rb).unwrap();
        let range = reserve_range(2 * MB, 2 * MB, &mut rb).unwrap();

        let err = map_and_grant(&range, &chunks, &[DeviceId(0), DeviceId(1)], &mut rb).unwrap_err();
        assert!(matches!(
            err,
            VmmError::MappingFailed {
                source: DriverError::PeerAccessDenied { .. }
            }
        ));
        drop(rb);
        assert_eq!(drv.live_mappings(), 0);
    }
}
