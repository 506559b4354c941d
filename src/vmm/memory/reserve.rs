use crate::driver::VmmDriver;
use crate::error::{VmmError, VmmResult};
use crate::vmm::memory::VirtualRange;
use crate::vmm::memory::rollback::Rollback;
use log::debug;

/// Reserves `size` bytes of address space aligned to `alignment`, with no backing.
///
/// # Errors
/// Returns `VmmError::AddressReservationFailed` if the address space cannot hold the range.
pub fn reserve_range<D: VmmDriver + ?Sized>(
    size: usize,
    alignment: usize,
    rollback: &mut Rollback<'_, D>,
) -> VmmResult<VirtualRange> {
    let base = rollback
        .driver()
        .reserve_address(size, alignment)
        .map_err(|source| VmmError::AddressReservationFailed {
            size,
            alignment,
            source,
        })?;
    rollback.free_address_on_failure(base, size);

    debug!("reserved 0x{base:x}..0x{:x}", base + size as u64);
    Ok(VirtualRange {
        base,
        size,
        alignment,
    })
}
