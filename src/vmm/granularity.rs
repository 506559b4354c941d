use crate::driver::{DeviceId, GranularityKind, VmmDriver};
use crate::error::{DriverError, VmmError, VmmResult};
use crate::utils::lcm;
use log::debug;

/// Allocation granularity of `device`.
///
/// With [`GranularityKind::Recommended`] the recommended value is used when the device reports
/// one, otherwise the minimum. The result is always a non-zero power of two.
///
/// # Errors
/// Returns `VmmError::CapabilityUnsupported` if the device does not support virtual memory
/// management or reports an unusable granularity.
pub fn granularity_of<D: VmmDriver + ?Sized>(
    driver: &D,
    device: DeviceId,
    preference: GranularityKind,
) -> VmmResult<usize> {
    let query = |kind| match driver.granularity(device, kind) {
        Ok(g) => Ok(g),
        Err(DriverError::NotSupported(_) | DriverError::InvalidDevice(_)) => {
            Err(VmmError::CapabilityUnsupported(device))
        }
        Err(e) => Err(VmmError::Driver(e)),
    };

    let granularity = match preference {
        GranularityKind::Minimum => query(GranularityKind::Minimum)?,
        GranularityKind::Recommended => match query(GranularityKind::Recommended)? {
            0 => query(GranularityKind::Minimum)?,
            g => g,
        },
    };

    if !granularity.is_power_of_two() {
        debug!("device {device} reported unusable granularity {granularity}");
        return Err(VmmError::CapabilityUnsupported(device));
    }
    Ok(granularity)
}

/// Alignment satisfying every granularity in `grans`.
///
/// This is their least common multiple, which is the maximum for power-of-two granularities.
///
/// # Errors
/// Returns `VmmError::InvalidArgument` when `grans` is empty or the alignment overflows.
pub fn governing_alignment(grans: impl IntoIterator<Item = usize>) -> VmmResult<usize> {
    grans
        .into_iter()
        .try_fold(None, |acc: Option<usize>, g| match acc {
            None => Some(Some(g)),
            Some(a) => lcm(a, g).map(Some),
        })
        .flatten()
        .filter(|&a| a > 0)
        .ok_or_else(|| VmmError::InvalidArgument("no usable granularity".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::host::{HostDeviceSpec, HostDriver};

    const KB: usize = 1024;
    const MB: usize = 1024 * KB;

    fn driver() -> HostDriver {
        HostDriver::builder()
            .device(HostDeviceSpec::new("rec", MB * 64).granularity(64 * KB, 2 * MB))
            .device(HostDeviceSpec::new("no-rec", MB * 64).granularity(64 * KB, 0))
            .device(HostDeviceSpec::new("legacy", MB * 64).without_vmm())
            .aperture_size(16 * MB)
            .build()
            .unwrap()
    }

    #[test]
    fn recommended_preferred_over_minimum() {
        let drv = driver();
        assert_eq!(
            granularity_of(&drv, DeviceId(0), GranularityKind::Recommended).unwrap(),
            2 * MB
        );
        assert_eq!(
            granularity_of(&drv, DeviceId(0), GranularityKind::Minimum).unwrap(),
            64 * KB
        );
    }

    #[test]
    fn falls_back_to_minimum() {
        let drv = driver();
        assert_eq!(
            granularity_of(&drv, DeviceId(1), GranularityKind::Recommended).unwrap(),
            64 * KB
        );
    }

    #[test]
    fn unsupported_devices_are_reported() {
        let drv = driver();
        assert!(matches!(
            granularity_of(&drv, DeviceId(2), GranularityKind::Recommended),
            Err(VmmError::CapabilityUnsupported(DeviceId(2)))
        ));
        assert!(matches!(
            granularity_of(&drv, DeviceId(9), GranularityKind::Minimum),
            Err(VmmError::CapabilityUnsupported(DeviceId(9)))
        ));
    }

    #[test]
    fn governing_alignment_is_max_of_powers_of_two() {
        assert_eq!(governing_alignment([64 * KB, 2 * MB, 4 * KB]).unwrap(), 2 * MB);
        assert_eq!(governing_alignment([4 * KB]).unwrap(), 4 * KB);
        assert!(governing_alignment(Vec::<usize>::new()).is_err());
    }
}
