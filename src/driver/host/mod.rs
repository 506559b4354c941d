#![allow(clippy::cast_possible_truncation)]

//! A [`VmmDriver`] that simulates a set of devices inside the host process.
//!
//! Physical handles are anonymous `memfd` objects, the address aperture is a
//! `PROT_NONE` reservation, and mapping a handle is an `mmap(MAP_FIXED)` of its
//! file into the aperture. Pointers returned by the allocator are therefore
//! real host addresses and can be read and written directly once access has
//! been granted.

pub mod aperture;

use crate::driver::{
    AccessDesc, AccessFlags, DeviceId, DevicePtr, GranularityKind, PhysicalHandle, VmmDriver,
};
use crate::error::{DriverError, DriverResult};
use crate::utils::page_size;
use aperture::Aperture;
use log::{debug, error};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

const KB: usize = 1024;
const MB: usize = 1024 * KB;
const GB: usize = 1024 * MB;

const DEFAULT_APERTURE_SIZE: usize = GB;
const DEFAULT_MIN_GRANULARITY: usize = 64 * KB;
const DEFAULT_RECOMMENDED_GRANULARITY: usize = 2 * MB;

// ===============================================================================================
// Device description
// ===============================================================================================

/// Static description of one simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDeviceSpec {
    pub name: String,
    /// Physical memory the device can hand out, in bytes.
    pub capacity: usize,
    pub min_granularity: usize,
    /// Zero means the device does not report a recommended granularity.
    pub recommended_granularity: usize,
    pub vmm_supported: bool,
}

impl HostDeviceSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            min_granularity: DEFAULT_MIN_GRANULARITY,
            recommended_granularity: DEFAULT_RECOMMENDED_GRANULARITY,
            vmm_supported: true,
        }
    }

    #[must_use]
    pub const fn granularity(mut self, min: usize, recommended: usize) -> Self {
        self.min_granularity = min;
        self.recommended_granularity = recommended;
        self
    }

    #[must_use]
    pub const fn without_vmm(mut self) -> Self {
        self.vmm_supported = false;
        self
    }
}

// ===============================================================================================
// Builder
// ===============================================================================================

#[derive(Debug, Clone)]
pub struct HostDriverBuilder {
    devices: Vec<HostDeviceSpec>,
    links: Vec<(u32, u32)>,
    fully_connected: bool,
    aperture_size: usize,
}

impl Default for HostDriverBuilder {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            links: Vec::new(),
            fully_connected: false,
            aperture_size: DEFAULT_APERTURE_SIZE,
        }
    }
}

impl HostDriverBuilder {
    #[must_use]
    pub fn device(mut self, spec: HostDeviceSpec) -> Self {
        self.devices.push(spec);
        self
    }

    #[must_use]
    pub fn devices(mut self, specs: impl IntoIterator<Item = HostDeviceSpec>) -> Self {
        self.devices.extend(specs);
        self
    }

    /// Makes `a` and `b` peers of each other.
    #[must_use]
    pub fn peer(mut self, a: u32, b: u32) -> Self {
        self.links.push((a, b));
        self
    }

    /// Makes every pair of distinct devices peers.
    #[must_use]
    pub const fn fully_connected(mut self) -> Self {
        self.fully_connected = true;
        self
    }

    /// Size of the address window reservations are carved from.
    #[must_use]
    pub const fn aperture_size(mut self, bytes: usize) -> Self {
        self.aperture_size = bytes;
        self
    }

    /// Validates the device table and reserves the aperture.
    ///
    /// # Errors
    /// Returns `DriverError::InvalidValue` for an empty device list, a bad granularity or an
    /// unknown peer link, and `DriverError::Os` if the aperture cannot be reserved.
    pub fn build(self) -> DriverResult<HostDriver> {
        if self.devices.is_empty() {
            return Err(DriverError::InvalidValue("no devices configured".into()));
        }

        let page = page_size();
        for spec in &self.devices {
            let min = spec.min_granularity;
            if !min.is_power_of_two() || min < page {
                return Err(DriverError::InvalidValue(format!(
                    "{}: minimum granularity {min} must be a power of two >= {page}",
                    spec.name
                )));
            }
            let rec = spec.recommended_granularity;
            if rec != 0 && (!rec.is_power_of_two() || rec < min) {
                return Err(DriverError::InvalidValue(format!(
                    "{}: recommended granularity {rec} must be a power of two >= {min}",
                    spec.name
                )));
            }
        }

        let n = self.devices.len();
        let mut peers = vec![vec![false; n]; n];
        if self.fully_connected {
            for (a, row) in peers.iter_mut().enumerate() {
                for (b, cell) in row.iter_mut().enumerate() {
                    *cell = a != b;
                }
            }
        }
        for &(a, b) in &self.links {
            let (a, b) = (a as usize, b as usize);
            if a >= n || b >= n {
                return Err(DriverError::InvalidValue(format!(
                    "peer link ({a}, {b}) references an unknown device"
                )));
            }
            if a != b {
                peers[a][b] = true;
                peers[b][a] = true;
            }
        }

        let aperture_size = crate::utils::align_up(self.aperture_size, page)
            .filter(|&s| s > 0)
            .ok_or_else(|| DriverError::InvalidValue("aperture size".into()))?;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aperture_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(DriverError::Os(io::Error::last_os_error()));
        }

        let base = base as u64;
        debug!(
            "host driver: {n} devices, aperture 0x{base:x}..0x{:x}",
            base + aperture_size as u64
        );

        Ok(HostDriver {
            devices: self.devices,
            peers,
            aperture_base: base,
            aperture_size,
            state: Mutex::new(HostState {
                aperture: Aperture::new(base, base + aperture_size as u64, page as u64),
                handles: HashMap::new(),
                next_handle: 1,
                mappings: BTreeMap::new(),
                access: HashMap::new(),
            }),
        })
    }
}

// ===============================================================================================
// Driver
// ===============================================================================================

#[derive(Debug)]
struct HostHandle {
    device: DeviceId,
    size: usize,
    file: OwnedFd,
}

#[derive(Debug, Clone, Copy)]
struct HostMapping {
    handle: PhysicalHandle,
    device: DeviceId,
    size: usize,
}

#[derive(Debug)]
struct HostState {
    aperture: Aperture,
    handles: HashMap<PhysicalHandle, HostHandle>,
    next_handle: u64,
    // Mapping start address -> mapping
    mappings: BTreeMap<u64, HostMapping>,
    // Reservation base -> granted access
    access: HashMap<u64, Vec<AccessDesc>>,
}

/// Host-memory implementation of [`VmmDriver`].
#[derive(Debug)]
pub struct HostDriver {
    devices: Vec<HostDeviceSpec>,
    peers: Vec<Vec<bool>>,
    aperture_base: u64,
    aperture_size: usize,
    state: Mutex<HostState>,
}

impl HostDriver {
    #[must_use]
    pub fn builder() -> HostDriverBuilder {
        HostDriverBuilder::default()
    }

    /// `count` identical, fully connected devices of `capacity` bytes each.
    ///
    /// # Errors
    /// See [`HostDriverBuilder::build`].
    pub fn uniform(count: u32, capacity: usize) -> DriverResult<Self> {
        Self::builder()
            .devices((0..count).map(|i| HostDeviceSpec::new(format!("host{i}"), capacity)))
            .fully_connected()
            .build()
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spec(&self, device: DeviceId) -> DriverResult<&HostDeviceSpec> {
        self.devices
            .get(device.index())
            .ok_or(DriverError::InvalidDevice(device))
    }

    fn vmm_spec(&self, device: DeviceId) -> DriverResult<&HostDeviceSpec> {
        let spec = self.spec(device)?;
        if spec.vmm_supported {
            Ok(spec)
        } else {
            Err(DriverError::NotSupported(device))
        }
    }

    #[must_use]
    pub fn spec_of(&self, device: DeviceId) -> Option<&HostDeviceSpec> {
        self.devices.get(device.index())
    }

    #[must_use]
    pub const fn aperture(&self) -> (u64, usize) {
        (self.aperture_base, self.aperture_size)
    }

    /// Number of physical handles not yet released.
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.lock().handles.len()
    }

    /// Number of address reservations not yet freed.
    #[must_use]
    pub fn live_reservations(&self) -> usize {
        self.lock().aperture.len()
    }

    /// Number of handle mappings not yet unmapped.
    #[must_use]
    pub fn live_mappings(&self) -> usize {
        self.lock().mappings.len()
    }

    /// Bytes currently allocated on `device`.
    #[must_use]
    pub fn used_memory(&self, device: DeviceId) -> usize {
        let state = self.lock();
        state
            .handles
            .values()
            .filter(|h| h.device == device)
            .map(|h| h.size)
            .sum()
    }

    fn anon_protnone(addr: u64, size: usize) -> DriverResult<()> {
        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(DriverError::Os(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Mappings covering `[ptr, ptr + size)` exactly and contiguously.
    fn covering(state: &HostState, ptr: u64, size: usize) -> DriverResult<Vec<HostMapping>> {
        let end = ptr + size as u64;
        let mut cursor = ptr;
        let mut out = Vec::new();

        if let Some((&start, m)) = state.mappings.range(..=ptr).next_back() {
            if start < ptr && start + m.size as u64 > ptr {
                out.push(*m);
                cursor = start + m.size as u64;
            }
        }
        for (&start, m) in state.mappings.range(cursor..end) {
            if start != cursor {
                break;
            }
            out.push(*m);
            cursor = start + m.size as u64;
        }

        if cursor < end {
            return Err(DriverError::InvalidValue(format!(
                "range 0x{ptr:x}+{size} is not fully mapped"
            )));
        }
        Ok(out)
    }
}

impl Drop for HostDriver {
    fn drop(&mut self) {
        let ret = unsafe {
            libc::munmap(
                self.aperture_base as *mut libc::c_void,
                self.aperture_size,
            )
        };
        if ret != 0 {
            error!(
                "host driver: failed to unmap aperture 0x{:x}: {}",
                self.aperture_base,
                io::Error::last_os_error()
            );
        }
    }
}

impl VmmDriver for HostDriver {
    fn device_count(&self) -> u32 {
        self.devices.len() as u32
    }

    fn can_access_peer(&self, from: DeviceId, to: DeviceId) -> DriverResult<bool> {
        self.spec(from)?;
        self.spec(to)?;
        Ok(self.peers[from.index()][to.index()])
    }

    fn supports_vmm(&self, device: DeviceId) -> DriverResult<bool> {
        Ok(self.spec(device)?.vmm_supported)
    }

    fn granularity(&self, device: DeviceId, kind: GranularityKind) -> DriverResult<usize> {
        let spec = self.vmm_spec(device)?;
        Ok(match kind {
            GranularityKind::Minimum => spec.min_granularity,
            GranularityKind::Recommended => spec.recommended_granularity,
        })
    }

    fn free_memory(&self, device: DeviceId) -> DriverResult<usize> {
        let capacity = self.spec(device)?.capacity;
        Ok(capacity.saturating_sub(self.used_memory(device)))
    }

    fn create_physical(&self, device: DeviceId, size: usize) -> DriverResult<PhysicalHandle> {
        let spec = self.vmm_spec(device)?;
        if size == 0 || size % spec.min_granularity != 0 {
            return Err(DriverError::InvalidValue(format!(
                "size {size} is not a multiple of granularity {}",
                spec.min_granularity
            )));
        }

        let mut state = self.lock();
        let in_use: usize = state
            .handles
            .values()
            .filter(|h| h.device == device)
            .map(|h| h.size)
            .sum();
        if in_use.saturating_add(size) > spec.capacity {
            return Err(DriverError::OutOfMemory);
        }

        let fd = unsafe { libc::memfd_create(c"vmm-chunk".as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(DriverError::Os(io::Error::last_os_error()));
        }
        // SAFETY: `fd` was just returned by memfd_create and is owned by nobody else.
        let file = unsafe { OwnedFd::from_raw_fd(fd) };

        let len = libc::off_t::try_from(size)
            .map_err(|_| DriverError::InvalidValue(format!("size {size} too large")))?;
        if unsafe { libc::ftruncate(file.as_raw_fd(), len) } != 0 {
            return Err(DriverError::Os(io::Error::last_os_error()));
        }

        let handle = PhysicalHandle(state.next_handle);
        state.next_handle += 1;
        state.handles.insert(handle, HostHandle { device, size, file });

        debug!("host driver: created handle {} ({size} bytes) on device {device}", handle.0);
        Ok(handle)
    }

    fn release_physical(&self, handle: PhysicalHandle) -> DriverResult<()> {
        let mut state = self.lock();
        if state.mappings.values().any(|m| m.handle == handle) {
            return Err(DriverError::InvalidValue(format!(
                "handle {} is still mapped",
                handle.0
            )));
        }
        // Dropping the handle closes the memfd and frees its pages.
        state
            .handles
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| DriverError::InvalidValue(format!("unknown handle {}", handle.0)))
    }

    fn reserve_address(&self, size: usize, alignment: usize) -> DriverResult<DevicePtr> {
        if size == 0 {
            return Err(DriverError::InvalidValue("empty reservation".into()));
        }
        self.lock()
            .aperture
            .reserve(size as u64, alignment as u64)
            .ok_or(DriverError::AddressSpaceExhausted)
    }

    fn free_address(&self, ptr: DevicePtr, size: usize) -> DriverResult<()> {
        let mut state = self.lock();
        let end = ptr + size as u64;
        if state.mappings.range(ptr..end).next().is_some() {
            return Err(DriverError::InvalidValue(format!(
                "reservation 0x{ptr:x} still has live mappings"
            )));
        }
        if !state.aperture.release(ptr, size as u64) {
            return Err(DriverError::InvalidValue(format!(
                "0x{ptr:x}+{size} is not a reservation"
            )));
        }
        state.access.remove(&ptr);
        Ok(())
    }

    fn map(&self, ptr: DevicePtr, size: usize, handle: PhysicalHandle) -> DriverResult<()> {
        let mut state = self.lock();
        let (fd, device, handle_size) = {
            let h = state
                .handles
                .get(&handle)
                .ok_or_else(|| DriverError::InvalidValue(format!("unknown handle {}", handle.0)))?;
            (h.file.as_raw_fd(), h.device, h.size)
        };
        let granularity = self.spec(device)?.min_granularity;

        if size == 0 || size > handle_size || ptr % granularity as u64 != 0 {
            return Err(DriverError::InvalidValue(format!(
                "bad mapping 0x{ptr:x}+{size} for handle {} ({handle_size} bytes)",
                handle.0
            )));
        }
        if state.aperture.containing(ptr, size as u64).is_none() {
            return Err(DriverError::InvalidValue(format!(
                "0x{ptr:x}+{size} is outside any reservation"
            )));
        }
        let end = ptr + size as u64;
        let overlaps_before = state
            .mappings
            .range(..ptr)
            .next_back()
            .is_some_and(|(&s, m)| s + m.size as u64 > ptr);
        if overlaps_before || state.mappings.range(ptr..end).next().is_some() {
            return Err(DriverError::InvalidValue(format!(
                "0x{ptr:x}+{size} overlaps an existing mapping"
            )));
        }

        let ret = unsafe {
            libc::mmap(
                ptr as *mut libc::c_void,
                size,
                libc::PROT_NONE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(DriverError::Os(io::Error::last_os_error()));
        }

        state.mappings.insert(
            ptr,
            HostMapping {
                handle,
                device,
                size,
            },
        );
        Ok(())
    }

    fn unmap(&self, ptr: DevicePtr, size: usize) -> DriverResult<()> {
        let mut state = self.lock();
        match state.mappings.get(&ptr) {
            Some(m) if m.size == size => {}
            _ => {
                return Err(DriverError::InvalidValue(format!(
                    "0x{ptr:x}+{size} is not a mapping"
                )));
            }
        }
        // Put the placeholder back so the reservation stays intact.
        Self::anon_protnone(ptr, size)?;
        state.mappings.remove(&ptr);
        Ok(())
    }

    fn set_access(&self, ptr: DevicePtr, size: usize, descs: &[AccessDesc]) -> DriverResult<()> {
        let mut state = self.lock();
        let (res_base, _) = state.aperture.containing(ptr, size as u64).ok_or_else(|| {
            DriverError::InvalidValue(format!("0x{ptr:x}+{size} is outside any reservation"))
        })?;
        let mapped = Self::covering(&state, ptr, size)?;

        for desc in descs {
            self.vmm_spec(desc.device)?;
            for m in &mapped {
                if m.device != desc.device && !self.peers[desc.device.index()][m.device.index()] {
                    return Err(DriverError::PeerAccessDenied {
                        from: desc.device,
                        to: m.device,
                    });
                }
            }
        }

        let prot = match descs.iter().map(|d| d.flags).max_by_key(|f| match f {
            AccessFlags::None => 0,
            AccessFlags::Read => 1,
            AccessFlags::ReadWrite => 2,
        }) {
            Some(AccessFlags::ReadWrite) => libc::PROT_READ | libc::PROT_WRITE,
            Some(AccessFlags::Read) => libc::PROT_READ,
            _ => libc::PROT_NONE,
        };
        if unsafe { libc::mprotect(ptr as *mut libc::c_void, size, prot) } != 0 {
            return Err(DriverError::Os(io::Error::last_os_error()));
        }

        let granted = state.access.entry(res_base).or_default();
        for desc in descs {
            granted.retain(|g| g.device != desc.device);
            granted.push(*desc);
        }
        Ok(())
    }

    fn get_access(&self, device: DeviceId, ptr: DevicePtr) -> DriverResult<AccessFlags> {
        self.spec(device)?;
        let state = self.lock();
        let Some((res_base, _)) = state.aperture.containing(ptr, 1) else {
            return Err(DriverError::InvalidValue(format!(
                "0x{ptr:x} is outside any reservation"
            )));
        };
        Ok(state
            .access
            .get(&res_base)
            .and_then(|g| g.iter().find(|d| d.device == device))
            .map_or(AccessFlags::None, |d| d.flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_devices() -> HostDriver {
        HostDriver::builder()
            .device(HostDeviceSpec::new("a", 16 * MB))
            .device(HostDeviceSpec::new("b", 16 * MB))
            .peer(0, 1)
            .aperture_size(64 * MB)
            .build()
            .unwrap()
    }

    #[test]
    fn builder_rejects_bad_granularity() {
        let err = HostDriver::builder()
            .device(HostDeviceSpec::new("a", MB).granularity(3000, 0))
            .build()
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidValue(_)));

        let err = HostDriver::builder()
            .device(HostDeviceSpec::new("a", MB).granularity(64 * KB, 32 * KB))
            .build()
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidValue(_)));
    }

    #[test]
    fn builder_rejects_unknown_peer() {
        let err = HostDriver::builder()
            .device(HostDeviceSpec::new("a", MB))
            .peer(0, 3)
            .build()
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidValue(_)));
    }

    #[test]
    fn peers_are_symmetric_and_not_reflexive() {
        let drv = two_devices();
        assert!(drv.can_access_peer(DeviceId(0), DeviceId(1)).unwrap());
        assert!(drv.can_access_peer(DeviceId(1), DeviceId(0)).unwrap());
        assert!(!drv.can_access_peer(DeviceId(0), DeviceId(0)).unwrap());
        assert!(drv.can_access_peer(DeviceId(0), DeviceId(2)).is_err());
    }

    #[test]
    fn capacity_is_enforced() {
        let drv = two_devices();
        let h = drv.create_physical(DeviceId(0), 16 * MB).unwrap();
        assert!(matches!(
            drv.create_physical(DeviceId(0), 2 * MB),
            Err(DriverError::OutOfMemory)
        ));
        assert_eq!(drv.free_memory(DeviceId(0)).unwrap(), 0);
        drv.release_physical(h).unwrap();
        assert_eq!(drv.free_memory(DeviceId(0)).unwrap(), 16 * MB);
    }

    #[test]
    fn map_write_read_and_teardown() {
        let drv = two_devices();
        let h0 = drv.create_physical(DeviceId(0), 2 * MB).unwrap();
        let h1 = drv.create_physical(DeviceId(1), 2 * MB).unwrap();
        let va = drv.reserve_address(4 * MB, 2 * MB).unwrap();
        drv.map(va, 2 * MB, h0).unwrap();
        drv.map(va + 2 * MB as u64, 2 * MB, h1).unwrap();
        drv.set_access(va, 4 * MB, &[AccessDesc::read_write(DeviceId(0))])
            .unwrap();
        assert_eq!(
            drv.get_access(DeviceId(0), va).unwrap(),
            AccessFlags::ReadWrite
        );
        assert_eq!(drv.get_access(DeviceId(1), va).unwrap(), AccessFlags::None);

        let words = (4 * MB) / std::mem::size_of::<u32>();
        let p = va as *mut u32;
        unsafe {
            for i in 0..words {
                p.add(i).write(i as u32);
            }
            for i in (0..words).step_by(4093) {
                assert_eq!(p.add(i).read(), i as u32);
            }
        }

        assert!(drv.free_address(va, 4 * MB).is_err());
        assert!(drv.release_physical(h0).is_err());
        drv.unmap(va, 2 * MB).unwrap();
        drv.unmap(va + 2 * MB as u64, 2 * MB).unwrap();
        drv.release_physical(h0).unwrap();
        drv.release_physical(h1).unwrap();
        drv.free_address(va, 4 * MB).unwrap();
        assert_eq!(drv.live_handles(), 0);
        assert_eq!(drv.live_reservations(), 0);
        assert_eq!(drv.live_mappings(), 0);
    }

    #[test]
    fn set_access_requires_full_mapping_and_peer() {
        let drv = HostDriver::builder()
            .device(HostDeviceSpec::new("a", 16 * MB))
            .device(HostDeviceSpec::new("b", 16 * MB))
            .aperture_size(64 * MB)
            .build()
            .unwrap();
        let h = drv.create_physical(DeviceId(0), 2 * MB).unwrap();
        let va = drv.reserve_address(4 * MB, 2 * MB).unwrap();
        drv.map(va, 2 * MB, h).unwrap();

        assert!(
            drv.set_access(va, 4 * MB, &[AccessDesc::read_write(DeviceId(0))])
                .is_err()
        );
        let err = drv
            .set_access(va, 2 * MB, &[AccessDesc::read_write(DeviceId(1))])
            .unwrap_err();
        assert!(matches!(err, DriverError::PeerAccessDenied { .. }));
        // A rejected grant leaves nothing behind.
        assert_eq!(drv.get_access(DeviceId(0), va).unwrap(), AccessFlags::None);

        drv.unmap(va, 2 * MB).unwrap();
        drv.release_physical(h).unwrap();
        drv.free_address(va, 4 * MB).unwrap();
    }

    #[test]
    fn map_rejects_overlap_and_misalignment() {
        let drv = two_devices();
        let h = drv.create_physical(DeviceId(0), 2 * MB).unwrap();
        let h2 = drv.create_physical(DeviceId(0), 2 * MB).unwrap();
        let va = drv.reserve_address(4 * MB, 2 * MB).unwrap();
        drv.map(va, 2 * MB, h).unwrap();
        assert!(drv.map(va + MB as u64, 2 * MB, h2).is_err());
        assert!(drv.map(va + 4096, MB, h2).is_err());
        assert!(drv.map(va + 2 * MB as u64, 4 * MB, h2).is_err());
        drv.unmap(va, 2 * MB).unwrap();
        drv.release_physical(h).unwrap();
        drv.release_physical(h2).unwrap();
        drv.free_address(va, 4 * MB).unwrap();
    }

    #[test]
    fn vmm_unsupported_device_cannot_allocate() {
        let drv = HostDriver::builder()
            .device(HostDeviceSpec::new("a", MB).without_vmm())
            .build()
            .unwrap();
        assert!(!drv.supports_vmm(DeviceId(0)).unwrap());
        assert!(matches!(
            drv.create_physical(DeviceId(0), 64 * KB),
            Err(DriverError::NotSupported(_))
        ));
        assert!(matches!(
            drv.granularity(DeviceId(0), GranularityKind::Minimum),
            Err(DriverError::NotSupported(_))
        ));
    }
}
