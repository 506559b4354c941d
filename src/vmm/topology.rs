use crate::driver::{DeviceId, VmmDriver};
use crate::error::VmmResult;

/// Capabilities of one device relevant to virtual memory management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    pub id: DeviceId,
    pub vmm_supported: bool,
}

/// Immutable snapshot of the device topology.
///
/// `peers[a][b]` is true when device `a` can access memory physically owned by device `b`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTable {
    caps: Vec<DeviceCaps>,
    peers: Vec<Vec<bool>>,
}

impl DeviceTable {
    /// Builds a table from explicit capabilities and a square peer matrix.
    ///
    /// Rows or columns missing from `peers` read as "no access".
    #[must_use]
    pub const fn new(caps: Vec<DeviceCaps>, peers: Vec<Vec<bool>>) -> Self {
        Self { caps, peers }
    }

    /// Queries every device the driver enumerates.
    ///
    /// # Errors
    /// Propagates any failure of the underlying topology queries.
    pub fn probe<D: VmmDriver + ?Sized>(driver: &D) -> VmmResult<Self> {
        let count = driver.device_count();
        let mut caps = Vec::with_capacity(count as usize);
        let mut peers = Vec::with_capacity(count as usize);

        for a in 0..count {
            let id = DeviceId(a);
            caps.push(DeviceCaps {
                id,
                vmm_supported: driver.supports_vmm(id)?,
            });

            let mut row = Vec::with_capacity(count as usize);
            for b in 0..count {
                row.push(a != b && driver.can_access_peer(id, DeviceId(b))?);
            }
            peers.push(row);
        }

        Ok(Self { caps, peers })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.caps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    #[must_use]
    pub fn caps(&self, device: DeviceId) -> Option<&DeviceCaps> {
        self.caps.get(device.index())
    }

    #[must_use]
    pub fn supports_vmm(&self, device: DeviceId) -> bool {
        self.caps(device).is_some_and(|c| c.vmm_supported)
    }

    #[must_use]
    pub fn can_access_peer(&self, from: DeviceId, to: DeviceId) -> bool {
        self.peers
            .get(from.index())
            .and_then(|row| row.get(to.index()))
            .copied()
            .unwrap_or(false)
    }

    /// Devices whose physical memory can back an allocation mapped on `mapping`.
    ///
    /// `mapping` always comes first. The others follow in enumeration order and are kept only
    /// when `mapping` can access them as a peer and they support virtual address management.
    #[must_use]
    pub fn backing_devices_for(&self, mapping: DeviceId) -> Vec<DeviceId> {
        let mut backing = vec![mapping];
        backing.extend(
            self.caps
                .iter()
                .filter(|c| c.id != mapping)
                .filter(|c| self.can_access_peer(mapping, c.id))
                .filter(|c| c.vmm_supported)
                .map(|c| c.id),
        );
        backing
    }
}
