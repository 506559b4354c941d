use std::collections::BTreeMap;

/// A window of address space carved into reservations.
///
/// Only bookkeeping lives here; the host driver owns the actual mapping.
#[derive(Debug)]
pub struct Aperture {
    base: u64,
    limit: u64,
    align: u64,

    // Occupied ranges: start -> size. Used to find holes for new reservations.
    reservations: BTreeMap<u64, u64>,
}

impl Aperture {
    /// Creates an aperture covering `[base, limit)`.
    #[must_use]
    pub fn new(base: u64, limit: u64, align: u64) -> Self {
        Self {
            base,
            limit,
            align: align.max(1),
            reservations: BTreeMap::new(),
        }
    }

    fn align_up(val: u64, align: u64) -> Option<u64> {
        let rem = val % align;
        if rem == 0 {
            Some(val)
        } else {
            val.checked_add(align - rem)
        }
    }

    #[must_use]
    pub const fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    /// First-fit search for a hole of `size` bytes aligned to `align`.
    pub fn reserve(&mut self, size: u64, align: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let align = align.max(self.align);
        let mut candidate = Self::align_up(self.base, align)?;

        for (&start, &len) in &self.reservations {
            if start >= candidate && start - candidate >= size {
                break;
            }
            candidate = candidate.max(Self::align_up(start + len, align)?);
        }

        let end = candidate.checked_add(size)?;
        if end > self.limit {
            return None;
        }
        self.reservations.insert(candidate, size);
        Some(candidate)
    }

    /// Drops a reservation. Returns `false` if `addr` was not a reservation of `size` bytes.
    pub fn release(&mut self, addr: u64, size: u64) -> bool {
        match self.reservations.get(&addr) {
            Some(&len) if len == size => {
                self.reservations.remove(&addr);
                true
            }
            _ => false,
        }
    }

    /// The reservation fully containing `[addr, addr + size)`, if any.
    #[must_use]
    pub fn containing(&self, addr: u64, size: u64) -> Option<(u64, u64)> {
        let (&start, &len) = self.reservations.range(..=addr).next_back()?;
        let end = addr.checked_add(size)?;
        (end <= start + len).then_some((start, len))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }
}
