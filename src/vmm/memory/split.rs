#![allow(clippy::cast_possible_truncation)]

//! Policies deciding how much of a request each backing device provides.

use crate::driver::DeviceId;
use crate::error::{VmmError, VmmResult};
use crate::utils::{align_up, is_aligned};
use std::fmt;

/// What a split policy knows about one backing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingSlot {
    pub device: DeviceId,
    pub granularity: usize,
    /// Free physical memory, only filled in when the policy asks for it.
    pub free_bytes: usize,
}

/// Splits a request across the backing set.
///
/// A plan holds one size per slot, in slot order. Every size must be a non-zero multiple of
/// `alignment` and the sizes must add up to at least `size`.
pub trait SplitPolicy: Send + Sync + fmt::Debug {
    /// Returns `None` if the plan cannot be computed without overflowing.
    fn split(&self, size: usize, alignment: usize, slots: &[BackingSlot]) -> Option<Vec<usize>>;

    /// Whether [`BackingSlot::free_bytes`] must be queried before calling `split`.
    fn needs_free_memory(&self) -> bool {
        false
    }
}

/// Equal stripes on every backing device.
///
/// The request is rounded up to `slots * alignment` and divided evenly.
#[derive(Debug, Clone, Copy, Default)]
pub struct Striped;

impl SplitPolicy for Striped {
    fn split(&self, size: usize, alignment: usize, slots: &[BackingSlot]) -> Option<Vec<usize>> {
        let n = slots.len();
        let total = align_up(size, n.checked_mul(alignment)?)?;
        Some(vec![total / n; n])
    }
}

/// Shares proportional to each device's free memory.
///
/// Each share is rounded up to `alignment` and is at least one `alignment`. Falls back to
/// [`Striped`] when no device reports free memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacityWeighted;

impl SplitPolicy for CapacityWeighted {
    fn split(&self, size: usize, alignment: usize, slots: &[BackingSlot]) -> Option<Vec<usize>> {
        let total_free: u128 = slots.iter().map(|s| s.free_bytes as u128).sum();
        if total_free == 0 {
            return Striped.split(size, alignment, slots);
        }

        slots
            .iter()
            .map(|s| {
                let share = (size as u128 * s.free_bytes as u128).div_ceil(total_free);
                let share = usize::try_from(share).ok()?.max(1);
                align_up(share, alignment)
            })
            .collect()
    }

    fn needs_free_memory(&self) -> bool {
        true
    }
}

/// Checks a plan against the invariants every policy must honour.
///
/// # Errors
/// Returns `VmmError::InvalidArgument` describing the first violation.
pub fn validate_plan(
    size: usize,
    alignment: usize,
    slots: &[BackingSlot],
    plan: &[usize],
) -> VmmResult<()> {
    if plan.len() != slots.len() {
        return Err(VmmError::InvalidArgument(format!(
            "split plan has {} entries for {} backing devices",
            plan.len(),
            slots.len()
        )));
    }
    for (slot, &chunk) in slots.iter().zip(plan) {
        if chunk == 0 || !is_aligned(chunk, alignment) || !is_aligned(chunk, slot.granularity) {
            return Err(VmmError::InvalidArgument(format!(
                "chunk of {chunk} bytes on device {} is not a multiple of {alignment}",
                slot.device
            )));
        }
    }
    let total = plan
        .iter()
        .try_fold(0usize, |acc, &c| acc.checked_add(c))
        .ok_or_else(|| VmmError::InvalidArgument("split plan overflows".into()))?;
    if total < size {
        return Err(VmmError::InvalidArgument(format!(
            "split plan covers {total} of {size} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KB: usize = 1024;
    const MB: usize = 1024 * KB;

    fn slots(free: &[usize]) -> Vec<BackingSlot> {
        free.iter()
            .enumerate()
            .map(|(i, &f)| BackingSlot {
                device: DeviceId(i as u32),
                granularity: 64 * KB,
                free_bytes: f,
            })
            .collect()
    }

    #[test]
    fn striped_single_device_rounds_to_alignment() {
        let plan = Striped.split(200_000, 2 * MB, &slots(&[0])).unwrap();
        assert_eq!(plan, vec![2 * MB]);
    }

    #[test]
    fn striped_splits_evenly() {
        let plan = Striped.split(5 * MB, 2 * MB, &slots(&[0, 0])).unwrap();
        assert_eq!(plan, vec![4 * MB, 4 * MB]);
    }

    #[test]
    fn weighted_follows_free_memory() {
        let plan = CapacityWeighted
            .split(8 * MB, 2 * MB, &slots(&[96 * MB, 32 * MB]))
            .unwrap();
        assert_eq!(plan, vec![6 * MB, 2 * MB]);
    }

    #[test]
    fn weighted_gives_every_device_a_chunk() {
        let plan = CapacityWeighted
            .split(2 * MB, 2 * MB, &slots(&[64 * MB, 0]))
            .unwrap();
        assert_eq!(plan, vec![2 * MB, 2 * MB]);
    }

    #[test]
    fn weighted_without_free_memory_stripes() {
        let plan = CapacityWeighted.split(3 * MB, MB, &slots(&[0, 0, 0])).unwrap();
        assert_eq!(plan, vec![MB, MB, MB]);
    }

    #[test]
    fn overflow_is_reported() {
        assert_eq!(Striped.split(usize::MAX, 2 * MB, &slots(&[0, 0])), None);
    }

    #[test]
    fn validate_rejects_broken_plans() {
        let s = slots(&[0, 0]);
        assert!(validate_plan(4 * MB, 2 * MB, &s, &[2 * MB, 2 * MB]).is_ok());
        assert!(validate_plan(4 * MB, 2 * MB, &s, &[4 * MB]).is_err());
        assert!(validate_plan(4 * MB, 2 * MB, &s, &[MB, 3 * MB]).is_err());
        assert!(validate_plan(4 * MB, 2 * MB, &s, &[2 * MB, 0]).is_err());
        assert!(validate_plan(6 * MB, 2 * MB, &s, &[2 * MB, 2 * MB]).is_err());
    }

    proptest! {
        #[test]
        fn policies_produce_valid_plans(
            size in 1usize..(256 * MB),
            shift in 16u32..23,
            free in proptest::collection::vec(0usize..(1 << 30), 1..6),
        ) {
            let alignment = 1usize << shift;
            let s = slots(&free);
            for policy in [&Striped as &dyn SplitPolicy, &CapacityWeighted] {
                let plan = policy.split(size, alignment, &s).unwrap();
                prop_assert!(validate_plan(size, alignment, &s, &plan).is_ok(), "{:?}", plan);
            }
        }
    }
}
