/// Rounds `value` up to the next multiple of `align`.
///
/// Returns `None` when `align` is zero or the result overflows.
#[must_use]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    if align == 0 {
        return None;
    }
    let rem = value % align;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(align - rem)
    }
}

#[must_use]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    align != 0 && value % align == 0
}

#[must_use]
pub const fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Least common multiple, `None` on overflow or when either side is zero.
#[must_use]
pub const fn lcm(a: usize, b: usize) -> Option<usize> {
    if a == 0 || b == 0 {
        return None;
    }
    (a / gcd(a, b)).checked_mul(b)
}

/// Host page size as reported by `sysconf`.
#[must_use]
pub fn page_size() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(ret).unwrap_or(4096)
}
