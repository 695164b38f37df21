use std::time::Instant;

use std::sync::OnceLock;

/// Rounds `value` up to the nearest multiple of `align`. `align` must be a power of two.
#[inline(always)]
pub const fn align_usize(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}

/// [`align_usize`] for sizes that come from callers. `None` when rounding up overflows.
#[inline(always)]
pub const fn checked_align_usize(value: usize, align: usize) -> Option<usize> {
    if align == 0 {
        return Some(value);
    }
    match value.checked_add(align - 1) {
        Some(bumped) => Some(bumped & !(align - 1)),
        None => None,
    }
}

#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Nanoseconds elapsed since the first call in this process. Monotonic.
pub fn nano_time() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cold]
pub fn oom_abort() -> ! {
    log::error!("OutOfMemory: unrecoverable heap failure");
    eprintln!("OutOfMemory");
    std::process::abort();
}

/// Issues a read prefetch hint for `addr`. No-op on targets without one.
#[inline(always)]
pub fn prefetch_read(addr: usize) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_prefetch::<{ core::arch::x86_64::_MM_HINT_T0 }>(addr as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = addr;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align_usize(13, 8), 16);
        assert_eq!(align_usize(16, 8), 16);
        assert_eq!(align_down(4097, 4096), 4096);
        assert!(is_aligned(0x4000, 0x1000));
        assert!(!is_aligned(0x4008, 0x1000));
    }

    #[test]
    fn checked_align_rejects_overflow() {
        assert_eq!(checked_align_usize(13, 8), Some(16));
        assert_eq!(checked_align_usize(usize::MAX - 3, 8), None);
        assert_eq!(checked_align_usize(usize::MAX, 0), Some(usize::MAX));
    }
}
