//! `PlatformMemory`: one reserved virtual range and the OS advice applied to parts of it.
//!
//! Unix backs the range with an anonymous private mapping that is committed lazily by the
//! kernel, so `commit` is only a hint there. Windows reserves first and must commit before
//! the memory is touched.

use std::ffi::CStr;

use crate::error::{HeapError, Result};

#[cfg(windows)]
pub mod _win {
    use super::*;

    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    pub struct PlatformMemory {
        base: *mut u8,
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl PlatformMemory {
        /// Reserves `size` bytes whose start is aligned to `align`.
        pub fn reserve(size: usize, align: usize) -> Result<Self> {
            let total = size + align;
            unsafe {
                let mem = VirtualAlloc(null_mut(), total, MEM_RESERVE, PAGE_READWRITE) as *mut u8;
                if mem.is_null() {
                    return Err(HeapError::ReservationFailed(total));
                }
                let start = crate::utils::align_usize(mem as usize, align) as *mut u8;
                Ok(Self {
                    base: mem,
                    start,
                    end: start.add(size),
                    size,
                })
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }
        pub const fn size(&self) -> usize {
            self.size
        }

        pub fn commit(&self, page: *mut u8, size: usize, _expect_physical: bool) {
            unsafe {
                VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE);
            }
        }

        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualFree(page.cast(), size, MEM_DECOMMIT);
            }
        }

        pub fn advise_huge_page(&self, _page: *mut u8, _size: usize, _enable: bool) {}

        pub fn name(&self, _name: &'static CStr) {}
    }

    impl Drop for PlatformMemory {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.base.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    use super::*;

    pub struct PlatformMemory {
        base: *mut u8,
        start: *mut u8,
        end: *mut u8,
        size: usize,
        mapped: usize,
    }

    #[cfg(target_os = "linux")]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE;
    #[cfg(not(target_os = "linux"))]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

    impl PlatformMemory {
        /// Reserves `size` bytes whose start is aligned to `align`.
        pub fn reserve(size: usize, align: usize) -> Result<Self> {
            let mapped = size + align;
            unsafe {
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    mapped as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    RESERVE_FLAGS,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    return Err(HeapError::ReservationFailed(mapped));
                }
                let start = crate::utils::align_usize(map as usize, align) as *mut u8;
                Ok(Self {
                    base: map as *mut u8,
                    start,
                    end: start.add(size),
                    size,
                    mapped,
                })
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }
        pub const fn size(&self) -> usize {
            self.size
        }

        pub fn commit(&self, page: *mut u8, size: usize, expect_physical: bool) {
            if expect_physical {
                unsafe {
                    libc::madvise(page as *mut _, size as _, libc::MADV_WILLNEED);
                }
            }
        }

        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
            }
        }

        #[cfg(target_os = "linux")]
        pub fn advise_huge_page(&self, page: *mut u8, size: usize, enable: bool) {
            let advice = if enable {
                libc::MADV_HUGEPAGE
            } else {
                libc::MADV_NOHUGEPAGE
            };
            unsafe {
                libc::madvise(page as *mut _, size as _, advice);
            }
        }

        #[cfg(not(target_os = "linux"))]
        pub fn advise_huge_page(&self, _page: *mut u8, _size: usize, _enable: bool) {}

        /// Names the mapping for `/proc/<pid>/maps`. Kernels without anonymous VMA names ignore it.
        #[cfg(target_os = "linux")]
        pub fn name(&self, name: &'static CStr) {
            const PR_SET_VMA: libc::c_int = 0x53564d41;
            const PR_SET_VMA_ANON_NAME: libc::c_ulong = 0;
            unsafe {
                libc::prctl(
                    PR_SET_VMA,
                    PR_SET_VMA_ANON_NAME,
                    self.base as libc::c_ulong,
                    self.mapped as libc::c_ulong,
                    name.as_ptr() as libc::c_ulong,
                );
            }
        }

        #[cfg(not(target_os = "linux"))]
        pub fn name(&self, _name: &'static CStr) {}
    }

    impl Drop for PlatformMemory {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.base as *mut _, self.mapped as _);
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;

unsafe impl Send for PlatformMemory {}
unsafe impl Sync for PlatformMemory {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::{PAGE_SIZE, UNIT_SIZE};

    #[test]
    fn reserve_is_aligned_and_writable() {
        let mem = PlatformMemory::reserve(4 * UNIT_SIZE, UNIT_SIZE).unwrap();
        assert_eq!(mem.start() as usize % UNIT_SIZE, 0);
        assert_eq!(mem.end() as usize - mem.start() as usize, 4 * UNIT_SIZE);
        mem.commit(mem.start(), UNIT_SIZE, true);
        unsafe {
            mem.start().write(42);
            assert_eq!(mem.start().read(), 42);
        }
        mem.dontneed(mem.start(), PAGE_SIZE);
        mem.commit(mem.start(), PAGE_SIZE, false);
        unsafe {
            assert_eq!(mem.start().read(), 0);
        }
    }
}
