use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    error::Result,
    globals::PAGE_SIZE,
    mmap::PlatformMemory,
};

use super::free_tree::FreeIntervalTree;

/// A fixed arena of native pages for the collector's own data structures.
///
/// Pages are handed out from a free-interval tree first and then from the untouched tail of
/// the arena. Returned pages are decommitted before they become reusable.
pub struct PagePool {
    memory: PlatformMemory,
    total_pages: usize,
    free_pages: Mutex<FreeIntervalTree>,
    used_zone: AtomicUsize,
    pages_in_use: AtomicUsize,
}

impl PagePool {
    pub fn new(size: usize) -> Result<Self> {
        let total_pages = size / PAGE_SIZE;
        let memory = PlatformMemory::reserve(total_pages * PAGE_SIZE, PAGE_SIZE)?;
        memory.name(c"strata_page_pool");
        log::debug!(
            "page pool reserved {} pages at {:p}",
            total_pages,
            memory.start()
        );
        Ok(Self {
            memory,
            total_pages,
            free_pages: Mutex::new(FreeIntervalTree::new()),
            used_zone: AtomicUsize::new(0),
            pages_in_use: AtomicUsize::new(0),
        })
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn pages_in_use(&self) -> usize {
        self.pages_in_use.load(Ordering::Relaxed)
    }

    /// Returns `count` contiguous pages, or `None` when the arena is exhausted.
    pub fn get_page(&self, count: usize) -> Option<NonNull<u8>> {
        let index = {
            let mut free = self.free_pages.lock();
            free.take(count as u32).map(|start| start as usize)
        };
        let index = match index {
            Some(index) => index,
            None => self.grow_used_zone(count)?,
        };
        let addr = self.memory.start() as usize + index * PAGE_SIZE;
        self.memory
            .commit(addr as *mut u8, count * PAGE_SIZE, false);
        self.pages_in_use.fetch_add(count, Ordering::Relaxed);
        NonNull::new(addr as *mut u8)
    }

    /// Gives `count` pages starting at `page` back to the pool.
    pub fn return_page(&self, page: NonNull<u8>, count: usize) {
        let addr = page.as_ptr() as usize;
        let start = self.memory.start() as usize;
        assert!(
            addr >= start && addr + count * PAGE_SIZE <= self.memory.end() as usize,
            "page {:#x} does not belong to the pool",
            addr
        );
        self.memory.dontneed(page.as_ptr(), count * PAGE_SIZE);
        let index = (addr - start) / PAGE_SIZE;
        self.free_pages.lock().insert(index as u32, count as u32);
        self.pages_in_use.fetch_sub(count, Ordering::Relaxed);
    }

    fn grow_used_zone(&self, count: usize) -> Option<usize> {
        let mut current = self.used_zone.load(Ordering::Relaxed);
        loop {
            if current + count > self.total_pages {
                return None;
            }
            match self.used_zone.compare_exchange_weak(
                current,
                current + count,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_recycled() {
        let pool = PagePool::new(32 * PAGE_SIZE).unwrap();
        let a = pool.get_page(1).unwrap();
        let b = pool.get_page(2).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, PAGE_SIZE);
        assert_eq!(pool.pages_in_use(), 3);
        unsafe { b.as_ptr().write(7) };
        pool.return_page(b, 2);
        let c = pool.get_page(1).unwrap();
        assert_eq!(c, b);
        assert_eq!(unsafe { c.as_ptr().read() }, 0);
        pool.return_page(a, 1);
        pool.return_page(c, 1);
        assert_eq!(pool.pages_in_use(), 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = PagePool::new(16 * PAGE_SIZE).unwrap();
        assert!(pool.get_page(16).is_some());
        assert!(pool.get_page(1).is_none());
    }
}
