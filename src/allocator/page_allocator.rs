use std::{ptr::NonNull, sync::Arc};

use parking_lot::Mutex;

use crate::globals::PAGE_SIZE;

use super::page_pool::PagePool;

struct SlabState {
    /// Head of the intrusive free list; each free slot stores the next one in its first word.
    free_list: usize,
    total_slots: usize,
    allocated_slots: usize,
    free_slots: usize,
    pages: Vec<NonNull<u8>>,
}

/// Slab allocator for one slot size, carving pages from the [`PagePool`].
pub struct PageAllocator {
    slot_size: usize,
    pages_per_refill: usize,
    pool: Arc<PagePool>,
    state: Mutex<SlabState>,
}

unsafe impl Send for PageAllocator {}
unsafe impl Sync for PageAllocator {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotCounts {
    pub total: usize,
    pub allocated: usize,
    pub free: usize,
}

impl PageAllocator {
    pub fn new(pool: Arc<PagePool>, slot_size: usize) -> Self {
        assert!(slot_size >= std::mem::size_of::<usize>() && slot_size.is_power_of_two());
        let pages_per_refill = (slot_size * 4).div_ceil(PAGE_SIZE).max(1);
        Self {
            slot_size,
            pages_per_refill,
            pool,
            state: Mutex::new(SlabState {
                free_list: 0,
                total_slots: 0,
                allocated_slots: 0,
                free_slots: 0,
                pages: Vec::new(),
            }),
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn allocate(&self) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        if state.free_list == 0 {
            self.refill(&mut state)?;
        }
        let slot = state.free_list;
        state.free_list = unsafe { *(slot as *const usize) };
        state.allocated_slots += 1;
        state.free_slots -= 1;
        unsafe {
            std::ptr::write_bytes(slot as *mut u8, 0, self.slot_size);
        }
        NonNull::new(slot as *mut u8)
    }

    pub fn deallocate(&self, ptr: NonNull<u8>) {
        let mut state = self.state.lock();
        debug_assert!(state.allocated_slots > 0);
        let slot = ptr.as_ptr() as usize;
        unsafe { *(slot as *mut usize) = state.free_list };
        state.free_list = slot;
        state.allocated_slots -= 1;
        state.free_slots += 1;
    }

    pub fn counts(&self) -> SlotCounts {
        let state = self.state.lock();
        SlotCounts {
            total: state.total_slots,
            allocated: state.allocated_slots,
            free: state.free_slots,
        }
    }

    fn refill(&self, state: &mut SlabState) -> Option<()> {
        let page = self.pool.get_page(self.pages_per_refill)?;
        let bytes = self.pages_per_refill * PAGE_SIZE;
        let slots = bytes / self.slot_size;
        let base = page.as_ptr() as usize;
        for i in (0..slots).rev() {
            let slot = base + i * self.slot_size;
            unsafe { *(slot as *mut usize) = state.free_list };
            state.free_list = slot;
        }
        state.pages.push(page);
        state.total_slots += slots;
        state.free_slots += slots;
        Some(())
    }
}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for page in state.pages.drain(..) {
            self.pool.return_page(page, self.pages_per_refill);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_accounting_holds() {
        let pool = Arc::new(PagePool::new(64 * PAGE_SIZE).unwrap());
        let alloc = PageAllocator::new(pool.clone(), 64);
        let mut slots = Vec::new();
        for _ in 0..200 {
            slots.push(alloc.allocate().unwrap());
            let c = alloc.counts();
            assert_eq!(c.free + c.allocated, c.total);
        }
        for slot in slots.drain(..100) {
            alloc.deallocate(slot);
            let c = alloc.counts();
            assert_eq!(c.free + c.allocated, c.total);
        }
        assert_eq!(alloc.counts().allocated, 100);
        drop(slots);
        drop(alloc);
        assert_eq!(pool.pages_in_use(), 0);
    }

    #[test]
    fn reused_slot_is_zeroed() {
        let pool = Arc::new(PagePool::new(16 * PAGE_SIZE).unwrap());
        let alloc = PageAllocator::new(pool, 32);
        let slot = alloc.allocate().unwrap();
        unsafe { slot.as_ptr().add(16).write(0xff) };
        alloc.deallocate(slot);
        let again = alloc.allocate().unwrap();
        assert_eq!(again, slot);
        assert_eq!(unsafe { again.as_ptr().add(16).read() }, 0);
    }
}
