use std::{ptr::NonNull, sync::Arc};

use super::{page_allocator::PageAllocator, page_pool::PagePool};

pub const MIN_SIZE_CLASS: usize = 16;
pub const MAX_SIZE_CLASS: usize = 2048;
const CLASS_COUNT: usize = (MAX_SIZE_CLASS.trailing_zeros() - MIN_SIZE_CLASS.trailing_zeros()) as usize + 1;

/// Power-of-two size classes over [`PageAllocator`]s, used by the collector's native
/// containers. Requests above [`MAX_SIZE_CLASS`] are not served.
pub struct AggregateAllocator {
    classes: Vec<PageAllocator>,
}

impl AggregateAllocator {
    pub fn new(pool: Arc<PagePool>) -> Self {
        let classes = (0..CLASS_COUNT)
            .map(|i| PageAllocator::new(pool.clone(), MIN_SIZE_CLASS << i))
            .collect();
        Self { classes }
    }

    fn class_index(size: usize) -> Option<usize> {
        if size > MAX_SIZE_CLASS {
            return None;
        }
        let size = size.max(MIN_SIZE_CLASS).next_power_of_two();
        Some((size.trailing_zeros() - MIN_SIZE_CLASS.trailing_zeros()) as usize)
    }

    /// Zeroed memory of at least `size` bytes.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let index = Self::class_index(size)?;
        self.classes[index].allocate()
    }

    /// `size` must be the size passed to the matching `allocate`.
    pub fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        match Self::class_index(size) {
            Some(index) => self.classes[index].deallocate(ptr),
            None => panic!("deallocating {} bytes that no size class serves", size),
        }
    }

    pub fn allocated_bytes(&self) -> usize {
        self.classes
            .iter()
            .map(|c| c.counts().allocated * c.slot_size())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::PAGE_SIZE;

    #[test]
    fn size_classes() {
        assert_eq!(AggregateAllocator::class_index(1), Some(0));
        assert_eq!(AggregateAllocator::class_index(16), Some(0));
        assert_eq!(AggregateAllocator::class_index(17), Some(1));
        assert_eq!(AggregateAllocator::class_index(2048), Some(CLASS_COUNT - 1));
        assert_eq!(AggregateAllocator::class_index(2049), None);
    }

    #[test]
    fn allocate_and_free() {
        let pool = Arc::new(PagePool::new(128 * PAGE_SIZE).unwrap());
        let alloc = AggregateAllocator::new(pool);
        let a = alloc.allocate(100).unwrap();
        let b = alloc.allocate(2000).unwrap();
        assert_eq!(alloc.allocated_bytes(), 128 + 2048);
        alloc.deallocate(a, 100);
        alloc.deallocate(b, 2000);
        assert_eq!(alloc.allocated_bytes(), 0);
        assert!(alloc.allocate(4096).is_none());
    }
}
