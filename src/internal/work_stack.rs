use std::{ptr::NonNull, sync::Arc};

use crate::allocator::{aggregate::MAX_SIZE_CLASS, AggregateAllocator};

const CHUNK_BYTES: usize = MAX_SIZE_CLASS;
const CHUNK_CAPACITY: usize = CHUNK_BYTES / std::mem::size_of::<usize>() - 2;

#[repr(C)]
struct Chunk {
    prev: *mut Chunk,
    len: usize,
    items: [usize; CHUNK_CAPACITY],
}

/// LIFO stack of words in chunks taken from the [`AggregateAllocator`].
pub struct WorkStack {
    top: *mut Chunk,
    len: usize,
    allocator: Arc<AggregateAllocator>,
}

unsafe impl Send for WorkStack {}

impl WorkStack {
    pub fn new(allocator: Arc<AggregateAllocator>) -> Self {
        Self {
            top: std::ptr::null_mut(),
            len: 0,
            allocator,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: usize) {
        unsafe {
            if self.top.is_null() || (*self.top).len == CHUNK_CAPACITY {
                self.push_chunk();
            }
            let top = &mut *self.top;
            top.items[top.len] = value;
            top.len += 1;
        }
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<usize> {
        unsafe {
            if self.top.is_null() {
                return None;
            }
            if (*self.top).len == 0 {
                self.pop_chunk();
                if self.top.is_null() {
                    return None;
                }
            }
            let top = &mut *self.top;
            top.len -= 1;
            self.len -= 1;
            let value = top.items[top.len];
            if top.len == 0 {
                self.pop_chunk();
            }
            Some(value)
        }
    }

    /// Pops up to `count` entries into `f`.
    pub fn take(&mut self, count: usize, mut f: impl FnMut(usize)) {
        for _ in 0..count {
            match self.pop() {
                Some(value) => f(value),
                None => break,
            }
        }
    }

    fn push_chunk(&mut self) {
        let chunk = match self.allocator.allocate(CHUNK_BYTES) {
            Some(chunk) => chunk.as_ptr() as *mut Chunk,
            None => crate::utils::oom_abort(),
        };
        unsafe {
            (*chunk).prev = self.top;
            (*chunk).len = 0;
        }
        self.top = chunk;
    }

    fn pop_chunk(&mut self) {
        let chunk = self.top;
        unsafe {
            self.top = (*chunk).prev;
            if let Some(ptr) = NonNull::new(chunk as *mut u8) {
                self.allocator.deallocate(ptr, CHUNK_BYTES);
            }
        }
    }
}

impl Drop for WorkStack {
    fn drop(&mut self) {
        while !self.top.is_null() {
            self.pop_chunk();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{allocator::PagePool, globals::PAGE_SIZE};

    #[test]
    fn push_pop_across_chunks() {
        let pool = Arc::new(PagePool::new(64 * PAGE_SIZE).unwrap());
        let alloc = Arc::new(AggregateAllocator::new(pool));
        let mut stack = WorkStack::new(alloc.clone());
        for i in 0..1000 {
            stack.push(i);
        }
        assert_eq!(stack.len(), 1000);
        for i in (0..1000).rev() {
            assert_eq!(stack.pop(), Some(i));
        }
        assert!(stack.pop().is_none());
        assert_eq!(alloc.allocated_bytes(), 0);
    }
}
