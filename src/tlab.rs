//! Thread local allocation buffers.
//!
//! A buffer owns up to one current region per allocation kind and bump allocates into it
//! without synchronization. When a region is exhausted the buffer retires it to the shared
//! lists and asks the [`RegionSpace`] for a fresh one.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    region::{manager::TL_RAW_POINTER, RegionId, RegionList, RegionType},
    space::{AllocType, RegionSpace},
};

/// Per-thread allocation state. Mutators own one each; GC copy workers create one per job.
pub struct AllocationBuffer {
    young: AtomicU32,
    old: AtomicU32,
    to: AtomicU32,
    raw_pointer: AtomicU32,
    /// Young region taken ahead of time by the finalizer thread.
    prefetched: AtomicU32,
    pub(crate) tl_raw_pointer_regions: RegionList,
    hungry: AtomicBool,
    is_gc_thread: bool,
    acquired_regions: AtomicUsize,
    retired_regions: AtomicUsize,
    allocated_bytes: AtomicUsize,
}

/// Counters kept for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub acquired_regions: usize,
    pub retired_regions: usize,
    pub allocated_bytes: usize,
}

impl AllocationBuffer {
    pub fn new(is_gc_thread: bool) -> Self {
        Self {
            young: AtomicU32::new(RegionId::NONE.0),
            old: AtomicU32::new(RegionId::NONE.0),
            to: AtomicU32::new(RegionId::NONE.0),
            raw_pointer: AtomicU32::new(RegionId::NONE.0),
            prefetched: AtomicU32::new(RegionId::NONE.0),
            tl_raw_pointer_regions: RegionList::new("thread local raw pointer", TL_RAW_POINTER),
            hungry: AtomicBool::new(false),
            is_gc_thread,
            acquired_regions: AtomicUsize::new(0),
            retired_regions: AtomicUsize::new(0),
            allocated_bytes: AtomicUsize::new(0),
        }
    }

    pub fn is_gc_thread(&self) -> bool {
        self.is_gc_thread
    }

    fn slot(&self, kind: AllocType) -> &AtomicU32 {
        match kind {
            AllocType::Young => &self.young,
            AllocType::Old => &self.old,
            AllocType::To => &self.to,
            AllocType::RawPointer => &self.raw_pointer,
            AllocType::NonMovable | AllocType::ReadOnly => {
                unreachable!("{:?} objects are not buffer allocated", kind)
            }
        }
    }

    /// Current region for `kind`, or `RegionId::NONE`.
    pub fn current_region(&self, kind: AllocType) -> RegionId {
        RegionId(self.slot(kind).load(Ordering::Acquire))
    }

    /// Bump allocates `size` bytes of `kind`, refilling from `space` when the current region
    /// is exhausted. Returns 0 when no region could be obtained.
    pub fn allocate(&self, space: &RegionSpace, kind: AllocType, size: usize) -> usize {
        let table = space.manager().table();
        let slot = self.slot(kind);
        let current = RegionId(slot.load(Ordering::Acquire));
        if !current.is_none() {
            let addr = table.desc(current).alloc(size);
            if addr != 0 {
                self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
                return addr;
            }
            slot.store(RegionId::NONE.0, Ordering::Release);
            self.retire_region(space, kind, current);
        }

        let fresh = space.allocate_thread_local_region(self, kind);
        if fresh.is_none() {
            return 0;
        }
        slot.store(fresh.0, Ordering::Release);
        self.acquired_regions.fetch_add(1, Ordering::Relaxed);
        let addr = table.desc(fresh).alloc(size);
        debug_assert_ne!(addr, 0, "fresh region cannot hold {} bytes", size);
        if addr != 0 {
            self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
        }
        addr
    }

    /// Hands a region that left one of the slots back to the shared lists.
    fn retire_region(&self, space: &RegionSpace, kind: AllocType, id: RegionId) {
        let manager = space.manager();
        let table = manager.table();
        match kind {
            AllocType::Young => {
                manager.thread_local_regions.delete(table, id);
                manager
                    .recent_full_regions
                    .prepend(table, id, RegionType::RecentFull);
            }
            AllocType::Old => {
                manager.thread_local_old_regions.delete(table, id);
                manager.old_regions.prepend(table, id, RegionType::Old);
            }
            // to-regions and raw pointer regions already sit on their final list
            AllocType::To | AllocType::RawPointer => {}
            AllocType::NonMovable | AllocType::ReadOnly => unreachable!(),
        }
        self.retired_regions.fetch_add(1, Ordering::Relaxed);
        log::trace!("retired {:?} from {:?} slot", id, kind);
    }

    fn retire_slot(&self, space: &RegionSpace, kind: AllocType) {
        let id = RegionId(self.slot(kind).swap(RegionId::NONE.0, Ordering::AcqRel));
        if !id.is_none() {
            self.retire_region(space, kind, id);
        }
    }

    /// Retires the young and old regions. Runs while the owner is stopped.
    pub(crate) fn retire_for_gc(&self, space: &RegionSpace) {
        self.retire_slot(space, AllocType::Young);
        self.retire_slot(space, AllocType::Old);
    }

    /// Drops the to-region so its fix line can be stamped.
    pub(crate) fn retire_to_region(&self, space: &RegionSpace) {
        self.retire_slot(space, AllocType::To);
    }

    /// Returns every region the buffer still holds. Called when the owner goes away.
    pub(crate) fn release(&self, space: &RegionSpace) {
        self.retire_slot(space, AllocType::Young);
        self.retire_slot(space, AllocType::Old);
        self.retire_slot(space, AllocType::To);
        self.retire_slot(space, AllocType::RawPointer);
        let manager = space.manager();
        let table = manager.table();
        let prefetched = self.take_prefetched();
        if !prefetched.is_none() {
            manager.thread_local_regions.delete(table, prefetched);
            manager
                .recent_full_regions
                .prepend(table, prefetched, RegionType::RecentFull);
        }
        manager.raw_pointer_regions.merge_from(
            table,
            &self.tl_raw_pointer_regions,
            RegionType::RawPointer,
        );
    }

    pub(crate) fn take_prefetched(&self) -> RegionId {
        RegionId(self.prefetched.swap(RegionId::NONE.0, Ordering::AcqRel))
    }

    pub(crate) fn has_prefetched(&self) -> bool {
        self.prefetched.load(Ordering::Acquire) != RegionId::NONE.0
    }

    pub(crate) fn set_prefetched(&self, id: RegionId) {
        let prev = self.prefetched.swap(id.0, Ordering::AcqRel);
        debug_assert_eq!(prev, RegionId::NONE.0);
    }

    pub fn is_hungry(&self) -> bool {
        self.hungry.load(Ordering::Acquire)
    }

    pub(crate) fn set_hungry(&self, hungry: bool) {
        self.hungry.store(hungry, Ordering::Release);
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            acquired_regions: self.acquired_regions.load(Ordering::Relaxed),
            retired_regions: self.retired_regions.load(Ordering::Relaxed),
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Registry of the buffers of attached mutators.
#[derive(Default)]
pub struct AllocBufferManager {
    buffers: Mutex<Vec<Arc<AllocationBuffer>>>,
}

impl AllocBufferManager {
    pub fn register(&self, buffer: Arc<AllocationBuffer>) {
        self.buffers.lock().push(buffer);
    }

    pub fn unregister(&self, buffer: &Arc<AllocationBuffer>) {
        self.buffers.lock().retain(|b| !Arc::ptr_eq(b, buffer));
    }

    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_each(&self, mut f: impl FnMut(&AllocationBuffer)) {
        for buffer in self.buffers.lock().iter() {
            f(buffer);
        }
    }

    pub fn has_hungry_buffers(&self) -> bool {
        self.buffers.lock().iter().any(|b| b.is_hungry())
    }

    /// Gives every hungry buffer a prefetched young region. Returns the number fed.
    pub fn feed_hungry_buffers(&self, space: &RegionSpace) -> usize {
        let hungry: Vec<_> = self
            .buffers
            .lock()
            .iter()
            .filter(|b| b.is_hungry())
            .cloned()
            .collect();
        let mut fed = 0;
        for buffer in hungry {
            if !buffer.has_prefetched() {
                match space
                    .manager()
                    .take_region(1, RegionType::ThreadLocal, true, false)
                {
                    Some(id) => buffer.set_prefetched(id),
                    None => break,
                }
            }
            buffer.set_hungry(false);
            fed += 1;
        }
        if fed > 0 {
            log::debug!("fed {} hungry allocation buffers", fed);
        }
        fed
    }
}
