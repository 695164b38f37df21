//! The region space: routes every allocation request to an allocation buffer, a shared
//! non-moving region or a dedicated large region.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    collector::GcState,
    globals::{ALLOC_ALIGN, LARGE_OBJECT_THRESHOLD, MIN_OBJECT_SIZE, UNIT_SIZE},
    region::{RegionDesc, RegionId, RegionManager, RegionType},
    tlab::{AllocBufferManager, AllocationBuffer},
    utils::checked_align_usize,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum AllocType {
    /// Ordinary movable objects.
    Young,
    /// Movable objects that are expected to live long.
    Old,
    /// Evacuation target. Used by collector workers and copying barriers.
    To,
    /// Objects whose address is handed to native code. Never moved.
    RawPointer,
    /// Pinned objects in shared regions.
    NonMovable,
    /// Objects that are never written after initialization and never collected.
    ReadOnly,
}

pub struct RegionSpace {
    manager: RegionManager,
    buffers: AllocBufferManager,
    gc_state: Arc<GcState>,
    current_pinned: AtomicU32,
    current_read_only: AtomicU32,
    /// Serializes refills of the shared regions.
    shared_refill: Mutex<()>,
}

impl RegionSpace {
    pub fn new(manager: RegionManager, gc_state: Arc<GcState>) -> Self {
        Self {
            manager,
            buffers: AllocBufferManager::default(),
            gc_state,
            current_pinned: AtomicU32::new(RegionId::NONE.0),
            current_read_only: AtomicU32::new(RegionId::NONE.0),
            shared_refill: Mutex::new(()),
        }
    }

    #[inline(always)]
    pub fn manager(&self) -> &RegionManager {
        &self.manager
    }

    pub fn buffers(&self) -> &AllocBufferManager {
        &self.buffers
    }

    /// One allocation attempt. Returns the object address, or 0 on failure.
    pub fn try_allocate_once(
        &self,
        buffer: &AllocationBuffer,
        size: usize,
        alloc_type: AllocType,
    ) -> usize {
        let size = match checked_align_usize(size.max(MIN_OBJECT_SIZE), ALLOC_ALIGN) {
            Some(size) if size <= self.manager.capacity() => size,
            _ => return 0,
        };
        if size >= LARGE_OBJECT_THRESHOLD {
            return self.allocate_large(buffer, size, alloc_type);
        }
        match alloc_type {
            AllocType::NonMovable => self.allocate_shared(
                &self.current_pinned,
                RegionType::RecentPinned,
                size,
                !buffer.is_gc_thread(),
            ),
            AllocType::ReadOnly => self.allocate_shared(
                &self.current_read_only,
                RegionType::ReadOnly,
                size,
                !buffer.is_gc_thread(),
            ),
            AllocType::RawPointer => {
                let addr = buffer.allocate(self, alloc_type, size);
                if addr != 0 {
                    self.note_raw_pointer_object(addr);
                }
                addr
            }
            _ => buffer.allocate(self, alloc_type, size),
        }
    }

    /// Evacuation target for a copy of `size` bytes. Never paces and never triggers a GC.
    pub fn allocate_to(&self, buffer: &AllocationBuffer, size: usize) -> usize {
        buffer.allocate(self, AllocType::To, size)
    }

    fn note_raw_pointer_object(&self, addr: usize) {
        if let Some(desc) = self.manager.table().region_desc_of(addr) {
            desc.inc_raw_pointer_objects();
        }
    }

    fn allocate_large(&self, buffer: &AllocationBuffer, size: usize, alloc_type: AllocType) -> usize {
        let units = size.div_ceil(UNIT_SIZE);
        let gc_thread = buffer.is_gc_thread();
        if !gc_thread {
            self.manager.request_for_region(units * UNIT_SIZE);
        }
        let id = match self
            .manager
            .take_region(units, RegionType::RecentLarge, true, !gc_thread)
        {
            Some(id) => id,
            None => return 0,
        };
        let desc = self.manager.table().desc(id);
        self.stamp_lines(desc);
        let addr = desc.alloc(size);
        if alloc_type == AllocType::RawPointer {
            desc.inc_raw_pointer_objects();
        }
        log::debug!("large object of {} bytes in {:?}", size, id);
        addr
    }

    /// Bump allocation in a region shared by every thread, refilled under `shared_refill`.
    fn allocate_shared(&self, slot: &AtomicU32, ty: RegionType, size: usize, allow_gc: bool) -> usize {
        let table = self.manager.table();
        loop {
            let current = RegionId(slot.load(Ordering::Acquire));
            if !current.is_none() {
                let addr = table.desc(current).atomic_alloc(size);
                if addr != 0 {
                    return addr;
                }
            }
            let _refill = self.shared_refill.lock();
            if slot.load(Ordering::Acquire) != current.0 {
                continue;
            }
            let fresh = match self.manager.take_region(1, ty, true, allow_gc) {
                Some(id) => id,
                None => return 0,
            };
            self.stamp_lines(table.desc(fresh));
            slot.store(fresh.0, Ordering::Release);
        }
    }

    /// Detaches the shared pinned region so it can be swept like any other full one.
    pub(crate) fn retire_shared_pinned_region(&self) {
        let _refill = self.shared_refill.lock();
        self.current_pinned
            .store(RegionId::NONE.0, Ordering::Release);
    }

    /// Takes a fresh region for one of `buffer`'s slots. Returns `RegionId::NONE` and marks the
    /// buffer hungry when none is available.
    pub(crate) fn allocate_thread_local_region(
        &self,
        buffer: &AllocationBuffer,
        kind: AllocType,
    ) -> RegionId {
        let table = self.manager.table();
        if kind == AllocType::Young {
            let prefetched = buffer.take_prefetched();
            if !prefetched.is_none() {
                self.stamp_lines(table.desc(prefetched));
                return prefetched;
            }
        }

        let gc_thread = buffer.is_gc_thread();
        if !gc_thread && kind != AllocType::To && self.manager.request_for_region(UNIT_SIZE) {
            buffer.set_hungry(true);
        }
        let ty = match kind {
            AllocType::Young => RegionType::ThreadLocal,
            AllocType::Old => RegionType::ThreadLocalOld,
            AllocType::To => RegionType::To,
            AllocType::RawPointer => RegionType::TlRawPointer,
            AllocType::NonMovable | AllocType::ReadOnly => unreachable!(),
        };
        let allow_gc = !gc_thread && kind != AllocType::To;
        let id = match self.manager.take_region(1, ty, true, allow_gc) {
            Some(id) => id,
            None => {
                if !gc_thread {
                    buffer.set_hungry(true);
                }
                return RegionId::NONE;
            }
        };
        if ty == RegionType::TlRawPointer {
            buffer.tl_raw_pointer_regions.prepend(table, id, ty);
        }
        self.stamp_lines(table.desc(id));
        id
    }

    /// Objects in a region installed during a cycle sit above its lines and are treated as
    /// live and already in place.
    fn stamp_lines(&self, desc: &RegionDesc) {
        let phase = self.gc_state.phase();
        if phase.is_marking() {
            desc.reset_lines_to_start(true, false);
        } else if phase.is_evacuating() {
            desc.reset_lines_to_start(true, true);
        }
    }

    /// Gives hungry buffers a prefetched region. Run by the finalizer thread.
    pub fn feed_hungry_buffers(&self) -> usize {
        self.buffers.feed_hungry_buffers(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{param::RuntimeParam, statistics::GcStats};

    fn space(units: usize) -> RegionSpace {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut param = RuntimeParam::default();
        param.heap.heap_size = units * UNIT_SIZE;
        param.heap.allocation_rate = 0;
        let state = Arc::new(GcState::default());
        let manager =
            RegionManager::new(&param, state.clone(), Arc::new(GcStats::new(usize::MAX))).unwrap();
        RegionSpace::new(manager, state)
    }

    #[test]
    fn retire_and_acquire_at_region_boundary() {
        let space = space(8);
        let buffer = AllocationBuffer::new(false);
        let size = 1024;
        let per_region = UNIT_SIZE / size;
        for _ in 0..per_region {
            assert_ne!(space.try_allocate_once(&buffer, size, AllocType::Young), 0);
        }
        let stats = buffer.stats();
        assert_eq!(stats.acquired_regions, 1);
        assert_eq!(stats.retired_regions, 0);

        let first = buffer.current_region(AllocType::Young);
        assert_ne!(space.try_allocate_once(&buffer, size, AllocType::Young), 0);
        let stats = buffer.stats();
        assert_eq!(stats.acquired_regions, 2);
        assert_eq!(stats.retired_regions, 1);
        assert_eq!(stats.allocated_bytes, (per_region + 1) * size);

        let table = space.manager().table();
        assert_eq!(table.desc(first).region_type(), RegionType::RecentFull);
        assert!(space.manager().recent_full_regions.contains(table, first));
        assert_eq!(space.manager().thread_local_regions.region_count(), 1);
    }

    #[test]
    fn requests_beyond_capacity_fail_without_taking_regions() {
        let space = space(8);
        let buffer = AllocationBuffer::new(false);
        assert_eq!(space.try_allocate_once(&buffer, usize::MAX - 3, AllocType::Young), 0);
        assert_eq!(
            space.try_allocate_once(&buffer, 9 * UNIT_SIZE, AllocType::Young),
            0
        );
        assert_eq!(space.manager().used_units(), 0);
        assert!(!buffer.is_hungry());
    }

    #[test]
    fn large_and_shared_objects_bypass_the_buffer() {
        let space = space(16);
        let buffer = AllocationBuffer::new(false);
        let large = space.try_allocate_once(&buffer, UNIT_SIZE + 8, AllocType::Young);
        assert_ne!(large, 0);
        assert_eq!(
            space.manager().region_type_of(large),
            Some(RegionType::RecentLarge)
        );
        let id = space.manager().table().region_of(large).unwrap();
        assert_eq!(space.manager().table().desc(id).unit_count(), 2);

        let a = space.try_allocate_once(&buffer, 24, AllocType::NonMovable);
        let b = space.try_allocate_once(&buffer, 24, AllocType::NonMovable);
        assert_eq!(b, a + 24);
        assert_eq!(
            space.manager().region_type_of(a),
            Some(RegionType::RecentPinned)
        );
        assert_eq!(buffer.stats().acquired_regions, 0);
    }

    #[test]
    fn raw_pointer_regions_move_to_the_shared_list_on_release() {
        let space = space(8);
        let buffer = AllocationBuffer::new(false);
        let addr = space.try_allocate_once(&buffer, 64, AllocType::RawPointer);
        let table = space.manager().table();
        let id = table.region_of(addr).unwrap();
        assert_eq!(table.desc(id).raw_pointer_objects(), 1);
        assert_eq!(buffer.tl_raw_pointer_regions.region_count(), 1);

        buffer.release(&space);
        assert!(buffer.tl_raw_pointer_regions.is_empty());
        assert!(space.manager().raw_pointer_regions.contains(table, id));
        assert_eq!(table.desc(id).region_type(), RegionType::RawPointer);
    }

    #[test]
    fn hungry_buffer_is_fed_a_prefetched_region() {
        let space = space(8);
        let buffer = Arc::new(AllocationBuffer::new(false));
        space.buffers().register(buffer.clone());
        buffer.set_hungry(true);
        assert_eq!(space.feed_hungry_buffers(), 1);
        assert!(!buffer.is_hungry());
        assert!(buffer.has_prefetched());
        space.try_allocate_once(&buffer, 32, AllocType::Young);
        assert!(!buffer.has_prefetched());
        assert_eq!(space.manager().thread_local_regions.region_count(), 1);
    }
}
