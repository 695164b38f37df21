//! Region lifecycle: carving regions out of the reserved heap, the per-type region lists,
//! and returning units to the dirty and released free trees.

use std::{
    f64::consts::PI,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, OnceLock, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;

use super::{
    desc::{RegionId, RegionTable, RegionType},
    list::{RegionList, RegionListStats},
};
use crate::{
    allocator::FreeIntervalTree,
    collector::{GCReason, GcState, GcTrigger},
    error::Result,
    globals::{MB, UNIT_SIZE},
    internal::region_bitmap::HeapBitmapManager,
    mmap::PlatformMemory,
    param::{HeapParam, RuntimeParam},
    statistics::{GcStats, HeapStatistics},
    utils::nano_time,
};

pub(crate) const GARBAGE: u8 = 0;
pub(crate) const THREAD_LOCAL: u8 = 1;
pub(crate) const THREAD_LOCAL_OLD: u8 = 2;
pub(crate) const RECENT_FULL: u8 = 3;
pub(crate) const FROM: u8 = 4;
pub(crate) const TO: u8 = 5;
pub(crate) const OLD: u8 = 6;
pub(crate) const RECENT_PINNED: u8 = 7;
pub(crate) const FULL_PINNED: u8 = 8;
pub(crate) const RAW_POINTER: u8 = 9;
/// Shared by the private raw-pointer lists of every allocation buffer.
pub(crate) const TL_RAW_POINTER: u8 = 10;
pub(crate) const RECENT_LARGE: u8 = 11;
pub(crate) const OLD_LARGE: u8 = 12;
pub(crate) const READ_ONLY: u8 = 13;
pub(crate) const APP_SPAWN: u8 = 14;

/// Length of one pacing window.
const PACING_WINDOW_NS: u64 = 100_000_000;
/// Share of the allocation rate that stays available however full the heap is.
const MIN_BUDGET_FRACTION: f64 = 0.1;

/// Allowed allocation rate in bytes per second for a heap with `live` of `capacity` bytes in
/// use. Equal to `rate` for an empty heap and falls along a half cosine to a tenth of it.
pub fn allocation_rate_budget(rate: f64, live: f64, capacity: f64) -> f64 {
    if capacity <= 0.0 {
        return rate;
    }
    let ratio = (live / capacity).clamp(0.0, 1.0);
    let factor = 0.5 * (1.0 + (ratio * PI).cos());
    rate * (MIN_BUDGET_FRACTION + (1.0 - MIN_BUDGET_FRACTION) * factor)
}

struct PacingWindow {
    start_ns: u64,
    bytes: usize,
}

pub struct RegionManager {
    memory: PlatformMemory,
    table: RegionTable,
    bitmaps: HeapBitmapManager,
    dirty_units: Mutex<FreeIntervalTree>,
    released_units: Mutex<FreeIntervalTree>,
    /// Units at and above this index have never been handed out.
    inactive_zone: AtomicUsize,
    used_units: AtomicUsize,

    pub(crate) garbage_regions: RegionList,
    pub(crate) thread_local_regions: RegionList,
    pub(crate) thread_local_old_regions: RegionList,
    pub(crate) recent_full_regions: RegionList,
    pub(crate) from_regions: RegionList,
    pub(crate) to_regions: RegionList,
    pub(crate) old_regions: RegionList,
    pub(crate) recent_pinned_regions: RegionList,
    pub(crate) full_pinned_regions: RegionList,
    pub(crate) raw_pointer_regions: RegionList,
    pub(crate) recent_large_regions: RegionList,
    pub(crate) old_large_regions: RegionList,
    pub(crate) read_only_regions: RegionList,
    pub(crate) app_spawn_regions: RegionList,

    pacing: Mutex<PacingWindow>,
    param: HeapParam,
    young_gc_enabled: bool,
    gc_state: Arc<GcState>,
    stats: Arc<GcStats>,
    trigger: OnceLock<Weak<dyn GcTrigger>>,
}

impl RegionManager {
    pub fn new(param: &RuntimeParam, gc_state: Arc<GcState>, stats: Arc<GcStats>) -> Result<Self> {
        let unit_count = param.unit_count();
        let memory = PlatformMemory::reserve(unit_count * UNIT_SIZE, UNIT_SIZE)?;
        memory.name(c"strata_heap");
        let heap_start = memory.start() as usize;
        let table = RegionTable::new(heap_start, unit_count);
        let bitmaps = HeapBitmapManager::new(heap_start, unit_count)?;
        log::debug!(
            "reserved heap [{:#x}, {:#x}) with {} units",
            heap_start,
            table.heap_end(),
            unit_count
        );
        Ok(Self {
            memory,
            table,
            bitmaps,
            dirty_units: Mutex::new(FreeIntervalTree::new()),
            released_units: Mutex::new(FreeIntervalTree::new()),
            inactive_zone: AtomicUsize::new(0),
            used_units: AtomicUsize::new(0),
            garbage_regions: RegionList::new("garbage", GARBAGE),
            thread_local_regions: RegionList::new("thread local", THREAD_LOCAL),
            thread_local_old_regions: RegionList::new("thread local old", THREAD_LOCAL_OLD),
            recent_full_regions: RegionList::new("recent full", RECENT_FULL),
            from_regions: RegionList::new("from", FROM),
            to_regions: RegionList::new("to", TO),
            old_regions: RegionList::new("old", OLD),
            recent_pinned_regions: RegionList::new("recent pinned", RECENT_PINNED),
            full_pinned_regions: RegionList::new("full pinned", FULL_PINNED),
            raw_pointer_regions: RegionList::new("raw pointer", RAW_POINTER),
            recent_large_regions: RegionList::new("recent large", RECENT_LARGE),
            old_large_regions: RegionList::new("old large", OLD_LARGE),
            read_only_regions: RegionList::new("read only", READ_ONLY),
            app_spawn_regions: RegionList::new("appspawn", APP_SPAWN),
            pacing: Mutex::new(PacingWindow {
                start_ns: nano_time(),
                bytes: 0,
            }),
            param: param.heap.clone(),
            young_gc_enabled: param.gc.enable_young_gc,
            gc_state,
            stats,
            trigger: OnceLock::new(),
        })
    }

    /// Installs the hook used to request heuristic collections. Only the first call wins.
    pub fn set_gc_trigger(&self, trigger: Weak<dyn GcTrigger>) {
        let _ = self.trigger.set(trigger);
    }

    #[inline(always)]
    pub fn table(&self) -> &RegionTable {
        &self.table
    }

    #[inline(always)]
    pub fn bitmaps(&self) -> &HeapBitmapManager {
        &self.bitmaps
    }

    pub fn capacity(&self) -> usize {
        self.table.unit_count() * UNIT_SIZE
    }

    pub fn used_units(&self) -> usize {
        self.used_units.load(Ordering::Acquire)
    }

    pub fn dirty_unit_count(&self) -> usize {
        self.dirty_units.lock().total_count()
    }

    pub fn released_unit_count(&self) -> usize {
        self.released_units.lock().total_count()
    }

    pub fn region_type_of(&self, addr: usize) -> Option<RegionType> {
        self.table.region_desc_of(addr).map(|desc| desc.region_type())
    }

    /// Bytes held by regions allocated into since the last collection.
    pub fn young_bytes(&self) -> usize {
        (self.thread_local_regions.unit_count() + self.recent_full_regions.unit_count()) * UNIT_SIZE
    }

    /// The list a freshly taken region of type `ty` is put on. Raw-pointer regions taken by
    /// an allocation buffer go on its private list instead.
    pub(crate) fn list_for(&self, ty: RegionType) -> Option<&RegionList> {
        Some(match ty {
            RegionType::Garbage => &self.garbage_regions,
            RegionType::ThreadLocal => &self.thread_local_regions,
            RegionType::ThreadLocalOld => &self.thread_local_old_regions,
            RegionType::RecentFull => &self.recent_full_regions,
            RegionType::From => &self.from_regions,
            RegionType::To => &self.to_regions,
            RegionType::Old => &self.old_regions,
            RegionType::RecentPinned => &self.recent_pinned_regions,
            RegionType::FullPinned => &self.full_pinned_regions,
            RegionType::RawPointer => &self.raw_pointer_regions,
            RegionType::RecentLarge => &self.recent_large_regions,
            RegionType::OldLarge => &self.old_large_regions,
            RegionType::ReadOnly => &self.read_only_regions,
            RegionType::AppSpawn => &self.app_spawn_regions,
            RegionType::Free | RegionType::TlRawPointer => return None,
        })
    }

    pub(crate) fn all_lists(&self) -> [&RegionList; 14] {
        [
            &self.garbage_regions,
            &self.thread_local_regions,
            &self.thread_local_old_regions,
            &self.recent_full_regions,
            &self.from_regions,
            &self.to_regions,
            &self.old_regions,
            &self.recent_pinned_regions,
            &self.full_pinned_regions,
            &self.raw_pointer_regions,
            &self.recent_large_regions,
            &self.old_large_regions,
            &self.read_only_regions,
            &self.app_spawn_regions,
        ]
    }

    /// Creates a region of `unit_count` units and puts it on the list for `ty`.
    /// `None` means the reserved address space is exhausted.
    pub fn take_region(
        &self,
        unit_count: usize,
        ty: RegionType,
        expect_physical_mem: bool,
        allow_gc: bool,
    ) -> Option<RegionId> {
        if allow_gc {
            self.maybe_trigger_gc();
        }
        let id = match self.try_take_region(unit_count, ty, expect_physical_mem) {
            Some(id) => id,
            None => {
                if !self.garbage_regions.is_empty() {
                    self.reclaim_garbage_regions();
                } else if unit_count > 1 {
                    self.release_dirty_units(0);
                }
                self.try_take_region(unit_count, ty, expect_physical_mem)?
            }
        };
        if unit_count >= self.param.huge_page_units {
            let desc = self.table.desc(id);
            self.memory
                .advise_huge_page(desc.start() as *mut u8, desc.size(), true);
        }
        if let Some(list) = self.list_for(ty) {
            list.prepend(&self.table, id, ty);
        }
        Some(id)
    }

    fn try_take_region(
        &self,
        unit_count: usize,
        ty: RegionType,
        expect_physical_mem: bool,
    ) -> Option<RegionId> {
        let reused = self.garbage_regions.take_first(&self.table, |id| {
            self.table.desc(id).unit_count() == unit_count
        });
        if let Some(id) = reused {
            self.clear_region_content(id);
            self.table.reset_region(id, ty);
            log::debug!("reuse garbage {:?} ({} units) as {:?}", id, unit_count, ty);
            return Some(id);
        }

        let oversized = self.garbage_regions.take_first(&self.table, |id| {
            self.table.desc(id).unit_count() > unit_count
        });
        if let Some(id) = oversized {
            self.reclaim_region(id);
        }

        let index = self.take_free_units(unit_count, expect_physical_mem)?;
        let id = RegionId(index as u32);
        self.table.init_region(id, unit_count, ty);
        self.used_units.fetch_add(unit_count, Ordering::AcqRel);
        log::debug!("take {:?} ({} units) as {:?}", id, unit_count, ty);
        Some(id)
    }

    fn take_free_units(&self, unit_count: usize, expect_physical_mem: bool) -> Option<usize> {
        if let Some(index) = self.dirty_units.lock().take(unit_count as u32) {
            return Some(index as usize);
        }
        if let Some(index) = self.released_units.lock().take(unit_count as u32) {
            self.commit_units(index as usize, unit_count, expect_physical_mem);
            return Some(index as usize);
        }
        let total = self.table.unit_count();
        let mut zone = self.inactive_zone.load(Ordering::Acquire);
        loop {
            if zone + unit_count > total {
                return None;
            }
            match self.inactive_zone.compare_exchange_weak(
                zone,
                zone + unit_count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => zone = actual,
            }
        }
        self.commit_units(zone, unit_count, expect_physical_mem);
        Some(zone)
    }

    fn commit_units(&self, index: usize, unit_count: usize, expect_physical_mem: bool) {
        self.memory.commit(
            self.table.unit_address(index) as *mut u8,
            unit_count * UNIT_SIZE,
            expect_physical_mem,
        );
    }

    /// Zeroes the allocated part of the region and drops its mark and remembered bits.
    fn clear_region_content(&self, id: RegionId) {
        let desc = self.table.desc(id);
        let used = desc.allocated_bytes();
        if used > 0 {
            unsafe {
                std::ptr::write_bytes(desc.start() as *mut u8, 0, used);
            }
        }
        self.bitmaps.clear_region(id.index(), desc.unit_count());
    }

    /// Returns an unlisted region's units to the dirty tree. The memory stays committed and
    /// is zeroed.
    pub fn reclaim_region(&self, id: RegionId) {
        self.clear_region_content(id);
        let count = self.table.free_region_units(id);
        self.used_units.fetch_sub(count, Ordering::AcqRel);
        self.dirty_units.lock().insert(id.0, count as u32);
        log::debug!("reclaim {:?} ({} units) to dirty", id, count);
    }

    /// Returns an unlisted region's units to the released tree and decommits them.
    pub fn release_region(&self, id: RegionId) {
        let desc = self.table.desc(id);
        let start = desc.start();
        let size = desc.size();
        self.bitmaps.clear_region(id.index(), desc.unit_count());
        if desc.unit_count() >= self.param.huge_page_units {
            self.memory.advise_huge_page(start as *mut u8, size, false);
        }
        self.memory.dontneed(start as *mut u8, size);
        let count = self.table.free_region_units(id);
        self.used_units.fetch_sub(count, Ordering::AcqRel);
        self.released_units.lock().insert(id.0, count as u32);
        log::debug!("release {:?} ({} units)", id, count);
    }

    /// Empties the garbage list. Huge regions are released, the rest go to the dirty tree.
    /// Returns the number of bytes reclaimed.
    pub fn reclaim_garbage_regions(&self) -> usize {
        let mut bytes = 0;
        while let Some(id) = self.garbage_regions.take_head(&self.table) {
            let desc = self.table.desc(id);
            bytes += desc.size();
            if desc.unit_count() >= self.param.huge_page_units {
                self.release_region(id);
            } else {
                self.reclaim_region(id);
            }
        }
        if bytes > 0 {
            log::debug!("reclaimed {} bytes of garbage regions", bytes);
        }
        bytes
    }

    /// Decommits dirty units until at most `keep` remain. Returns the number released.
    pub fn release_dirty_units(&self, keep: usize) -> usize {
        let mut released = 0;
        loop {
            let interval = {
                let mut dirty = self.dirty_units.lock();
                let excess = dirty.total_count().saturating_sub(keep);
                if excess == 0 {
                    break;
                }
                dirty.pop_highest().map(|(start, count)| {
                    if count as usize > excess {
                        let kept = count - excess as u32;
                        dirty.insert(start, kept);
                        (start + kept, excess as u32)
                    } else {
                        (start, count)
                    }
                })
            };
            let (start, count) = match interval {
                Some(interval) => interval,
                None => break,
            };
            self.memory.dontneed(
                self.table.unit_address(start as usize) as *mut u8,
                count as usize * UNIT_SIZE,
            );
            self.released_units.lock().insert(start, count);
            released += count as usize;
        }
        if released > 0 {
            log::debug!("released {} dirty units", released);
        }
        released
    }

    /// Paces region refills against the allocation-rate budget. Returns true if the caller
    /// was delayed.
    pub fn request_for_region(&self, size: usize) -> bool {
        if self.param.allocation_rate == 0 {
            return false;
        }
        let budget = allocation_rate_budget(
            (self.param.allocation_rate * MB) as f64,
            self.stats.live_bytes_after_gc() as f64,
            self.capacity() as f64,
        );
        let now = nano_time();
        let delay_ns = {
            let mut window = self.pacing.lock();
            if now.saturating_sub(window.start_ns) > PACING_WINDOW_NS {
                window.start_ns = now;
                window.bytes = 0;
            }
            window.bytes += size;
            let elapsed = now.saturating_sub(window.start_ns) as f64 / 1e9;
            let allowed = budget * elapsed;
            let requested = window.bytes as f64;
            if requested <= allowed {
                0
            } else {
                ((requested - allowed) / budget * 1e9) as u64
            }
        };
        if delay_ns == 0 {
            return false;
        }
        let delay = Duration::from_nanos(delay_ns).min(self.param.allocation_wait_time);
        log::debug!("pacing region request of {} bytes for {:?}", size, delay);
        std::thread::sleep(delay);
        true
    }

    fn maybe_trigger_gc(&self) {
        if self.gc_state.is_gc_running() {
            return;
        }
        let trigger = match self.trigger.get().and_then(Weak::upgrade) {
            Some(trigger) => trigger,
            None => return,
        };
        if self.young_gc_enabled
            && self.young_bytes() as f64 >= self.capacity() as f64 * self.param.young_budget_ratio
        {
            trigger.trigger_gc(GCReason::Young);
            return;
        }
        if self.used_units() * UNIT_SIZE >= self.stats.heap_threshold() {
            trigger.trigger_gc(GCReason::Heu);
        }
    }

    /// Moves recent large regions onto the old large list so they can be swept.
    pub fn assemble_large_garbage_candidates(&self) {
        self.old_large_regions.merge_from(
            &self.table,
            &self.recent_large_regions,
            RegionType::OldLarge,
        );
    }

    /// Moves recent pinned regions onto the full pinned list so they can be swept. The
    /// shared pinned region must have been retired first.
    pub fn assemble_pinned_garbage_candidates(&self) {
        self.full_pinned_regions.merge_from(
            &self.table,
            &self.recent_pinned_regions,
            RegionType::FullPinned,
        );
    }

    pub fn region_stats(&self) -> Vec<(&'static str, RegionListStats)> {
        self.all_lists()
            .iter()
            .map(|list| (list.name(), list.stats(&self.table)))
            .collect()
    }

    pub(crate) fn fill_statistics(&self, out: &mut HeapStatistics) {
        out.heap_size = self.capacity();
        out.used_units = self.used_units();
        out.dirty_free_units = self.dirty_unit_count();
        out.released_free_units = self.released_unit_count();
        out.lists = self.region_stats();
        out.fill_gc_counters(&self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectRef, TypeInfo};

    static CELL: TypeInfo = TypeInfo::fixed("Cell", 16, &[]);

    fn manager(units: usize) -> RegionManager {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut param = RuntimeParam::default();
        param.heap.heap_size = units * UNIT_SIZE;
        param.heap.allocation_rate = 0;
        RegionManager::new(
            &param,
            Arc::new(GcState::default()),
            Arc::new(GcStats::new(usize::MAX)),
        )
        .unwrap()
    }

    #[test]
    fn budget_decreases_with_live_bytes() {
        let rate = 1024.0 * 1024.0;
        let mut previous = f64::MAX;
        for step in 0..=10 {
            let budget = allocation_rate_budget(rate, step as f64 * 10.0, 100.0);
            assert!(budget <= previous);
            previous = budget;
        }
        assert_eq!(allocation_rate_budget(rate, 0.0, 100.0), rate);
        assert!((allocation_rate_budget(rate, 100.0, 100.0) - rate * 0.1).abs() < 1e-6);
    }

    #[test]
    fn take_and_reclaim_keep_unit_accounting() {
        let manager = manager(8);
        let a = manager
            .take_region(1, RegionType::ThreadLocal, true, false)
            .unwrap();
        let b = manager
            .take_region(3, RegionType::RecentLarge, true, false)
            .unwrap();
        assert_eq!(manager.used_units(), 4);
        assert_eq!(manager.thread_local_regions.region_count(), 1);
        assert_eq!(manager.recent_large_regions.unit_count(), 3);

        manager.thread_local_regions.delete(manager.table(), a);
        manager.reclaim_region(a);
        assert_eq!(manager.used_units(), 3);
        assert_eq!(manager.dirty_unit_count(), 1);

        manager.recent_large_regions.delete(manager.table(), b);
        manager.release_region(b);
        assert_eq!(manager.used_units(), 0);
        assert_eq!(manager.released_unit_count(), 3);
        assert_eq!(manager.table().region_of(manager.table().heap_start()), None);
    }

    #[test]
    fn exhaustion_returns_none() {
        let manager = manager(4);
        for _ in 0..4 {
            assert!(manager
                .take_region(1, RegionType::Old, false, false)
                .is_some());
        }
        assert!(manager
            .take_region(1, RegionType::Old, false, false)
            .is_none());
    }

    #[test]
    fn garbage_region_of_same_size_is_reused_zeroed() {
        let manager = manager(4);
        let table = manager.table();
        let id = manager
            .take_region(1, RegionType::RecentFull, true, false)
            .unwrap();
        let addr = table.desc(id).alloc(CELL.instance_size(0));
        ObjectRef::from_address(addr)
            .unwrap()
            .header()
            .install_type(&CELL);
        manager.recent_full_regions.delete(table, id);
        manager.garbage_regions.prepend(table, id, RegionType::Garbage);

        let reused = manager
            .take_region(1, RegionType::ThreadLocal, true, false)
            .unwrap();
        assert_eq!(reused, id);
        assert_eq!(table.desc(id).allocated_bytes(), 0);
        assert_eq!(table.desc(id).region_type(), RegionType::ThreadLocal);
        assert_eq!(unsafe { *(addr as *const usize) }, 0);
        assert!(manager.garbage_regions.is_empty());
    }

    #[test]
    fn dirty_units_are_released_down_to_the_cache() {
        let manager = manager(8);
        let ids: Vec<_> = (0..4)
            .map(|_| {
                manager
                    .take_region(1, RegionType::Old, true, false)
                    .unwrap()
            })
            .collect();
        for id in ids {
            manager.old_regions.delete(manager.table(), id);
            manager.reclaim_region(id);
        }
        assert_eq!(manager.dirty_unit_count(), 4);
        assert_eq!(manager.release_dirty_units(1), 3);
        assert_eq!(manager.dirty_unit_count(), 1);
        assert_eq!(manager.released_unit_count(), 3);
        // a multi-unit request can be served from the released tree
        assert!(manager
            .take_region(3, RegionType::RecentLarge, true, false)
            .is_some());
    }
}
