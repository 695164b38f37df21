use std::{
    fmt,
    sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering},
};

use modular_bitfield::prelude::*;

use crate::globals::{BITMAP_PARTS, UNIT_SHIFT, UNIT_SIZE};

/// Stable handle of a region: the index of its head unit.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u32);

impl RegionId {
    pub const NONE: RegionId = RegionId(u32::MAX);

    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline(always)]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Debug for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "Region(none)")
        } else {
            write!(f, "Region({})", self.0)
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
#[repr(u8)]
pub enum RegionType {
    Free = 0,
    Garbage,
    ThreadLocal,
    RecentFull,
    From,
    To,
    Old,
    ThreadLocalOld,
    RecentPinned,
    FullPinned,
    RawPointer,
    TlRawPointer,
    RecentLarge,
    OldLarge,
    ReadOnly,
    AppSpawn,
}

impl RegionType {
    const ALL: [RegionType; 16] = [
        RegionType::Free,
        RegionType::Garbage,
        RegionType::ThreadLocal,
        RegionType::RecentFull,
        RegionType::From,
        RegionType::To,
        RegionType::Old,
        RegionType::ThreadLocalOld,
        RegionType::RecentPinned,
        RegionType::FullPinned,
        RegionType::RawPointer,
        RegionType::TlRawPointer,
        RegionType::RecentLarge,
        RegionType::OldLarge,
        RegionType::ReadOnly,
        RegionType::AppSpawn,
    ];

    fn from_bits(bits: u8) -> Self {
        Self::ALL[bits as usize]
    }

    /// Regions allocated into since the last collection.
    pub fn is_young(self) -> bool {
        matches!(self, RegionType::ThreadLocal | RegionType::RecentFull)
    }

    /// Regions whose objects never move.
    pub fn is_non_movable(self) -> bool {
        matches!(
            self,
            RegionType::RecentPinned
                | RegionType::FullPinned
                | RegionType::RawPointer
                | RegionType::TlRawPointer
                | RegionType::RecentLarge
                | RegionType::OldLarge
                | RegionType::ReadOnly
        )
    }

    pub fn is_large(self) -> bool {
        matches!(self, RegionType::RecentLarge | RegionType::OldLarge)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum UnitRole {
    Free = 0,
    Head = 1,
    Subordinate = 2,
}

/// Marks a region that is on no list.
pub const NO_LIST: u8 = 0x1f;

#[bitfield(bits = 16)]
#[derive(Clone, Copy)]
struct RegionMeta {
    region_type: B5,
    role: B2,
    fix_in_place: bool,
    list_tag: B5,
    #[skip]
    __: B3,
}

impl RegionMeta {
    fn from_word(word: u16) -> Self {
        Self::from_bytes(word.to_le_bytes())
    }

    fn to_word(self) -> u16 {
        u16::from_le_bytes(self.into_bytes())
    }
}

/// Out-of-line descriptor of one heap unit. Only head units carry region state.
pub struct RegionDesc {
    start: usize,
    meta: AtomicU16,
    head: AtomicU32,
    unit_count: AtomicU32,
    end: AtomicUsize,
    alloc_ptr: AtomicUsize,
    live_bytes: AtomicUsize,
    trace_line: AtomicUsize,
    copy_line: AtomicUsize,
    fix_line: AtomicUsize,
    pub(crate) prev: AtomicU32,
    pub(crate) next: AtomicU32,
    raw_pointer_objects: AtomicU32,
    live_parts: [AtomicUsize; BITMAP_PARTS],
}

impl RegionDesc {
    fn new(start: usize) -> Self {
        let meta = RegionMeta::new()
            .with_region_type(RegionType::Free as u8)
            .with_role(UnitRole::Free as u8)
            .with_list_tag(NO_LIST);
        Self {
            start,
            meta: AtomicU16::new(meta.to_word()),
            head: AtomicU32::new(u32::MAX),
            unit_count: AtomicU32::new(0),
            end: AtomicUsize::new(start),
            alloc_ptr: AtomicUsize::new(start),
            live_bytes: AtomicUsize::new(0),
            trace_line: AtomicUsize::new(start),
            copy_line: AtomicUsize::new(start),
            fix_line: AtomicUsize::new(start),
            prev: AtomicU32::new(u32::MAX),
            next: AtomicU32::new(u32::MAX),
            raw_pointer_objects: AtomicU32::new(0),
            live_parts: Default::default(),
        }
    }

    #[inline]
    fn meta(&self) -> RegionMeta {
        RegionMeta::from_word(self.meta.load(Ordering::Acquire))
    }

    fn update_meta(&self, f: impl Fn(RegionMeta) -> RegionMeta) {
        let mut current = self.meta.load(Ordering::Acquire);
        loop {
            let next = f(RegionMeta::from_word(current)).to_word();
            match self.meta.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    pub fn region_type(&self) -> RegionType {
        RegionType::from_bits(self.meta().region_type())
    }

    pub(crate) fn set_region_type(&self, ty: RegionType) {
        self.update_meta(|m| m.with_region_type(ty as u8));
    }

    pub fn role(&self) -> UnitRole {
        match self.meta().role() {
            0 => UnitRole::Free,
            1 => UnitRole::Head,
            _ => UnitRole::Subordinate,
        }
    }

    pub(crate) fn list_tag(&self) -> u8 {
        self.meta().list_tag()
    }

    /// Sets list membership and region type in one step.
    pub(crate) fn set_list_and_type(&self, tag: u8, ty: RegionType) {
        self.update_meta(|m| m.with_list_tag(tag).with_region_type(ty as u8));
    }

    /// Whether this from-region was demoted: its objects stay where they are.
    #[inline]
    pub fn is_fix_in_place(&self) -> bool {
        self.meta().fix_in_place()
    }

    pub(crate) fn set_fix_in_place(&self, value: bool) {
        self.update_meta(|m| m.with_fix_in_place(value));
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    pub fn unit_count(&self) -> usize {
        self.unit_count.load(Ordering::Acquire) as usize
    }

    pub fn size(&self) -> usize {
        self.end() - self.start
    }

    #[inline(always)]
    pub fn alloc_ptr(&self) -> usize {
        self.alloc_ptr.load(Ordering::Acquire)
    }

    pub fn allocated_bytes(&self) -> usize {
        self.alloc_ptr() - self.start
    }

    pub fn available_bytes(&self) -> usize {
        self.end() - self.alloc_ptr()
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Bump allocation by the region's single owner. Returns 0 when the region is exhausted.
    #[inline]
    pub fn alloc(&self, size: usize) -> usize {
        let top = self.alloc_ptr.load(Ordering::Relaxed);
        if top + size > self.end.load(Ordering::Relaxed) {
            return 0;
        }
        self.alloc_ptr.store(top + size, Ordering::Release);
        top
    }

    /// Bump allocation for regions shared between threads.
    pub fn atomic_alloc(&self, size: usize) -> usize {
        let end = self.end();
        let mut top = self.alloc_ptr.load(Ordering::Acquire);
        loop {
            if top + size > end {
                return 0;
            }
            match self.alloc_ptr.compare_exchange_weak(
                top,
                top + size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return top,
                Err(actual) => top = actual,
            }
        }
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn add_live_bytes(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn live_parts(&self) -> &[AtomicUsize; BITMAP_PARTS] {
        &self.live_parts
    }

    pub(crate) fn reset_live_info(&self) {
        self.live_bytes.store(0, Ordering::Release);
        for part in &self.live_parts {
            part.store(0, Ordering::Relaxed);
        }
    }

    pub fn trace_line(&self) -> usize {
        self.trace_line.load(Ordering::Acquire)
    }

    pub fn copy_line(&self) -> usize {
        self.copy_line.load(Ordering::Acquire)
    }

    pub fn fix_line(&self) -> usize {
        self.fix_line.load(Ordering::Acquire)
    }

    pub(crate) fn set_trace_line(&self) {
        self.trace_line.store(self.alloc_ptr(), Ordering::Release);
    }

    pub(crate) fn set_copy_line(&self) {
        self.copy_line.store(self.alloc_ptr(), Ordering::Release);
    }

    pub(crate) fn set_fix_line(&self) {
        self.fix_line.store(self.alloc_ptr(), Ordering::Release);
    }

    /// Stamps the lines of a region that starts life in the middle of a collection.
    pub(crate) fn reset_lines_to_start(&self, trace: bool, copy_and_fix: bool) {
        if trace {
            self.trace_line.store(self.start, Ordering::Release);
        }
        if copy_and_fix {
            self.copy_line.store(self.start, Ordering::Release);
            self.fix_line.store(self.start, Ordering::Release);
        }
    }

    /// Objects at or above the trace line were allocated during marking and are live.
    #[inline]
    pub fn is_new_object_since_trace(&self, addr: usize) -> bool {
        addr >= self.trace_line()
    }

    /// True after marking when the region holds no live object and nothing was allocated
    /// into it since the trace line.
    pub fn is_garbage_after_mark(&self) -> bool {
        self.live_bytes() == 0 && self.trace_line() >= self.alloc_ptr()
    }

    pub fn raw_pointer_objects(&self) -> u32 {
        self.raw_pointer_objects.load(Ordering::Acquire)
    }

    pub(crate) fn inc_raw_pointer_objects(&self) {
        self.raw_pointer_objects.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_raw_pointer_objects(&self) {
        let prev = self.raw_pointer_objects.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "raw pointer count underflow in region at {:#x}", self.start);
    }

}

/// Dense descriptor array covering every unit of the heap.
pub struct RegionTable {
    descs: Box<[RegionDesc]>,
    heap_start: usize,
    heap_end: usize,
}

impl RegionTable {
    pub fn new(heap_start: usize, unit_count: usize) -> Self {
        let descs = (0..unit_count)
            .map(|i| RegionDesc::new(heap_start + (i << UNIT_SHIFT)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            descs,
            heap_start,
            heap_end: heap_start + unit_count * UNIT_SIZE,
        }
    }

    pub fn unit_count(&self) -> usize {
        self.descs.len()
    }

    pub fn heap_start(&self) -> usize {
        self.heap_start
    }

    pub fn heap_end(&self) -> usize {
        self.heap_end
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.heap_start && addr < self.heap_end
    }

    #[inline(always)]
    pub fn desc(&self, id: RegionId) -> &RegionDesc {
        &self.descs[id.index()]
    }

    #[inline(always)]
    pub fn unit_address(&self, index: usize) -> usize {
        self.heap_start + (index << UNIT_SHIFT)
    }

    #[inline(always)]
    pub fn unit_index_of(&self, addr: usize) -> usize {
        (addr - self.heap_start) >> UNIT_SHIFT
    }

    /// Region holding `addr`, or `None` for addresses outside the heap or in free units.
    #[inline]
    pub fn region_of(&self, addr: usize) -> Option<RegionId> {
        if !self.contains(addr) {
            return None;
        }
        let index = self.unit_index_of(addr);
        let unit = &self.descs[index];
        match unit.role() {
            UnitRole::Head => Some(RegionId(index as u32)),
            UnitRole::Subordinate => Some(RegionId(unit.head.load(Ordering::Acquire))),
            UnitRole::Free => None,
        }
    }

    #[inline]
    pub fn region_desc_of(&self, addr: usize) -> Option<&RegionDesc> {
        self.region_of(addr).map(|id| self.desc(id))
    }

    /// Turns `unit_count` free units starting at `id` into one region of type `ty`.
    pub(crate) fn init_region(&self, id: RegionId, unit_count: usize, ty: RegionType) {
        let head = self.desc(id);
        assert_eq!(
            head.role(),
            UnitRole::Free,
            "initializing {:?} which is still in use",
            id
        );
        for i in 1..unit_count {
            let unit = &self.descs[id.index() + i];
            unit.head.store(id.0, Ordering::Release);
            unit.update_meta(|m| m.with_role(UnitRole::Subordinate as u8));
        }
        let start = head.start;
        head.unit_count.store(unit_count as u32, Ordering::Release);
        head.end.store(start + unit_count * UNIT_SIZE, Ordering::Release);
        head.alloc_ptr.store(start, Ordering::Release);
        head.trace_line.store(start, Ordering::Release);
        head.copy_line.store(start, Ordering::Release);
        head.fix_line.store(start, Ordering::Release);
        head.raw_pointer_objects.store(0, Ordering::Release);
        head.prev.store(u32::MAX, Ordering::Release);
        head.next.store(u32::MAX, Ordering::Release);
        head.reset_live_info();
        head.update_meta(|m| {
            m.with_role(UnitRole::Head as u8)
                .with_region_type(ty as u8)
                .with_fix_in_place(false)
                .with_list_tag(NO_LIST)
        });
    }

    /// Reuses a region of the same size without returning its units.
    pub(crate) fn reset_region(&self, id: RegionId, ty: RegionType) {
        let head = self.desc(id);
        let start = head.start;
        head.alloc_ptr.store(start, Ordering::Release);
        head.trace_line.store(start, Ordering::Release);
        head.copy_line.store(start, Ordering::Release);
        head.fix_line.store(start, Ordering::Release);
        head.raw_pointer_objects.store(0, Ordering::Release);
        head.reset_live_info();
        head.update_meta(|m| m.with_region_type(ty as u8).with_fix_in_place(false));
    }

    /// Returns every unit of the region to the free role.
    pub(crate) fn free_region_units(&self, id: RegionId) -> usize {
        let head = self.desc(id);
        let count = head.unit_count();
        for i in (0..count).rev() {
            let unit = &self.descs[id.index() + i];
            unit.head.store(u32::MAX, Ordering::Release);
            unit.update_meta(|m| {
                m.with_role(UnitRole::Free as u8)
                    .with_region_type(RegionType::Free as u8)
                    .with_fix_in_place(false)
            });
        }
        head.unit_count.store(0, Ordering::Release);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_word_round_trip() {
        let table = RegionTable::new(0x1000_0000, 8);
        let id = RegionId(2);
        table.init_region(id, 3, RegionType::ThreadLocal);
        let desc = table.desc(id);
        assert_eq!(desc.region_type(), RegionType::ThreadLocal);
        assert_eq!(desc.role(), UnitRole::Head);
        assert_eq!(desc.list_tag(), NO_LIST);
        desc.set_fix_in_place(true);
        desc.set_list_and_type(3, RegionType::From);
        assert!(desc.is_fix_in_place());
        assert_eq!(desc.region_type(), RegionType::From);
        assert_eq!(desc.list_tag(), 3);
    }

    #[test]
    fn region_of_resolves_subordinates() {
        let base = 0x2000_0000;
        let table = RegionTable::new(base, 8);
        table.init_region(RegionId(1), 4, RegionType::RecentLarge);
        assert_eq!(table.region_of(base + UNIT_SIZE + 8), Some(RegionId(1)));
        assert_eq!(table.region_of(base + 4 * UNIT_SIZE + 8), Some(RegionId(1)));
        assert_eq!(table.region_of(base + 5 * UNIT_SIZE), None);
        assert_eq!(table.region_of(base - 8), None);
        assert_eq!(table.free_region_units(RegionId(1)), 4);
        assert_eq!(table.region_of(base + 2 * UNIT_SIZE), None);
    }

    #[test]
    fn bump_allocation_stops_at_end() {
        let table = RegionTable::new(0x3000_0000, 2);
        table.init_region(RegionId(0), 1, RegionType::ThreadLocal);
        let desc = table.desc(RegionId(0));
        let first = desc.alloc(UNIT_SIZE - 16);
        assert_eq!(first, desc.start());
        assert_eq!(desc.alloc(32), 0);
        assert_ne!(desc.atomic_alloc(16), 0);
        assert_eq!(desc.available_bytes(), 0);
    }
}
