use parking_lot::Mutex;

use super::desc::{RegionId, RegionTable, RegionType, NO_LIST};
use std::sync::atomic::Ordering;

struct ListState {
    head: RegionId,
    region_count: usize,
    unit_count: usize,
}

/// Index-linked doubly linked list of regions, with its own lock.
///
/// A region carries the tag of the list it is on. Membership and region type are changed
/// together under the list lock; adding a region that is already on a list, or deleting one
/// that is not on this list, is a fatal error.
pub struct RegionList {
    name: &'static str,
    tag: u8,
    state: Mutex<ListState>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionListStats {
    pub regions: usize,
    pub units: usize,
    pub allocated_bytes: usize,
    pub live_bytes: usize,
}

impl RegionList {
    pub fn new(name: &'static str, tag: u8) -> Self {
        assert!(tag < NO_LIST);
        Self {
            name,
            tag,
            state: Mutex::new(ListState {
                head: RegionId::NONE,
                region_count: 0,
                unit_count: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn region_count(&self) -> usize {
        self.state.lock().region_count
    }

    pub fn unit_count(&self) -> usize {
        self.state.lock().unit_count
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().region_count == 0
    }

    pub fn contains(&self, table: &RegionTable, id: RegionId) -> bool {
        let _state = self.state.lock();
        table.desc(id).list_tag() == self.tag
    }

    /// Adds `id` at the head of the list and retypes it.
    pub fn prepend(&self, table: &RegionTable, id: RegionId, ty: RegionType) {
        let mut state = self.state.lock();
        self.link_front(&mut state, table, id, ty);
    }

    /// Removes `id` from the list.
    pub fn delete(&self, table: &RegionTable, id: RegionId) {
        let mut state = self.state.lock();
        self.unlink(&mut state, table, id);
    }

    /// Removes `id` only if it is on this list. Returns whether it was removed.
    pub fn try_delete(&self, table: &RegionTable, id: RegionId) -> bool {
        let mut state = self.state.lock();
        if table.desc(id).list_tag() != self.tag {
            return false;
        }
        self.unlink(&mut state, table, id);
        true
    }

    pub fn take_head(&self, table: &RegionTable) -> Option<RegionId> {
        let mut state = self.state.lock();
        let head = state.head;
        if head.is_none() {
            return None;
        }
        self.unlink(&mut state, table, head);
        Some(head)
    }

    /// Removes and returns the first region for which `pred` holds.
    pub fn take_first(
        &self,
        table: &RegionTable,
        mut pred: impl FnMut(RegionId) -> bool,
    ) -> Option<RegionId> {
        let mut state = self.state.lock();
        let mut cur = state.head;
        while !cur.is_none() {
            if pred(cur) {
                self.unlink(&mut state, table, cur);
                return Some(cur);
            }
            cur = RegionId(table.desc(cur).next.load(Ordering::Acquire));
        }
        None
    }

    /// Moves every region of `other` to the front of this list, retyping them to `ty`.
    pub fn merge_from(&self, table: &RegionTable, other: &RegionList, ty: RegionType) {
        if std::ptr::eq(self, other) {
            return;
        }
        let (mut this, mut that) = if self.tag < other.tag {
            let a = self.state.lock();
            let b = other.state.lock();
            (a, b)
        } else {
            let b = other.state.lock();
            let a = self.state.lock();
            (a, b)
        };
        while !that.head.is_none() {
            let id = that.head;
            other.unlink(&mut that, table, id);
            self.link_front(&mut this, table, id, ty);
        }
    }

    /// Snapshot of the region ids in list order.
    pub fn ids(&self, table: &RegionTable) -> Vec<RegionId> {
        let state = self.state.lock();
        let mut out = Vec::with_capacity(state.region_count);
        let mut cur = state.head;
        while !cur.is_none() {
            out.push(cur);
            cur = RegionId(table.desc(cur).next.load(Ordering::Acquire));
        }
        out
    }

    /// Visits each region under the list lock. `f` must not touch this list.
    pub fn for_each(&self, table: &RegionTable, mut f: impl FnMut(RegionId)) {
        let state = self.state.lock();
        let mut cur = state.head;
        while !cur.is_none() {
            let next = RegionId(table.desc(cur).next.load(Ordering::Acquire));
            f(cur);
            cur = next;
        }
    }

    pub fn stats(&self, table: &RegionTable) -> RegionListStats {
        let state = self.state.lock();
        let mut stats = RegionListStats {
            regions: state.region_count,
            units: state.unit_count,
            ..Default::default()
        };
        let mut cur = state.head;
        while !cur.is_none() {
            let desc = table.desc(cur);
            stats.allocated_bytes += desc.allocated_bytes();
            stats.live_bytes += desc.live_bytes();
            cur = RegionId(desc.next.load(Ordering::Acquire));
        }
        stats
    }

    pub fn allocated_bytes(&self, table: &RegionTable) -> usize {
        self.stats(table).allocated_bytes
    }

    fn link_front(&self, state: &mut ListState, table: &RegionTable, id: RegionId, ty: RegionType) {
        let desc = table.desc(id);
        assert_eq!(
            desc.list_tag(),
            NO_LIST,
            "{:?} is already on a list while adding it to {}",
            id,
            self.name
        );
        desc.prev.store(u32::MAX, Ordering::Release);
        desc.next.store(state.head.0, Ordering::Release);
        if !state.head.is_none() {
            table.desc(state.head).prev.store(id.0, Ordering::Release);
        }
        state.head = id;
        state.region_count += 1;
        state.unit_count += desc.unit_count();
        desc.set_list_and_type(self.tag, ty);
    }

    fn unlink(&self, state: &mut ListState, table: &RegionTable, id: RegionId) {
        let desc = table.desc(id);
        assert_eq!(
            desc.list_tag(),
            self.tag,
            "{:?} ({:?}) is not on {}",
            id,
            desc.region_type(),
            self.name
        );
        let prev = RegionId(desc.prev.load(Ordering::Acquire));
        let next = RegionId(desc.next.load(Ordering::Acquire));
        if prev.is_none() {
            state.head = next;
        } else {
            table.desc(prev).next.store(next.0, Ordering::Release);
        }
        if !next.is_none() {
            table.desc(next).prev.store(prev.0, Ordering::Release);
        }
        desc.prev.store(u32::MAX, Ordering::Release);
        desc.next.store(u32::MAX, Ordering::Release);
        state.region_count -= 1;
        state.unit_count -= desc.unit_count();
        desc.set_list_and_type(NO_LIST, desc.region_type());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_regions(n: usize) -> RegionTable {
        let table = RegionTable::new(0x4000_0000, n);
        for i in 0..n {
            table.init_region(RegionId(i as u32), 1, RegionType::ThreadLocal);
        }
        table
    }

    #[test]
    fn prepend_delete_and_counts() {
        let table = table_with_regions(4);
        let list = RegionList::new("recent full", 1);
        for i in 0..4 {
            list.prepend(&table, RegionId(i), RegionType::RecentFull);
        }
        assert_eq!(list.region_count(), 4);
        assert_eq!(list.unit_count(), 4);
        assert_eq!(
            list.ids(&table),
            vec![RegionId(3), RegionId(2), RegionId(1), RegionId(0)]
        );
        list.delete(&table, RegionId(2));
        assert_eq!(list.ids(&table), vec![RegionId(3), RegionId(1), RegionId(0)]);
        assert_eq!(table.desc(RegionId(1)).region_type(), RegionType::RecentFull);
        assert_eq!(list.take_head(&table), Some(RegionId(3)));
        assert_eq!(list.region_count(), 2);
    }

    #[test]
    fn merge_retypes_every_region() {
        let table = table_with_regions(3);
        let to = RegionList::new("to", 2);
        let old = RegionList::new("old", 3);
        to.prepend(&table, RegionId(0), RegionType::To);
        to.prepend(&table, RegionId(1), RegionType::To);
        old.prepend(&table, RegionId(2), RegionType::Old);
        old.merge_from(&table, &to, RegionType::Old);
        assert!(to.is_empty());
        assert_eq!(old.region_count(), 3);
        for i in 0..3 {
            assert_eq!(table.desc(RegionId(i)).region_type(), RegionType::Old);
            assert!(old.contains(&table, RegionId(i)));
        }
    }

    #[test]
    #[should_panic]
    fn deleting_foreign_region_panics() {
        let table = table_with_regions(2);
        let a = RegionList::new("a", 1);
        let b = RegionList::new("b", 2);
        a.prepend(&table, RegionId(0), RegionType::Old);
        b.delete(&table, RegionId(0));
    }

    #[test]
    #[should_panic]
    fn double_insert_panics() {
        let table = table_with_regions(1);
        let a = RegionList::new("a", 1);
        let b = RegionList::new("b", 2);
        a.prepend(&table, RegionId(0), RegionType::Old);
        b.prepend(&table, RegionId(0), RegionType::Old);
    }
}
