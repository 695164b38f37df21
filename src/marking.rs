//! Marking: setting mark bits, the SATB buffer and the parallel tracing workers.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::{
    deque::{Injector, Steal},
    utils::Backoff,
};
use parking_lot::Mutex;

use crate::{
    globals::{PREFETCH_DISTANCE, PREFETCH_QUEUE_CAPACITY},
    heap::RuntimeContext,
    internal::work_stack::WorkStack,
    object::{ObjectRef, RefField},
    region::RegionManager,
    utils::prefetch_read,
};

/// Local stacks longer than this donate work to idle workers.
const SHARE_THRESHOLD: usize = 64;
const SHARE_BATCH: usize = 32;

/// Marks `obj`. Returns true if it was already marked or needs no tracing: it lies outside
/// the heap, outside the collected generation, or above its region's trace line.
#[inline]
pub(crate) fn mark_object(manager: &RegionManager, obj: ObjectRef, young_only: bool) -> bool {
    let table = manager.table();
    let addr = obj.address();
    let id = match table.region_of(addr) {
        Some(id) => id,
        None => return true,
    };
    let desc = table.desc(id);
    if young_only && !desc.region_type().is_young() {
        return true;
    }
    if desc.is_new_object_since_trace(addr) {
        return true;
    }
    let size = obj.size();
    let bitmap = manager.bitmaps().region_bitmap(table, id);
    if bitmap.mark_bits(addr - desc.start(), size) {
        return true;
    }
    desc.add_live_bytes(size);
    false
}

/// Whether `obj` survives the cycle being marked.
pub(crate) fn is_marked_live(manager: &RegionManager, obj: ObjectRef, young_only: bool) -> bool {
    let table = manager.table();
    let addr = obj.address();
    let id = match table.region_of(addr) {
        Some(id) => id,
        None => return true,
    };
    let desc = table.desc(id);
    if young_only && !desc.region_type().is_young() {
        return true;
    }
    if desc.is_new_object_since_trace(addr) {
        return true;
    }
    manager
        .bitmaps()
        .region_bitmap(table, id)
        .is_marked(addr - desc.start())
}

/// Old values overwritten by mutators while marking.
#[derive(Default)]
pub struct SatbBuffer {
    entries: Mutex<Vec<usize>>,
}

impl SatbBuffer {
    pub(crate) fn push(&self, addr: usize) {
        self.entries.lock().push(addr);
    }

    pub(crate) fn take(&self) -> Vec<usize> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ring of object addresses whose cache lines were prefetched ahead of tracing.
pub(crate) struct PrefetchQueue {
    ring: [usize; PREFETCH_QUEUE_CAPACITY],
    head: usize,
    len: usize,
}

impl PrefetchQueue {
    pub fn new() -> Self {
        Self {
            ring: [0; PREFETCH_QUEUE_CAPACITY],
            head: 0,
            len: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, addr: usize) {
        debug_assert!(self.len < PREFETCH_QUEUE_CAPACITY);
        prefetch_read(addr);
        self.ring[(self.head + self.len) & (PREFETCH_QUEUE_CAPACITY - 1)] = addr;
        self.len += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let addr = self.ring[self.head];
        self.head = (self.head + 1) & (PREFETCH_QUEUE_CAPACITY - 1);
        self.len -= 1;
        Some(addr)
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

/// State shared by the workers of one parallel marking run.
pub(crate) struct MarkShared {
    pub injector: Injector<usize>,
    idle: AtomicUsize,
    workers: AtomicUsize,
    pub young_only: bool,
    marked_bytes: AtomicUsize,
}

impl MarkShared {
    pub fn new(young_only: bool) -> Self {
        Self {
            injector: Injector::new(),
            idle: AtomicUsize::new(0),
            workers: AtomicUsize::new(1),
            young_only,
            marked_bytes: AtomicUsize::new(0),
        }
    }

    /// Prepares the termination protocol for a run with at most `workers` participants.
    pub fn begin(&self, workers: usize) {
        self.idle.store(0, Ordering::Release);
        self.workers.store(workers.max(1), Ordering::Release);
    }

    /// Lowers the participant count once the pool knows how many workers it dispatched.
    pub fn set_workers(&self, workers: usize) {
        self.workers.store(workers.max(1), Ordering::Release);
    }

    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes.load(Ordering::Acquire)
    }

    /// Marks the target of a root slot and queues it for tracing.
    pub fn mark_root(&self, manager: &RegionManager, field: &RefField) {
        if let Some(obj) = field.target() {
            self.mark_and_push(manager, obj);
        }
    }

    pub fn mark_and_push(&self, manager: &RegionManager, obj: ObjectRef) {
        if !mark_object(manager, obj, self.young_only) {
            self.marked_bytes.fetch_add(obj.size(), Ordering::Relaxed);
            self.injector.push(obj.address());
        }
    }
}

pub(crate) struct MarkWorker<'a> {
    context: &'a RuntimeContext,
    shared: &'a MarkShared,
    local: WorkStack,
    prefetch: PrefetchQueue,
    marked_bytes: usize,
}

impl<'a> MarkWorker<'a> {
    pub fn new(context: &'a RuntimeContext, shared: &'a MarkShared) -> Self {
        Self {
            context,
            shared,
            local: WorkStack::new(context.native.clone()),
            prefetch: PrefetchQueue::new(),
            marked_bytes: 0,
        }
    }

    #[inline]
    fn next(&mut self) -> Option<ObjectRef> {
        while self.prefetch.len() < PREFETCH_DISTANCE {
            match self.local.pop() {
                Some(addr) => self.prefetch.push(addr),
                None => break,
            }
        }
        self.prefetch.pop().and_then(ObjectRef::from_address)
    }

    fn trace_object(&mut self, obj: ObjectRef) {
        let context = self.context;
        let manager = context.space.manager();
        let young_only = self.shared.young_only;
        let local = &mut self.local;
        let marked_bytes = &mut self.marked_bytes;
        obj.for_each_ref_field(|field| {
            if let Some(target) = field.target() {
                if !mark_object(manager, target, young_only) {
                    *marked_bytes += target.size();
                    local.push(target.address());
                }
            }
        });
    }

    fn share_work(&mut self) {
        if self.local.len() > SHARE_THRESHOLD
            && self.shared.idle.load(Ordering::Relaxed) > 0
            && self.shared.injector.is_empty()
        {
            let injector = &self.shared.injector;
            self.local.take(SHARE_BATCH, |addr| injector.push(addr));
        }
    }

    fn steal(&mut self) -> bool {
        loop {
            match self.shared.injector.steal() {
                Steal::Success(addr) => {
                    self.local.push(addr);
                    return true;
                }
                Steal::Empty => return false,
                Steal::Retry => continue,
            }
        }
    }

    /// Traces until every worker of the run is out of work.
    pub fn run(&mut self) {
        'outer: loop {
            while let Some(obj) = self.next() {
                self.trace_object(obj);
                self.share_work();
            }
            if self.steal() {
                continue;
            }
            self.shared.idle.fetch_add(1, Ordering::AcqRel);
            let backoff = Backoff::new();
            loop {
                if !self.shared.injector.is_empty() {
                    self.shared.idle.fetch_sub(1, Ordering::AcqRel);
                    continue 'outer;
                }
                let workers = self.shared.workers.load(Ordering::Acquire);
                if self.shared.idle.load(Ordering::Acquire) == workers {
                    break 'outer;
                }
                backoff.snooze();
            }
        }
        self.shared
            .marked_bytes
            .fetch_add(self.marked_bytes, Ordering::AcqRel);
        self.marked_bytes = 0;
    }

    /// Traces everything reachable from the injector on the calling thread alone.
    pub fn run_serial(&mut self) {
        loop {
            while let Some(obj) = self.next() {
                self.trace_object(obj);
            }
            if !self.steal() {
                break;
            }
        }
        self.shared
            .marked_bytes
            .fetch_add(self.marked_bytes, Ordering::AcqRel);
        self.marked_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefetch_queue_is_fifo() {
        let mut queue = PrefetchQueue::new();
        let slots = [0u64; PREFETCH_QUEUE_CAPACITY];
        for round in 0..3 {
            for (i, slot) in slots.iter().enumerate().take(PREFETCH_DISTANCE) {
                queue.push(slot as *const u64 as usize + i * round);
            }
            for (i, slot) in slots.iter().enumerate().take(PREFETCH_DISTANCE) {
                assert_eq!(queue.pop(), Some(slot as *const u64 as usize + i * round));
            }
            assert_eq!(queue.pop(), None);
        }
    }

    #[test]
    fn satb_buffer_drains_once() {
        let buffer = SatbBuffer::default();
        buffer.push(0x1000);
        buffer.push(0x2000);
        assert_eq!(buffer.take(), vec![0x1000, 0x2000]);
        assert!(buffer.is_empty());
    }
}
