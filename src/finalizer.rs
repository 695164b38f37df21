//! The finalizer thread.
//!
//! Besides running finalizers it does deferred heap housekeeping on behalf of the collector
//! and of mutators: reclaiming garbage regions after a cycle and feeding hungry allocation
//! buffers.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::{HeapError, Result},
    heap::RuntimeContext,
    mutator::Mutator,
    object::{ObjectRef, RefField},
};

#[derive(Default)]
struct FinalizerLists {
    /// Objects with a finalizer that are not known to be dead.
    finalizers: Vec<RefField>,
    /// Dead objects waiting for their finalizer.
    finalizables: Vec<RefField>,
    /// Objects the finalizer thread is draining.
    working: Vec<RefField>,
}

pub struct FinalizerProcessor {
    lists: Mutex<FinalizerLists>,
    has_finalizable_job: AtomicBool,
    should_reclaim_heap_garbage: AtomicBool,
    should_feed_hungry_buffers: AtomicBool,
    running: AtomicBool,
    wake: Mutex<bool>,
    wake_cv: Condvar,
    wait_time: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FinalizerProcessor {
    pub fn new(wait_time: Duration) -> Self {
        Self {
            lists: Mutex::new(FinalizerLists::default()),
            has_finalizable_job: AtomicBool::new(false),
            should_reclaim_heap_garbage: AtomicBool::new(false),
            should_feed_hungry_buffers: AtomicBool::new(false),
            running: AtomicBool::new(false),
            wake: Mutex::new(false),
            wake_cv: Condvar::new(),
            wait_time,
            thread: Mutex::new(None),
        }
    }

    pub(crate) fn start(&self, context: Arc<RuntimeContext>) -> Result<()> {
        self.running.store(true, Ordering::Release);
        let handle = std::thread::Builder::new()
            .name("strata-finalizer".to_string())
            .spawn(move || Self::run(context))
            .map_err(|_| HeapError::ThreadSpawnFailed("finalizer"))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Stops the thread and waits for it to exit.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.notify();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn notify(&self) {
        let mut woken = self.wake.lock();
        *woken = true;
        self.wake_cv.notify_one();
    }

    pub(crate) fn notify_reclaim_heap_garbage(&self) {
        self.should_reclaim_heap_garbage
            .store(true, Ordering::Release);
        self.notify();
    }

    pub(crate) fn notify_hungry_buffers(&self) {
        if !self.should_feed_hungry_buffers.swap(true, Ordering::AcqRel) {
            self.notify();
        }
    }

    pub(crate) fn register_finalizer(&self, obj: ObjectRef) {
        self.lists.lock().finalizers.push(RefField::new(Some(obj)));
    }

    pub fn candidate_count(&self) -> usize {
        self.lists.lock().finalizers.len()
    }

    pub fn pending_count(&self) -> usize {
        let lists = self.lists.lock();
        lists.finalizables.len() + lists.working.len()
    }

    /// Moves up to `limit` candidates accepted by `predicate` to the finalizable list.
    pub(crate) fn enqueue_finalizables(
        &self,
        mut predicate: impl FnMut(ObjectRef) -> bool,
        limit: usize,
    ) -> usize {
        let moved = {
            let mut lists = self.lists.lock();
            let FinalizerLists {
                finalizers,
                finalizables,
                ..
            } = &mut *lists;
            let mut moved = 0;
            let mut i = 0;
            while i < finalizers.len() && moved < limit {
                let accept = finalizers[i].target().map_or(true, &mut predicate);
                if accept {
                    finalizables.push(finalizers.swap_remove(i));
                    moved += 1;
                } else {
                    i += 1;
                }
            }
            moved
        };
        if moved > 0 {
            self.has_finalizable_job.store(true, Ordering::Release);
            self.notify();
        }
        moved
    }

    /// Moves every candidate that `is_live` rejects to the finalizable list. Runs while the
    /// world is stopped, right after marking.
    pub(crate) fn collect_dead_candidates(&self, mut is_live: impl FnMut(ObjectRef) -> bool) -> usize {
        let mut lists = self.lists.lock();
        let FinalizerLists {
            finalizers,
            finalizables,
            ..
        } = &mut *lists;
        let before = finalizables.len();
        let mut i = 0;
        while i < finalizers.len() {
            match finalizers[i].target() {
                Some(obj) if is_live(obj) => i += 1,
                Some(_) => finalizables.push(finalizers.swap_remove(i)),
                None => {
                    finalizers.swap_remove(i);
                }
            }
        }
        let dead = finalizables.len() - before;
        if dead > 0 {
            self.has_finalizable_job.store(true, Ordering::Release);
        }
        dead
    }

    /// Visits the strong roots held by the processor: the finalizable and working lists.
    pub(crate) fn for_each_root(&self, mut f: impl FnMut(&RefField)) {
        let lists = self.lists.lock();
        lists.finalizables.iter().for_each(&mut f);
        lists.working.iter().for_each(&mut f);
    }

    /// Visits the candidate list. Candidates are weak, so only forwarding touches them.
    pub(crate) fn for_each_candidate(&self, f: impl FnMut(&RefField)) {
        self.lists.lock().finalizers.iter().for_each(f);
    }

    fn wait(&self) {
        let mut woken = self.wake.lock();
        if !*woken {
            self.wake_cv.wait_for(&mut woken, self.wait_time);
        }
        *woken = false;
    }

    fn run(context: Arc<RuntimeContext>) {
        let mutator = Mutator::attach(context.clone(), "strata-finalizer");
        let processor = &context.finalizer;
        log::debug!("finalizer thread started");
        while processor.running.load(Ordering::Acquire) {
            {
                let _safe = mutator.enter_safe_region();
                processor.wait();
            }
            if !processor.running.load(Ordering::Acquire) {
                break;
            }
            if processor
                .should_reclaim_heap_garbage
                .swap(false, Ordering::AcqRel)
            {
                context.space.manager().reclaim_garbage_regions();
            }
            if processor
                .should_feed_hungry_buffers
                .swap(false, Ordering::AcqRel)
            {
                let fed = context.space.feed_hungry_buffers();
                log::debug!("fed {} hungry allocation buffers", fed);
            }
            if processor.has_finalizable_job.swap(false, Ordering::AcqRel) {
                processor.process_finalizables(&mutator);
            }
        }
        log::debug!("finalizer thread stopped");
    }

    fn process_finalizables(&self, mutator: &Mutator) {
        {
            let mut lists = self.lists.lock();
            let pending = std::mem::take(&mut lists.finalizables);
            lists.working.extend(pending);
        }
        let mut count = 0;
        loop {
            mutator.poll();
            let obj = match self.lists.lock().working.pop() {
                Some(field) => match field.target() {
                    Some(obj) => obj,
                    None => continue,
                },
                None => break,
            };
            let finalize = match obj.type_info().finalize {
                Some(finalize) => finalize,
                None => continue,
            };
            let slot = mutator.push_root(Some(obj));
            if let Some(obj) = mutator.root(slot) {
                finalize(mutator, obj);
            }
            mutator.truncate_roots(slot);
            count += 1;
        }
        if count > 0 {
            log::debug!("ran {} finalizers", count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(8))]
    struct Storage([usize; 4]);

    static PLAIN: crate::object::TypeInfo = crate::object::TypeInfo::fixed("Plain", 16, &[]);

    fn object(storage: &mut Storage) -> ObjectRef {
        let obj = ObjectRef::from_address(storage.0.as_mut_ptr() as usize).unwrap();
        obj.header().install_type(&PLAIN);
        obj
    }

    #[test]
    fn dead_candidates_move_to_finalizables() {
        let processor = FinalizerProcessor::new(Duration::from_millis(10));
        let mut a = Storage([0; 4]);
        let mut b = Storage([0; 4]);
        let a = object(&mut a);
        let b = object(&mut b);
        processor.register_finalizer(a);
        processor.register_finalizer(b);
        assert_eq!(processor.collect_dead_candidates(|obj| obj == a), 1);
        assert_eq!(processor.candidate_count(), 1);
        assert_eq!(processor.pending_count(), 1);
        let mut roots = Vec::new();
        processor.for_each_root(|f| roots.push(f.target()));
        assert_eq!(roots, vec![Some(b)]);
    }

    #[test]
    fn enqueue_respects_limit() {
        let processor = FinalizerProcessor::new(Duration::from_millis(10));
        let mut storage = [Storage([0; 4]), Storage([0; 4]), Storage([0; 4])];
        for s in storage.iter_mut() {
            let obj = object(s);
            processor.register_finalizer(obj);
        }
        assert_eq!(processor.enqueue_finalizables(|_| true, 2), 2);
        assert_eq!(processor.candidate_count(), 1);
        assert_eq!(processor.pending_count(), 2);
    }
}
