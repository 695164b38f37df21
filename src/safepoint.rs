use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{object::RefField, tlab::AllocationBuffer};

/// Heap-visible state of one attached mutator.
pub struct MutatorRecord {
    pub(crate) buffer: Arc<AllocationBuffer>,
    /// Handle stack of the mutator. Read and updated by the collector only while the world
    /// is stopped.
    pub(crate) roots: Mutex<Vec<RefField>>,
    in_safe_region: AtomicBool,
    name: String,
}

impl MutatorRecord {
    pub(crate) fn new(name: String, buffer: Arc<AllocationBuffer>) -> Self {
        Self {
            buffer,
            roots: Mutex::new(Vec::new()),
            in_safe_region: AtomicBool::new(true),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_in_safe_region(&self) -> bool {
        self.in_safe_region.load(Ordering::Acquire)
    }
}

struct SafepointState {
    stw_active: bool,
    /// Attached mutators outside a safe region.
    running: usize,
}

/// Used to bring all threads with heap access to a safepoint such that e.g. a
/// garbage collection can be performed.
///
/// A mutator is either running or inside a safe region. Stopping the world waits until no
/// mutator is running; leaving a safe region blocks while the world is stopped.
pub struct GlobalSafepoint {
    state: Mutex<SafepointState>,
    cv_stopped: Condvar,
    cv_resume: Condvar,
    requested: AtomicBool,
    /// Serializes stop-the-world requests.
    stw_lock: Mutex<()>,
    mutators: Mutex<Vec<Arc<MutatorRecord>>>,
}

impl Default for GlobalSafepoint {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SafepointState {
                stw_active: false,
                running: 0,
            }),
            cv_stopped: Condvar::new(),
            cv_resume: Condvar::new(),
            requested: AtomicBool::new(false),
            stw_lock: Mutex::new(()),
            mutators: Mutex::new(Vec::new()),
        }
    }

    /// Adds a mutator and moves it out of its initial safe region.
    pub(crate) fn attach(&self, record: Arc<MutatorRecord>) {
        self.mutators.lock().push(record.clone());
        self.leave_safe_region(&record);
    }

    pub(crate) fn detach(&self, record: &Arc<MutatorRecord>) {
        if !record.is_in_safe_region() {
            self.enter_safe_region(record);
        }
        self.mutators.lock().retain(|r| !Arc::ptr_eq(r, record));
    }

    pub fn mutator_count(&self) -> usize {
        self.mutators.lock().len()
    }

    /// Visits every attached mutator. Holds the registry lock while `f` runs.
    pub fn for_each_mutator(&self, mut f: impl FnMut(&MutatorRecord)) {
        for record in self.mutators.lock().iter() {
            f(record);
        }
    }

    pub(crate) fn enter_safe_region(&self, record: &MutatorRecord) {
        let mut state = self.state.lock();
        debug_assert!(!record.is_in_safe_region());
        record.in_safe_region.store(true, Ordering::Release);
        state.running -= 1;
        if state.stw_active && state.running == 0 {
            self.cv_stopped.notify_all();
        }
    }

    pub(crate) fn leave_safe_region(&self, record: &MutatorRecord) {
        let mut state = self.state.lock();
        debug_assert!(record.is_in_safe_region());
        while state.stw_active {
            self.cv_resume.wait(&mut state);
        }
        state.running += 1;
        record.in_safe_region.store(false, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Parks the calling mutator if a stop-the-world pause is pending.
    #[inline]
    pub(crate) fn poll(&self, record: &MutatorRecord) {
        if self.is_requested() {
            self.enter_safe_region(record);
            self.leave_safe_region(record);
        }
    }

    /// Stops every mutator. The world resumes when the guard is dropped. Must not be called
    /// from a thread that is itself an attached, running mutator.
    pub fn stop_the_world(&self) -> StopTheWorld<'_> {
        let serial = self.stw_lock.lock();
        let mut state = self.state.lock();
        state.stw_active = true;
        self.requested.store(true, Ordering::Release);
        while state.running > 0 {
            self.cv_stopped.wait(&mut state);
        }
        drop(state);
        StopTheWorld {
            safepoint: self,
            _serial: serial,
        }
    }
}

pub struct StopTheWorld<'a> {
    safepoint: &'a GlobalSafepoint,
    _serial: MutexGuard<'a, ()>,
}

impl Drop for StopTheWorld<'_> {
    fn drop(&mut self) {
        let mut state = self.safepoint.state.lock();
        state.stw_active = false;
        self.safepoint.requested.store(false, Ordering::Release);
        self.safepoint.cv_resume.notify_all();
        drop(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    fn record(name: &str) -> Arc<MutatorRecord> {
        Arc::new(MutatorRecord::new(
            name.to_string(),
            Arc::new(AllocationBuffer::new(false)),
        ))
    }

    #[test]
    fn stop_the_world_waits_for_running_mutators() {
        let safepoint = Arc::new(GlobalSafepoint::new());
        let polls = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let safepoint = safepoint.clone();
            let polls = polls.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let record = record("worker");
                safepoint.attach(record.clone());
                while !stop.load(Ordering::Acquire) {
                    polls.fetch_add(1, Ordering::Relaxed);
                    safepoint.poll(&record);
                }
                safepoint.detach(&record);
            })
        };
        while safepoint.mutator_count() == 0 || polls.load(Ordering::Relaxed) == 0 {
            thread::yield_now();
        }
        {
            let _stw = safepoint.stop_the_world();
            let seen = polls.load(Ordering::Relaxed);
            thread::sleep(Duration::from_millis(20));
            assert_eq!(polls.load(Ordering::Relaxed), seen);
            safepoint.for_each_mutator(|r| assert!(r.is_in_safe_region()));
        }
        stop.store(true, Ordering::Release);
        worker.join().unwrap();
        assert_eq!(safepoint.mutator_count(), 0);
    }
}
