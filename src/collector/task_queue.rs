use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use super::GCReason;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum GCTaskType {
    InvokeGc,
    Terminate,
    Timeout,
    DumpHeap,
    DumpHeapOom,
}

/// One unit of work for the GC main thread.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct GCTask {
    pub task_type: GCTaskType,
    pub reason: GCReason,
    /// Position in the sync queue. Async tasks carry 0.
    pub index: u64,
}

const INVOKE_GC_BASE: u32 = 4;

impl GCTask {
    pub fn new(task_type: GCTaskType, reason: GCReason) -> Self {
        Self {
            task_type,
            reason,
            index: 0,
        }
    }

    pub fn invoke_gc(reason: GCReason) -> Self {
        Self::new(GCTaskType::InvokeGc, reason)
    }

    pub fn terminate() -> Self {
        Self::new(GCTaskType::Terminate, GCReason::User)
    }

    /// Lower runs first. Collections are ordered by reason after the housekeeping tasks.
    pub fn priority(&self) -> u32 {
        match self.task_type {
            GCTaskType::Terminate => 0,
            GCTaskType::Timeout => 1,
            GCTaskType::DumpHeap => 2,
            GCTaskType::DumpHeapOom => 3,
            GCTaskType::InvokeGc => INVOKE_GC_BASE + self.reason as u32,
        }
    }

    fn from_priority(priority: u32) -> Self {
        match priority {
            0 => Self::terminate(),
            1 => Self::new(GCTaskType::Timeout, GCReason::Idle),
            2 => Self::new(GCTaskType::DumpHeap, GCReason::User),
            3 => Self::new(GCTaskType::DumpHeapOom, GCReason::Oom),
            p => Self::invoke_gc(GCReason::ALL[(p - INVOKE_GC_BASE) as usize]),
        }
    }
}

struct SyncQueue {
    tasks: VecDeque<GCTask>,
    next_index: u64,
    terminated: bool,
}

/// Tasks for the GC main thread.
///
/// Async tasks live in a bitmask indexed by priority, so repeated requests collapse into one
/// bit and the most urgent task is always popped first. Sync tasks live in a FIFO with
/// strictly increasing indices; a requester waits until the finished index reaches its own.
pub struct GCTaskQueue {
    async_tasks: AtomicU64,
    sync: Mutex<SyncQueue>,
    finished: Mutex<u64>,
    finished_cv: Condvar,
    wake: Mutex<()>,
    wake_cv: Condvar,
}

impl Default for GCTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl GCTaskQueue {
    /// Finished index published once the queue is terminated. Releases every waiter.
    pub const EXIT: u64 = u64::MAX;

    pub fn new() -> Self {
        Self {
            async_tasks: AtomicU64::new(0),
            sync: Mutex::new(SyncQueue {
                tasks: VecDeque::new(),
                next_index: 1,
                terminated: false,
            }),
            finished: Mutex::new(0),
            finished_cv: Condvar::new(),
            wake: Mutex::new(()),
            wake_cv: Condvar::new(),
        }
    }

    /// Sets the task's bit. An overriding push first drops every less urgent async task.
    pub fn push_async(&self, task: GCTask, overriding: bool) {
        let bit = 1u64 << task.priority();
        if overriding {
            let keep = bit | (bit - 1);
            let mut current = self.async_tasks.load(Ordering::Acquire);
            loop {
                match self.async_tasks.compare_exchange_weak(
                    current,
                    (current & keep) | bit,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        } else {
            self.async_tasks.fetch_or(bit, Ordering::AcqRel);
        }
        log::trace!("async {:?} ({}) queued", task.task_type, task.reason.name());
        self.wake();
    }

    /// Takes the most urgent async task.
    pub fn pop_async(&self) -> Option<GCTask> {
        let mut current = self.async_tasks.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            let priority = current.trailing_zeros();
            match self.async_tasks.compare_exchange_weak(
                current,
                current & !(1u64 << priority),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(GCTask::from_priority(priority)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Appends `task` unless a queued task matches `filter`, in which case the caller shares
    /// that task's index. Returns `None` once the queue is terminated.
    pub fn enqueue_sync(&self, task: GCTask, filter: impl Fn(&GCTask) -> bool) -> Option<u64> {
        let index = {
            let mut sync = self.sync.lock();
            if sync.terminated {
                return None;
            }
            if let Some(queued) = sync.tasks.iter().find(|t| filter(t)) {
                log::trace!("sync {:?} coalesced into #{}", task.task_type, queued.index);
                return Some(queued.index);
            }
            let index = sync.next_index;
            sync.next_index += 1;
            sync.tasks.push_back(GCTask { index, ..task });
            index
        };
        log::trace!("sync {:?} queued as #{}", task.task_type, index);
        self.wake();
        Some(index)
    }

    pub fn pop_sync(&self) -> Option<GCTask> {
        self.sync.lock().tasks.pop_front()
    }

    /// Sync tasks first, then async ones.
    pub fn pop(&self) -> Option<GCTask> {
        self.pop_sync().or_else(|| self.pop_async())
    }

    pub fn has_tasks(&self) -> bool {
        self.async_tasks.load(Ordering::Acquire) != 0 || !self.sync.lock().tasks.is_empty()
    }

    fn wake(&self) {
        let _guard = self.wake.lock();
        self.wake_cv.notify_all();
    }

    /// Blocks the GC main thread until a task arrives. Returns false if `timeout` elapsed
    /// first.
    pub fn wait_for_task(&self, timeout: Option<Duration>) -> bool {
        let mut guard = self.wake.lock();
        if self.has_tasks() {
            return true;
        }
        match timeout {
            Some(timeout) => !self.wake_cv.wait_for(&mut guard, timeout).timed_out() || self.has_tasks(),
            None => {
                self.wake_cv.wait(&mut guard);
                true
            }
        }
    }

    /// Drops every pending sync task and releases all current and future waiters. Returns
    /// the number of tasks dropped; only the first call drops anything.
    pub fn terminate(&self) -> usize {
        let dropped = {
            let mut sync = self.sync.lock();
            if sync.terminated {
                0
            } else {
                sync.terminated = true;
                let dropped = sync.tasks.len();
                sync.tasks.clear();
                dropped
            }
        };
        if dropped > 0 {
            log::debug!("discarded {} pending sync gc tasks", dropped);
        }
        self.notify_finished(Self::EXIT);
        dropped
    }

    pub fn is_terminated(&self) -> bool {
        self.sync.lock().terminated
    }

    /// Publishes that every sync task up to `index` is done.
    pub fn notify_finished(&self, index: u64) {
        let mut finished = self.finished.lock();
        *finished = (*finished).max(index);
        self.finished_cv.notify_all();
    }

    pub fn finished_index(&self) -> u64 {
        *self.finished.lock()
    }

    /// Waits until the task with `index` is done or the queue is terminated.
    pub fn wait_finished(&self, index: u64) {
        let mut finished = self.finished.lock();
        while *finished < index && *finished != Self::EXIT {
            self.finished_cv.wait(&mut finished);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn async_pops_follow_priority() {
        let queue = GCTaskQueue::new();
        queue.push_async(GCTask::invoke_gc(GCReason::Young), false);
        queue.push_async(GCTask::new(GCTaskType::Timeout, GCReason::Idle), false);
        queue.push_async(GCTask::invoke_gc(GCReason::Oom), false);
        queue.push_async(GCTask::invoke_gc(GCReason::Young), false);

        assert_eq!(queue.pop_async().unwrap().task_type, GCTaskType::Timeout);
        assert_eq!(queue.pop_async().unwrap().reason, GCReason::Oom);
        assert_eq!(queue.pop_async().unwrap().reason, GCReason::Young);
        assert_eq!(queue.pop_async(), None);
    }

    #[test]
    fn overriding_terminate_clears_lower_priorities() {
        let queue = GCTaskQueue::new();
        queue.push_async(GCTask::invoke_gc(GCReason::Heu), false);
        queue.push_async(GCTask::new(GCTaskType::DumpHeap, GCReason::User), false);
        queue.push_async(GCTask::terminate(), true);
        assert_eq!(queue.pop_async(), Some(GCTask::terminate()));
        assert_eq!(queue.pop_async(), None);
    }

    #[test]
    fn overriding_push_keeps_more_urgent_tasks() {
        let queue = GCTaskQueue::new();
        queue.push_async(GCTask::new(GCTaskType::Timeout, GCReason::Idle), false);
        queue.push_async(GCTask::invoke_gc(GCReason::Native), false);
        queue.push_async(GCTask::invoke_gc(GCReason::Oom), true);
        assert_eq!(queue.pop_async().unwrap().task_type, GCTaskType::Timeout);
        assert_eq!(queue.pop_async().unwrap().reason, GCReason::Oom);
        assert_eq!(queue.pop_async(), None);
    }

    #[test]
    fn sync_tasks_coalesce_on_filter() {
        let queue = GCTaskQueue::new();
        let same_reason = |reason| move |t: &GCTask| t.reason == reason;
        let a = queue
            .enqueue_sync(GCTask::invoke_gc(GCReason::User), same_reason(GCReason::User))
            .unwrap();
        let b = queue
            .enqueue_sync(GCTask::invoke_gc(GCReason::User), same_reason(GCReason::User))
            .unwrap();
        let c = queue
            .enqueue_sync(GCTask::invoke_gc(GCReason::Oom), same_reason(GCReason::Oom))
            .unwrap();
        assert_eq!(a, b);
        assert!(c > a);
        assert_eq!(queue.pop().unwrap().index, a);
        assert_eq!(queue.pop().unwrap().index, c);
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn finished_index_is_monotonic() {
        let queue = GCTaskQueue::new();
        queue.notify_finished(5);
        queue.notify_finished(3);
        assert_eq!(queue.finished_index(), 5);
        queue.wait_finished(4);
    }

    #[test]
    fn terminate_discards_once_and_releases_waiters() {
        let _ = env_logger::builder().is_test(true).try_init();
        let queue = Arc::new(GCTaskQueue::new());
        let index = queue
            .enqueue_sync(GCTask::invoke_gc(GCReason::User), |_| false)
            .unwrap();
        queue
            .enqueue_sync(GCTask::invoke_gc(GCReason::Force), |_| false)
            .unwrap();
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_finished(index))
        };
        assert_eq!(queue.terminate(), 2);
        assert_eq!(queue.terminate(), 0);
        waiter.join().unwrap();
        assert_eq!(queue.finished_index(), GCTaskQueue::EXIT);
        assert_eq!(
            queue.enqueue_sync(GCTask::invoke_gc(GCReason::User), |_| false),
            None
        );
        assert_eq!(queue.pop_sync(), None);
    }
}
