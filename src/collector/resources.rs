use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use super::{
    proxy::CollectorProxy,
    task_queue::{GCTask, GCTaskQueue, GCTaskType},
    thread_pool::GCThreadPool,
    GCReason,
};
use crate::{
    error::{HeapError, Result},
    heap::RuntimeContext,
    param::GCParam,
    statistics::{GcStats, HeapStatistics},
    utils::nano_time,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum IgnorePolicy {
    Never,
    /// Ignored when the last collection ended less than the interval ago.
    SinceLastGc,
    /// Ignored when the previous request of the same reason came less than the interval ago.
    SinceLastRequest,
}

/// Request policy of one [`GCReason`].
pub struct GCRequest {
    pub name: &'static str,
    pub is_sync: bool,
    pub is_concurrent: bool,
    min_interval_ns: u64,
    policy: IgnorePolicy,
    prev_request_ns: AtomicU64,
}

impl GCRequest {
    fn new(reason: GCReason, param: &GCParam) -> Self {
        let heu = param.min_heu_gc_interval.as_nanos() as u64;
        let native = param.min_native_gc_interval.as_nanos() as u64;
        let (is_sync, is_concurrent, min_interval_ns, policy) = match reason {
            GCReason::User => (true, false, 0, IgnorePolicy::Never),
            GCReason::Oom => (true, false, 0, IgnorePolicy::SinceLastGc),
            GCReason::Backup => (true, false, 0, IgnorePolicy::Never),
            GCReason::Heu => (false, true, heu, IgnorePolicy::SinceLastGc),
            GCReason::Young => (false, true, heu, IgnorePolicy::SinceLastGc),
            GCReason::Native => (false, true, native, IgnorePolicy::SinceLastRequest),
            GCReason::HeuSync => (true, true, 0, IgnorePolicy::Never),
            GCReason::NativeSync => (true, true, 0, IgnorePolicy::Never),
            GCReason::Force => (true, false, 0, IgnorePolicy::SinceLastGc),
            GCReason::AppSpawn => (true, false, 0, IgnorePolicy::Never),
            GCReason::Background => (false, true, heu, IgnorePolicy::SinceLastGc),
            GCReason::Hint => (false, true, 0, IgnorePolicy::Never),
            GCReason::Idle => (false, true, 0, IgnorePolicy::Never),
        };
        Self {
            name: reason.name(),
            is_sync,
            is_concurrent,
            min_interval_ns,
            policy,
            prev_request_ns: AtomicU64::new(0),
        }
    }

    fn should_be_ignored(&self, now_ns: u64, last_gc_end_ns: u64) -> bool {
        match self.policy {
            IgnorePolicy::Never => false,
            IgnorePolicy::SinceLastGc => {
                last_gc_end_ns != 0 && now_ns.saturating_sub(last_gc_end_ns) < self.min_interval_ns
            }
            IgnorePolicy::SinceLastRequest => {
                let prev = self.prev_request_ns.swap(now_ns, Ordering::AcqRel);
                prev != 0 && now_ns.saturating_sub(prev) < self.min_interval_ns
            }
        }
    }
}

/// Everything the GC main thread shares with the rest of the heap: the task queue, the
/// request table, and the "a collection is running" handshake.
pub struct CollectorResources {
    queue: GCTaskQueue,
    requests: Vec<GCRequest>,
    active: AtomicBool,
    gc_running: Mutex<bool>,
    gc_finished_cv: Condvar,
    gc_timeout: Option<Duration>,
    cache_units: usize,
    stats: Arc<GcStats>,
    gc_thread: Mutex<Option<JoinHandle<()>>>,
}

impl CollectorResources {
    pub fn new(param: &GCParam, cache_units: usize, stats: Arc<GcStats>) -> Self {
        Self {
            queue: GCTaskQueue::new(),
            requests: GCReason::ALL
                .iter()
                .map(|reason| GCRequest::new(*reason, param))
                .collect(),
            active: AtomicBool::new(false),
            gc_running: Mutex::new(false),
            gc_finished_cv: Condvar::new(),
            gc_timeout: param.gc_timeout_interval,
            cache_units,
            stats,
            gc_thread: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &GCTaskQueue {
        &self.queue
    }

    pub fn request(&self, reason: GCReason) -> &GCRequest {
        &self.requests[reason as usize]
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Starts the GC main thread. Its helper pool is created on that thread.
    pub(crate) fn start(&self, context: Arc<RuntimeContext>) -> Result<()> {
        self.active.store(true, Ordering::Release);
        let spawned = std::thread::Builder::new()
            .name("strata-gc".to_string())
            .spawn(move || Self::gc_main(context));
        match spawned {
            Ok(handle) => {
                *self.gc_thread.lock() = Some(handle);
                Ok(())
            }
            Err(_) => {
                self.active.store(false, Ordering::Release);
                Err(HeapError::ThreadSpawnFailed("gc"))
            }
        }
    }

    /// Stops accepting requests, terminates the GC main thread and joins it.
    pub(crate) fn stop(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.queue.push_async(GCTask::terminate(), true);
        if let Some(handle) = self.gc_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Asks for a collection. Sync requests return once it has finished. Requests the
    /// policy ignores still wait for a collection that is already running.
    pub fn request_gc(&self, reason: GCReason, is_async: bool) -> Result<()> {
        if !self.is_active() {
            return Err(HeapError::CollectorInactive);
        }
        let request = self.request(reason);
        if request.should_be_ignored(nano_time(), self.stats.last_gc_end_ns()) {
            log::debug!("{} gc request ignored", request.name);
            if !is_async {
                self.wait_for_gc_finish();
            }
            return Ok(());
        }
        let task = GCTask::invoke_gc(reason);
        if is_async {
            self.queue.push_async(task, false);
            return Ok(());
        }
        let index = self
            .queue
            .enqueue_sync(task, |queued| {
                queued.task_type == GCTaskType::InvokeGc && queued.reason == reason
            })
            .ok_or(HeapError::CollectorInactive)?;
        self.queue.wait_finished(index);
        Ok(())
    }

    /// Runs a housekeeping task on the GC main thread and waits for it.
    pub(crate) fn request_sync_task(&self, task_type: GCTaskType, reason: GCReason) -> Result<()> {
        if !self.is_active() {
            return Err(HeapError::CollectorInactive);
        }
        let index = self
            .queue
            .enqueue_sync(GCTask::new(task_type, reason), |queued| {
                queued.task_type == task_type
            })
            .ok_or(HeapError::CollectorInactive)?;
        self.queue.wait_finished(index);
        Ok(())
    }

    pub(crate) fn request_async_task(&self, task_type: GCTaskType, reason: GCReason) {
        if self.is_active() {
            self.queue.push_async(GCTask::new(task_type, reason), false);
        }
    }

    pub fn is_gc_running(&self) -> bool {
        *self.gc_running.lock()
    }

    /// Blocks while a collection is running.
    pub fn wait_for_gc_finish(&self) {
        let mut running = self.gc_running.lock();
        while *running {
            self.gc_finished_cv.wait(&mut running);
        }
    }

    pub(crate) fn mark_gc_start(&self) {
        let mut running = self.gc_running.lock();
        while *running {
            self.gc_finished_cv.wait(&mut running);
        }
        *running = true;
    }

    pub(crate) fn mark_gc_finish(&self, index: u64) {
        {
            let mut running = self.gc_running.lock();
            *running = false;
            self.gc_finished_cv.notify_all();
        }
        self.queue.notify_finished(index);
    }

    fn gc_main(context: Arc<RuntimeContext>) {
        let pool = GCThreadPool::new(context.param.gc.gc_threads);
        let mut proxy = CollectorProxy::new(context.clone(), pool);
        let resources = &context.resources;
        log::debug!("gc main thread started");
        loop {
            let task = match resources.queue.pop() {
                Some(task) => task,
                None => {
                    if !resources.queue.wait_for_task(resources.gc_timeout) {
                        resources
                            .queue
                            .push_async(GCTask::new(GCTaskType::Timeout, GCReason::Idle), false);
                    }
                    continue;
                }
            };
            log::trace!("gc task {:?} #{} ({})", task.task_type, task.index, task.reason.name());
            match task.task_type {
                GCTaskType::Terminate => {
                    resources.queue.terminate();
                    break;
                }
                GCTaskType::Timeout => {
                    let released = context
                        .space
                        .manager()
                        .release_dirty_units(resources.cache_units);
                    if released > 0 {
                        log::debug!("idle timeout released {} dirty units", released);
                    }
                }
                GCTaskType::DumpHeap | GCTaskType::DumpHeapOom => {
                    Self::dump_heap(&context, task.task_type == GCTaskType::DumpHeapOom);
                }
                GCTaskType::InvokeGc => {
                    resources.mark_gc_start();
                    proxy.run_gc(task.reason);
                    resources.mark_gc_finish(task.index);
                    continue;
                }
            }
            if task.index != 0 {
                resources.queue.notify_finished(task.index);
            }
        }
        log::debug!("gc main thread stopped");
    }

    fn dump_heap(context: &RuntimeContext, oom: bool) {
        let mut dump = HeapStatistics::default();
        {
            let _stw = context.safepoint.stop_the_world();
            context.space.manager().fill_statistics(&mut dump);
        }
        if oom {
            log::warn!("heap dump after allocation failure\n{}", dump);
        } else {
            log::info!("{}", dump);
        }
        *context.last_heap_dump.lock() = Some(dump);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources() -> CollectorResources {
        let mut param = GCParam::default();
        param.min_heu_gc_interval = Duration::from_secs(60);
        param.min_native_gc_interval = Duration::from_secs(60);
        CollectorResources::new(&param, 0, Arc::new(GcStats::new(0)))
    }

    #[test]
    fn heuristic_requests_respect_the_interval_since_last_gc() {
        let resources = resources();
        let heu = resources.request(GCReason::Heu);
        assert!(!heu.should_be_ignored(1_000, 0));
        assert!(heu.should_be_ignored(2_000, 1_000));
        let young = resources.request(GCReason::Young);
        assert!(young.should_be_ignored(2_000, 1_000));
    }

    #[test]
    fn native_requests_respect_the_interval_since_last_request() {
        let resources = resources();
        let native = resources.request(GCReason::Native);
        assert!(!native.should_be_ignored(1_000, 0));
        assert!(native.should_be_ignored(2_000, 0));
    }

    #[test]
    fn urgent_and_explicit_requests_are_never_ignored() {
        let resources = resources();
        for reason in [GCReason::Oom, GCReason::Force, GCReason::User, GCReason::AppSpawn] {
            assert!(!resources.request(reason).should_be_ignored(2_000, 1_999));
        }
    }

    #[test]
    fn inactive_collector_rejects_requests() {
        let resources = resources();
        assert_eq!(
            resources.request_gc(GCReason::User, false),
            Err(HeapError::CollectorInactive)
        );
    }
}
