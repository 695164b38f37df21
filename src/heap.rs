//! The heap: construction of the runtime context and the embedding API.

use std::{
    sync::{Arc, Weak},
    thread::JoinHandle,
};

use parking_lot::Mutex;

use crate::{
    allocator::{AggregateAllocator, PagePool},
    collector::{
        resources::CollectorResources, task_queue::GCTaskType, GCReason, GcState, GcTrigger,
    },
    error::Result,
    finalizer::FinalizerProcessor,
    marking::SatbBuffer,
    mutator::{spawn_mutator, Mutator},
    object::{ObjectRef, RefField},
    param::RuntimeParam,
    region::RegionManager,
    roots::{RootProvider, StaticRoots},
    safepoint::GlobalSafepoint,
    space::RegionSpace,
    statistics::{formatted_size, GcStats, HeapStatistics},
};

/// Everything shared by mutators, the collector and the finalizer thread. Built once by
/// [`Heap::new`] and passed around explicitly.
pub struct RuntimeContext {
    pub(crate) param: RuntimeParam,
    pub(crate) gc_state: Arc<GcState>,
    pub(crate) stats: Arc<GcStats>,
    pub(crate) space: RegionSpace,
    pub(crate) page_pool: Arc<PagePool>,
    /// Native memory for the collector's own containers.
    pub(crate) native: Arc<AggregateAllocator>,
    pub(crate) safepoint: GlobalSafepoint,
    pub(crate) roots: StaticRoots,
    pub(crate) satb: SatbBuffer,
    pub(crate) finalizer: FinalizerProcessor,
    pub(crate) resources: CollectorResources,
    pub(crate) last_heap_dump: Mutex<Option<HeapStatistics>>,
}

impl RuntimeContext {
    fn new(param: RuntimeParam) -> Result<Self> {
        let gc_state = Arc::new(GcState::default());
        let stats = Arc::new(GcStats::new(param.heap.min_gc_threshold));
        let manager = RegionManager::new(&param, gc_state.clone(), stats.clone())?;
        let page_pool = Arc::new(PagePool::new(param.heap.page_pool_size)?);
        Ok(Self {
            space: RegionSpace::new(manager, gc_state.clone()),
            native: Arc::new(AggregateAllocator::new(page_pool.clone())),
            page_pool,
            safepoint: GlobalSafepoint::new(),
            roots: StaticRoots::default(),
            satb: SatbBuffer::default(),
            finalizer: FinalizerProcessor::new(param.gc.finalizer_wait_time),
            resources: CollectorResources::new(&param.gc, param.heap.cache_units, stats.clone()),
            last_heap_dump: Mutex::new(None),
            gc_state,
            stats,
            param,
        })
    }
}

impl GcTrigger for RuntimeContext {
    fn trigger_gc(&self, reason: GCReason) {
        if let Err(err) = self.resources.request_gc(reason, true) {
            log::debug!("{} gc request dropped: {}", reason.name(), err);
        }
    }
}

pub struct Heap {
    context: Arc<RuntimeContext>,
}

impl Heap {
    /// Reserves the heap and starts the GC main thread and the finalizer thread.
    pub fn new(param: RuntimeParam) -> Result<Self> {
        param.validate()?;
        let context = Arc::new(RuntimeContext::new(param)?);
        let trigger: Arc<dyn GcTrigger> = context.clone();
        let trigger: Weak<dyn GcTrigger> = Arc::downgrade(&trigger);
        context.space.manager().set_gc_trigger(trigger);
        let heap = Self { context };
        heap.context.resources.start(heap.context.clone())?;
        heap.context.finalizer.start(heap.context.clone())?;
        log::info!(
            "heap initialized: {} in {} units, {} gc helpers",
            formatted_size(heap.context.space.manager().capacity()),
            heap.context.param.unit_count(),
            heap.context.param.gc.gc_threads
        );
        Ok(heap)
    }

    pub(crate) fn context(&self) -> &Arc<RuntimeContext> {
        &self.context
    }

    /// Attaches the calling thread.
    pub fn attach_mutator(&self, name: &str) -> Mutator {
        Mutator::attach(self.context.clone(), name)
    }

    /// Spawns a thread with its own attached mutator.
    pub fn spawn_mutator<F, R>(&self, name: &str, closure: F) -> Result<JoinHandle<R>>
    where
        F: FnOnce(&Mutator) -> R + Send + 'static,
        R: Send + 'static,
    {
        spawn_mutator(self.context.clone(), name, closure)
    }

    /// Requests a collection. Sync requests block until it finishes, so a thread with a
    /// running mutator must use [`Mutator::request_gc`] instead.
    pub fn request_gc(&self, reason: GCReason, is_async: bool) -> Result<()> {
        self.context.resources.request_gc(reason, is_async)
    }

    pub fn wait_for_gc_finish(&self) {
        self.context.resources.wait_for_gc_finish();
    }

    pub fn is_gc_running(&self) -> bool {
        self.context.resources.is_gc_running()
    }

    /// Takes a heap dump on the GC thread and waits for it. The result is available from
    /// [`Heap::last_heap_dump`].
    pub fn request_heap_dump(&self, task_type: GCTaskType) -> Result<()> {
        debug_assert!(matches!(
            task_type,
            GCTaskType::DumpHeap | GCTaskType::DumpHeapOom
        ));
        self.context
            .resources
            .request_sync_task(task_type, GCReason::User)
    }

    pub fn last_heap_dump(&self) -> Option<HeapStatistics> {
        self.context.last_heap_dump.lock().clone()
    }

    /// Runs a full stop-the-world collection and freezes every surviving old region.
    /// Frozen regions are never evacuated again.
    pub fn freeze_for_app_spawn(&self) -> Result<()> {
        self.request_gc(GCReason::AppSpawn, false)
    }

    /// Current region and collection counters.
    pub fn statistics(&self) -> HeapStatistics {
        let mut stats = HeapStatistics::default();
        self.context.space.manager().fill_statistics(&mut stats);
        stats
    }

    pub fn add_root_provider(&self, provider: Arc<dyn RootProvider>) {
        self.context.roots.add_provider(provider);
    }

    pub fn register_static_root(&self, slot: &'static RefField) {
        self.context.roots.register_static(slot);
    }

    /// Registers an interned-string slot. Only old objects may be stored there.
    pub fn register_string_table_root(&self, slot: &'static RefField) {
        self.context.roots.register_string_table(slot);
    }

    /// Moves up to `limit` finalizer candidates accepted by `predicate` to the finalizer
    /// thread.
    pub fn enqueue_finalizables(
        &self,
        predicate: impl FnMut(ObjectRef) -> bool,
        limit: usize,
    ) -> usize {
        self.context.finalizer.enqueue_finalizables(predicate, limit)
    }

    pub fn finalizer_candidates(&self) -> usize {
        self.context.finalizer.candidate_count()
    }

    pub fn gc_state(&self) -> &GcState {
        &self.context.gc_state
    }

    pub fn stats(&self) -> &GcStats {
        &self.context.stats
    }

    pub fn param(&self) -> &RuntimeParam {
        &self.context.param
    }

    pub fn native_pages_in_use(&self) -> usize {
        self.context.page_pool.pages_in_use()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.context.resources.stop();
        self.context.finalizer.stop();
        log::debug!("heap shut down");
    }
}
