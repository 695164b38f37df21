//! The tracing collector: one mark, copy and fix cycle over the region space.
//!
//! Each cycle stamps three lines on every region it touches. Objects below the trace line
//! live only if marked; objects above it were allocated during the cycle and are live by
//! construction. The copy and fix lines bound what evacuation and reference fixing walk, so
//! that neither phase reads memory a mutator is still initializing.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use super::{
    copy::{evacuate_region, fix_object, fix_region, forward_root},
    thread_pool::GCThreadPool,
    GCPhase, GCReason,
};
use crate::{
    heap::RuntimeContext,
    marking::{is_marked_live, MarkShared, MarkWorker},
    object::{ObjectRef, RefField},
    region::{RegionDesc, RegionId, RegionList, RegionType},
    space::AllocType,
    statistics::{formatted_size, CycleRecord},
    tlab::AllocationBuffer,
    utils::nano_time,
};

pub(crate) struct TraceCollector {
    context: Arc<RuntimeContext>,
    pool: GCThreadPool,
    /// To-space buffer of the GC main thread, used for forwarding roots.
    buffer: AllocationBuffer,
    gc_count: u64,
    reason: GCReason,
    young: bool,
    start_ns: u64,
    freed_bytes: usize,
    pause_ns: u64,
}

impl TraceCollector {
    pub fn new(context: Arc<RuntimeContext>, pool: GCThreadPool) -> Self {
        Self {
            context,
            pool,
            buffer: AllocationBuffer::new(true),
            gc_count: 0,
            reason: GCReason::User,
            young: false,
            start_ns: 0,
            freed_bytes: 0,
            pause_ns: 0,
        }
    }

    fn phase_log_level(&self) -> log::Level {
        if self.context.param.gc.verbose {
            log::Level::Info
        } else {
            log::Level::Debug
        }
    }

    fn stw_workers(&self) -> usize {
        self.pool.size().min(2)
    }

    fn concurrent_workers(&self) -> usize {
        self.pool.size().saturating_sub(1).max(1)
    }

    fn begin(&mut self, reason: GCReason, young: bool) {
        self.gc_count += 1;
        self.reason = reason;
        self.young = young;
        self.start_ns = nano_time();
        self.freed_bytes = 0;
        self.pause_ns = 0;
        self.context.gc_state.set_gc_index(self.gc_count);
        self.context.gc_state.set_running(true);
        log::debug!(
            "[gc #{}] start: reason {}, {} cycle",
            self.gc_count,
            reason.name(),
            if young { "young" } else { "full" }
        );
    }

    /// Runs `f` with every mutator stopped.
    fn pause<R>(&mut self, name: &str, f: impl FnOnce(&mut Self) -> R) -> R {
        let context = self.context.clone();
        let start = nano_time();
        let stw = context.safepoint.stop_the_world();
        let result = f(self);
        drop(stw);
        let pause = nano_time() - start;
        self.pause_ns += pause;
        context.stats.record_pause(pause);
        log::log!(
            self.phase_log_level(),
            "[gc #{}] {} pause {:.3}ms",
            self.gc_count,
            name,
            pause as f64 / 1e6
        );
        result
    }

    /// Mostly-concurrent cycle. Young cycles only trace and evacuate young regions.
    pub fn run_concurrent(&mut self, reason: GCReason, young: bool) {
        self.begin(reason, young);
        let shared = Arc::new(MarkShared::new(young));
        self.pause("init mark", |gc| gc.enumerate(&shared));

        let workers = self.concurrent_workers();
        self.parallel_mark(&shared, workers);
        self.context.gc_state.set_phase(GCPhase::RemarkSatb);
        self.drain_satb(&shared);
        self.parallel_mark(&shared, workers);

        let from = self.pause("final mark", |gc| {
            gc.final_mark(&shared);
            gc.post_mark(&shared);
            gc.precopy()
        });
        self.parallel_copy(from, workers);
        let fix = self.pause("pre fix", |gc| gc.prepare_fix());
        self.parallel_fix(fix, workers);
        self.pause("finish", |gc| gc.finish());
    }

    /// The whole cycle inside one pause.
    pub fn run_stop_the_world(&mut self, reason: GCReason) {
        self.begin(reason, false);
        let shared = Arc::new(MarkShared::new(false));
        self.pause("full", |gc| {
            let workers = gc.stw_workers();
            gc.enumerate(&shared);
            gc.parallel_mark(&shared, workers);
            gc.final_mark(&shared);
            gc.post_mark(&shared);
            let from = gc.precopy();
            gc.parallel_copy(from, workers);
            let fix = gc.prepare_fix();
            gc.parallel_fix(fix, workers);
            gc.finish();
        });
    }

    /// Visits every region this cycle traces.
    fn for_each_traced_region(&self, mut f: impl FnMut(RegionId)) {
        let manager = self.context.space.manager();
        let table = manager.table();
        if self.young {
            manager.thread_local_regions.for_each(table, &mut f);
            manager.recent_full_regions.for_each(table, &mut f);
            return;
        }
        self.for_each_region(&mut f);
    }

    fn for_each_region(&self, mut f: impl FnMut(RegionId)) {
        let manager = self.context.space.manager();
        let table = manager.table();
        for list in manager.all_lists() {
            list.for_each(table, &mut f);
        }
        self.context
            .space
            .buffers()
            .for_each(|buffer| buffer.tl_raw_pointer_regions.for_each(table, &mut f));
    }

    /// Visits the holders recorded in the remembered-set snapshot that still sit in a live
    /// region.
    fn for_each_remembered_holder(&self, mut f: impl FnMut(ObjectRef)) {
        let manager = self.context.space.manager();
        manager.bitmaps().for_each_remembered_snapshot(|addr| {
            match manager.region_type_of(addr) {
                None | Some(RegionType::Free) | Some(RegionType::Garbage) => {}
                Some(_) => {
                    if let Some(holder) = ObjectRef::from_address(addr) {
                        f(holder);
                    }
                }
            }
        });
    }

    /// Visits every root slot. Young cycles skip the string table, whose objects are always
    /// old, and add the fields of remembered holders.
    fn visit_roots(&self, young: bool, f: &mut dyn FnMut(&RefField)) {
        let context = &self.context;
        context.safepoint.for_each_mutator(|record| {
            for slot in record.roots.lock().iter() {
                f(slot);
            }
        });
        context.roots.for_each_static(&mut *f);
        if !young {
            context.roots.for_each_string_table(&mut *f);
        }
        context.finalizer.for_each_root(&mut *f);
        context.roots.for_each_provider_root(&mut *f);
        if young {
            self.for_each_remembered_holder(|holder| holder.for_each_ref_field(&mut *f));
        }
    }

    fn enumerate(&mut self, shared: &MarkShared) {
        let context = &self.context;
        let manager = context.space.manager();
        let table = manager.table();
        context.gc_state.set_phase(GCPhase::Start);
        context.satb.take();
        manager.bitmaps().flip_remembered_set();
        self.for_each_traced_region(|id| {
            let desc = table.desc(id);
            desc.reset_live_info();
            desc.set_trace_line();
        });
        context.gc_state.set_phase(GCPhase::Enum);
        self.visit_roots(self.young, &mut |field| shared.mark_root(manager, field));
        context.gc_state.set_phase(GCPhase::Mark);
    }

    fn parallel_mark(&self, shared: &Arc<MarkShared>, workers: usize) {
        if shared.injector.is_empty() {
            return;
        }
        let workers = workers.clamp(1, self.pool.size());
        shared.begin(workers);
        let context = self.context.clone();
        let worker_shared = shared.clone();
        self.pool.run_with(
            workers,
            Arc::new(move |_| MarkWorker::new(&context, &worker_shared).run()),
            |dispatched| shared.set_workers(dispatched),
        );
    }

    fn drain_satb(&self, shared: &MarkShared) {
        let manager = self.context.space.manager();
        let entries = self.context.satb.take();
        if !entries.is_empty() {
            log::trace!("[gc #{}] draining {} satb entries", self.gc_count, entries.len());
        }
        for addr in entries {
            if let Some(obj) = ObjectRef::from_address(addr) {
                shared.mark_and_push(manager, obj);
            }
        }
    }

    fn final_mark(&mut self, shared: &Arc<MarkShared>) {
        let manager = self.context.space.manager();
        self.context.gc_state.set_phase(GCPhase::FinalMark);
        self.visit_roots(self.young, &mut |field| shared.mark_root(manager, field));
        self.drain_satb(shared);
        self.parallel_mark(shared, self.stw_workers());
        log::debug!(
            "[gc #{}] marked {}",
            self.gc_count,
            formatted_size(shared.marked_bytes())
        );
    }

    fn post_mark(&mut self, shared: &Arc<MarkShared>) {
        let context = self.context.clone();
        let space = &context.space;
        let manager = space.manager();
        let young = self.young;
        context.gc_state.set_phase(GCPhase::PostMark);

        let dead = context
            .finalizer
            .collect_dead_candidates(|obj| is_marked_live(manager, obj, young));
        if dead > 0 {
            log::debug!("[gc #{}] {} objects need finalization", self.gc_count, dead);
            context
                .finalizer
                .for_each_root(|field| shared.mark_root(manager, field));
            self.parallel_mark(shared, self.stw_workers());
        }

        space.buffers().for_each(|buffer| buffer.retire_for_gc(space));
        space.retire_shared_pinned_region();

        if !young {
            manager.assemble_large_garbage_candidates();
            manager.assemble_pinned_garbage_candidates();
            self.sweep_list(&manager.old_large_regions);
            self.sweep_list(&manager.full_pinned_regions);
            self.sweep_list(&manager.raw_pointer_regions);
            space.buffers().for_each(|buffer| {
                let current = buffer.current_region(AllocType::RawPointer);
                self.sweep_list_except(&buffer.tl_raw_pointer_regions, current);
            });
        }
        self.select_from_regions();
    }

    fn sweep_list(&mut self, list: &RegionList) {
        self.sweep_list_except(list, RegionId::NONE);
    }

    /// Moves regions without live objects to the garbage list.
    fn sweep_list_except(&mut self, list: &RegionList, keep: RegionId) {
        let manager = self.context.space.manager();
        let table = manager.table();
        for id in list.ids(table) {
            let desc = table.desc(id);
            if id == keep || !desc.is_garbage_after_mark() || desc.raw_pointer_objects() != 0 {
                continue;
            }
            list.delete(table, id);
            self.freed_bytes += desc.allocated_bytes();
            manager
                .garbage_regions
                .prepend(table, id, RegionType::Garbage);
        }
    }

    fn select_from_regions(&mut self) {
        let context = self.context.clone();
        let manager = context.space.manager();
        let table = manager.table();
        for id in manager.recent_full_regions.ids(table) {
            manager.recent_full_regions.delete(table, id);
            self.move_to_from_or_garbage(id);
        }
        if !self.young {
            let threshold = context.param.heap.exemption_threshold;
            for id in manager.old_regions.ids(table) {
                let desc = table.desc(id);
                if desc.is_garbage_after_mark() || live_ratio(desc) < threshold {
                    manager.old_regions.delete(table, id);
                    self.move_to_from_or_garbage(id);
                }
            }
        }
        log::debug!(
            "[gc #{}] {} from regions ({} units)",
            self.gc_count,
            manager.from_regions.region_count(),
            manager.from_regions.unit_count()
        );
    }

    fn move_to_from_or_garbage(&mut self, id: RegionId) {
        let manager = self.context.space.manager();
        let table = manager.table();
        let desc = table.desc(id);
        if desc.is_garbage_after_mark() {
            self.freed_bytes += desc.allocated_bytes();
            manager
                .garbage_regions
                .prepend(table, id, RegionType::Garbage);
        } else {
            manager.from_regions.prepend(table, id, RegionType::From);
        }
    }

    /// Stamps copy and fix lines and forwards every root. Returns the regions to evacuate.
    fn precopy(&mut self) -> Vec<RegionId> {
        let context = self.context.clone();
        let manager = context.space.manager();
        let table = manager.table();
        context.gc_state.set_phase(GCPhase::Precopy);
        self.for_each_region(|id| {
            let desc = table.desc(id);
            desc.set_copy_line();
            desc.set_fix_line();
        });
        manager.bitmaps().merge_active_into_snapshot();

        let buffer = &self.buffer;
        self.visit_roots(false, &mut |field| forward_root(&context, buffer, field));
        context
            .finalizer
            .for_each_candidate(|field| forward_root(&context, buffer, field));

        let from = manager.from_regions.ids(table);
        context.gc_state.set_phase(GCPhase::Copy);
        from
    }

    fn parallel_copy(&self, from: Vec<RegionId>, workers: usize) {
        if from.is_empty() {
            return;
        }
        let context = self.context.clone();
        let regions = Arc::new(from);
        let cursor = Arc::new(AtomicUsize::new(0));
        let copied = Arc::new(AtomicUsize::new(0));
        let counter = copied.clone();
        self.pool.run(
            workers,
            Arc::new(move |_| {
                let buffer = AllocationBuffer::new(true);
                let mut objects = 0;
                loop {
                    let i = cursor.fetch_add(1, Ordering::AcqRel);
                    if i >= regions.len() {
                        break;
                    }
                    objects += evacuate_region(&context, &buffer, regions[i]);
                }
                buffer.retire_to_region(&context.space);
                counter.fetch_add(objects, Ordering::AcqRel);
            }),
        );
        log::debug!(
            "[gc #{}] forwarded {} objects",
            self.gc_count,
            copied.load(Ordering::Acquire)
        );
    }

    /// Hands to-regions back from every buffer, keeps demoted from-regions in place, and
    /// returns the regions whose references need fixing.
    fn prepare_fix(&mut self) -> Vec<RegionId> {
        let context = self.context.clone();
        let space = &context.space;
        let manager = space.manager();
        let table = manager.table();
        space.buffers().for_each(|buffer| buffer.retire_to_region(space));
        self.buffer.retire_to_region(space);

        let mut demoted = 0;
        while let Some(id) = manager
            .from_regions
            .take_first(table, |id| table.desc(id).is_fix_in_place())
        {
            manager.to_regions.prepend(table, id, RegionType::To);
            demoted += 1;
        }
        if demoted > 0 {
            log::warn!(
                "[gc #{}] {} from regions fixed in place",
                self.gc_count,
                demoted
            );
        }
        manager
            .to_regions
            .for_each(table, |id| table.desc(id).set_fix_line());

        let regions = if self.young {
            manager.to_regions.ids(table)
        } else {
            let mut regions = Vec::new();
            self.for_each_region(|id| match table.desc(id).region_type() {
                RegionType::From | RegionType::Garbage => {}
                _ => regions.push(id),
            });
            regions
        };
        context.gc_state.set_phase(GCPhase::Fix);
        regions
    }

    fn parallel_fix(&self, regions: Vec<RegionId>, workers: usize) {
        let young = self.young;
        let context = self.context.clone();
        let regions = Arc::new(regions);
        let cursor = Arc::new(AtomicUsize::new(0));
        let holders = Arc::new(if young {
            let mut holders = Vec::new();
            self.for_each_remembered_holder(|holder| holders.push(holder));
            holders
        } else {
            Vec::new()
        });
        if regions.is_empty() && holders.is_empty() {
            return;
        }
        let holder_cursor = Arc::new(AtomicUsize::new(0));
        self.pool.run(
            workers,
            Arc::new(move |_| {
                let table = context.space.manager().table();
                loop {
                    let i = holder_cursor.fetch_add(1, Ordering::AcqRel);
                    if i >= holders.len() {
                        break;
                    }
                    fix_object(table, holders[i]);
                }
                loop {
                    let i = cursor.fetch_add(1, Ordering::AcqRel);
                    if i >= regions.len() {
                        break;
                    }
                    fix_region(&context, regions[i]);
                }
            }),
        );
    }

    fn finish(&mut self) {
        let context = self.context.clone();
        let manager = context.space.manager();
        let table = manager.table();

        self.freed_bytes += manager.from_regions.allocated_bytes(table);
        manager
            .garbage_regions
            .merge_from(table, &manager.from_regions, RegionType::Garbage);
        manager
            .to_regions
            .for_each(table, |id| table.desc(id).set_fix_in_place(false));
        manager
            .old_regions
            .merge_from(table, &manager.to_regions, RegionType::Old);
        manager.bitmaps().clear_marks();
        manager.bitmaps().clear_remembered_snapshot();

        if self.reason == GCReason::AppSpawn {
            manager
                .app_spawn_regions
                .merge_from(table, &manager.old_regions, RegionType::AppSpawn);
            log::info!(
                "[gc #{}] {} units frozen for appspawn",
                self.gc_count,
                manager.app_spawn_regions.unit_count()
            );
        }

        let live_bytes: usize = manager
            .all_lists()
            .iter()
            .filter(|list| !std::ptr::eq(**list, &manager.garbage_regions as *const RegionList))
            .map(|list| list.allocated_bytes(table))
            .sum();
        let param = &context.param.heap;
        let next_threshold =
            ((live_bytes as f64 * param.heap_growth_factor) as usize).max(param.min_gc_threshold);
        let end_ns = nano_time();
        context.stats.record_cycle(CycleRecord {
            young: self.young,
            start_ns: self.start_ns,
            end_ns,
            live_bytes,
            freed_bytes: self.freed_bytes,
            next_threshold,
        });
        context.gc_state.set_phase(GCPhase::Idle);
        context.gc_state.set_running(false);
        context.finalizer.notify_reclaim_heap_garbage();

        log::info!(
            "[gc #{}] {} {}: freed {}, live {}, threshold {}, pause {:.3}ms, total {:.3}ms",
            self.gc_count,
            if self.young { "young" } else { "full" },
            self.reason.name(),
            formatted_size(self.freed_bytes),
            formatted_size(live_bytes),
            formatted_size(next_threshold),
            self.pause_ns as f64 / 1e6,
            (end_ns - self.start_ns) as f64 / 1e6
        );
    }
}

/// Fraction of a region's allocated bytes that survive marking. Objects above the trace
/// line count as live.
fn live_ratio(desc: &RegionDesc) -> f64 {
    let allocated = desc.allocated_bytes();
    if allocated == 0 {
        return 0.0;
    }
    let live = desc.live_bytes() + desc.alloc_ptr().saturating_sub(desc.trace_line());
    live as f64 / allocated as f64
}
