use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Barrier,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    barrier::copy_barrier::try_forward_ref_field,
    collector::{task_queue::GCTaskType, GCPhase, GCReason},
    error::HeapError,
    globals::UNIT_SIZE,
    heap::Heap,
    mutator::Mutator,
    object::{ObjectRef, RefField, TypeInfo},
    param::RuntimeParam,
    region::RegionType,
    space::AllocType,
    tlab::AllocationBuffer,
};

/// Header, `next`, `value`.
static NODE: TypeInfo = TypeInfo::fixed("Node", 24, &[8]);
static HOLDER: TypeInfo = TypeInfo::fixed("Holder", 16, &[8]);
static BYTES: TypeInfo = TypeInfo::array("Bytes", 1, false);
static REFS: TypeInfo = TypeInfo::array("Refs", 8, true);

const NEXT: usize = 8;
const VALUE: usize = 16;

fn param(units: usize) -> RuntimeParam {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut param = RuntimeParam::default();
    param.heap.heap_size = units * UNIT_SIZE;
    param.heap.allocation_rate = 0;
    param.heap.min_gc_threshold = usize::MAX / 4;
    param.gc.gc_threads = 2;
    param.gc.min_heu_gc_interval = Duration::ZERO;
    param
}

fn heap(units: usize) -> Heap {
    Heap::new(param(units)).unwrap()
}

fn value(obj: ObjectRef) -> u64 {
    unsafe { *((obj.address() + VALUE) as *const u64) }
}

fn set_value(obj: ObjectRef, value: u64) {
    unsafe { *((obj.address() + VALUE) as *mut u64) = value }
}

/// Builds `len` nodes holding `len - 1` down to 0 and returns the root slot of the head.
fn build_list(mutator: &Mutator, len: u64) -> usize {
    let head = mutator.push_root(None);
    for i in 0..len {
        let node = mutator.new_object(&NODE).unwrap();
        set_value(node, i);
        let prev = mutator.root(head);
        mutator.write_ref_field(node, NEXT, prev);
        mutator.set_root(head, Some(node));
    }
    head
}

fn check_list(mutator: &Mutator, head: usize, len: u64) {
    let mut expected = len;
    let mut cur = mutator.root(head);
    while let Some(node) = cur {
        expected -= 1;
        assert_eq!(value(node), expected);
        cur = mutator.read_ref_field(node, NEXT);
    }
    assert_eq!(expected, 0);
}

fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}

#[test]
fn invalid_param_is_rejected() {
    let mut param = param(64);
    param.heap.heap_size = UNIT_SIZE;
    assert!(matches!(Heap::new(param), Err(HeapError::InvalidConfig(_))));
}

#[test]
fn linked_list_survives_concurrent_collection() {
    let heap = heap(64);
    let mutator = heap.attach_mutator("main");
    let head = build_list(&mutator, 5000);
    mutator.request_gc(GCReason::User, false).unwrap();
    assert!(heap.stats().gc_count() >= 1);
    assert!(heap.stats().copied_bytes() > 0);
    assert_eq!(heap.gc_state().phase(), GCPhase::Idle);
    check_list(&mutator, head, 5000);
}

#[test]
fn stop_the_world_collection_reclaims_garbage() {
    let heap = heap(64);
    let mutator = heap.attach_mutator("main");
    let head = build_list(&mutator, 1000);
    for _ in 0..20_000 {
        mutator.new_array(&BYTES, 100).unwrap();
    }
    mutator.request_gc(GCReason::Force, false).unwrap();
    assert!(heap.stats().freed_bytes() > 0);
    check_list(&mutator, head, 1000);

    mutator.request_gc(GCReason::Force, false).unwrap();
    check_list(&mutator, head, 1000);
    assert!(heap.stats().gc_count() >= 2);
}

#[test]
fn concurrent_mutators_survive_collections() {
    const THREADS: usize = 4;
    const LEN: u64 = 2000;
    let heap = heap(128);
    let done = Arc::new(AtomicBool::new(false));
    let started = Arc::new(Barrier::new(THREADS + 1));
    let workers: Vec<_> = (0..THREADS)
        .map(|i| {
            let done = done.clone();
            let started = started.clone();
            heap.spawn_mutator(&format!("worker-{}", i), move |mutator| {
                let head = build_list(mutator, LEN);
                started.wait();
                let mut rounds = 0;
                loop {
                    for _ in 0..100 {
                        mutator.new_array(&BYTES, 48).unwrap();
                    }
                    check_list(mutator, head, LEN);
                    rounds += 1;
                    if done.load(Ordering::Acquire) {
                        break rounds;
                    }
                }
            })
            .unwrap()
        })
        .collect();

    started.wait();
    for _ in 0..3 {
        heap.request_gc(GCReason::User, false).unwrap();
    }
    done.store(true, Ordering::Release);
    for worker in workers {
        assert!(worker.join().unwrap() > 0);
    }
    assert!(heap.stats().gc_count() >= 3);

    let stats = heap.statistics();
    assert_eq!(stats.list("from").map(|s| s.regions), Some(0));
    assert_eq!(stats.list("to").map(|s| s.regions), Some(0));
}

#[test]
fn racing_threads_forward_an_object_once() {
    const THREADS: usize = 8;
    let heap = heap(64);
    let mutator = heap.attach_mutator("main");
    let obj = mutator.new_object(&NODE).unwrap();
    set_value(obj, 42);

    let context = heap.context().clone();
    let space = &context.space;
    let manager = space.manager();
    let table = manager.table();
    let id = table.region_of(obj.address()).unwrap();
    {
        let _safe = mutator.enter_safe_region();
        let _stw = context.safepoint.stop_the_world();
        space.buffers().for_each(|buffer| buffer.retire_for_gc(space));
        manager.recent_full_regions.delete(table, id);
        manager.from_regions.prepend(table, id, RegionType::From);
        table.desc(id).set_copy_line();
        context.gc_state.set_phase(GCPhase::Copy);
    }

    let field: &'static RefField = Box::leak(Box::new(RefField::new(Some(obj))));
    let start = Arc::new(Barrier::new(THREADS));
    let threads: Vec<_> = (0..THREADS)
        .map(|_| {
            let context = context.clone();
            let start = start.clone();
            thread::spawn(move || {
                let buffer = AllocationBuffer::new(true);
                start.wait();
                let copy = try_forward_ref_field(&context, &buffer, field);
                buffer.retire_to_region(&context.space);
                copy.map(|c| c.address())
            })
        })
        .collect();
    let copies: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    let copy = obj.header().forwardee().unwrap();
    assert_ne!(copy, obj);
    assert!(copies.iter().all(|c| *c == Some(copy.address())));
    assert_eq!(field.target(), Some(copy));
    assert_eq!(value(copy), 42);
    assert_eq!(context.stats.copied_bytes(), obj.size());

    {
        let _safe = mutator.enter_safe_region();
        let _stw = context.safepoint.stop_the_world();
        manager
            .old_regions
            .merge_from(table, &manager.to_regions, RegionType::Old);
        manager
            .garbage_regions
            .merge_from(table, &manager.from_regions, RegionType::Garbage);
        context.gc_state.set_phase(GCPhase::Idle);
    }
}

#[test]
fn young_collection_keeps_old_to_young_references() {
    let mut param = param(64);
    param.gc.enable_young_gc = true;
    let heap = Heap::new(param).unwrap();
    let mutator = heap.attach_mutator("main");

    let holder = mutator.new_object_with(&HOLDER, AllocType::Old).unwrap();
    let slot = mutator.push_root(Some(holder));
    let child = mutator.new_object(&NODE).unwrap();
    set_value(child, 7);
    let holder = mutator.root(slot).unwrap();
    mutator.write_ref_field(holder, 8, Some(child));
    let old_child = child.address();

    mutator.request_gc(GCReason::Young, false).unwrap();
    assert_eq!(heap.stats().young_gc_count(), 1);

    let holder = mutator.root(slot).unwrap();
    let child = mutator.read_ref_field(holder, 8).unwrap();
    assert_eq!(value(child), 7);
    assert_ne!(child.address(), old_child);
    assert_eq!(
        heap.context().space.manager().region_type_of(child.address()),
        Some(RegionType::Old)
    );
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn count_finalized(_: &Mutator, obj: ObjectRef) {
    if value(obj) == 0xfeed {
        FINALIZED.fetch_add(1, Ordering::AcqRel);
    }
}

static FINALIZABLE: TypeInfo = TypeInfo::fixed("Finalizable", 24, &[8]).with_finalizer(count_finalized);

#[test]
fn finalizers_run_for_dead_objects() {
    let heap = heap(64);
    let mutator = heap.attach_mutator("main");
    let live = mutator.new_object(&FINALIZABLE).unwrap();
    let slot = mutator.push_root(Some(live));
    mutator.register_finalizer(live);
    for _ in 0..3 {
        let dead = mutator.new_object(&FINALIZABLE).unwrap();
        set_value(dead, 0xfeed);
        mutator.register_finalizer(dead);
    }
    assert_eq!(heap.finalizer_candidates(), 4);

    mutator.request_gc(GCReason::User, false).unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        FINALIZED.load(Ordering::Acquire) == 3
    }));
    assert_eq!(heap.finalizer_candidates(), 1);
    assert!(mutator.root(slot).is_some());
}

#[test]
fn exhausted_heap_reports_out_of_memory() {
    let heap = heap(8);
    let mutator = heap.attach_mutator("main");
    let mut result = Ok(());
    for _ in 0..64 {
        match mutator.new_array(&BYTES, UNIT_SIZE / 2) {
            Ok(array) => {
                mutator.push_root(Some(array));
            }
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }
    assert!(matches!(result, Err(HeapError::OutOfMemory { .. })));
    mutator.truncate_roots(0);
    mutator.request_gc(GCReason::Force, false).unwrap();
    assert!(mutator.new_array(&BYTES, UNIT_SIZE / 2).is_ok());
}

#[test]
fn static_roots_follow_moved_objects() {
    let heap = heap(64);
    let slot: &'static RefField = Box::leak(Box::new(RefField::null()));
    heap.register_static_root(slot);
    let mutator = heap.attach_mutator("main");
    let obj = mutator.new_object(&NODE).unwrap();
    set_value(obj, 99);
    mutator.write_static_ref(slot, Some(obj));
    let before = obj.address();

    mutator.request_gc(GCReason::User, false).unwrap();
    let obj = mutator.read_static_ref(slot).unwrap();
    assert_ne!(obj.address(), before);
    assert_eq!(value(obj), 99);
}

#[test]
fn non_movable_objects_keep_their_address() {
    let heap = heap(64);
    let mutator = heap.attach_mutator("main");
    let raw = mutator.new_object_with(&NODE, AllocType::RawPointer).unwrap();
    set_value(raw, 1);
    let raw_slot = mutator.push_root(Some(raw));
    let large = mutator.new_array(&BYTES, UNIT_SIZE / 4).unwrap();
    let large_slot = mutator.push_root(Some(large));
    let (raw_addr, large_addr) = (raw.address(), large.address());

    mutator.request_gc(GCReason::User, false).unwrap();
    let raw = mutator.root(raw_slot).unwrap();
    assert_eq!(raw.address(), raw_addr);
    assert_eq!(value(raw), 1);
    assert_eq!(mutator.root(large_slot).unwrap().address(), large_addr);
    mutator.release_raw_pointer(raw);
}

#[test]
fn heap_dump_lists_regions() {
    let heap = heap(64);
    let mutator = heap.attach_mutator("main");
    let _head = build_list(&mutator, 100);
    {
        let _safe = mutator.enter_safe_region();
        heap.request_heap_dump(GCTaskType::DumpHeap).unwrap();
    }
    let dump = heap.last_heap_dump().unwrap();
    assert_eq!(dump.heap_size, 64 * UNIT_SIZE);
    assert!(dump.used_units > 0);
    assert!(dump.allocated_bytes() >= 100 * NODE.instance_size(0));
}

#[test]
fn app_spawn_freezes_surviving_objects() {
    let heap = heap(64);
    let mutator = heap.attach_mutator("main");
    let head = build_list(&mutator, 500);
    {
        let _safe = mutator.enter_safe_region();
        heap.freeze_for_app_spawn().unwrap();
    }
    let frozen = mutator.root(head).unwrap();
    let manager = heap.context().space.manager();
    assert_eq!(
        manager.region_type_of(frozen.address()),
        Some(RegionType::AppSpawn)
    );

    mutator.request_gc(GCReason::Force, false).unwrap();
    assert_eq!(mutator.root(head).unwrap().address(), frozen.address());
    check_list(&mutator, head, 500);
}

#[test]
fn compare_and_swap_checks_current_value() {
    let heap = heap(64);
    let mutator = heap.attach_mutator("main");
    let holder = mutator.new_object(&HOLDER).unwrap();
    let a = mutator.new_object(&NODE).unwrap();
    let b = mutator.new_object(&NODE).unwrap();
    mutator.write_ref_field(holder, 8, Some(a));
    assert!(!mutator.compare_and_swap_ref_field(holder, 8, Some(b), None));
    assert!(mutator.compare_and_swap_ref_field(holder, 8, Some(a), Some(b)));
    assert_eq!(mutator.atomic_read_ref_field(holder, 8), Some(b));
    assert_eq!(mutator.atomic_swap_ref_field(holder, 8, None), Some(b));
    assert_eq!(mutator.read_ref_field(holder, 8), None);
}

#[test]
fn struct_array_copies_references_and_bytes() {
    let heap = heap(64);
    let mutator = heap.attach_mutator("main");
    let node = mutator.new_object(&NODE).unwrap();
    let src = mutator.new_array(&REFS, 4).unwrap();
    let dst = mutator.new_array(&REFS, 4).unwrap();
    for i in 0..4 {
        mutator.write_ref_field(src, crate::object::element_offset(i), Some(node));
    }
    mutator.copy_struct_array(src, 1, dst, 0, 3);
    assert_eq!(mutator.read_ref_field(dst, crate::object::element_offset(0)), Some(node));
    assert_eq!(mutator.read_ref_field(dst, crate::object::element_offset(3)), None);

    let bytes = mutator.new_array(&BYTES, 16).unwrap();
    let payload = (bytes.address() + crate::object::element_offset(0)) as *mut u8;
    for i in 0..16 {
        unsafe { *payload.add(i) = i as u8 };
    }
    mutator.copy_struct_array(bytes, 0, bytes, 4, 8);
    let copied: Vec<u8> = (0..16).map(|i| unsafe { *payload.add(i) }).collect();
    assert_eq!(&copied[4..12], &[0, 1, 2, 3, 4, 5, 6, 7]);

    let mut out = [0u8; 16];
    mutator.write_ref_field(node, NEXT, Some(node));
    set_value(node, 5);
    mutator.read_struct(node, NEXT, &mut out, &[0]);
    assert_eq!(usize::from_ne_bytes(out[..8].try_into().unwrap()), node.address());
    assert_eq!(u64::from_ne_bytes(out[8..].try_into().unwrap()), 5);
}

#[test]
#[should_panic(expected = "outside")]
fn struct_read_past_the_holder_is_rejected() {
    let heap = heap(16);
    let mutator = heap.attach_mutator("main");
    let node = mutator.new_object(&NODE).unwrap();
    let mut out = [0u8; 24];
    mutator.read_struct(node, NEXT, &mut out, &[]);
}

#[test]
#[should_panic(expected = "reference slot")]
fn struct_reference_slot_must_lie_inside_the_struct() {
    let heap = heap(16);
    let mutator = heap.attach_mutator("main");
    let node = mutator.new_object(&NODE).unwrap();
    let mut out = [0u8; 16];
    mutator.read_struct(node, NEXT, &mut out, &[12]);
}

#[test]
fn unaddressable_array_length_is_out_of_memory() {
    let heap = heap(16);
    let mutator = heap.attach_mutator("main");
    let gcs = heap.stats().gc_count();
    assert!(matches!(
        mutator.new_array(&REFS, usize::MAX / 4),
        Err(HeapError::OutOfMemory { .. })
    ));
    assert!(matches!(
        mutator.new_array(&BYTES, usize::MAX - 8),
        Err(HeapError::OutOfMemory { .. })
    ));
    // fits in usize but not in the heap
    assert!(matches!(
        mutator.new_array(&REFS, usize::MAX / 16),
        Err(HeapError::OutOfMemory { .. })
    ));
    assert_eq!(heap.stats().gc_count(), gcs);

    let array = mutator.new_array(&REFS, 4).unwrap();
    assert_eq!(array.array_length(), 4);
    assert_eq!(array.size(), 48);
}

#[test]
fn no_gc_allocation_installs_a_header_and_never_collects() {
    let mut param = param(8);
    param.gc.enable_young_gc = false;
    let heap = Heap::new(param).unwrap();
    let mutator = heap.attach_mutator("main");
    let obj = mutator.new_object_no_gc(&NODE, AllocType::Young).unwrap();
    assert_eq!(obj.type_info().name, "Node");
    assert_eq!(obj.size(), NODE.instance_size(0));

    let gcs = heap.stats().gc_count();
    let mut result = Ok(obj);
    for _ in 0..1_000_000 {
        result = mutator.new_object_no_gc(&NODE, AllocType::Young);
        match result {
            Ok(node) => {
                mutator.push_root(Some(node));
            }
            Err(_) => break,
        }
    }
    assert!(matches!(result, Err(HeapError::OutOfMemory { .. })));
    assert_eq!(heap.stats().gc_count(), gcs);
}

#[test]
fn allocation_fails_fast_once_the_collector_stops() {
    let heap = heap(8);
    let mutator = heap.attach_mutator("main");
    heap.context().resources.stop();
    let start = Instant::now();
    let mut result = Ok(());
    for _ in 0..64 {
        match mutator.new_array(&BYTES, UNIT_SIZE / 2) {
            Ok(array) => {
                mutator.push_root(Some(array));
            }
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }
    assert!(matches!(result, Err(HeapError::OutOfMemory { .. })));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(heap.stats().gc_count(), 0);
}
