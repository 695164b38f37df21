use std::time::Instant;

use strata::{GCReason, Heap, Mutator, ObjectRef, RuntimeParam, TypeInfo};

/// Header, `next`, `value`.
static NODE: TypeInfo = TypeInfo::fixed("Node", 24, &[8]);

fn set_value(obj: ObjectRef, value: i64) {
    unsafe { *((obj.address() + 16) as *mut i64) = value }
}

fn churn(mutator: &Mutator) -> usize {
    let list = mutator.push_root(None);
    let mut allocated = 0;
    for i in 0..5_000_000 {
        let node = mutator.new_object(&NODE).expect("heap exhausted");
        set_value(node, 42);
        let next = mutator.root(list);
        mutator.write_ref_field(node, 8, next);
        mutator.set_root(list, Some(node));
        allocated += 1;

        if i % 8192 == 0 {
            mutator.set_root(list, None);
        }
    }
    allocated
}

fn main() {
    env_logger::init();
    let mut param = RuntimeParam::default();
    param.gc.verbose = true;
    let heap = Heap::new(param).expect("failed to create heap");

    println!("Spawning 4 mutators");
    let start = Instant::now();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            heap.spawn_mutator(&format!("mutator-{}", i), churn)
                .expect("failed to spawn mutator")
        })
        .collect();
    let total: usize = handles
        .into_iter()
        .map(|handle| handle.join().expect("mutator panicked"))
        .sum();
    heap.request_gc(GCReason::User, false)
        .expect("collector stopped");

    let stats = heap.stats();
    println!(
        "allocated {} objects in {:.2}s, {} collections ({} young)",
        total,
        start.elapsed().as_secs_f64(),
        stats.gc_count(),
        stats.young_gc_count()
    );
    println!("{}", heap.statistics());
}
