//! Region-based, mostly-concurrent copying heap for managed runtimes.
//!
//! The heap is carved into fixed-size units grouped into regions. Mutators bump-allocate in
//! thread-local regions; a tracing collector marks live objects with snapshot-at-the-beginning
//! barriers, evacuates sparse regions and fixes references, running most of each cycle
//! concurrently with mutators.
//!
//! ```no_run
//! use strata::{Heap, RuntimeParam, TypeInfo};
//!
//! static NODE: TypeInfo = TypeInfo::fixed("Node", 16, &[8]);
//!
//! let heap = Heap::new(RuntimeParam::default()).unwrap();
//! let mutator = heap.attach_mutator("main");
//! let node = mutator.new_object(&NODE).unwrap();
//! let slot = mutator.push_root(Some(node));
//! let child = mutator.new_object(&NODE).unwrap();
//! let node = mutator.root(slot).unwrap();
//! mutator.write_ref_field(node, 8, Some(child));
//! ```

pub mod allocator;
pub(crate) mod barrier;
pub mod collector;
pub mod error;
pub mod finalizer;
pub mod globals;
pub mod heap;
pub mod internal;
pub mod marking;
pub mod mmap;
pub mod mutator;
pub mod object;
pub mod param;
pub mod region;
pub mod roots;
pub mod safepoint;
pub mod space;
pub mod statistics;
pub mod tlab;
pub mod utils;

#[cfg(test)]
mod tests;

pub use collector::{task_queue::GCTaskType, CollectorStrategy, GCPhase, GCReason};
pub use error::{HeapError, Result};
pub use heap::Heap;
pub use mutator::{Mutator, SafeRegion, ScopedObjectAccess};
pub use object::{ObjectLayout, ObjectRef, RefField, TypeInfo};
pub use param::{GCParam, HeapParam, RuntimeParam};
pub use roots::RootProvider;
pub use space::AllocType;
pub use statistics::HeapStatistics;
