//! Read and write barriers, selected by the published collector phase.
//!
//! Phase changes that switch barrier families only happen while every mutator is stopped,
//! so a mutator sees one family for the whole of a barrier call.

pub mod copy_barrier;
pub mod mark_barrier;
pub mod preforward_barrier;

use crate::{
    collector::{copy::forward_if_needed, GCPhase},
    heap::RuntimeContext,
    object::{ObjectRef, RefField},
    tlab::AllocationBuffer,
};

pub use copy_barrier::CopyBarrier;
pub use mark_barrier::MarkBarrier;
pub use preforward_barrier::PreforwardBarrier;

/// What a barrier needs from the calling thread.
pub(crate) struct BarrierEnv<'a> {
    pub context: &'a RuntimeContext,
    pub buffer: &'a AllocationBuffer,
}

impl<'a> BarrierEnv<'a> {
    pub fn new(context: &'a RuntimeContext, buffer: &'a AllocationBuffer) -> Self {
        Self { context, buffer }
    }
}

pub(crate) trait Barrier {
    /// Loads `field` and returns the reference a mutator may use.
    fn read_ref(env: &BarrierEnv<'_>, field: &RefField) -> Option<ObjectRef> {
        let _ = env;
        field.target()
    }

    /// Runs before a store overwrites `field`.
    fn pre_write(env: &BarrierEnv<'_>, field: &RefField) {
        let _ = (env, field);
    }

    /// Returns the current location of `obj`.
    fn resolve(env: &BarrierEnv<'_>, obj: ObjectRef) -> ObjectRef {
        let _ = env;
        obj
    }
}

/// Plain loads and stores while no collection is in progress.
pub struct IdleBarrier;

impl Barrier for IdleBarrier {}

macro_rules! dispatch {
    ($env:expr, $method:ident($($arg:expr),*)) => {
        match $env.context.gc_state.phase() {
            GCPhase::Idle | GCPhase::Start => IdleBarrier::$method($env, $($arg),*),
            GCPhase::Enum
            | GCPhase::Mark
            | GCPhase::RemarkSatb
            | GCPhase::FinalMark
            | GCPhase::PostMark => MarkBarrier::$method($env, $($arg),*),
            GCPhase::Precopy => PreforwardBarrier::$method($env, $($arg),*),
            GCPhase::Copy | GCPhase::Fix => CopyBarrier::$method($env, $($arg),*),
        }
    };
}

#[inline]
pub(crate) fn read_ref(env: &BarrierEnv<'_>, field: &RefField) -> Option<ObjectRef> {
    dispatch!(env, read_ref(field))
}

#[inline]
pub(crate) fn pre_write(env: &BarrierEnv<'_>, field: &RefField) {
    dispatch!(env, pre_write(field))
}

#[inline]
pub(crate) fn resolve(env: &BarrierEnv<'_>, obj: ObjectRef) -> ObjectRef {
    dispatch!(env, resolve(obj))
}

/// Resolves a value about to be stored. Only evacuating phases can hand out stale copies.
#[inline]
pub(crate) fn resolve_value(env: &BarrierEnv<'_>, value: Option<ObjectRef>) -> Option<ObjectRef> {
    match value {
        Some(obj) if env.context.gc_state.phase().is_evacuating() => {
            Some(forward_if_needed(env.context, env.buffer, obj))
        }
        other => other,
    }
}

/// Records `holder` in the remembered set when an old holder now points at a young object.
#[inline]
pub(crate) fn remember(env: &BarrierEnv<'_>, holder: ObjectRef, value: Option<ObjectRef>) {
    let value = match value {
        Some(value) => value,
        None => return,
    };
    let manager = env.context.space.manager();
    let table = manager.table();
    let holder_young = match table.region_desc_of(holder.address()) {
        Some(desc) => desc.region_type().is_young(),
        None => return,
    };
    if holder_young {
        return;
    }
    match table.region_desc_of(value.address()) {
        Some(desc) if desc.region_type().is_young() => manager.bitmaps().remember(holder.address()),
        _ => {}
    }
}
