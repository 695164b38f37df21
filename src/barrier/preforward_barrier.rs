use super::{Barrier, BarrierEnv};
use crate::{
    collector::copy::forward_if_needed,
    object::{ObjectRef, RefField},
};

/// Barrier for the pre-copy pause. Loads forward the referent but leave the field alone;
/// the fix phase heals it later.
pub struct PreforwardBarrier;

impl Barrier for PreforwardBarrier {
    fn read_ref(env: &BarrierEnv<'_>, field: &RefField) -> Option<ObjectRef> {
        field
            .target()
            .map(|target| forward_if_needed(env.context, env.buffer, target))
    }

    fn resolve(env: &BarrierEnv<'_>, obj: ObjectRef) -> ObjectRef {
        forward_if_needed(env.context, env.buffer, obj)
    }
}
