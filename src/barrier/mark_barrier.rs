use super::{Barrier, BarrierEnv};
use crate::object::RefField;

/// Snapshot-at-the-beginning barrier used from enumeration to the end of marking. The value
/// a store overwrites is handed to the collector so everything reachable at the start of the
/// cycle gets marked.
pub struct MarkBarrier;

impl Barrier for MarkBarrier {
    #[inline]
    fn pre_write(env: &BarrierEnv<'_>, field: &RefField) {
        if let Some(old) = field.target() {
            env.context.satb.push(old.address());
        }
    }
}
