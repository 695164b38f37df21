use super::{Barrier, BarrierEnv};
use crate::{
    collector::copy::{forward_if_needed, forward_object, needs_forwarding},
    heap::RuntimeContext,
    object::{decode_target, encode_with_tag, ObjectRef, RefField},
    tlab::AllocationBuffer,
};

/// Barrier for the copy and fix phases. Loads copy the referent if nobody has and heal the
/// field so later loads take the fast path.
pub struct CopyBarrier;

impl Barrier for CopyBarrier {
    #[inline]
    fn read_ref(env: &BarrierEnv<'_>, field: &RefField) -> Option<ObjectRef> {
        try_forward_ref_field(env.context, env.buffer, field)
    }

    #[inline]
    fn resolve(env: &BarrierEnv<'_>, obj: ObjectRef) -> ObjectRef {
        forward_if_needed(env.context, env.buffer, obj)
    }
}

/// Returns the up-to-date target of `field`, forwarding it and updating the field (weak tag
/// preserved) when it still points into a from-region.
pub(crate) fn try_forward_ref_field(
    context: &RuntimeContext,
    buffer: &AllocationBuffer,
    field: &RefField,
) -> Option<ObjectRef> {
    let table = context.space.manager().table();
    loop {
        let raw = field.raw();
        let target = decode_target(raw)?;
        if !needs_forwarding(table, target) {
            return Some(target);
        }
        let copy = forward_object(context, buffer, target);
        if copy == target {
            return Some(target);
        }
        if field
            .compare_exchange_raw(raw, encode_with_tag(Some(copy), raw))
            .is_ok()
        {
            return Some(copy);
        }
    }
}
