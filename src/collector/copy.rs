//! Evacuation and reference fixing.
//!
//! An object is copied by whoever first moves its header from NORMAL to FORWARDING: a
//! collector worker walking a from-region, or a mutator whose load barrier found it. The
//! winner either publishes FORWARDED with the copy address or, when to-space is exhausted,
//! demotes the whole region to fix-in-place before unlocking.

use crossbeam::utils::Backoff;

use crate::{
    heap::RuntimeContext,
    object::{decode_target, encode_with_tag, ForwardState, ObjectRef, RefField, HEADER_SIZE},
    region::{RegionId, RegionTable, RegionType},
    tlab::AllocationBuffer,
};

/// Whether references to `obj` must be redirected to a copy. Regions fixed in place keep
/// their unforwarded objects, but objects copied before the region was demoted still move.
#[inline]
pub(crate) fn needs_forwarding(table: &RegionTable, obj: ObjectRef) -> bool {
    match table.region_desc_of(obj.address()) {
        Some(desc) if desc.is_fix_in_place() => obj.header().is_forwarded(),
        Some(desc) => desc.region_type() == RegionType::From,
        None => false,
    }
}

/// Returns the to-space copy of `obj`, copying it first if nobody has. Returns `obj` itself
/// when its region is fixed in place.
pub(crate) fn forward_object(
    context: &RuntimeContext,
    buffer: &AllocationBuffer,
    obj: ObjectRef,
) -> ObjectRef {
    let table = context.space.manager().table();
    let desc = match table.region_desc_of(obj.address()) {
        Some(desc) => desc,
        None => return obj,
    };
    let header = obj.header();
    let backoff = Backoff::new();
    loop {
        match header.forward_state() {
            ForwardState::Forwarded => {
                if let Some(copy) = header.forwardee() {
                    return copy;
                }
            }
            ForwardState::Forwarding => {
                backoff.snooze();
                continue;
            }
            ForwardState::Normal => {}
        }
        if desc.is_fix_in_place() {
            return obj;
        }
        if !header.try_lock_forwarding() {
            continue;
        }
        if desc.is_fix_in_place() {
            header.unlock_forwarding();
            return obj;
        }
        let size = obj.size();
        let to = context.space.allocate_to(buffer, size);
        if to == 0 {
            if !desc.is_fix_in_place() {
                log::warn!(
                    "to-space exhausted copying {} bytes, fixing region at {:#x} in place",
                    size,
                    desc.start()
                );
            }
            desc.set_fix_in_place(true);
            header.unlock_forwarding();
            return obj;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                (obj.address() + HEADER_SIZE) as *const u8,
                (to + HEADER_SIZE) as *mut u8,
                size - HEADER_SIZE,
            );
        }
        let copy = match ObjectRef::from_address(to) {
            Some(copy) => copy,
            None => unreachable!(),
        };
        copy.header().init_header_word(header.normal_header());
        header.set_forwarded(to);
        context.stats.add_copied_bytes(size);
        return copy;
    }
}

#[inline]
pub(crate) fn forward_if_needed(
    context: &RuntimeContext,
    buffer: &AllocationBuffer,
    obj: ObjectRef,
) -> ObjectRef {
    if needs_forwarding(context.space.manager().table(), obj) {
        forward_object(context, buffer, obj)
    } else {
        obj
    }
}

/// Forwards the target of a root slot and updates the slot. Runs while mutators are stopped.
pub(crate) fn forward_root(context: &RuntimeContext, buffer: &AllocationBuffer, field: &RefField) {
    let raw = field.raw();
    if let Some(target) = decode_target(raw) {
        let copy = forward_if_needed(context, buffer, target);
        if copy != target {
            field.set_raw(encode_with_tag(Some(copy), raw));
        }
    }
}

/// Visits objects laid out contiguously in `[from, to)`. Stops at an uninitialized header.
pub(crate) fn walk_objects(from: usize, to: usize, mut f: impl FnMut(ObjectRef)) {
    let mut addr = from;
    while addr < to {
        let obj = match ObjectRef::from_address(addr) {
            Some(obj) => obj,
            None => break,
        };
        if !obj.header().has_type() {
            break;
        }
        let size = obj.size();
        f(obj);
        addr += size;
    }
}

/// Visits the objects of a region that survive marking and lie below `limit`: marked objects
/// below the trace line and everything allocated above it.
pub(crate) fn for_each_surviving_object(
    context: &RuntimeContext,
    id: RegionId,
    limit: usize,
    mut f: impl FnMut(ObjectRef),
) {
    let manager = context.space.manager();
    let table = manager.table();
    let desc = table.desc(id);
    let start = desc.start();
    let trace_line = desc.trace_line();
    let marked_limit = trace_line.min(limit);
    if marked_limit > start {
        manager
            .bitmaps()
            .region_bitmap(table, id)
            .for_each_marked(marked_limit - start, |offset| {
                if let Some(obj) = ObjectRef::from_address(start + offset) {
                    f(obj);
                }
            });
    }
    if limit > trace_line {
        walk_objects(trace_line, limit, f);
    }
}

/// Copies every surviving object of a from-region below its copy line. Returns the number of
/// objects forwarded.
pub(crate) fn evacuate_region(
    context: &RuntimeContext,
    buffer: &AllocationBuffer,
    id: RegionId,
) -> usize {
    let desc = context.space.manager().table().desc(id);
    let mut count = 0;
    for_each_surviving_object(context, id, desc.copy_line(), |obj| {
        forward_object(context, buffer, obj);
        count += 1;
    });
    count
}

/// Redirects a slot pointing at a forwarded from-object to the copy.
#[inline]
pub(crate) fn fix_ref_field(table: &RegionTable, field: &RefField) {
    let raw = field.raw();
    let target = match decode_target(raw) {
        Some(target) => target,
        None => return,
    };
    match table.region_desc_of(target.address()) {
        Some(desc) if desc.region_type() == RegionType::From || desc.is_fix_in_place() => {}
        _ => return,
    }
    if let Some(copy) = target.header().forwardee() {
        let _ = field.compare_exchange_raw(raw, encode_with_tag(Some(copy), raw));
    }
}

pub(crate) fn fix_object(table: &RegionTable, obj: ObjectRef) {
    if obj.header().is_forwarded() {
        return;
    }
    obj.for_each_ref_field(|field| fix_ref_field(table, field));
}

/// Fixes the references held by the surviving objects of a region below its fix line.
/// Regions filled by evacuation hold only copies and are walked linearly.
pub(crate) fn fix_region(context: &RuntimeContext, id: RegionId) {
    let table = context.space.manager().table();
    let desc = table.desc(id);
    let fix_line = desc.fix_line();
    if desc.region_type() == RegionType::To && !desc.is_fix_in_place() {
        walk_objects(desc.start(), fix_line, |obj| fix_object(table, obj));
    } else {
        for_each_surviving_object(context, id, fix_line, |obj| fix_object(table, obj));
    }
}
