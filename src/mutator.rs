//! Per-thread heap access.
//!
//! A [`Mutator`] is the explicit context every heap operation goes through: it owns the
//! thread's allocation buffer and handle stack, and it is the unit the safepoint counts.
//!
//! `ObjectRef`s held in locals are only valid until the next call that can reach a
//! safepoint (`poll`, allocation, leaving a safe region). Values that must survive go into
//! the handle stack with [`Mutator::push_root`].

use std::{marker::PhantomData, sync::Arc, thread::JoinHandle};

use crate::{
    barrier::{self, BarrierEnv},
    collector::{task_queue::GCTaskType, GCReason},
    error::{HeapError, Result},
    globals::{ALLOC_ALIGN, OOM_TRIES, RESCHEDULE_TRIES},
    heap::RuntimeContext,
    object::{
        decode_target, element_offset, encode_with_tag, ObjectLayout, ObjectRef, RefField, TypeInfo,
        HEADER_SIZE,
    },
    safepoint::MutatorRecord,
    space::AllocType,
    tlab::AllocationBuffer,
};

pub struct Mutator {
    context: Arc<RuntimeContext>,
    record: Arc<MutatorRecord>,
    /// Mutators stay on the thread that attached them.
    _marker: PhantomData<*const ()>,
}

impl Mutator {
    /// Attaches the calling thread. The mutator starts out running.
    pub(crate) fn attach(context: Arc<RuntimeContext>, name: &str) -> Self {
        let buffer = Arc::new(AllocationBuffer::new(false));
        context.space.buffers().register(buffer.clone());
        let record = Arc::new(MutatorRecord::new(name.to_string(), buffer));
        context.safepoint.attach(record.clone());
        log::trace!("mutator '{}' attached", name);
        Self {
            context,
            record,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    /// Spawn a mutator thread attached to the same heap.
    pub fn spawn_mutator<F, R>(&self, name: &str, closure: F) -> Result<JoinHandle<R>>
    where
        F: FnOnce(&Mutator) -> R + Send + 'static,
        R: Send + 'static,
    {
        spawn_mutator(self.context.clone(), name, closure)
    }

    #[inline]
    fn env(&self) -> BarrierEnv<'_> {
        BarrierEnv::new(&self.context, &self.record.buffer)
    }

    /// Parks the thread if the collector asked for a stop-the-world pause.
    #[inline]
    pub fn poll(&self) {
        self.context.safepoint.poll(&self.record);
    }

    /// Declares that the thread will not touch the heap until the guard is dropped, so
    /// collections may proceed without it. Use around blocking calls.
    pub fn enter_safe_region(&self) -> SafeRegion<'_> {
        let entered = !self.record.is_in_safe_region();
        if entered {
            self.context.safepoint.enter_safe_region(&self.record);
        }
        SafeRegion {
            mutator: self,
            entered,
        }
    }

    /// Regains heap access inside a safe region until the guard is dropped.
    pub fn scoped_object_access(&self) -> ScopedObjectAccess<'_> {
        let left = self.record.is_in_safe_region();
        if left {
            self.context.safepoint.leave_safe_region(&self.record);
        }
        ScopedObjectAccess {
            mutator: self,
            left,
        }
    }

    pub fn is_in_safe_region(&self) -> bool {
        self.record.is_in_safe_region()
    }

    pub fn buffer(&self) -> &AllocationBuffer {
        &self.record.buffer
    }

    /* Handle stack */

    /// Pushes a root and returns its slot index.
    pub fn push_root(&self, obj: Option<ObjectRef>) -> usize {
        let obj = barrier::resolve_value(&self.env(), obj);
        let mut roots = self.record.roots.lock();
        roots.push(RefField::new(obj));
        roots.len() - 1
    }

    pub fn root(&self, slot: usize) -> Option<ObjectRef> {
        let roots = self.record.roots.lock();
        barrier::read_ref(&self.env(), &roots[slot])
    }

    pub fn set_root(&self, slot: usize, obj: Option<ObjectRef>) {
        let obj = barrier::resolve_value(&self.env(), obj);
        self.record.roots.lock()[slot].set_target(obj);
    }

    pub fn pop_root(&self) -> Option<ObjectRef> {
        let env = self.env();
        let field = self.record.roots.lock().pop()?;
        field.target().map(|obj| barrier::resolve(&env, obj))
    }

    /// Drops every root at or above `len`.
    pub fn truncate_roots(&self, len: usize) {
        self.record.roots.lock().truncate(len);
    }

    pub fn root_count(&self) -> usize {
        self.record.roots.lock().len()
    }

    /* Allocation */

    /// Allocates `size` raw bytes, collecting and retrying when the heap is exhausted. The
    /// memory is zeroed and has no header, so the caller installs one before it next polls.
    pub(crate) fn allocate(&self, size: usize, alloc_type: AllocType) -> Result<usize> {
        let context = &*self.context;
        let buffer = &*self.record.buffer;
        if size > context.space.manager().capacity() {
            return Err(HeapError::OutOfMemory { size, alloc_type });
        }
        let mut tries = 0;
        loop {
            self.poll();
            let addr = context.space.try_allocate_once(buffer, size, alloc_type);
            if buffer.is_hungry() {
                context.finalizer.notify_hungry_buffers();
            }
            if addr != 0 {
                return Ok(addr);
            }
            tries += 1;
            if buffer.is_gc_thread() {
                return Err(HeapError::OutOfMemory { size, alloc_type });
            }
            if tries < RESCHEDULE_TRIES {
                std::thread::yield_now();
                continue;
            }
            let _safe = self.enter_safe_region();
            let collected = if tries < OOM_TRIES {
                if context.resources.is_gc_running() {
                    context.resources.wait_for_gc_finish();
                    Ok(())
                } else {
                    context.resources.request_gc(GCReason::Heu, false)
                }
            } else if tries == OOM_TRIES {
                log::warn!(
                    "allocation of {} bytes still failing after {} tries, collecting",
                    size,
                    tries
                );
                context.resources.request_gc(GCReason::Oom, false)
            } else {
                log::error!(
                    "out of memory: {} bytes of {:?} memory for '{}'",
                    size,
                    alloc_type,
                    self.name()
                );
                context
                    .resources
                    .request_async_task(GCTaskType::DumpHeapOom, GCReason::Oom);
                return Err(HeapError::OutOfMemory { size, alloc_type });
            };
            if let Err(err) = collected {
                log::warn!(
                    "allocation of {} bytes for '{}' cannot collect: {}",
                    size,
                    self.name(),
                    err
                );
                return Err(HeapError::OutOfMemory { size, alloc_type });
            }
        }
    }

    /// One raw allocation attempt without collecting.
    pub(crate) fn allocate_no_gc(&self, size: usize, alloc_type: AllocType) -> Result<usize> {
        self.poll();
        match self
            .context
            .space
            .try_allocate_once(&self.record.buffer, size, alloc_type)
        {
            0 => Err(HeapError::OutOfMemory { size, alloc_type }),
            addr => Ok(addr),
        }
    }

    fn install_header(
        addr: usize,
        ty: &'static TypeInfo,
        size: usize,
        alloc_type: AllocType,
    ) -> Result<ObjectRef> {
        let obj = ObjectRef::from_address(addr).ok_or(HeapError::OutOfMemory { size, alloc_type })?;
        obj.header().install_type(ty);
        Ok(obj)
    }

    pub fn new_object(&self, ty: &'static TypeInfo) -> Result<ObjectRef> {
        self.new_object_with(ty, AllocType::Young)
    }

    pub fn new_object_with(&self, ty: &'static TypeInfo, alloc_type: AllocType) -> Result<ObjectRef> {
        debug_assert!(matches!(ty.layout, ObjectLayout::Fixed { .. }));
        let size = ty.instance_size(0);
        let addr = self.allocate(size, alloc_type)?;
        Self::install_header(addr, ty, size, alloc_type)
    }

    /// Single attempt that never collects, for deserializers that must not reach a GC.
    pub fn new_object_no_gc(
        &self,
        ty: &'static TypeInfo,
        alloc_type: AllocType,
    ) -> Result<ObjectRef> {
        debug_assert!(matches!(ty.layout, ObjectLayout::Fixed { .. }));
        let size = ty.instance_size(0);
        let addr = self.allocate_no_gc(size, alloc_type)?;
        Self::install_header(addr, ty, size, alloc_type)
    }

    pub fn new_array(&self, ty: &'static TypeInfo, length: usize) -> Result<ObjectRef> {
        self.new_array_with(ty, length, AllocType::Young)
    }

    /// Fails with [`HeapError::OutOfMemory`] when `length` elements cannot be addressed.
    pub fn new_array_with(
        &self,
        ty: &'static TypeInfo,
        length: usize,
        alloc_type: AllocType,
    ) -> Result<ObjectRef> {
        debug_assert!(matches!(ty.layout, ObjectLayout::Array { .. }));
        let size = ty.checked_instance_size(length).ok_or(HeapError::OutOfMemory {
            size: usize::MAX,
            alloc_type,
        })?;
        let addr = self.allocate(size, alloc_type)?;
        let obj = Self::install_header(addr, ty, size, alloc_type)?;
        obj.set_array_length(length);
        Ok(obj)
    }

    /// Drops the native pin of an object allocated with [`AllocType::RawPointer`]. Once a
    /// region has no pinned objects left it can be swept.
    pub fn release_raw_pointer(&self, obj: ObjectRef) {
        let obj = barrier::resolve(&self.env(), obj);
        if let Some(desc) = self
            .context
            .space
            .manager()
            .table()
            .region_desc_of(obj.address())
        {
            desc.dec_raw_pointer_objects();
        }
    }

    pub fn register_finalizer(&self, obj: ObjectRef) {
        let obj = barrier::resolve(&self.env(), obj);
        self.context.finalizer.register_finalizer(obj);
    }

    /// Requests a collection. Waits inside a safe region for sync requests.
    pub fn request_gc(&self, reason: GCReason, is_async: bool) -> Result<()> {
        let _safe = self.enter_safe_region();
        self.context.resources.request_gc(reason, is_async)
    }

    /* Barriers */

    pub fn read_ref_field(&self, holder: ObjectRef, offset: usize) -> Option<ObjectRef> {
        let env = self.env();
        let holder = barrier::resolve(&env, holder);
        barrier::read_ref(&env, holder.field(offset))
    }

    pub fn write_ref_field(&self, holder: ObjectRef, offset: usize, value: Option<ObjectRef>) {
        let env = self.env();
        let holder = barrier::resolve(&env, holder);
        let value = barrier::resolve_value(&env, value);
        let field = holder.field(offset);
        barrier::pre_write(&env, field);
        field.set_target(value);
        barrier::remember(&env, holder, value);
    }

    pub fn atomic_read_ref_field(&self, holder: ObjectRef, offset: usize) -> Option<ObjectRef> {
        self.read_ref_field(holder, offset)
    }

    pub fn atomic_write_ref_field(&self, holder: ObjectRef, offset: usize, value: Option<ObjectRef>) {
        self.write_ref_field(holder, offset, value)
    }

    /// Stores `value` and returns the previous referent.
    pub fn atomic_swap_ref_field(
        &self,
        holder: ObjectRef,
        offset: usize,
        value: Option<ObjectRef>,
    ) -> Option<ObjectRef> {
        let env = self.env();
        let holder = barrier::resolve(&env, holder);
        let value = barrier::resolve_value(&env, value);
        let field = holder.field(offset);
        barrier::pre_write(&env, field);
        let old = field.swap_raw(encode_with_tag(value, 0));
        barrier::remember(&env, holder, value);
        decode_target(old).map(|obj| barrier::resolve(&env, obj))
    }

    /// Stores `value` if the field currently refers to `expected`. A field still holding a
    /// stale copy of `expected` counts as a match.
    pub fn compare_and_swap_ref_field(
        &self,
        holder: ObjectRef,
        offset: usize,
        expected: Option<ObjectRef>,
        value: Option<ObjectRef>,
    ) -> bool {
        let env = self.env();
        let holder = barrier::resolve(&env, holder);
        let expected = barrier::resolve_value(&env, expected);
        let value = barrier::resolve_value(&env, value);
        let field = holder.field(offset);
        loop {
            let raw = field.raw();
            let current = decode_target(raw).map(|obj| barrier::resolve(&env, obj));
            if current != expected {
                return false;
            }
            barrier::pre_write(&env, field);
            if field
                .compare_exchange_raw(raw, encode_with_tag(value, raw))
                .is_ok()
            {
                barrier::remember(&env, holder, value);
                return true;
            }
        }
    }

    pub fn read_static_ref(&self, slot: &RefField) -> Option<ObjectRef> {
        barrier::read_ref(&self.env(), slot)
    }

    pub fn write_static_ref(&self, slot: &RefField, value: Option<ObjectRef>) {
        let env = self.env();
        let value = barrier::resolve_value(&env, value);
        barrier::pre_write(&env, slot);
        slot.set_target(value);
    }

    /// Reads an interned-string slot. Young cycles never move its referents.
    pub fn read_string_table_static_ref(&self, slot: &RefField) -> Option<ObjectRef> {
        if self.context.gc_state.is_young_cycle() {
            return slot.target();
        }
        self.read_static_ref(slot)
    }

    pub fn write_string_table_static_ref(&self, slot: &RefField, value: Option<ObjectRef>) {
        if let Some(obj) = value {
            let young = self
                .context
                .space
                .manager()
                .region_type_of(obj.address())
                .map_or(false, |ty| ty.is_young());
            assert!(!young, "young object {:?} stored in the string table", obj);
        }
        self.write_static_ref(slot, value)
    }

    /// Copies `dst.len()` bytes of an inline struct at `offset` out of `holder`. Reference
    /// slots, given as offsets within the struct, are loaded through the read barrier.
    ///
    /// Panics unless the struct lies within the holder's body and every reference slot is
    /// an aligned word inside the struct.
    pub fn read_struct(&self, holder: ObjectRef, offset: usize, dst: &mut [u8], ref_offsets: &[usize]) {
        const WORD: usize = std::mem::size_of::<usize>();
        let env = self.env();
        let holder = barrier::resolve(&env, holder);
        let end = offset.checked_add(dst.len());
        assert!(
            offset >= HEADER_SIZE && end.map_or(false, |end| end <= holder.size()),
            "struct at {}..+{} outside {:?} of {} bytes",
            offset,
            dst.len(),
            holder,
            holder.size()
        );
        for &slot in ref_offsets {
            assert!(
                slot.checked_add(WORD).map_or(false, |end| end <= dst.len())
                    && (offset + slot) % ALLOC_ALIGN == 0,
                "reference slot {} outside struct of {} bytes",
                slot,
                dst.len()
            );
        }
        let src = (holder.address() + offset) as *const u8;
        // SAFETY: the range was checked against the resolved holder.
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        for &slot in ref_offsets {
            let value = barrier::read_ref(&env, holder.field(offset + slot));
            let word = value.map_or(0, |obj| obj.address());
            dst[slot..slot + WORD].copy_from_slice(&word.to_ne_bytes());
        }
    }

    /// Copies `count` elements between arrays of the same element layout. Reference arrays
    /// are copied one element at a time through the barriers; others with a memmove.
    pub fn copy_struct_array(
        &self,
        src: ObjectRef,
        src_index: usize,
        dst: ObjectRef,
        dst_index: usize,
        count: usize,
    ) {
        let env = self.env();
        let src = barrier::resolve(&env, src);
        let dst = barrier::resolve(&env, dst);
        assert!(src_index + count <= src.array_length());
        assert!(dst_index + count <= dst.array_length());
        let (element_size, element_is_ref) = match dst.type_info().layout {
            ObjectLayout::Array {
                element_size,
                element_is_ref,
            } => (element_size, element_is_ref),
            ObjectLayout::Fixed { .. } => panic!("{} is not an array", dst.type_info().name),
        };
        if !element_is_ref {
            let from = (src.address() + element_offset(0)) as *const u8;
            let to = (dst.address() + element_offset(0)) as *mut u8;
            // SAFETY: both ranges were bounds checked above; they may overlap.
            unsafe {
                std::ptr::copy(
                    from.add(src_index * element_size),
                    to.add(dst_index * element_size),
                    count * element_size,
                )
            };
            return;
        }
        let forward = !(src == dst && src_index < dst_index);
        for i in 0..count {
            let i = if forward { i } else { count - 1 - i };
            let value = barrier::read_ref(&env, src.element(src_index + i));
            let field = dst.element(dst_index + i);
            barrier::pre_write(&env, field);
            field.set_target(value);
            barrier::remember(&env, dst, value);
        }
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let space = &self.context.space;
        if self.record.is_in_safe_region() {
            self.context.safepoint.leave_safe_region(&self.record);
        }
        self.record.buffer.release(space);
        space.buffers().unregister(&self.record.buffer);
        self.record.roots.lock().clear();
        self.context.safepoint.detach(&self.record);
        log::trace!("mutator '{}' detached", self.record.name());
    }
}

/// Guard returned by [`Mutator::enter_safe_region`].
pub struct SafeRegion<'a> {
    mutator: &'a Mutator,
    entered: bool,
}

impl Drop for SafeRegion<'_> {
    fn drop(&mut self) {
        if self.entered {
            self.mutator
                .context
                .safepoint
                .leave_safe_region(&self.mutator.record);
        }
    }
}

/// Guard returned by [`Mutator::scoped_object_access`].
pub struct ScopedObjectAccess<'a> {
    mutator: &'a Mutator,
    left: bool,
}

impl Drop for ScopedObjectAccess<'_> {
    fn drop(&mut self) {
        if self.left {
            self.mutator
                .context
                .safepoint
                .enter_safe_region(&self.mutator.record);
        }
    }
}

/// Spawns a thread that runs `closure` with its own attached mutator.
pub(crate) fn spawn_mutator<F, R>(
    context: Arc<RuntimeContext>,
    name: &str,
    closure: F,
) -> Result<JoinHandle<R>>
where
    F: FnOnce(&Mutator) -> R + Send + 'static,
    R: Send + 'static,
{
    let thread_name = name.to_string();
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let mutator = Mutator::attach(context, &thread_name);
            closure(&mutator)
        })
        .map_err(|_| HeapError::ThreadSpawnFailed("mutator"))
}
