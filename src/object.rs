//! The slice of the object model the collector depends on.
//!
//! Every heap object starts with one header word ([`BaseObject`]). In the normal state the
//! word holds a `&'static TypeInfo`; the two low bits hold the forwarding state. Once an
//! object has been evacuated the word holds the address of its copy instead.

use std::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{globals::ALLOC_ALIGN, mutator::Mutator, utils::checked_align_usize};

const STATE_MASK: usize = 0b11;
const STATE_NORMAL: usize = 0;
const STATE_FORWARDING: usize = 1;
const STATE_FORWARDED: usize = 2;

/// Bit 0 of a reference field marks a weak reference.
pub const TAG_WEAK: usize = 1;
const TAG_MASK: usize = ALLOC_ALIGN - 1;

pub const HEADER_SIZE: usize = std::mem::size_of::<usize>();
/// Arrays store their length in the word after the header.
pub const ARRAY_HEADER_SIZE: usize = 2 * HEADER_SIZE;

/// Byte offset of element `index` in a reference array.
#[inline(always)]
pub const fn element_offset(index: usize) -> usize {
    ARRAY_HEADER_SIZE + index * HEADER_SIZE
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ForwardState {
    Normal,
    Forwarding,
    Forwarded,
}

#[derive(Copy, Clone, Debug)]
pub enum ObjectLayout {
    /// Fixed-size object; `ref_offsets` are byte offsets of reference fields from the header.
    Fixed {
        size: usize,
        ref_offsets: &'static [usize],
    },
    /// Header word, length word, then `length` elements of `element_size` bytes.
    /// When `element_is_ref` is set every element is a [`RefField`].
    Array {
        element_size: usize,
        element_is_ref: bool,
    },
}

pub type FinalizeFn = fn(&Mutator, ObjectRef);

/// Static description of an object type. Must be at least 8-byte aligned since its address
/// shares the header word with the forwarding state bits.
#[repr(align(8))]
pub struct TypeInfo {
    pub name: &'static str,
    pub layout: ObjectLayout,
    pub finalize: Option<FinalizeFn>,
}

impl TypeInfo {
    pub const fn fixed(name: &'static str, size: usize, ref_offsets: &'static [usize]) -> Self {
        Self {
            name,
            layout: ObjectLayout::Fixed { size, ref_offsets },
            finalize: None,
        }
    }

    pub const fn array(name: &'static str, element_size: usize, element_is_ref: bool) -> Self {
        Self {
            name,
            layout: ObjectLayout::Array {
                element_size,
                element_is_ref,
            },
            finalize: None,
        }
    }

    pub const fn with_finalizer(mut self, finalize: FinalizeFn) -> Self {
        self.finalize = Some(finalize);
        self
    }

    /// Allocation size of an instance. `length` is ignored for fixed layouts.
    pub fn instance_size(&self, length: usize) -> usize {
        self.checked_instance_size(length).unwrap_or(usize::MAX)
    }

    /// Allocation size of an instance, or `None` when an array of `length` elements cannot
    /// be addressed.
    pub fn checked_instance_size(&self, length: usize) -> Option<usize> {
        match self.layout {
            ObjectLayout::Fixed { size, .. } => {
                checked_align_usize(size.max(HEADER_SIZE), ALLOC_ALIGN)
            }
            ObjectLayout::Array { element_size, .. } => element_size
                .checked_mul(length)
                .and_then(|bytes| bytes.checked_add(ARRAY_HEADER_SIZE))
                .and_then(|bytes| checked_align_usize(bytes, ALLOC_ALIGN)),
        }
    }
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo").field("name", &self.name).finish()
    }
}

#[repr(C)]
pub struct BaseObject {
    state: AtomicUsize,
}

impl BaseObject {
    #[inline]
    pub fn forward_state(&self) -> ForwardState {
        match self.state.load(Ordering::Acquire) & STATE_MASK {
            STATE_NORMAL => ForwardState::Normal,
            STATE_FORWARDING => ForwardState::Forwarding,
            _ => ForwardState::Forwarded,
        }
    }

    #[inline]
    pub fn is_forwarded(&self) -> bool {
        self.forward_state() == ForwardState::Forwarded
    }

    /// Address of the copy. Only meaningful once the object is forwarded.
    pub fn forwardee(&self) -> Option<ObjectRef> {
        let word = self.state.load(Ordering::Acquire);
        if word & STATE_MASK == STATE_FORWARDED {
            ObjectRef::from_address(word & !STATE_MASK)
        } else {
            None
        }
    }

    /// Type of the object. A forwarded header is followed to its copy.
    pub fn type_info(&self) -> &'static TypeInfo {
        let mut word = self.state.load(Ordering::Acquire);
        if word & STATE_MASK == STATE_FORWARDED {
            let copy = (word & !STATE_MASK) as *const BaseObject;
            word = unsafe { (*copy).state.load(Ordering::Acquire) };
        }
        let ptr = (word & !STATE_MASK) as *const TypeInfo;
        debug_assert!(!ptr.is_null(), "object header is not initialized");
        unsafe { &*ptr }
    }

    pub(crate) fn install_type(&self, ty: &'static TypeInfo) {
        self.state
            .store(ty as *const TypeInfo as usize | STATE_NORMAL, Ordering::Release);
    }

    pub(crate) fn has_type(&self) -> bool {
        self.state.load(Ordering::Acquire) != 0
    }

    /// Moves NORMAL to FORWARDING. The winner must either publish a forwardee or unlock.
    pub(crate) fn try_lock_forwarding(&self) -> bool {
        let word = self.state.load(Ordering::Acquire);
        if word & STATE_MASK != STATE_NORMAL {
            return false;
        }
        self.state
            .compare_exchange(
                word,
                (word & !STATE_MASK) | STATE_FORWARDING,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub(crate) fn unlock_forwarding(&self) {
        let word = self.state.load(Ordering::Relaxed);
        debug_assert_eq!(word & STATE_MASK, STATE_FORWARDING);
        self.state
            .store((word & !STATE_MASK) | STATE_NORMAL, Ordering::Release);
    }

    pub(crate) fn set_forwarded(&self, copy: usize) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed) & STATE_MASK, STATE_FORWARDING);
        self.state.store(copy | STATE_FORWARDED, Ordering::Release);
    }

    /// Raw header word for copying into the to-space object.
    pub(crate) fn normal_header(&self) -> usize {
        self.state.load(Ordering::Acquire) & !STATE_MASK
    }

    /// Publishes a header copied from another object.
    pub(crate) fn init_header_word(&self, word: usize) {
        debug_assert_eq!(word & STATE_MASK, STATE_NORMAL);
        self.state.store(word, Ordering::Release);
    }
}

/// A reference to a heap object. Carries no lifetime; validity is kept by the collector
/// as long as the reference is reachable from a root.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectRef(NonNull<BaseObject>);

unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    #[inline]
    pub fn from_address(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut BaseObject).map(Self)
    }

    #[inline]
    pub fn address(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub fn header(&self) -> &BaseObject {
        unsafe { self.0.as_ref() }
    }

    pub fn type_info(self) -> &'static TypeInfo {
        self.header().type_info()
    }

    pub fn array_length(self) -> usize {
        unsafe { *((self.address() + HEADER_SIZE) as *const usize) }
    }

    pub(crate) fn set_array_length(self, length: usize) {
        unsafe { *((self.address() + HEADER_SIZE) as *mut usize) = length }
    }

    /// Allocation size of the object, read through the forwarding pointer if needed.
    pub fn size(self) -> usize {
        let ty = self.type_info();
        match ty.layout {
            ObjectLayout::Fixed { .. } => ty.instance_size(0),
            ObjectLayout::Array { .. } => {
                let current = self.header().forwardee().unwrap_or(self);
                ty.instance_size(current.array_length())
            }
        }
    }

    /// The reference field at `offset` bytes from the header.
    pub fn field(&self, offset: usize) -> &RefField {
        debug_assert!(offset >= HEADER_SIZE && offset % ALLOC_ALIGN == 0);
        unsafe { &*((self.address() + offset) as *const RefField) }
    }

    /// Element `index` of a reference array.
    pub fn element(&self, index: usize) -> &RefField {
        debug_assert!(index < self.array_length());
        self.field(element_offset(index))
    }

    /// Calls `f` for every reference field of the object.
    pub fn for_each_ref_field(&self, mut f: impl FnMut(&RefField)) {
        match self.type_info().layout {
            ObjectLayout::Fixed { ref_offsets, .. } => {
                for &offset in ref_offsets {
                    f(self.field(offset));
                }
            }
            ObjectLayout::Array {
                element_is_ref: true,
                ..
            } => {
                for i in 0..self.array_length() {
                    f(self.element(i));
                }
            }
            ObjectLayout::Array { .. } => {}
        }
    }

    /// Raw bytes of the object past the header.
    pub fn payload(&self) -> *mut u8 {
        (self.address() + HEADER_SIZE) as *mut u8
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.address())
    }
}

/// A slot holding a possibly-weak reference. Mutators go through the barrier entry points on
/// [`Mutator`]; the raw accessors here are for the collector and initialization.
#[repr(transparent)]
#[derive(Default)]
pub struct RefField(AtomicUsize);

impl RefField {
    pub const fn null() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn new(target: Option<ObjectRef>) -> Self {
        Self(AtomicUsize::new(target.map_or(0, |o| o.address())))
    }

    #[inline]
    pub fn raw(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_raw(&self, value: usize) {
        self.0.store(value, Ordering::Release)
    }

    pub fn swap_raw(&self, value: usize) -> usize {
        self.0.swap(value, Ordering::AcqRel)
    }

    pub fn compare_exchange_raw(&self, current: usize, new: usize) -> Result<usize, usize> {
        self.0
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    #[inline]
    pub fn target(&self) -> Option<ObjectRef> {
        decode_target(self.raw())
    }

    pub fn is_weak(&self) -> bool {
        self.raw() & TAG_WEAK != 0
    }

    pub fn set_target(&self, target: Option<ObjectRef>) {
        self.set_raw(target.map_or(0, |o| o.address()))
    }

    pub fn set_weak_target(&self, target: Option<ObjectRef>) {
        self.set_raw(target.map_or(0, |o| o.address() | TAG_WEAK))
    }
}

impl fmt::Debug for RefField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefField({:#x})", self.raw())
    }
}

#[inline]
pub fn decode_target(raw: usize) -> Option<ObjectRef> {
    ObjectRef::from_address(raw & !TAG_MASK)
}

#[inline]
pub fn encode_with_tag(target: Option<ObjectRef>, tag_source: usize) -> usize {
    match target {
        Some(obj) => obj.address() | (tag_source & TAG_WEAK),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static PAIR: TypeInfo = TypeInfo::fixed("Pair", 24, &[8, 16]);
    static BYTES: TypeInfo = TypeInfo::array("Bytes", 1, false);
    static REFS: TypeInfo = TypeInfo::array("Refs", 8, true);

    #[repr(C, align(8))]
    struct Storage([usize; 8]);

    #[test]
    fn header_and_fields() {
        let mut storage = Storage([0; 8]);
        let obj = ObjectRef::from_address(storage.0.as_mut_ptr() as usize).unwrap();
        obj.header().install_type(&PAIR);
        assert_eq!(obj.size(), 24);
        assert_eq!(obj.type_info().name, "Pair");
        let mut count = 0;
        obj.for_each_ref_field(|_| count += 1);
        assert_eq!(count, 2);
        obj.field(8).set_weak_target(Some(obj));
        assert!(obj.field(8).is_weak());
        assert_eq!(obj.field(8).target(), Some(obj));
    }

    #[test]
    fn array_size_is_aligned() {
        assert_eq!(BYTES.instance_size(3), 24);
        assert_eq!(BYTES.instance_size(8), 24);
        assert_eq!(BYTES.instance_size(9), 32);
    }

    #[test]
    fn oversized_array_has_no_size() {
        assert_eq!(REFS.checked_instance_size(usize::MAX / 4), None);
        assert_eq!(BYTES.checked_instance_size(usize::MAX - 8), None);
        assert_eq!(REFS.checked_instance_size(2), Some(32));
    }

    #[test]
    fn forwarding_state_machine() {
        let mut from = Storage([0; 8]);
        let mut to = Storage([0; 8]);
        let obj = ObjectRef::from_address(from.0.as_mut_ptr() as usize).unwrap();
        let copy = to.0.as_mut_ptr() as usize;
        obj.header().install_type(&PAIR);
        assert!(obj.header().try_lock_forwarding());
        assert!(!obj.header().try_lock_forwarding());
        assert_eq!(obj.header().forward_state(), ForwardState::Forwarding);
        unsafe { *(copy as *mut usize) = obj.header().normal_header() };
        obj.header().set_forwarded(copy);
        assert_eq!(obj.header().forwardee().map(|o| o.address()), Some(copy));
        assert_eq!(obj.type_info().name, "Pair");
    }
}
