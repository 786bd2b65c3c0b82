//! Object allocation and lifecycle management for the `objrt` runtime.
//!
//! This module implements the object protocol every class shares:
//! - Zero-filled allocation sized by the class (`make_obj`, `init_obj`)
//! - Atomic reference counting (`inc_ref`, `dec_ref`)
//! - Ancestry checks and casts (`is_a`, `certify`, `downcast`)
//! - The dispatched core methods (`equals`, `hash_sum`, `to_string`)
//!
//! # Architecture
//!
//! Every instance starts with an [`ObjHeader`]: a pointer to its class's
//! [`VTable`], flags, and the reference count. Instance variables follow the
//! header at offsets recorded on the class. `VTable`s are themselves objects
//! whose header is marked immortal, so counting operations on them are
//! no-ops and they are never destroyed.
//!
//! Raw handles are [`ObjPtr`]s; the free functions taking them are `unsafe`
//! because nothing ties a raw pointer to a live object. [`Obj`] is the owned
//! handle: `Clone` is `inc_ref`, `Drop` is `dec_ref`.
//!
//! # Thread Safety
//!
//! Counting is atomic, so an object may be shared and released from any
//! thread. The thread that drops the last reference runs `destroy`.

use crate::error::{Error, Result};
use crate::runtime::core_classes::{DESTROY, EQUALS, HASH_SUM, TO_STRING};
use crate::runtime::dispatch::send_unchecked;
use crate::runtime::vtable::VTable;
use log::error;
use std::alloc::{self, Layout};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

/// Header never counts and is never destroyed.
pub(crate) const FLAG_IMMORTAL: u32 = 1 << 0;
/// Storage belongs to the caller; `destroy` must not free it.
pub(crate) const FLAG_CALLER_OWNED: u32 = 1 << 1;

/// Size of the header every instance starts with.
pub const HEADER_SIZE: usize = mem::size_of::<ObjHeader>();

/// Alignment of every runtime-allocated instance.
pub const INSTANCE_ALIGN: usize = 16;

/// Common prefix of every object, including `VTable`s.
#[repr(C)]
pub struct ObjHeader {
    pub(crate) klass: *const VTable,
    pub(crate) flags: u32,
    pub(crate) refcount: AtomicU32,
}

impl ObjHeader {
    pub(crate) fn new(klass: *const VTable, flags: u32) -> Self {
        Self {
            klass,
            flags,
            refcount: AtomicU32::new(1),
        }
    }

    fn is_immortal(&self) -> bool {
        self.flags & FLAG_IMMORTAL != 0
    }
}

/// Raw, non-null, non-owning object pointer.
///
/// This is the receiver type of [`Imp`](crate::runtime::Imp) and is
/// layout-compatible with a C pointer.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjPtr(NonNull<ObjHeader>);

// SAFETY: ObjPtr is an address. Headers are only mutated atomically.
unsafe impl Send for ObjPtr {}
unsafe impl Sync for ObjPtr {}

impl ObjPtr {
    /// Wraps a raw object address.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point at an initialized object header.
    pub unsafe fn from_raw(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr.cast::<ObjHeader>()).map(Self)
    }

    pub(crate) fn from_header(header: &ObjHeader) -> Self {
        Self(NonNull::from(header))
    }

    /// Start of the object's storage.
    #[must_use]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr().cast()
    }

    /// Address as a machine word, as passed through method arguments.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// # Safety
    ///
    /// The object must be live.
    pub(crate) unsafe fn header<'a>(self) -> &'a ObjHeader {
        // SAFETY: upheld by the caller.
        unsafe { self.0.as_ref() }
    }

    /// The object's class.
    ///
    /// # Safety
    ///
    /// The object must be live.
    pub unsafe fn vtable(self) -> &'static VTable {
        // SAFETY: a live object's class pointer is set before publication
        // and VTables are never freed.
        unsafe { &*self.header().klass }
    }

    /// Name of the object's class.
    ///
    /// # Safety
    ///
    /// The object must be live.
    pub unsafe fn class_name(self) -> &'static str {
        unsafe { self.vtable() }.name()
    }

    /// Current reference count.
    ///
    /// # Safety
    ///
    /// The object must be live.
    pub unsafe fn refcount(self) -> u32 {
        unsafe { self.header() }.refcount.load(Ordering::Acquire)
    }

    /// # Safety
    ///
    /// The object must be live.
    pub(crate) unsafe fn is_immortal(self) -> bool {
        unsafe { self.header() }.is_immortal()
    }

    /// Address of the byte `offset` bytes into the object.
    ///
    /// # Safety
    ///
    /// `offset` must lie within the class's `obj_alloc_size`.
    pub unsafe fn ivar(self, offset: usize) -> *mut u8 {
        unsafe { self.as_ptr().add(offset) }
    }
}

impl fmt::Debug for ObjPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjPtr({:p})", self.0)
    }
}

fn instance_layout(size: usize) -> Layout {
    Layout::from_size_align(size.max(HEADER_SIZE), INSTANCE_ALIGN)
        .unwrap_or_else(|err| panic!("invalid instance size {size}: {err}"))
}

/// Allocates a zeroed instance of `vtable` with a reference count of 1.
///
/// # Example
///
/// ```rust
/// use objrt::runtime::{make_obj, obj_class};
///
/// let obj = make_obj(obj_class());
/// assert_eq!(obj.class_name(), "Obj");
/// assert_eq!(obj.refcount(), 1);
/// ```
///
/// # Panics
///
/// Panics if `vtable` is the meta-class or descends from it. Classes are
/// created by bootstrap or singleton derivation, never by `make_obj`.
#[must_use]
pub fn make_obj(vtable: &'static VTable) -> Obj {
    refuse_meta_class(vtable);
    let layout = instance_layout(vtable.obj_alloc_size());
    // SAFETY: layout has non-zero size.
    let raw = unsafe { alloc::alloc_zeroed(layout) };
    if raw.is_null() {
        alloc::handle_alloc_error(layout);
    }
    // SAFETY: raw is fresh, INSTANCE_ALIGN-aligned and large enough.
    unsafe { raw.cast::<ObjHeader>().write(ObjHeader::new(vtable, 0)) };
    Obj {
        // SAFETY: checked for null above.
        ptr: ObjPtr(unsafe { NonNull::new_unchecked(raw.cast()) }),
    }
}

/// Turns caller-provided storage into an instance of `vtable`.
///
/// The storage is zero-filled and the reference count set to 1. When the
/// count later drops to zero `destroy` runs but the storage is not freed.
///
/// # Safety
///
/// `memory` must be valid for writes of `vtable.obj_alloc_size()` bytes,
/// aligned for [`ObjHeader`], and must outlive the object.
///
/// # Panics
///
/// Panics if `vtable` is the meta-class or descends from it.
pub unsafe fn init_obj(vtable: &'static VTable, memory: NonNull<u8>) -> ObjPtr {
    refuse_meta_class(vtable);
    debug_assert!(memory.as_ptr().align_offset(mem::align_of::<ObjHeader>()) == 0);
    // SAFETY: upheld by the caller.
    unsafe {
        ptr::write_bytes(memory.as_ptr(), 0, vtable.obj_alloc_size());
        memory
            .as_ptr()
            .cast::<ObjHeader>()
            .write(ObjHeader::new(vtable, FLAG_CALLER_OWNED));
    }
    ObjPtr(memory.cast())
}

fn refuse_meta_class(vtable: &VTable) {
    if vtable.ancestors().any(VTable::is_meta_class) {
        error!("refusing to instantiate class '{}'", vtable.name());
        panic!(
            "Can't instantiate '{}': instances of the meta-class are only made by bootstrap",
            vtable.name()
        );
    }
}

/// Adds a reference. A null object is returned unchanged.
///
/// # Safety
///
/// `obj`, if present, must be live.
///
/// # Panics
///
/// Panics if the count was zero (the object is mid-destruction) or would
/// overflow.
pub unsafe fn inc_ref(obj: Option<ObjPtr>) -> Option<ObjPtr> {
    let ptr = obj?;
    // SAFETY: upheld by the caller.
    let header = unsafe { ptr.header() };
    if header.is_immortal() {
        return obj;
    }
    let old = header.refcount.fetch_add(1, Ordering::AcqRel);
    if old == 0 {
        let name = unsafe { ptr.class_name() };
        error!("inc_ref on a destroyed {name}");
        panic!("Illegal refcount of 0 for {name}");
    }
    if old == u32::MAX {
        panic!("Reference count overflow in inc_ref");
    }
    obj
}

/// Drops a reference, destroying the object when it was the last one.
///
/// Returns the remaining count; 0 for a null object or after destruction.
/// Immortal objects always report 1.
///
/// # Safety
///
/// `obj`, if present, must be live and the caller must own the reference
/// being released.
///
/// # Panics
///
/// Panics if the count was already zero.
pub unsafe fn dec_ref(obj: Option<ObjPtr>) -> u32 {
    let Some(ptr) = obj else {
        return 0;
    };
    // SAFETY: upheld by the caller.
    let header = unsafe { ptr.header() };
    if header.is_immortal() {
        return 1;
    }
    match header.refcount.fetch_sub(1, Ordering::AcqRel) {
        0 => {
            let name = unsafe { ptr.class_name() };
            error!("dec_ref on a destroyed {name}");
            panic!("Illegal refcount of 0 for {name}");
        }
        1 => {
            // SAFETY: this was the last reference.
            unsafe { send_unchecked(ptr, DESTROY, &[]) };
            0
        }
        old => old - 1,
    }
}

/// Returns `true` if `obj` is an instance of `target` or a descendant.
///
/// # Safety
///
/// `obj`, if present, must be live.
pub unsafe fn is_a(obj: Option<ObjPtr>, target: &VTable) -> bool {
    obj.is_some_and(|ptr| unsafe { ptr.vtable() }.is_subclass_of(target))
}

/// Checks that `obj` is a non-null instance of `target`.
///
/// # Safety
///
/// `obj`, if present, must be live.
///
/// # Errors
///
/// Returns [`Error::InvalidCast`] if `obj` is null or of an unrelated class.
pub unsafe fn certify(obj: Option<ObjPtr>, target: &VTable) -> Result<ObjPtr> {
    match obj {
        None => Err(Error::InvalidCast {
            found: None,
            expected: target.name().to_string(),
        }),
        Some(ptr) => unsafe { checked_cast(ptr, target) },
    }
}

/// Like [`certify`], but a null object passes through as `None`.
///
/// # Safety
///
/// `obj`, if present, must be live.
///
/// # Errors
///
/// Returns [`Error::InvalidCast`] if `obj` is of an unrelated class.
pub unsafe fn downcast(obj: Option<ObjPtr>, target: &VTable) -> Result<Option<ObjPtr>> {
    obj.map(|ptr| unsafe { checked_cast(ptr, target) })
        .transpose()
}

unsafe fn checked_cast(ptr: ObjPtr, target: &VTable) -> Result<ObjPtr> {
    let klass = unsafe { ptr.vtable() };
    if klass.is_subclass_of(target) {
        Ok(ptr)
    } else {
        Err(Error::InvalidCast {
            found: Some(klass.name().to_string()),
            expected: target.name().to_string(),
        })
    }
}

/// Name of the object's class.
///
/// # Safety
///
/// `obj` must be live.
pub unsafe fn get_class_name(obj: ObjPtr) -> &'static str {
    unsafe { obj.class_name() }
}

/// Dispatched equality.
///
/// # Safety
///
/// Both objects must be live.
pub unsafe fn equals(obj: ObjPtr, other: ObjPtr) -> bool {
    unsafe { send_unchecked(obj, EQUALS, &[other.addr()]) != 0 }
}

/// Dispatched hash.
///
/// # Safety
///
/// `obj` must be live.
pub unsafe fn hash_sum(obj: ObjPtr) -> u64 {
    unsafe { send_unchecked(obj, HASH_SUM, &[]) as u64 }
}

/// Dispatched string conversion.
///
/// # Safety
///
/// `obj` must be live.
pub unsafe fn to_string(obj: ObjPtr) -> String {
    let mut out = String::new();
    let out_ptr: *mut String = &mut out;
    unsafe { send_unchecked(obj, TO_STRING, &[out_ptr as usize]) };
    out
}

/// Runs the `destroy` implementation `vtable` inherited from its parent.
///
/// Subclass `destroy` methods call this last, passing their own class, so
/// cleanup runs from the most derived class to `Obj`.
///
/// # Safety
///
/// `obj` must be live with no remaining references, and `vtable` must be
/// the class whose `destroy` is currently running.
pub unsafe fn super_destroy(obj: ObjPtr, vtable: &VTable) {
    let Some(parent) = vtable.parent() else {
        return;
    };
    if let Some(destroy) = parent.method_ptr(DESTROY) {
        let mut ret = [0usize; 2];
        unsafe { destroy(obj, DESTROY, ptr::null(), ret.as_mut_ptr().cast()) };
    }
}

/// Releases the storage of an instance whose count reached zero.
///
/// # Safety
///
/// `obj` must be unreachable. Caller-owned storage is left alone.
pub(crate) unsafe fn free_instance(obj: ObjPtr) {
    let header = unsafe { obj.header() };
    if header.flags & (FLAG_CALLER_OWNED | FLAG_IMMORTAL) != 0 {
        return;
    }
    let layout = instance_layout(unsafe { obj.vtable() }.obj_alloc_size());
    // SAFETY: allocated by make_obj with this same layout.
    unsafe { alloc::dealloc(obj.as_ptr(), layout) };
}

/// Owned reference to a runtime object.
///
/// # Example
///
/// ```rust
/// use objrt::runtime::{make_obj, obj_class};
///
/// let first = make_obj(obj_class());
/// let second = first.clone();
/// assert_eq!(first.refcount(), 2);
/// assert_eq!(first, second);
///
/// drop(second);
/// assert_eq!(first.refcount(), 1);
/// ```
pub struct Obj {
    ptr: ObjPtr,
}

impl Obj {
    /// Takes ownership of one reference.
    ///
    /// # Safety
    ///
    /// `ptr` must be live and the caller must own a reference to it.
    pub unsafe fn from_raw(ptr: ObjPtr) -> Self {
        Self { ptr }
    }

    /// Gives up the handle without releasing its reference.
    #[must_use]
    pub fn into_raw(self) -> ObjPtr {
        let ptr = self.ptr;
        mem::forget(self);
        ptr
    }

    /// Borrows the raw pointer.
    #[must_use]
    pub fn as_ptr(&self) -> ObjPtr {
        self.ptr
    }

    /// The object's class.
    #[must_use]
    pub fn vtable(&self) -> &'static VTable {
        // SAFETY: the handle keeps the object alive.
        unsafe { self.ptr.vtable() }
    }

    /// Name of the object's class.
    #[must_use]
    pub fn class_name(&self) -> &'static str {
        self.vtable().name()
    }

    /// Current reference count. Can change concurrently.
    #[must_use]
    pub fn refcount(&self) -> u32 {
        // SAFETY: the handle keeps the object alive.
        unsafe { self.ptr.refcount() }
    }

    /// Returns `true` if this is an instance of `target` or a descendant.
    #[must_use]
    pub fn is_a(&self, target: &VTable) -> bool {
        self.vtable().is_subclass_of(target)
    }

    /// Checks that this is an instance of `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCast`] otherwise.
    pub fn certify(&self, target: &VTable) -> Result<&Self> {
        // SAFETY: the handle keeps the object alive.
        unsafe { checked_cast(self.ptr, target) }.map(|_| self)
    }

    /// Dispatched hash.
    #[must_use]
    pub fn hash_sum(&self) -> u64 {
        // SAFETY: the handle keeps the object alive.
        unsafe { hash_sum(self.ptr) }
    }
}

impl Clone for Obj {
    fn clone(&self) -> Self {
        // SAFETY: the handle keeps the object alive.
        unsafe { inc_ref(Some(self.ptr)) };
        Self { ptr: self.ptr }
    }
}

impl Drop for Obj {
    fn drop(&mut self) {
        // SAFETY: the handle owns one reference.
        unsafe { dec_ref(Some(self.ptr)) };
    }
}

impl PartialEq for Obj {
    fn eq(&self, other: &Self) -> bool {
        // SAFETY: both handles keep their objects alive.
        unsafe { equals(self.ptr, other.ptr) }
    }
}

impl Eq for Obj {}

impl Hash for Obj {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_sum());
    }
}

impl fmt::Display for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: the handle keeps the object alive.
        f.write_str(&unsafe { to_string(self.ptr) })
    }
}

impl fmt::Debug for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Obj")
            .field("class", &self.class_name())
            .field("ptr", &self.ptr)
            .field("refcount", &self.refcount())
            .finish()
    }
}

// SAFETY: Obj is Send + Sync because:
// - Counting is atomic and destroy may run on any thread
// - The class pointer is immutable after creation
unsafe impl Send for Obj {}
unsafe impl Sync for Obj {}
