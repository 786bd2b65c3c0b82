//! Class descriptors with flattened dispatch tables.
//!
//! A [`VTable`] is built by copying its parent's method table and then
//! appending or replacing entries, so every inherited method is reachable
//! by slot index without walking the ancestry. Once published in the
//! registry a `VTable` is immutable (apart from host alias and exclusion
//! bookkeeping on its [`Method`]s) and lives for the rest of the process.
//!
//! `VTable`s are objects too: their header points at the `VTable` class and
//! is marked immortal.

use crate::error::{Error, Result};
use crate::runtime::dispatch::abstract_method;
use crate::runtime::host::{Host, host};
use crate::runtime::method::{Imp, Method, MethodSlot};
use crate::runtime::object::{FLAG_IMMORTAL, HEADER_SIZE, ObjHeader, ObjPtr};
use crate::runtime::{init, registry};
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

/// Class was derived at run time rather than bootstrapped.
pub const VTABLE_FLAG_DYNAMIC: u32 = 1 << 0;

/// Runtime class descriptor.
///
/// # Memory Layout
///
/// `#[repr(C)]` with the object header first, so a `&VTable` is also a
/// valid object pointer (see [`VTable::as_obj`]).
///
/// # Thread Safety
///
/// Immutable after publication. Published `VTable`s are `'static` and may
/// be shared freely between threads.
#[repr(C)]
pub struct VTable {
    pub(crate) header: ObjHeader,
    pub(crate) name: String,
    parent: Option<NonNull<VTable>>,
    parcel_id: u32,
    flags: u32,
    obj_alloc_size: usize,
    ivars_offset: usize,
    table: Box<[Imp]>,
    abstract_slots: Box<[bool]>,
    pub(crate) methods: Vec<Method>,
    /// Host that derived this class or an ancestor; `None` means the
    /// globally installed one.
    host: Option<&'static dyn Host>,
    /// Completes once the host has been told about this class.
    pub(crate) host_ready: OnceLock<()>,
}

// SAFETY: VTable is Send + Sync because:
// - The parent pointer targets another VTable that is never freed
// - Nothing but Method alias/exclusion state changes after publication,
//   and that state is behind its own lock/atomic
// - The recorded host is Send + Sync by the Host trait bound
unsafe impl Send for VTable {}
unsafe impl Sync for VTable {}

impl VTable {
    /// Allocates an unpublished class inheriting `parent`'s table.
    ///
    /// `novel_slots` entries are appended and start out abstract. The
    /// meta-class pointer and the name are filled in by later bootstrap
    /// passes.
    pub(crate) fn allocate(
        parent: Option<&VTable>,
        parcel_id: u32,
        ivars_size: usize,
        novel_slots: usize,
    ) -> Box<Self> {
        let (ivars_offset, mut table, mut abstract_slots) = match parent {
            Some(parent) => (
                parent.ivars_end(),
                parent.table.to_vec(),
                parent.abstract_slots.to_vec(),
            ),
            None => (HEADER_SIZE, Vec::new(), Vec::new()),
        };
        let slot_count = table.len() + novel_slots;
        table.resize(slot_count, abstract_method as Imp);
        abstract_slots.resize(slot_count, true);

        Box::new(Self {
            header: ObjHeader::new(ptr::null(), FLAG_IMMORTAL),
            name: String::new(),
            parent: parent.map(NonNull::from),
            parcel_id,
            flags: 0,
            obj_alloc_size: ivars_offset + ivars_size,
            ivars_offset,
            table: table.into_boxed_slice(),
            abstract_slots: abstract_slots.into_boxed_slice(),
            methods: Vec::new(),
            host: parent.and_then(|parent| parent.host),
            host_ready: OnceLock::new(),
        })
    }

    /// First instance variable offset available to a subclass.
    fn ivars_end(&self) -> usize {
        self.obj_alloc_size.next_multiple_of(mem::align_of::<usize>())
    }

    /// Copies this class into an unpublished subclass named `name` that adds
    /// no instance variables and no methods of its own.
    ///
    /// Host overrides patched into the copy are routed to `host`, or to
    /// whatever host this class routes to when `None`.
    pub(crate) fn derive_subclass(
        &'static self,
        name: &str,
        host: Option<&'static dyn Host>,
    ) -> Box<Self> {
        let ivars_offset = self.ivars_end();
        Box::new(Self {
            header: ObjHeader::new(self.header.klass, FLAG_IMMORTAL),
            name: name.to_string(),
            parent: Some(NonNull::from(self)),
            parcel_id: self.parcel_id,
            flags: self.flags | VTABLE_FLAG_DYNAMIC,
            obj_alloc_size: ivars_offset,
            ivars_offset,
            table: self.table.clone(),
            abstract_slots: self.abstract_slots.clone(),
            methods: Vec::new(),
            host: host.or(self.host),
            host_ready: OnceLock::new(),
        })
    }

    pub(crate) fn set_meta_class(&mut self, meta: NonNull<VTable>) {
        self.header.klass = meta.as_ptr();
    }

    /// Installs `imp` at `slot`. Returns `false` if the slot is out of range.
    pub(crate) fn override_slot(&mut self, imp: Imp, slot: MethodSlot) -> bool {
        match self.table.get_mut(slot.index()) {
            Some(entry) => {
                *entry = imp;
                self.abstract_slots[slot.index()] = false;
                true
            }
            None => false,
        }
    }

    /// Looks up a registered class by name.
    ///
    /// # Example
    ///
    /// ```rust
    /// use objrt::runtime::VTable;
    ///
    /// let obj = VTable::fetch("Obj").unwrap();
    /// assert_eq!(obj.name(), "Obj");
    /// assert!(VTable::fetch("NoSuchClass").is_none());
    /// ```
    pub fn fetch(name: &str) -> Option<&'static VTable> {
        init();
        registry().fetch(name).copied()
    }

    /// Registers this class under an additional name.
    ///
    /// Returns `false` if the alias is already taken.
    pub fn add_alias_to_registry(&'static self, alias: &str) -> bool {
        registry().register(alias, self)
    }

    /// Class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent class, `None` only for the root.
    pub fn parent(&self) -> Option<&'static VTable> {
        // SAFETY: parents are published or bootstrapped VTables, never freed.
        self.parent.map(|parent| unsafe { &*parent.as_ptr() })
    }

    /// Identifier of the bootstrap batch that created this class.
    pub fn parcel_id(&self) -> u32 {
        self.parcel_id
    }

    /// Class flags (`VTABLE_FLAG_*`).
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Returns `true` for the meta-class, the one class that is its own class.
    pub fn is_meta_class(&self) -> bool {
        ptr::eq(self.header.klass, self)
    }

    /// Host that runs this class's host overrides.
    pub fn host_adapter(&self) -> &'static dyn Host {
        self.host.unwrap_or_else(host)
    }

    /// Returns `true` for classes derived at run time.
    pub fn is_dynamic(&self) -> bool {
        self.flags & VTABLE_FLAG_DYNAMIC != 0
    }

    /// Bytes needed for an instance, header included.
    pub fn obj_alloc_size(&self) -> usize {
        self.obj_alloc_size
    }

    /// Offset of the first instance variable this class adds.
    pub fn ivars_offset(&self) -> usize {
        self.ivars_offset
    }

    /// Bytes taken by this descriptor and its method table.
    pub fn vt_alloc_size(&self) -> usize {
        mem::size_of::<Self>() + self.table.len() * mem::size_of::<Imp>()
    }

    /// Number of method slots.
    pub fn slot_count(&self) -> usize {
        self.table.len()
    }

    /// Implementation at `slot`, or `None` if the slot is out of range.
    pub fn method_ptr(&self, slot: MethodSlot) -> Option<Imp> {
        self.table.get(slot.index()).copied()
    }

    pub(crate) fn imp_at(&self, slot: MethodSlot) -> Imp {
        self.method_ptr(slot).unwrap_or_else(|| {
            panic!(
                "slot {slot} out of range for class '{}' ({} slots)",
                self.name,
                self.table.len()
            )
        })
    }

    /// Returns `true` if nothing in the ancestry implements `slot`.
    pub fn is_abstract_slot(&self, slot: MethodSlot) -> bool {
        self.abstract_slots.get(slot.index()).copied().unwrap_or(false)
    }

    /// Checks that `slot` exists and has an implementation.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidMethodSlot`] if the slot is out of range
    /// - [`Error::AbstractMethod`] if the slot is still abstract
    pub fn check_implemented(&self, slot: MethodSlot) -> Result<()> {
        match self.abstract_slots.get(slot.index()) {
            None => Err(Error::InvalidMethodSlot {
                class: self.name.clone(),
                method: String::new(),
                slot: slot.index(),
            }),
            Some(true) => Err(Error::AbstractMethod {
                class: self.name.clone(),
                method: self
                    .method_for_slot(slot)
                    .map_or_else(String::new, |m| m.name().to_string()),
            }),
            Some(false) => Ok(()),
        }
    }

    /// Methods declared by this class itself.
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// Method of this class (not its ancestors) named `name`.
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name() == name)
    }

    /// Nearest declaration of `name` in this class or its ancestors.
    pub fn find_method(&self, name: &str) -> Option<&Method> {
        self.ancestors().find_map(|class| class.method(name))
    }

    /// Nearest declaration of the method occupying `slot`.
    pub fn method_for_slot(&self, slot: MethodSlot) -> Option<&Method> {
        self.ancestors()
            .find_map(|class| class.methods.iter().find(|m| m.slot() == slot))
    }

    /// Sets the host-side name of one of this class's methods.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMethod`] if the class declares no such method.
    pub fn add_host_method_alias(&self, alias: &str, method_name: &str) -> Result<()> {
        self.own_method(method_name)?.set_host_alias(alias);
        Ok(())
    }

    /// Stops host classes from overriding one of this class's methods.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMethod`] if the class declares no such method.
    pub fn exclude_host_method(&self, method_name: &str) -> Result<()> {
        self.own_method(method_name)?.exclude();
        Ok(())
    }

    fn own_method(&self, name: &str) -> Result<&Method> {
        self.method(name).ok_or_else(|| Error::UnknownMethod {
            class: self.name.clone(),
            method: name.to_string(),
        })
    }

    /// This class followed by each ancestor up to the root.
    pub fn ancestors(&self) -> Ancestors<'_> {
        Ancestors { next: Some(self) }
    }

    /// Returns `true` if `other` is this class or one of its ancestors.
    pub fn is_subclass_of(&self, other: &VTable) -> bool {
        self.ancestors().any(|class| ptr::eq(class, other))
    }

    /// This class viewed as an object.
    pub fn as_obj(&self) -> ObjPtr {
        ObjPtr::from_header(&self.header)
    }
}

impl PartialEq for VTable {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl Eq for VTable {}

impl fmt::Debug for VTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VTable")
            .field("name", &self.name)
            .field("dynamic", &self.is_dynamic())
            .field("parent", &self.parent().map(VTable::name))
            .field("parcel_id", &self.parcel_id)
            .field("slots", &self.table.len())
            .field("obj_alloc_size", &self.obj_alloc_size)
            .finish_non_exhaustive()
    }
}

/// Iterator returned by [`VTable::ancestors`].
pub struct Ancestors<'a> {
    next: Option<&'a VTable>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a VTable;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent();
        Some(current)
    }
}
