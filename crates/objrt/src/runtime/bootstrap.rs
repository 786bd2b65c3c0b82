//! Batch construction of statically declared classes.
//!
//! A batch is an ordered list of [`ClassSpec`]s, parents before children.
//! Building it takes three passes:
//!
//! 1. Allocate each `VTable`, copy the parent's table into it and install
//!    the class's own implementations.
//! 2. Point every header at the `VTable` meta-class, which may be part of
//!    the same batch.
//! 3. Attach names and method records, then publish each class in the
//!    registry.
//!
//! Nothing is visible to other threads before pass 3, and each class is
//! complete by the time it is registered.

use crate::error::{Error, Result};
use crate::runtime::core_classes::VTABLE_CLASS_NAME;
use crate::runtime::dispatch::abstract_method;
use crate::runtime::host::host_trampoline;
use crate::runtime::method::{Imp, Method, MethodKind, MethodSlot};
use crate::runtime::registry::LockFreeRegistry;
use crate::runtime::vtable::VTable;
use crate::runtime::{init, registry};
use log::{debug, info};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Parcel ids handed out so far.
static PARCEL_COUNT: AtomicU32 = AtomicU32::new(0);

fn claim_parcel_id() -> u32 {
    PARCEL_COUNT.fetch_add(1, Ordering::Relaxed) + 1
}

/// Declaration of one method of a [`ClassSpec`].
#[derive(Debug, Clone)]
pub struct MethodSpec {
    /// Method name, also used for host matching.
    pub name: String,
    /// Implementation, or the abstract stub.
    pub func: Imp,
    /// Trampoline that forwards to the host when a host class overrides it.
    pub callback: Option<Imp>,
    /// Table slot. Novel methods take the next free slot; overrides reuse
    /// an inherited one.
    pub slot: MethodSlot,
    /// Novel or overridden.
    pub kind: MethodKind,
    /// Declared without an implementation.
    pub is_abstract: bool,
}

/// Static declaration of a class.
///
/// # Example
///
/// ```rust
/// use objrt::runtime::{bootstrap, ClassSpec, MethodSlot, ObjPtr, OBJ_SLOT_COUNT};
///
/// unsafe extern "C-unwind" fn area(
///     _this: ObjPtr,
///     _cmd: MethodSlot,
///     _args: *const usize,
///     ret: *mut u8,
/// ) {
///     unsafe { objrt::runtime::set_return(ret, 12) };
/// }
///
/// let area_slot = MethodSlot::new(OBJ_SLOT_COUNT);
/// let classes = bootstrap(&[
///     ClassSpec::new("DocShape")
///         .parent("Obj")
///         .abstract_method("area", area_slot),
///     ClassSpec::new("DocSquare")
///         .parent("DocShape")
///         .ivars_size(8)
///         .overridden("area", area, area_slot),
/// ])
/// .unwrap();
///
/// assert!(classes[0].is_abstract_slot(area_slot));
/// assert!(!classes[1].is_abstract_slot(area_slot));
/// ```
#[derive(Debug, Clone)]
pub struct ClassSpec {
    /// Class name.
    pub name: String,
    /// Parent class name, `None` only for the root.
    pub parent: Option<String>,
    /// Bytes of instance variables this class adds.
    pub ivars_size: usize,
    /// Methods this class introduces or overrides.
    pub methods: Vec<MethodSpec>,
}

impl ClassSpec {
    /// Starts a root class declaration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            ivars_size: 0,
            methods: Vec::new(),
        }
    }

    /// Sets the parent class.
    #[must_use]
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Sets the size of the instance variables this class adds.
    #[must_use]
    pub fn ivars_size(mut self, size: usize) -> Self {
        self.ivars_size = size;
        self
    }

    /// Introduces a method host classes may override.
    #[must_use]
    pub fn novel(self, name: impl Into<String>, func: Imp, slot: MethodSlot) -> Self {
        self.with_method(name, func, Some(host_trampoline), slot, MethodKind::Novel, false)
    }

    /// Introduces a method host classes may not override.
    #[must_use]
    pub fn novel_final(self, name: impl Into<String>, func: Imp, slot: MethodSlot) -> Self {
        self.with_method(name, func, None, slot, MethodKind::Novel, false)
    }

    /// Introduces a method with no implementation.
    #[must_use]
    pub fn abstract_method(self, name: impl Into<String>, slot: MethodSlot) -> Self {
        self.with_method(
            name,
            abstract_method,
            Some(host_trampoline),
            slot,
            MethodKind::Novel,
            true,
        )
    }

    /// Replaces an inherited implementation.
    #[must_use]
    pub fn overridden(self, name: impl Into<String>, func: Imp, slot: MethodSlot) -> Self {
        self.with_method(name, func, None, slot, MethodKind::Overridden, false)
    }

    fn with_method(
        mut self,
        name: impl Into<String>,
        func: Imp,
        callback: Option<Imp>,
        slot: MethodSlot,
        kind: MethodKind,
        is_abstract: bool,
    ) -> Self {
        self.methods.push(MethodSpec {
            name: name.into(),
            func,
            callback,
            slot,
            kind,
            is_abstract,
        });
        self
    }

    fn novel_count(&self) -> usize {
        self.methods
            .iter()
            .filter(|m| m.kind == MethodKind::Novel)
            .count()
    }
}

/// Builds and registers a batch of classes.
///
/// Parents must be registered already or appear earlier in the batch.
/// Returns the new classes in batch order.
///
/// # Errors
///
/// - [`Error::ClassAlreadyExists`] if a name is taken or repeated
/// - [`Error::ClassNotFound`] if a parent can't be resolved
/// - [`Error::InvalidMethodSlot`] if a slot doesn't fit the layout
///
/// If a later class fails to register, the ones before it stay published.
pub fn bootstrap(specs: &[ClassSpec]) -> Result<Vec<&'static VTable>> {
    init();
    bootstrap_batch(registry(), specs)
}

/// Runs the three passes against `registry`.
///
/// The meta-class is the batch's own `VTable` class if it declares one,
/// otherwise the registered one.
pub(crate) fn bootstrap_batch(
    registry: &LockFreeRegistry<&'static VTable>,
    specs: &[ClassSpec],
) -> Result<Vec<&'static VTable>> {
    let parcel_id = claim_parcel_id();
    debug!("bootstrapping parcel {parcel_id} with {} classes", specs.len());

    for (i, spec) in specs.iter().enumerate() {
        let repeated = specs[..i].iter().any(|earlier| earlier.name == spec.name);
        if repeated || registry.fetch(&spec.name).is_some() {
            return Err(Error::ClassAlreadyExists {
                class: spec.name.clone(),
            });
        }
    }

    let mut built = Vec::with_capacity(specs.len());
    if let Err(err) = allocate_all(registry, specs, parcel_id, &mut built) {
        discard(built);
        return Err(err);
    }

    let meta = specs
        .iter()
        .position(|spec| spec.name == VTABLE_CLASS_NAME)
        .map(|i| built[i])
        .or_else(|| registry.fetch(VTABLE_CLASS_NAME).map(|vt| NonNull::from(*vt)));
    let Some(meta) = meta else {
        discard(built);
        return Err(Error::MissingMetaClass);
    };

    // Pass 2: meta-class.
    for vtable in &built {
        // SAFETY: unpublished, exclusively owned by this batch.
        unsafe { &mut *vtable.as_ptr() }.set_meta_class(meta);
    }

    // Pass 3: names, method records, publication.
    let mut published = Vec::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        let vtable = built[i];
        {
            // SAFETY: still unpublished.
            let vtable = unsafe { &mut *vtable.as_ptr() };
            vtable.name.clone_from(&spec.name);
            vtable.methods = spec
                .methods
                .iter()
                .map(|m| Method::new(&m.name, m.func, m.callback, m.slot, m.kind, m.is_abstract))
                .collect();
        }
        // SAFETY: from here on the VTable is shared and immutable.
        let vtable: &'static VTable = unsafe { &*vtable.as_ptr() };
        if registry.try_register(&spec.name, vtable).is_err() {
            discard(built.split_off(i));
            return Err(Error::ClassAlreadyExists {
                class: spec.name.clone(),
            });
        }
        published.push(vtable);
    }

    info!(
        "parcel {parcel_id} registered: {}",
        specs
            .iter()
            .map(|spec| spec.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(published)
}

/// Pass 1: allocate and flatten every class of the batch.
fn allocate_all(
    registry: &LockFreeRegistry<&'static VTable>,
    specs: &[ClassSpec],
    parcel_id: u32,
    built: &mut Vec<NonNull<VTable>>,
) -> Result<()> {
    for (i, spec) in specs.iter().enumerate() {
        let parent = match &spec.parent {
            None => None,
            Some(name) => Some(resolve_parent(registry, specs, built, i, name)?),
        };
        // SAFETY: parents are either registered or earlier in this batch.
        let parent = parent.map(|p| unsafe { &*p.as_ptr() });

        let mut vtable = VTable::allocate(parent, parcel_id, spec.ivars_size, spec.novel_count());
        let inherited = parent.map_or(0, VTable::slot_count);
        let mut next_novel = inherited;

        for method in &spec.methods {
            let slot = method.slot.index();
            let valid = match method.kind {
                MethodKind::Novel => {
                    let expected = next_novel;
                    next_novel += 1;
                    slot == expected
                }
                MethodKind::Overridden => slot < inherited,
                MethodKind::HostOverride => false,
            };
            if !valid {
                return Err(Error::InvalidMethodSlot {
                    class: spec.name.clone(),
                    method: method.name.clone(),
                    slot,
                });
            }
            if !method.is_abstract {
                vtable.override_slot(method.func, method.slot);
            }
        }

        built.push(NonNull::from(Box::leak(vtable)));
    }
    Ok(())
}

fn resolve_parent(
    registry: &LockFreeRegistry<&'static VTable>,
    specs: &[ClassSpec],
    built: &[NonNull<VTable>],
    index: usize,
    name: &str,
) -> Result<NonNull<VTable>> {
    if let Some(pos) = specs[..index].iter().position(|spec| spec.name == name) {
        return Ok(built[pos]);
    }
    if let Some(parent) = registry.fetch(name) {
        return Ok(NonNull::from(*parent));
    }
    if specs[index..].iter().any(|spec| spec.name == name) {
        debug!("parent '{name}' is declared after '{}'", specs[index].name);
    }
    Err(Error::ClassNotFound {
        class: specs[index].name.clone(),
    })
}

/// Frees classes that were never published.
fn discard(unpublished: Vec<NonNull<VTable>>) {
    for vtable in unpublished {
        // SAFETY: created by Box::leak in allocate_all and never registered.
        drop(unsafe { Box::from_raw(vtable.as_ptr()) });
    }
}
