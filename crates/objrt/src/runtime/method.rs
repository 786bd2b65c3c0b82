//! Method descriptors and the method calling convention.
//!
//! Every method implementation shares one C-compatible signature, [`Imp`].
//! Arguments travel as machine words; results are written into a caller
//! supplied return buffer at least one word wide. The slot the method was
//! invoked through is passed along so shared implementations (such as the
//! host trampoline) can tell which method they stand in for.

use crate::error::{Error, Result};
use crate::runtime::object::ObjPtr;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

/// Method implementation function pointer.
///
/// # Arguments
///
/// * `this` - The receiver
/// * `cmd` - Slot the call was dispatched through
/// * `args` - Pointer to the argument words (may dangle if there are none)
/// * `ret` - Return buffer, at least one `usize` wide and word aligned
///
/// # Example
///
/// ```rust
/// use objrt::runtime::{MethodSlot, ObjPtr};
///
/// unsafe extern "C-unwind" fn answer(
///     _this: ObjPtr,
///     _cmd: MethodSlot,
///     _args: *const usize,
///     ret: *mut u8,
/// ) {
///     unsafe { ret.cast::<usize>().write(42) };
/// }
///
/// let imp: objrt::runtime::Imp = answer;
/// # let _ = imp;
/// ```
pub type Imp = unsafe extern "C-unwind" fn(
    this: ObjPtr,
    cmd: MethodSlot,
    args: *const usize,
    ret: *mut u8,
);

/// Index of a method in a class's flattened dispatch table.
///
/// A slot assigned to a method by the class that introduces it stays the
/// same in every descendant.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodSlot(usize);

impl MethodSlot {
    /// Wraps a table index.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The table index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for MethodSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a method came to be declared by a class.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MethodKind {
    /// Introduced by this class; owns a new slot.
    Novel,
    /// Replaces an inherited implementation in an existing slot.
    Overridden,
    /// Installed by singleton derivation; the slot routes to the host.
    HostOverride,
}

/// Method metadata recorded on the class that declares it.
///
/// Only the alias and the exclusion flag change after publication, and both
/// are expected to be set during single-threaded host start-up.
pub struct Method {
    name: String,
    imp: Imp,
    callback: Option<Imp>,
    slot: MethodSlot,
    kind: MethodKind,
    is_abstract: bool,
    host_alias: RwLock<Option<String>>,
    excluded: AtomicBool,
}

impl Method {
    pub(crate) fn new(
        name: impl Into<String>,
        imp: Imp,
        callback: Option<Imp>,
        slot: MethodSlot,
        kind: MethodKind,
        is_abstract: bool,
    ) -> Self {
        Self {
            name: name.into(),
            imp,
            callback,
            slot,
            kind,
            is_abstract,
            host_alias: RwLock::new(None),
            excluded: AtomicBool::new(false),
        }
    }

    /// Record for a slot a derived class routes to the host.
    pub(crate) fn host_override(original: &Method, callback: Imp) -> Self {
        Self::new(
            original.name.clone(),
            callback,
            Some(callback),
            original.slot,
            MethodKind::HostOverride,
            false,
        )
    }

    /// Method name as declared.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Implementation installed by the declaring class.
    pub fn imp(&self) -> Imp {
        self.imp
    }

    /// Host trampoline, if host classes may override this method.
    pub fn callback(&self) -> Option<Imp> {
        self.callback
    }

    /// Table slot.
    pub fn slot(&self) -> MethodSlot {
        self.slot
    }

    /// How the method was declared.
    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    /// Returns `true` for methods introduced by the declaring class.
    pub fn is_novel(&self) -> bool {
        self.kind == MethodKind::Novel
    }

    /// Returns `true` if the declaring class provides no implementation.
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// Host-side name this method is also known by.
    pub fn host_alias(&self) -> Option<String> {
        self.host_alias
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_host_alias(&self, alias: &str) {
        *self
            .host_alias
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(alias.to_string());
    }

    /// Returns `true` if host classes may not override this method.
    pub fn is_excluded(&self) -> bool {
        self.excluded.load(Ordering::Acquire)
    }

    pub(crate) fn exclude(&self) {
        self.excluded.store(true, Ordering::Release);
    }

    /// Whether `wanted` (already scrunched) names this method on the host side.
    pub(crate) fn answers_to(&self, wanted: &str) -> bool {
        let matches = |name: &str| scrunch(name).is_ok_and(|s| s == wanted);
        matches(&self.name) || self.host_alias().is_some_and(|alias| matches(&alias))
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("slot", &self.slot)
            .field("kind", &self.kind)
            .field("abstract", &self.is_abstract)
            .field("host_alias", &self.host_alias())
            .field("excluded", &self.is_excluded())
            .finish()
    }
}

/// Normalizes a method name for host matching.
///
/// Underscores and spaces are dropped and ASCII letters lowercased, so
/// `Do_Stuff`, `do_stuff` and `dostuff` all compare equal.
///
/// # Errors
///
/// Returns [`Error::CaseFold`] if `name` contains non-ASCII characters.
///
/// # Example
///
/// ```rust
/// use objrt::runtime::scrunch;
///
/// assert_eq!(scrunch("To_String").unwrap(), "tostring");
/// assert!(scrunch("größe").is_err());
/// ```
pub fn scrunch(name: &str) -> Result<String> {
    if !name.is_ascii() {
        return Err(Error::CaseFold {
            name: name.to_string(),
        });
    }
    Ok(name
        .chars()
        .filter(|c| *c != '_' && *c != ' ')
        .map(|c| c.to_ascii_lowercase())
        .collect())
}
