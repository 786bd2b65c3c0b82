//! Host language adapter.
//!
//! The runtime delegates a handful of decisions to whatever embeds it: the
//! parent of a class it has never heard of, which methods a host class
//! overrides, and how to run those overrides. [`Host`] collects those hooks;
//! every hook has a default so an embedding only implements what it needs.
//! Without an installed host, [`NullHost`] answers every query negatively.
//!
//! # Host overrides
//!
//! When singleton derivation patches a slot for a host class it installs
//! the method's callback, normally [`host_trampoline`]. The trampoline finds
//! which method the slot belongs to and hands the call to
//! [`Host::invoke`] on the host that derived the receiver's class, falling
//! back to the globally installed one.

use crate::error::{Error, Result};
use crate::runtime::method::{Method, MethodSlot};
use crate::runtime::object::ObjPtr;
use crate::runtime::vtable::VTable;
use log::{debug, error};
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Opaque reference to a host-side value.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostHandle(NonNull<c_void>);

impl HostHandle {
    /// Wraps a host pointer; `None` if it is null.
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// The wrapped pointer.
    #[must_use]
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Hooks the runtime calls into the embedding language.
pub trait Host: Send + Sync {
    /// Names the parent of a class that isn't registered yet.
    fn find_parent_class(&self, _class_name: &str) -> Option<String> {
        None
    }

    /// Methods the host class `class_name` defines itself.
    fn fresh_host_methods(&self, _class_name: &str) -> Vec<String> {
        Vec::new()
    }

    /// Called once per derived class after it has been registered.
    fn register_class(&self, _class: &'static VTable, _parent: &'static VTable) {}

    /// Runs the host implementation of `method` on `this`.
    ///
    /// # Safety
    ///
    /// Called from a method slot: `this` is live, `args` and `ret` follow
    /// the [`Imp`](crate::runtime::Imp) convention.
    unsafe fn invoke(&self, this: ObjPtr, method: &Method, _args: *const usize, _ret: *mut u8) {
        let class = unsafe { this.class_name() };
        error!("no host implementation for {class}::{}", method.name());
        panic!(
            "host has no implementation of '{}' for class '{class}'",
            method.name()
        );
    }

    /// Host-side counterpart of `obj`, if any.
    fn to_host(&self, _obj: ObjPtr) -> Option<HostHandle> {
        None
    }

    /// Runtime object behind a host value, if any.
    ///
    /// # Safety
    ///
    /// `handle` must have come from this host.
    unsafe fn from_host(&self, _handle: HostHandle) -> Option<ObjPtr> {
        None
    }
}

/// Host used until one is installed. Knows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl Host for NullHost {}

static HOST: OnceLock<Box<dyn Host>> = OnceLock::new();
static NULL_HOST: NullHost = NullHost;

/// Installs the process-wide host. Can only happen once.
///
/// # Errors
///
/// Returns [`Error::HostAlreadySet`] if a host is already installed.
pub fn set_host(host: impl Host + 'static) -> Result<()> {
    HOST.set(Box::new(host))
        .map_err(|_| Error::HostAlreadySet)?;
    debug!("host adapter installed");
    Ok(())
}

/// The installed host, or [`NullHost`].
pub fn host() -> &'static dyn Host {
    match HOST.get() {
        Some(host) => host.as_ref(),
        None => &NULL_HOST,
    }
}

/// Method callback that forwards to [`Host::invoke`].
///
/// # Panics
///
/// Panics if no method in the receiver's ancestry occupies `cmd`, or if the
/// host has no implementation.
pub unsafe extern "C-unwind" fn host_trampoline(
    this: ObjPtr,
    cmd: MethodSlot,
    args: *const usize,
    ret: *mut u8,
) {
    let class = unsafe { this.vtable() };
    let Some(method) = class.method_for_slot(cmd) else {
        error!("no method declared for slot {cmd} of '{}'", class.name());
        panic!("no method declared for slot {cmd} of '{}'", class.name());
    };
    unsafe { class.host_adapter().invoke(this, method, args, ret) };
}
