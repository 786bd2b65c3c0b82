//! `objrt` runtime module.
//!
//! This module provides the runtime infrastructure:
//!
//! - [`registry`]: lock-free, insert-only map from class names to classes
//! - [`object`]: object header, allocation and reference counting
//! - [`vtable`]: class descriptors with flattened method tables
//! - [`method`]: method records, slots and the calling convention
//! - [`bootstrap`]: three-pass construction of statically declared classes
//! - [`singleton`]: lazy derivation of host-defined subclasses
//! - [`host`]: adapter hooks into the embedding language
//! - [`dispatch`]: slot-indexed method calls
//! - [`core_classes`]: the built-in `Obj` and `VTable` classes
//!
//! # Global state
//!
//! Configuration, the class registry, the core classes and the host adapter
//! are process-wide and initialized once, on first use. Classes are never
//! unregistered or freed.
//!
//! # Example
//!
//! ```rust
//! use objrt::runtime::{make_obj, obj_class, vtable_class};
//!
//! let obj = make_obj(obj_class());
//! assert!(obj.is_a(obj_class()));
//! assert!(vtable_class().is_subclass_of(obj_class()));
//! ```

pub mod bootstrap;
pub mod core_classes;
pub mod dispatch;
pub mod host;
pub mod method;
pub mod object;
pub mod registry;
pub mod singleton;
pub mod vtable;

pub use bootstrap::{ClassSpec, MethodSpec, bootstrap};
pub use core_classes::{
    DESTROY, EQUALS, HASH_SUM, OBJ_CLASS_NAME, OBJ_SLOT_COUNT, TO_STRING,
    VTABLE_CLASS_NAME,
};
pub use dispatch::{abstract_method, arg, send, send_unchecked, set_return};
pub use host::{Host, HostHandle, NullHost, host, host_trampoline, set_host};
pub use method::{Imp, Method, MethodKind, MethodSlot, scrunch};
pub use object::{
    HEADER_SIZE, Obj, ObjHeader, ObjPtr, certify, dec_ref, downcast, get_class_name, inc_ref,
    init_obj, is_a, make_obj, super_destroy,
};
pub use registry::LockFreeRegistry;
pub use vtable::{Ancestors, VTABLE_FLAG_DYNAMIC, VTable};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use fxhash::FxHashSet;
use log::debug;
use std::ptr;
use std::sync::OnceLock;

/// Settings, fixed on first read.
static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Global class registry.
static REGISTRY: OnceLock<LockFreeRegistry<&'static VTable>> = OnceLock::new();

/// `Obj` and `VTable`, bootstrapped together.
static CORE: OnceLock<CoreClasses> = OnceLock::new();

struct CoreClasses {
    obj: &'static VTable,
    vtable: &'static VTable,
}

/// Fixes the runtime settings. Must run before anything reads them.
///
/// # Errors
///
/// - [`Error::InvalidConfig`] if `config` fails validation
/// - [`Error::RuntimeAlreadyInitialized`] if settings were already fixed
pub fn configure(config: RuntimeConfig) -> Result<()> {
    config.validate()?;
    CONFIG
        .set(config)
        .map_err(|_| Error::RuntimeAlreadyInitialized)
}

/// Current settings; taken from the environment if [`configure`] wasn't called.
pub fn config() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::from_env)
}

/// The global class registry.
pub fn registry() -> &'static LockFreeRegistry<&'static VTable> {
    REGISTRY.get_or_init(|| {
        let capacity = config().registry_capacity;
        debug!("creating class registry with {capacity} buckets");
        LockFreeRegistry::new(capacity)
    })
}

fn core() -> &'static CoreClasses {
    CORE.get_or_init(|| {
        let built = bootstrap::bootstrap_batch(registry(), &core_classes::core_specs())
            .unwrap_or_else(|err| panic!("failed to bootstrap core classes: {err}"));
        CoreClasses {
            obj: built[0],
            vtable: built[1],
        }
    })
}

/// Bootstraps the core classes if that hasn't happened yet.
pub fn init() {
    core();
}

/// The root class.
pub fn obj_class() -> &'static VTable {
    core().obj
}

/// The meta-class.
pub fn vtable_class() -> &'static VTable {
    core().vtable
}

/// Every registered class, once each even if it has aliases.
pub fn classes() -> Vec<&'static VTable> {
    init();
    let mut seen = FxHashSet::default();
    registry()
        .iter()
        .filter_map(|(_, &class)| seen.insert(ptr::from_ref(class)).then_some(class))
        .collect()
}
