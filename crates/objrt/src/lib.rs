//! `objrt`: a single-inheritance object runtime.
//!
//! `objrt` provides the object model a generated binding layer or host
//! language sits on:
//!
//! - **Flattened dispatch**: every class carries a full copy of its
//!   ancestors' method table, so a call is one indexed load
//! - **Lock-free class registry**: classes are looked up and published by
//!   name from any thread without locks
//! - **Reference counting**: atomic counts with class-specific `destroy`
//! - **Host classes**: subclasses defined in the host language are derived
//!   lazily, with host overrides routed back through a trampoline
//!
//! # Architecture
//!
//! - **Error layer**: [`Error`] and [`Result`]
//! - **Configuration**: [`RuntimeConfig`], fixed on first use
//! - **Runtime layer**: [`runtime`], unsafe internals behind documented
//!   `unsafe fn`s and a safe owned handle, [`runtime::Obj`]
//!
//! # Example
//!
//! ```rust
//! use objrt::runtime::{make_obj, obj_class, VTable};
//!
//! let point = VTable::singleton("Point", Some(obj_class())).unwrap();
//! let obj = make_obj(point);
//!
//! assert_eq!(obj.class_name(), "Point");
//! assert!(obj.is_a(obj_class()));
//! assert!(obj.to_string().starts_with("Point@0x"));
//! ```

pub mod config;
pub mod error;
pub mod runtime;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use runtime::{ClassSpec, Host, LockFreeRegistry, Method, MethodSlot, Obj, ObjPtr, VTable};
