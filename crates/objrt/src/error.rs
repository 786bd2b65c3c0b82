//! Error types for the `objrt` runtime.
//!
//! This module defines the error type shared by the class registry, the
//! bootstrap routine, singleton derivation, casting and checked dispatch.
//! Contract violations that leave the heap in an undefined state (refcount
//! misuse, destroying a `VTable`, calling an abstract method through the
//! unchecked path) panic instead of returning one of these variants.

use thiserror::Error;

/// Errors that can occur in the `objrt` runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No parent could be determined for a class that is not registered.
    #[error("Class '{class}' doesn't descend from Obj")]
    ClassNotFound {
        /// The class that could not be resolved.
        class: String,
    },

    /// An object failed a `certify` or `downcast` check.
    ///
    /// `found` is `None` when the object itself was null.
    #[error("{}", cast_message(.found.as_deref(), .expected))]
    InvalidCast {
        /// Class name of the object that was checked.
        found: Option<String>,
        /// Class name the object was checked against.
        expected: String,
    },

    /// A method with no implementation was invoked.
    #[error("Abstract method '{method}' not defined by {class}")]
    AbstractMethod {
        /// Class of the receiver.
        class: String,
        /// Name of the abstract method.
        method: String,
    },

    /// Class name already exists in registry.
    #[error("Class '{class}' already exists in registry")]
    ClassAlreadyExists {
        /// The duplicate name.
        class: String,
    },

    /// Parent resolution came back around to a class still being derived.
    #[error("Inheritance cycle detected while resolving '{class}'")]
    InheritanceCycle {
        /// The class at which the cycle closed.
        class: String,
    },

    /// A method declaration names a slot the class layout cannot hold.
    #[error("Method '{method}' of class '{class}' has invalid slot {slot}")]
    InvalidMethodSlot {
        /// Class being built or dispatched on.
        class: String,
        /// Method name, empty when unknown.
        method: String,
        /// The offending slot index.
        slot: usize,
    },

    /// No method of that name is declared by the class.
    #[error("Method '{method}' not found in class '{class}'")]
    UnknownMethod {
        /// Class that was searched.
        class: String,
        /// The missing method name.
        method: String,
    },

    /// A method name could not be normalized for host matching.
    #[error("Can't fold case for '{name}'")]
    CaseFold {
        /// The name that contains non-ASCII characters.
        name: String,
    },

    /// A bootstrap batch contains no `VTable` class and none exists yet.
    #[error("Meta-class 'VTable' has not been bootstrapped")]
    MissingMetaClass,

    /// Registration lost a race and the winner could not be fetched.
    ///
    /// Registry entries are never removed, so a lost race always finds its
    /// winner and this is not produced today. It stays so a failed lookup
    /// after a lost race is reported rather than assumed away.
    #[error("Failed to either insert or fetch VTable for '{class}'")]
    RegistrationFailed {
        /// The class being registered.
        class: String,
    },

    /// Configuration arrived after the runtime already read its settings.
    #[error("Runtime already initialized")]
    RuntimeAlreadyInitialized,

    /// A host adapter is already installed.
    #[error("Host adapter already installed")]
    HostAlreadySet,

    /// A configuration value is out of range.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong with the value.
        reason: String,
    },
}

fn cast_message(found: Option<&str>, expected: &str) -> String {
    match found {
        Some(found) => format!("Can't downcast from {found} to {expected}"),
        None => format!("Object isn't a {expected}, it's NULL"),
    }
}

/// Result type alias for `objrt` runtime operations.
pub type Result<T> = std::result::Result<T, Error>;
