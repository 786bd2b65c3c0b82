//! Lazy derivation of classes defined by the host.
//!
//! A host subclass of a runtime class gets its own [`VTable`]: a copy of
//! the parent's with the slots the host overrides pointed at their host
//! callbacks. Derivation happens on first request and is safe to race; all
//! callers get the same published `VTable`, and the host hears about it
//! exactly once.
//!
//! A class remembers the host that derived it, so its host overrides reach
//! that host even when it isn't the globally installed one.

use crate::error::{Error, Result};
use crate::runtime::host::{Host, host};
use crate::runtime::method::{Method, scrunch};
use crate::runtime::vtable::VTable;
use crate::runtime::{config, init, registry};
use fxhash::FxHashSet;
use log::{debug, info};
use std::cell::RefCell;
use std::ptr;

thread_local! {
    /// Classes whose host notification is running on this thread.
    static ANNOUNCING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

impl VTable {
    /// Returns the class named `class_name`, deriving it from `parent` on
    /// first use.
    ///
    /// With no `parent`, the installed host is asked for the parent's name
    /// and that class is resolved (or derived) first.
    ///
    /// # Errors
    ///
    /// - [`Error::ClassNotFound`] if no parent can be determined
    /// - [`Error::InheritanceCycle`] if host-reported parents loop
    /// - [`Error::CaseFold`] if a host method name isn't ASCII
    /// - [`Error::RegistrationFailed`] if registration lost a race and the
    ///   winner can't be fetched, which can't happen while registry entries
    ///   are never removed
    ///
    /// # Example
    ///
    /// ```rust
    /// use objrt::runtime::{obj_class, VTable};
    ///
    /// let widget = VTable::singleton("DocWidget", Some(obj_class())).unwrap();
    /// assert_eq!(widget.parent(), Some(obj_class()));
    /// assert!(widget.is_dynamic());
    ///
    /// let again = VTable::singleton("DocWidget", None).unwrap();
    /// assert!(std::ptr::eq(widget, again));
    /// ```
    pub fn singleton(class_name: &str, parent: Option<&'static VTable>) -> Result<&'static VTable> {
        init();
        derive(class_name, parent, None, &mut Vec::new())
    }

    /// Like [`VTable::singleton`], consulting `host` instead of the
    /// installed one.
    ///
    /// Classes derived here, including parents resolved through `host`,
    /// route their host overrides and their notification to `host`.
    ///
    /// # Errors
    ///
    /// See [`VTable::singleton`].
    pub fn singleton_with_host(
        class_name: &str,
        parent: Option<&'static VTable>,
        host: &'static dyn Host,
    ) -> Result<&'static VTable> {
        init();
        derive(class_name, parent, Some(host), &mut Vec::new())
    }
}

/// `adapter` of `None` means the global host, looked up on each use.
fn derive(
    class_name: &str,
    parent: Option<&'static VTable>,
    adapter: Option<&'static dyn Host>,
    resolving: &mut Vec<String>,
) -> Result<&'static VTable> {
    let registry = registry();
    if let Some(&existing) = registry.fetch(class_name) {
        return Ok(announce(existing));
    }
    if resolving.iter().any(|name| name == class_name) {
        return Err(Error::InheritanceCycle {
            class: class_name.to_string(),
        });
    }
    let queried = adapter.unwrap_or_else(host);

    let parent = match parent {
        Some(parent) => parent,
        None => {
            let parent_name =
                queried
                    .find_parent_class(class_name)
                    .ok_or_else(|| Error::ClassNotFound {
                        class: class_name.to_string(),
                    })?;
            resolving.push(class_name.to_string());
            let parent = derive(&parent_name, None, adapter, resolving);
            resolving.pop();
            parent?
        }
    };

    let mut singleton = parent.derive_subclass(class_name, adapter);
    apply_host_overrides(&mut singleton, parent, queried)?;

    let candidate: &'static VTable = Box::leak(singleton);
    match registry.try_register(class_name, candidate) {
        Ok(&registered) => {
            info!("derived '{class_name}' from '{}'", parent.name());
            Ok(announce(registered))
        }
        Err(rejected) => {
            debug!("lost the race to register '{class_name}', using the winner");
            // SAFETY: leaked above and never published.
            drop(unsafe { Box::from_raw(ptr::from_ref(rejected).cast_mut()) });
            let winner = registry
                .fetch(class_name)
                .copied()
                .ok_or_else(|| Error::RegistrationFailed {
                    class: class_name.to_string(),
                })?;
            Ok(announce(winner))
        }
    }
}

/// Points every slot the host overrides at its host callback.
fn apply_host_overrides(
    singleton: &mut VTable,
    parent: &'static VTable,
    host: &dyn Host,
) -> Result<()> {
    let fresh = host.fresh_host_methods(&singleton.name);
    if fresh.is_empty() {
        return Ok(());
    }
    let wanted = fresh
        .iter()
        .map(|name| scrunch(name))
        .collect::<Result<FxHashSet<_>>>()?;

    let mut patched: Vec<Method> = Vec::new();
    for ancestor in parent.ancestors() {
        for method in ancestor.methods() {
            let Some(callback) = method.callback() else {
                continue;
            };
            if !method.is_novel() || method.is_excluded() {
                continue;
            }
            if patched.iter().any(|m| m.slot() == method.slot()) {
                continue;
            }
            if wanted.iter().any(|name| method.answers_to(name)) {
                singleton.override_slot(callback, method.slot());
                patched.push(Method::host_override(method, callback));
            }
        }
    }

    debug!(
        "'{}' routes {} of {} host methods to the host",
        singleton.name,
        patched.len(),
        fresh.len()
    );
    singleton.methods = patched;
    Ok(())
}

/// Tells the class's host about a derived class the first time anyone
/// returns it.
///
/// Racing callers block until the notification has run, so no caller sees
/// the class before the host does. A host that asks for the class again
/// from inside `register_class` gets it back without waiting on itself.
fn announce(class: &'static VTable) -> &'static VTable {
    let addr = ptr::from_ref(class) as usize;
    if ANNOUNCING.with_borrow(|running| running.contains(&addr)) {
        return class;
    }
    class.host_ready.get_or_init(|| {
        if !class.is_dynamic() || !config().notify_host {
            return;
        }
        let Some(parent) = class.parent() else {
            return;
        };
        let _running = Announcing::enter(addr);
        class.host_adapter().register_class(class, parent);
    });
    class
}

/// Marks a notification as running on this thread until dropped.
struct Announcing(usize);

impl Announcing {
    fn enter(addr: usize) -> Self {
        ANNOUNCING.with_borrow_mut(|running| running.push(addr));
        Self(addr)
    }
}

impl Drop for Announcing {
    fn drop(&mut self) {
        ANNOUNCING.with_borrow_mut(|running| running.retain(|addr| *addr != self.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::host::NullHost;
    use crate::runtime::obj_class;

    static NULL: NullHost = NullHost;

    #[test]
    fn test_singleton_is_idempotent() {
        let first = VTable::singleton("SingletonIdempotent", Some(obj_class())).unwrap();
        let second = VTable::singleton("SingletonIdempotent", Some(obj_class())).unwrap();
        assert!(ptr::eq(first, second));
        assert_eq!(first.name(), "SingletonIdempotent");
        assert_eq!(first.slot_count(), obj_class().slot_count());
        assert_eq!(first.obj_alloc_size(), obj_class().obj_alloc_size());
        assert!(first.methods().is_empty());
    }

    #[test]
    fn test_existing_class_is_returned_as_is() {
        let obj = VTable::singleton("Obj", None).unwrap();
        assert!(ptr::eq(obj, obj_class()));
    }

    #[test]
    fn test_unknown_parent() {
        let err = VTable::singleton_with_host("NoParentAnywhere", None, &NULL).unwrap_err();
        assert_eq!(
            err,
            Error::ClassNotFound {
                class: "NoParentAnywhere".to_string()
            }
        );
        assert!(VTable::fetch("NoParentAnywhere").is_none());
    }

    #[test]
    fn test_derived_ivars_are_word_aligned() {
        use crate::runtime::bootstrap::{ClassSpec, bootstrap};
        use crate::runtime::core_classes::OBJ_CLASS_NAME;

        let odd = bootstrap(&[ClassSpec::new("OddSizedBase")
            .parent(OBJ_CLASS_NAME)
            .ivars_size(3)])
        .unwrap()[0];
        assert_eq!(odd.obj_alloc_size() % std::mem::size_of::<usize>(), 3);

        let derived = VTable::singleton("OddSizedDerived", Some(odd)).unwrap();
        let bootstrapped = bootstrap(&[ClassSpec::new("OddSizedSibling").parent("OddSizedBase")])
            .unwrap()[0];
        assert_eq!(derived.ivars_offset(), bootstrapped.ivars_offset());
        assert_eq!(derived.ivars_offset() % std::mem::align_of::<usize>(), 0);
        assert!(derived.ivars_offset() >= odd.obj_alloc_size());
        assert_eq!(derived.obj_alloc_size(), derived.ivars_offset());
    }

    #[test]
    fn test_explicit_host_is_recorded() {
        let derived = VTable::singleton_with_host("RecordsNullHost", Some(obj_class()), &NULL).unwrap();
        assert!(ptr::addr_eq(derived.host_adapter(), &NULL));
        let grandchild = VTable::singleton("InheritsNullHost", Some(derived)).unwrap();
        assert!(ptr::addr_eq(grandchild.host_adapter(), &NULL));
    }
}
