// Singleton derivation tests
//
// Host-declared subclasses: racing derivation, host overrides routed
// through the trampoline, parent resolution and notification. No global
// host is installed in this binary, so every override must reach the host
// that derived its class.

mod common;

use common::{HOST_RETURN, RecordingHost, init_logging, return_42_impl, unique_name};
use objrt::runtime::{
    ClassSpec, EQUALS, HASH_SUM, Host, MethodKind, MethodSlot, OBJ_CLASS_NAME, OBJ_SLOT_COUNT,
    VTable, bootstrap, host_trampoline, make_obj, obj_class, send,
};
use objrt::Error;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::time::Duration;
use std::thread;

const GREET: MethodSlot = MethodSlot::new(OBJ_SLOT_COUNT);
const FAREWELL: MethodSlot = MethodSlot::new(OBJ_SLOT_COUNT + 1);

fn greeter() -> &'static VTable {
    let name = unique_name("Greeter");
    bootstrap(&[ClassSpec::new(&name)
        .parent(OBJ_CLASS_NAME)
        .novel("Greet_Person", return_42_impl, GREET)
        .novel_final("farewell", return_42_impl, FAREWELL)])
    .unwrap()[0]
}

#[test]
fn test_concurrent_singleton_has_one_winner() {
    init_logging();
    const THREADS: usize = 8;
    let name = Arc::new(unique_name("Widget"));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let name = Arc::clone(&name);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let class = VTable::singleton(&name, Some(obj_class())).unwrap();
                ptr::from_ref(class) as usize
            })
        })
        .collect();

    let addrs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(addrs.iter().all(|a| *a == addrs[0]));

    let fetched = VTable::fetch(&name).unwrap();
    assert_eq!(ptr::from_ref(fetched) as usize, addrs[0]);
    assert_eq!(fetched.parent(), Some(obj_class()));
    assert!(fetched.is_dynamic());
}

#[test]
fn test_host_is_notified_once_under_race() {
    const THREADS: usize = 8;
    let name = unique_name("Notified");
    let host = RecordingHost::new().leak();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let name = name.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                VTable::singleton_with_host(&name, Some(obj_class()), host)
                    .map(|class| ptr::from_ref(class) as usize)
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(host.registered(), vec![(name, OBJ_CLASS_NAME.to_string())]);
}

#[test]
fn test_host_overrides_are_patched() {
    let parent = greeter();
    let child_name = unique_name("PerlGreeter");
    let host = RecordingHost::new()
        .with_methods(
            &child_name,
            &["greet_person", "Farewell", "HashSum", "not_a_method"],
        )
        .leak();

    let child = VTable::singleton_with_host(&child_name, Some(parent), host).unwrap();

    // Matched by normalized name and routed to the host.
    assert!(ptr::fn_addr_eq(
        child.method_ptr(GREET).unwrap(),
        host_trampoline as objrt::runtime::Imp
    ));
    assert!(ptr::fn_addr_eq(
        child.method_ptr(HASH_SUM).unwrap(),
        host_trampoline as objrt::runtime::Imp
    ));
    // No callback, so not overridable.
    assert!(ptr::fn_addr_eq(
        child.method_ptr(FAREWELL).unwrap(),
        parent.method_ptr(FAREWELL).unwrap()
    ));
    // Not mentioned by the host.
    assert!(ptr::fn_addr_eq(
        child.method_ptr(EQUALS).unwrap(),
        parent.method_ptr(EQUALS).unwrap()
    ));

    let patched: Vec<_> = child.methods().iter().map(|m| m.name()).collect();
    assert_eq!(patched, ["Greet_Person", "hash_sum"]);
    assert!(child.methods().iter().all(|m| m.kind() == MethodKind::HostOverride));

    let obj = make_obj(child);
    assert_eq!(unsafe { send(obj.as_ptr(), GREET, &[]) }, Ok(HOST_RETURN));
    assert_eq!(host.invocations(), 1);

    // The parent is untouched.
    let parent_obj = make_obj(parent);
    assert_eq!(unsafe { send(parent_obj.as_ptr(), GREET, &[]) }, Ok(42));
}

#[test]
fn test_excluded_and_aliased_methods() {
    let parent = greeter();
    parent.exclude_host_method("Greet_Person").unwrap();

    let child_name = unique_name("Excluded");
    let host = RecordingHost::new()
        .with_methods(&child_name, &["greet_person"])
        .leak();
    let child = VTable::singleton_with_host(&child_name, Some(parent), host).unwrap();
    assert!(ptr::fn_addr_eq(
        child.method_ptr(GREET).unwrap(),
        parent.method_ptr(GREET).unwrap()
    ));
    assert!(child.methods().is_empty());

    let aliased_parent = greeter();
    aliased_parent
        .add_host_method_alias("say_hello", "Greet_Person")
        .unwrap();
    let aliased_name = unique_name("Aliased");
    let host = RecordingHost::new()
        .with_methods(&aliased_name, &["SayHello"])
        .leak();
    let aliased = VTable::singleton_with_host(&aliased_name, Some(aliased_parent), host).unwrap();
    assert!(ptr::fn_addr_eq(
        aliased.method_ptr(GREET).unwrap(),
        host_trampoline as objrt::runtime::Imp
    ));
}

#[test]
fn test_parent_resolved_through_host() {
    let parent = greeter();
    let middle = unique_name("Middle");
    let leaf = unique_name("Leaf");
    let host = RecordingHost::new()
        .with_parent(&leaf, &middle)
        .with_parent(&middle, parent.name())
        .leak();

    let leaf_class = VTable::singleton_with_host(&leaf, None, host).unwrap();
    let middle_class = VTable::fetch(&middle).unwrap();
    assert_eq!(leaf_class.parent(), Some(middle_class));
    assert_eq!(middle_class.parent(), Some(parent));
    assert!(leaf_class.is_subclass_of(parent));

    // Parent first, then child.
    assert_eq!(
        host.registered(),
        vec![
            (middle.clone(), parent.name().to_string()),
            (leaf.clone(), middle.clone())
        ]
    );
}

#[test]
fn test_inheritance_cycle() {
    let a = unique_name("CycleA");
    let b = unique_name("CycleB");
    let host = RecordingHost::new()
        .with_parent(&a, &b)
        .with_parent(&b, &a)
        .leak();
    let err = VTable::singleton_with_host(&a, None, host).unwrap_err();
    assert_eq!(err, Error::InheritanceCycle { class: a.clone() });
    assert!(VTable::fetch(&a).is_none());
    assert!(VTable::fetch(&b).is_none());
}

#[test]
fn test_class_not_found() {
    let name = unique_name("Nowhere");
    let err = VTable::singleton_with_host(&name, None, RecordingHost::new().leak()).unwrap_err();
    assert_eq!(err, Error::ClassNotFound { class: name });
}

#[test]
fn test_non_ascii_host_method() {
    let name = unique_name("Unicode");
    let host = RecordingHost::new().with_methods(&name, &["größe"]).leak();
    let err = VTable::singleton_with_host(&name, Some(obj_class()), host).unwrap_err();
    assert!(matches!(err, Error::CaseFold { .. }));
    assert!(VTable::fetch(&name).is_none());
}

#[test]
fn test_singleton_of_singleton() {
    let base = VTable::singleton(&unique_name("Base"), Some(obj_class())).unwrap();
    let derived = VTable::singleton(&unique_name("Derived"), Some(base)).unwrap();
    assert_eq!(derived.parent(), Some(base));
    assert_eq!(derived.obj_alloc_size(), base.obj_alloc_size());
    let names: Vec<_> = derived.ancestors().map(VTable::name).collect();
    assert_eq!(names, [derived.name(), base.name(), "Obj"]);
}

#[test]
fn test_overrides_reach_deriving_host() {
    let parent = greeter();
    let first_name = unique_name("FirstHost");
    let second_name = unique_name("SecondHost");
    let first = RecordingHost::new()
        .with_methods(&first_name, &["greet_person"])
        .with_return(99)
        .leak();
    let second = RecordingHost::new()
        .with_methods(&second_name, &["greet_person"])
        .with_return(11)
        .leak();

    let first_class = VTable::singleton_with_host(&first_name, Some(parent), first).unwrap();
    let second_class = VTable::singleton_with_host(&second_name, Some(parent), second).unwrap();

    let first_obj = make_obj(first_class);
    let second_obj = make_obj(second_class);
    unsafe {
        assert_eq!(send(first_obj.as_ptr(), GREET, &[]), Ok(99));
        assert_eq!(send(second_obj.as_ptr(), GREET, &[]), Ok(11));
    }
    assert_eq!(first.invocations(), 1);
    assert_eq!(second.invocations(), 1);

    // A plain subclass keeps routing to the host of its nearest derived ancestor.
    let grandchild = VTable::singleton(&unique_name("FirstHostChild"), Some(first_class)).unwrap();
    let grandchild_obj = make_obj(grandchild);
    assert_eq!(unsafe { send(grandchild_obj.as_ptr(), GREET, &[]) }, Ok(99));
    assert_eq!(first.invocations(), 2);
}

/// Host that asks for the class it is being told about.
struct Reentrant {
    lookups: AtomicUsize,
}

impl Host for Reentrant {
    fn register_class(&self, class: &'static VTable, _parent: &'static VTable) {
        let again = VTable::singleton(class.name(), None).unwrap();
        assert!(ptr::eq(again, class));
        self.lookups.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_reentrant_registration_returns() {
    let host: &'static Reentrant = Box::leak(Box::new(Reentrant {
        lookups: AtomicUsize::new(0),
    }));
    let name = unique_name("Reentrant");

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let class = VTable::singleton_with_host(&name, Some(obj_class()), host)
            .map(|class| ptr::from_ref(class) as usize);
        let _ = tx.send(class);
    });

    let class = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("singleton derivation hung on a re-entrant host");
    assert!(class.is_ok());
    assert_eq!(host.lookups.load(Ordering::SeqCst), 1);
}

