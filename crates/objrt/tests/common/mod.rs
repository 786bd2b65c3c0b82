// Common test utilities for integration tests
//
// Shared method implementations, a recording host adapter and naming
// helpers so tests in one binary never collide in the global registry.

#![allow(dead_code)]

use fxhash::FxHashMap;
use objrt::runtime::{Host, Method, MethodSlot, ObjPtr, VTable, set_return};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

static NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Returns `prefix` with a process-unique suffix.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}_{}", NAME_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Routes `log` output through the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Method implementation that returns 42.
///
/// # Safety
///
/// `ret` must be a valid return buffer.
pub unsafe extern "C-unwind" fn return_42_impl(
    _this: ObjPtr,
    _cmd: MethodSlot,
    _args: *const usize,
    ret: *mut u8,
) {
    unsafe { set_return(ret, 42) };
}

/// Method implementation that returns 100.
///
/// # Safety
///
/// `ret` must be a valid return buffer.
pub unsafe extern "C-unwind" fn return_100_impl(
    _this: ObjPtr,
    _cmd: MethodSlot,
    _args: *const usize,
    ret: *mut u8,
) {
    unsafe { set_return(ret, 100) };
}

/// Method implementation that returns the sum of its two arguments.
///
/// # Safety
///
/// `args` must point at two words and `ret` must be a valid return buffer.
pub unsafe extern "C-unwind" fn add_impl(
    _this: ObjPtr,
    _cmd: MethodSlot,
    args: *const usize,
    ret: *mut u8,
) {
    let sum = unsafe { objrt::runtime::arg(args, 0) + objrt::runtime::arg(args, 1) };
    unsafe { set_return(ret, sum) };
}

/// Value [`RecordingHost`] returns from every host method unless told otherwise.
pub const HOST_RETURN: usize = 7;

/// Host adapter that answers from tables and records notifications.
pub struct RecordingHost {
    parents: FxHashMap<String, String>,
    methods: FxHashMap<String, Vec<String>>,
    returns: usize,
    invocations: AtomicUsize,
    registered: Mutex<Vec<(String, String)>>,
}

impl Default for RecordingHost {
    fn default() -> Self {
        Self {
            parents: FxHashMap::default(),
            methods: FxHashMap::default(),
            returns: HOST_RETURN,
            invocations: AtomicUsize::new(0),
            registered: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `class` as a host subclass of `parent`.
    pub fn with_parent(mut self, class: &str, parent: &str) -> Self {
        self.parents.insert(class.to_string(), parent.to_string());
        self
    }

    /// Declares the methods `class` defines on the host side.
    pub fn with_methods(mut self, class: &str, methods: &[&str]) -> Self {
        self.methods.insert(
            class.to_string(),
            methods.iter().map(|m| (*m).to_string()).collect(),
        );
        self
    }

    /// Value every host method call returns.
    pub fn with_return(mut self, value: usize) -> Self {
        self.returns = value;
        self
    }

    /// Gives the host the process lifetime classes expect of their host.
    pub fn leak(self) -> &'static Self {
        Box::leak(Box::new(self))
    }

    /// `(class, parent)` pairs passed to `register_class`, in order.
    pub fn registered(&self) -> Vec<(String, String)> {
        self.registered.lock().unwrap().clone()
    }

    /// Number of host method calls served.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Host for RecordingHost {
    fn find_parent_class(&self, class_name: &str) -> Option<String> {
        self.parents.get(class_name).cloned()
    }

    fn fresh_host_methods(&self, class_name: &str) -> Vec<String> {
        self.methods.get(class_name).cloned().unwrap_or_default()
    }

    fn register_class(&self, class: &'static VTable, parent: &'static VTable) {
        self.registered
            .lock()
            .unwrap()
            .push((class.name().to_string(), parent.name().to_string()));
    }

    unsafe fn invoke(&self, _this: ObjPtr, _method: &Method, _args: *const usize, ret: *mut u8) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        unsafe { set_return(ret, self.returns) };
    }
}
