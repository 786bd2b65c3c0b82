//! The two classes every runtime starts with.
//!
//! `Obj` is the root of the hierarchy and introduces the core methods every
//! object answers. `VTable` describes classes themselves; it is the
//! meta-class of every class, itself included, and refuses to be destroyed.

use crate::runtime::bootstrap::ClassSpec;
use crate::runtime::dispatch::{arg, set_return};
use crate::runtime::method::MethodSlot;
use crate::runtime::object::{HEADER_SIZE, ObjPtr, free_instance};
use crate::runtime::vtable::VTable;
use log::error;
use std::mem;

/// Name of the root class.
pub const OBJ_CLASS_NAME: &str = "Obj";
/// Name of the meta-class.
pub const VTABLE_CLASS_NAME: &str = "VTable";

/// `destroy()`: release an object whose count reached zero.
pub const DESTROY: MethodSlot = MethodSlot::new(0);
/// `equals(other)`: returns 1 if equal, 0 otherwise.
pub const EQUALS: MethodSlot = MethodSlot::new(1);
/// `hash_sum()`: hash consistent with `equals`.
pub const HASH_SUM: MethodSlot = MethodSlot::new(2);
/// `to_string(out: *mut String)`: appends a description to `out`.
pub const TO_STRING: MethodSlot = MethodSlot::new(3);
/// Slots `Obj` introduces; the first novel slot of a direct subclass.
pub const OBJ_SLOT_COUNT: usize = 4;

pub(crate) fn core_specs() -> Vec<ClassSpec> {
    let obj = ClassSpec::new(OBJ_CLASS_NAME)
        .novel_final("destroy", obj_destroy, DESTROY)
        .novel("equals", obj_equals, EQUALS)
        .novel("hash_sum", obj_hash_sum, HASH_SUM)
        .novel("to_string", obj_to_string, TO_STRING);
    debug_assert_eq!(obj.methods.len(), OBJ_SLOT_COUNT);

    let vtable = ClassSpec::new(VTABLE_CLASS_NAME)
        .parent(OBJ_CLASS_NAME)
        .ivars_size(mem::size_of::<VTable>() - HEADER_SIZE)
        .overridden("destroy", vtable_destroy, DESTROY);

    vec![obj, vtable]
}

unsafe extern "C-unwind" fn obj_destroy(
    this: ObjPtr,
    _cmd: MethodSlot,
    _args: *const usize,
    _ret: *mut u8,
) {
    // SAFETY: destroy only runs once the last reference is gone.
    unsafe { free_instance(this) };
}

unsafe extern "C-unwind" fn obj_equals(
    this: ObjPtr,
    _cmd: MethodSlot,
    args: *const usize,
    ret: *mut u8,
) {
    let other = unsafe { arg(args, 0) };
    unsafe { set_return(ret, usize::from(this.addr() == other)) };
}

unsafe extern "C-unwind" fn obj_hash_sum(
    this: ObjPtr,
    _cmd: MethodSlot,
    _args: *const usize,
    ret: *mut u8,
) {
    unsafe { set_return(ret, this.addr()) };
}

unsafe extern "C-unwind" fn obj_to_string(
    this: ObjPtr,
    _cmd: MethodSlot,
    args: *const usize,
    _ret: *mut u8,
) {
    // SAFETY: the caller passes a live *mut String as the only argument.
    let out = unsafe { &mut *(arg(args, 0) as *mut String) };
    let name = unsafe { this.class_name() };
    out.push_str(&format!(
        "{name}@0x{:0width$x}",
        this.addr(),
        width = 2 * mem::size_of::<usize>()
    ));
}

unsafe extern "C-unwind" fn vtable_destroy(
    this: ObjPtr,
    _cmd: MethodSlot,
    _args: *const usize,
    _ret: *mut u8,
) {
    // Real classes carry an immortal header; anything else is not a VTable.
    let name = if unsafe { this.is_immortal() } {
        // SAFETY: immortal headers with this destroy belong to live VTables.
        unsafe { &*this.as_ptr().cast::<VTable>() }.name()
    } else {
        unsafe { this.class_name() }
    };
    error!("attempt to destroy VTable for class '{name}'");
    panic!("Attempt to destroy VTable for class '{name}'");
}
