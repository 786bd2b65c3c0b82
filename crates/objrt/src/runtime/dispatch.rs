//! Slot-indexed method dispatch.
//!
//! Dispatch is a single indexed load from the receiver's flattened table
//! followed by an indirect call. Arguments are passed as machine words and
//! the first word of the return buffer is handed back to the caller.

use crate::error::{Error, Result};
use crate::runtime::method::MethodSlot;
use crate::runtime::object::ObjPtr;
use log::error;

/// Calls the method at `slot` after checking it exists and is implemented.
///
/// # Safety
///
/// `obj` must be live and `args` must match what the method expects.
///
/// # Errors
///
/// - [`Error::InvalidMethodSlot`] if the class has no such slot
/// - [`Error::AbstractMethod`] if no class in the ancestry implements it
///
/// # Example
///
/// ```rust
/// use objrt::runtime::{make_obj, obj_class, send, HASH_SUM};
///
/// let obj = make_obj(obj_class());
/// let hash = unsafe { send(obj.as_ptr(), HASH_SUM, &[]) }.unwrap();
/// assert_eq!(hash, obj.as_ptr().addr());
/// ```
pub unsafe fn send(obj: ObjPtr, slot: MethodSlot, args: &[usize]) -> Result<usize> {
    unsafe { obj.vtable() }.check_implemented(slot)?;
    Ok(unsafe { send_unchecked(obj, slot, args) })
}

/// Calls the method at `slot` with no checks beyond the slot bound.
///
/// # Safety
///
/// `obj` must be live and `args` must match what the method expects.
///
/// # Panics
///
/// Panics if `slot` is out of range or the method is abstract.
pub unsafe fn send_unchecked(obj: ObjPtr, slot: MethodSlot, args: &[usize]) -> usize {
    let imp = unsafe { obj.vtable() }.imp_at(slot);
    let mut ret = [0usize; 2];
    // SAFETY: upheld by the caller; ret is word aligned and two words wide.
    unsafe { imp(obj, slot, args.as_ptr(), ret.as_mut_ptr().cast()) };
    ret[0]
}

/// Reads argument word `index`.
///
/// # Safety
///
/// `args` must point at more than `index` words.
pub unsafe fn arg(args: *const usize, index: usize) -> usize {
    unsafe { args.add(index).read() }
}

/// Writes a one-word result into a method's return buffer.
///
/// # Safety
///
/// `ret` must be the buffer passed to the running method.
pub unsafe fn set_return(ret: *mut u8, value: usize) {
    unsafe { ret.cast::<usize>().write_unaligned(value) };
}

/// Placeholder occupying every slot without an implementation.
///
/// # Panics
///
/// Always panics with [`Error::AbstractMethod`].
pub unsafe extern "C-unwind" fn abstract_method(
    this: ObjPtr,
    cmd: MethodSlot,
    _args: *const usize,
    _ret: *mut u8,
) {
    let class = unsafe { this.vtable() };
    let err = Error::AbstractMethod {
        class: class.name().to_string(),
        method: class
            .method_for_slot(cmd)
            .map_or_else(|| format!("#{cmd}"), |m| m.name().to_string()),
    };
    error!("{err}");
    panic!("{err}");
}
