//! The register-level stack switch.
//!
//! Each backend provides the same four operations:
//! - `init_stack` lays out a fresh stack so the first switch lands in the
//!   initial function.
//! - `switch_and_link` switches from the resumer into the coroutine.
//! - `switch_yield` switches from the coroutine back to its resumer.
//! - `switch_and_reset` switches back for the last time when the initial
//!   function is done.
//!
//! The only machine state kept per coroutine is its stack pointer: all the
//! callee-saved registers that must survive a switch are pushed on the stack
//! being left. Nothing above this module inspects that state.

use core::mem;

use crate::stack::StackPointer;
use crate::util::EncodedValue;

/// Signature of the function executed on the first switch into a stack.
///
/// `parent_link` points at the slot near the stack base that holds the
/// resumer's stack pointer while the coroutine runs. `obj` points at the object
/// that was passed to `init_stack`.
pub type InitialFunc<T> =
    unsafe extern "C" fn(arg: EncodedValue, parent_link: *mut StackPointer, obj: *mut T) -> !;

// Helper macros to deal with platform-specific differences in assembly code
// between ELF and Mach-O file formats.
cfg_if::cfg_if! {
    if #[cfg(target_vendor = "apple")] {
        macro_rules! asm_mangle {
            ($name:literal) => { concat!("_", $name) };
        }
        macro_rules! asm_function_begin {
            ($name:literal) => {
                concat!(
                    ".globl ", asm_mangle!($name), "\n",
                    ".private_extern ", asm_mangle!($name), "\n",
                    asm_mangle!($name), ":\n",
                )
            };
        }
        macro_rules! asm_function_end {
            ($name:literal) => {
                ""
            };
        }
        // Darwin refuses to unwind through signal frames.
        macro_rules! cfi_signal_frame {
            () => { "" }
        }
    } else {
        macro_rules! asm_mangle {
            ($name:literal) => { $name };
        }
        macro_rules! asm_function_begin {
            ($name:literal) => {
                concat!(
                    ".globl ", asm_mangle!($name), "\n",
                    ".type ", asm_mangle!($name), ", @function\n",
                    asm_mangle!($name), ":\n",
                )
            };
        }
        macro_rules! asm_function_end {
            ($name:literal) => {
                concat!(".size ", asm_mangle!($name), ", . - ", asm_mangle!($name), "\n")
            };
        }
        macro_rules! cfi_signal_frame {
            () => { ".cfi_signal_frame" }
        }
    }
}

/// Writes `obj` below `sp` so that `sp` ends up aligned to `STACK_ALIGNMENT`,
/// given that `sp + sp_offset` already is.
#[inline]
unsafe fn allocate_obj_on_stack<T>(sp: &mut usize, sp_offset: usize, obj: T) {
    assert!(mem::size_of::<T>() <= 1024, "type is too big to transfer");

    if mem::align_of::<T>() > STACK_ALIGNMENT {
        *sp -= mem::size_of::<T>();
        *sp &= !(mem::align_of::<T>() - 1);
    } else {
        let total_size = sp_offset + mem::size_of::<T>();
        let align_offset = total_size % STACK_ALIGNMENT;
        if align_offset != 0 {
            *sp -= STACK_ALIGNMENT - align_offset;
        }
        *sp -= mem::size_of::<T>();
    }
    (*sp as *mut T).write(obj);

    debug_assert_eq!(*sp % STACK_ALIGNMENT, 0);
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", unix))] {
        mod x86_64;
        pub use self::x86_64::*;
    } else if #[cfg(all(target_arch = "aarch64", unix))] {
        mod aarch64;
        pub use self::aarch64::*;
    } else {
        compile_error!("Unsupported target");
    }
}

/// Pushes a word onto a stack, or just reserves the slot for `None`.
#[inline]
unsafe fn push(sp: &mut usize, val: Option<StackWord>) {
    *sp -= mem::size_of::<StackWord>();
    if let Some(val) = val {
        *(*sp as *mut StackWord) = val;
    }
}
