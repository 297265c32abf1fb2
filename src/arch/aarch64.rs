//! Stack switching for AArch64.
//!
//! This follows the x86_64 backend closely; see x86_64.rs for the overall
//! scheme. Only the differences are described here.
//!
//! The stack base is again the address of the context record. The parent
//! link slot `[base - 16]` sits below the initial func word. The trampoline
//! writes it on first entry and the resume path of `switch_yield` on later
//! ones. `coroutine_main` keeps its address in the record.
//!
//! ## Stack layout
//!
//! Suspended coroutine:
//!
//! ```text
//! | Ctx record   |
//! +--------------+  <- Stack base
//! | Initial func |
//! +--------------+
//! | Parent link  |
//! +--------------+
//! |              |
//! ~     ...      ~
//! |              |
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Saved PC     |
//! +--------------+
//! | Saved X29    |
//! +--------------+
//! | Saved X19    |
//! +--------------+  <- Saved stack pointer
//! ```
//!
//! Parent stack while the coroutine runs:
//!
//! ```text
//! +-----------+
//! | Padding   |
//! +-----------+
//! | Saved X19 |
//! +-----------+
//! | Saved PC  |
//! +-----------+
//! | Saved X29 |
//! +-----------+  <- Parent link points here.
//! ```
//!
//! Freshly initialized coroutine:
//!
//! ```text
//! +--------------+  <- Stack base
//! | Initial func |
//! +--------------+
//! | Parent link  |
//! +--------------+
//! | Initial obj  |
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Initial PC   |
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Padding      |
//! +--------------+  <- Initial stack pointer
//! ```

use core::arch::{asm, global_asm};

use super::{allocate_obj_on_stack, push, InitialFunc};
use crate::stack::StackPointer;
use crate::util::EncodedValue;

pub const STACK_ALIGNMENT: usize = 16;
pub type StackWord = u64;

global_asm!(
    ".balign 4",
    asm_function_begin!("cocontext_stack_init_trampoline"),
    ".cfi_startproc",
    cfi_signal_frame!(),
    // Register state on entry:
    // - SP points to the top of the parent stack.
    // - LR contains the return address in the parent context.
    // - X19 and X29 contain their value from the parent context.
    // - X2 points to the top of the coroutine stack.
    // - X1 points to the base of our stack.
    // - X0 contains the argument passed from switch_and_link.
    "stp x29, lr, [sp, #-32]!",
    "str x19, [sp, #16]",
    // Fill in the parent link and point X1 at it.
    "mov x3, sp",
    "str x3, [x1, #-16]!",
    // Switch stacks, popping the padding and initial PC.
    "add sp, x2, #32",
    "mov x29, x1",
    // CFA = [x29] + 32:
    // 0x0f: DW_CFA_def_cfa_expression
    // 5: byte length of the following DWARF expression
    // 0x8d 0x00: DW_OP_breg29 (x29 + 0)
    // 0x06: DW_OP_deref
    // 0x23, 0x20: DW_OP_plus_uconst 32
    ".cfi_escape 0x0f, 5, 0x8d, 0x00, 0x06, 0x23, 0x20",
    ".cfi_offset x19, -16",
    ".cfi_offset lr, -24",
    ".cfi_offset x29, -32",
    // Third argument: the initial object.
    "mov x2, sp",
    "adr lr, 2f",
    "ldr x3, [x1, #8]",
    "br x3",
    // Never executed: the initial function does not return.
    "2:",
    "brk #0",
    ".cfi_endproc",
    asm_function_end!("cocontext_stack_init_trampoline"),
);

extern "C" {
    // Custom calling convention, only reached from switch_and_link().
    fn cocontext_stack_init_trampoline();
}

#[inline]
pub unsafe fn init_stack<T>(
    stack_base: StackPointer,
    func: InitialFunc<T>,
    obj: T,
) -> StackPointer {
    let mut sp = stack_base.get();

    push(&mut sp, Some(func as StackWord));

    // Parent link.
    push(&mut sp, None);

    allocate_obj_on_stack(&mut sp, 16, obj);

    // Padding so the final stack pointer value is properly aligned.
    push(&mut sp, None);

    push(&mut sp, Some(cocontext_stack_init_trampoline as StackWord));

    // switch_and_link() looks for the target PC 16 bytes above the stack
    // pointer.
    push(&mut sp, None);
    push(&mut sp, None);

    StackPointer::new_unchecked(sp)
}

#[inline]
pub unsafe fn switch_and_link(
    arg: EncodedValue,
    sp: StackPointer,
    stack_base: StackPointer,
) -> (EncodedValue, Option<StackPointer>) {
    let (ret_val, ret_sp);

    asm!(
        "ldr x3, [x2, #16]",
        "blr x3",

        // Back from the coroutine:
        // - X2: our stack pointer.
        // - X1: top of the coroutine stack, or 0 from switch_and_reset.
        // - X0: argument passed from the coroutine.
        "add sp, x2, #32",

        inlateout("x0") arg => ret_val,
        lateout("x1") ret_sp,
        in("x1") stack_base.get() as u64,
        in("x2") sp.get() as u64,

        lateout("x20") _, lateout("x21") _, lateout("x22") _, lateout("x23") _,
        lateout("x24") _, lateout("x25") _, lateout("x26") _, lateout("x27") _,
        lateout("x28") _,
        clobber_abi("C"),
    );

    (ret_val, StackPointer::new(ret_sp))
}

#[inline(always)]
pub unsafe fn switch_yield(arg: EncodedValue, parent_link: *mut StackPointer) -> EncodedValue {
    let ret_val;

    asm!(
        // Save X19 and X29, reserving room for the resume PC.
        "stp x19, x29, [sp, #-32]!",
        "adr lr, 2f",
        "str lr, [sp, #16]",

        "ldr x2, [x2]",
        "mov x1, sp",

        // Restore X19, X29 and LR from the parent stack.
        "ldr x19, [x2, #16]",
        "ldp x29, lr, [x2]",
        "ret",

        // Resumed by switch_and_link():
        // - SP points to the top of the parent stack.
        // - X2 points to the top of the coroutine stack.
        // - X1 points to the base of our stack.
        "2:",
        "stp x29, lr, [sp, #-32]!",
        "str x19, [sp, #16]",
        "mov x3, sp",
        "str x3, [x1, #-16]",
        "ldp x19, x29, [x2]",
        "add sp, x2, #32",

        inlateout("x0") arg => ret_val,
        in("x2") parent_link as u64,

        lateout("x20") _, lateout("x21") _, lateout("x22") _, lateout("x23") _,
        lateout("x24") _, lateout("x25") _, lateout("x26") _, lateout("x27") _,
        lateout("x28") _,
        clobber_abi("C"),
    );

    ret_val
}

#[inline(always)]
pub unsafe fn switch_and_reset(arg: EncodedValue, parent_link: *mut StackPointer) -> ! {
    asm!(
        "ldr x2, [{parent_link}]",
        "ldr x19, [x2, #16]",
        "ldp x29, lr, [x2]",
        "ret",

        parent_link = in(reg) parent_link as u64,
        in("x0") arg,
        in("x1") 0,
        options(noreturn),
    );
}
