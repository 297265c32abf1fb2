//! Stack switching for x86_64 (System V ABI).
//!
//! ## Linked stacks
//!
//! A copy of the resumer's stack pointer (the parent link) is kept 16 bytes
//! below the coroutine's stack base and refreshed on every switch into the
//! coroutine. Yielding and finishing both switch back through it.
//!
//! The trampoline also carries DWARF CFI describing how to find the parent
//! frame through the parent link, so backtraces taken inside a coroutine
//! continue into whoever last resumed it.
//!
//! ## Context record
//!
//! The stack base handed to `init_stack` is the address of the context
//! record, which occupies the aligned top of the guarded region. The two
//! words just below it (initial func, parent link) are the only part of the
//! coroutine stack the switch code addresses by fixed offset, so the record
//! itself is never written by anything in this module. `coroutine_main`
//! receives the parent link slot `[base - 16]` as its second argument and
//! keeps it in the record, which is how `switch_yield` finds the resumer
//! from an arbitrary depth.
//!
//! ## Stack layout
//!
//! Suspended coroutine:
//!
//! ```text
//! | Ctx record   |  <- Top of the guarded region.
//! +--------------+  <- Stack base
//! | Initial func |  <- Only used once when resuming for the first time.
//! +--------------+
//! | Parent link  |  <- Points to the top of the parent stack while the
//! +--------------+     coroutine runs.
//! |              |
//! ~     ...      ~
//! |              |
//! +--------------+
//! | Saved RBP    |
//! +--------------+
//! | Saved RBX    |
//! +--------------+
//! | Saved RIP    |
//! +--------------+  <- Saved stack pointer
//! ```
//!
//! Parent stack while the coroutine runs:
//!
//! ```text
//! +-------------+
//! | Saved RBX   |
//! +-------------+
//! | Saved RIP   |
//! +-------------+
//! | Saved RBP   |
//! +-------------+  <- Parent link points here.
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
//! | Initial obj  |  <- Rounded up to `STACK_ALIGNMENT`.
//! +--------------+
//! | Initial RIP  |  <- Points to stack_init_trampoline
//! +--------------+  <- Initial stack pointer
//! ```

use core::arch::{asm, global_asm};

use super::{allocate_obj_on_stack, push, InitialFunc};
use crate::stack::StackPointer;
use crate::util::EncodedValue;

pub const STACK_ALIGNMENT: usize = 16;
pub type StackWord = u64;

// Entry point of every coroutine, reached through the initial RIP that
// init_stack() leaves on top of a fresh stack.
global_asm!(
    ".balign 16",
    asm_function_begin!("cocontext_stack_init_trampoline"),
    ".cfi_startproc",
    // Lets GDB accept a frame whose address is below its parent's.
    cfi_signal_frame!(),
    // Register state on entry:
    // - RSP points to the top of the parent stack.
    // - RBP holds its value from the parent context.
    // - RDX points to the top of our stack.
    // - RSI points to the base of our stack.
    // - RDI contains the argument passed from switch_and_link.
    //
    // Saved RBP plus the return address form a frame record.
    "push rbp",
    // Fill in the parent link. RSI is the context record address, so this
    // lands in the second word below it.
    "mov [rsi - 16], rsp",
    // Second argument of the initial function: the parent link.
    "sub rsi, 16",
    // Switch to the coroutine stack, skipping the initial RIP.
    "lea rsp, [rdx + 8]",
    "mov rbp, rsi",
    // CFA = [rbp] + 24:
    // 0x0f: DW_CFA_def_cfa_expression
    // 5: byte length of the following DWARF expression
    // 0x76 0x00: DW_OP_breg6 (rbp + 0)
    // 0x06: DW_OP_deref
    // 0x23, 0x18: DW_OP_plus_uconst 24
    ".cfi_escape 0x0f, 5, 0x76, 0x00, 0x06, 0x23, 0x18",
    ".cfi_offset rbx, -8",
    ".cfi_offset rip, -16",
    ".cfi_offset rbp, -24",
    // Third argument: the initial object.
    "mov rdx, rsp",
    // Jump rather than call so the return address predictor stays balanced
    // with the RET executed by switch_yield() or switch_and_reset().
    "lea rcx, [rip + 2f]",
    "push rcx",
    "jmp [rsi + 8]",
    // Never executed: the initial function does not return.
    "2:",
    "int3",
    ".cfi_endproc",
    asm_function_end!("cocontext_stack_init_trampoline"),
);

extern "C" {
    // Custom calling convention, only reached from switch_and_link().
    fn cocontext_stack_init_trampoline();
}

/// Sets up a stack so that `func` runs on the first switch into it, with a
/// pointer to `obj` as its third argument.
#[inline]
pub unsafe fn init_stack<T>(
    stack_base: StackPointer,
    func: InitialFunc<T>,
    obj: T,
) -> StackPointer {
    let mut sp = stack_base.get();

    // Read by the trampoline and jumped to.
    push(&mut sp, Some(func as StackWord));

    // Parent link, filled in on every switch_and_link().
    push(&mut sp, None);

    allocate_obj_on_stack(&mut sp, 16, obj);

    // Called by switch_and_link() during the initial switch.
    push(&mut sp, Some(cocontext_stack_init_trampoline as StackWord));

    StackPointer::new_unchecked(sp)
}

/// Transfers control into a coroutine along with an argument.
///
/// Returns the argument sent back by the coroutine and its new stack pointer,
/// which is `None` if it came back through `switch_and_reset`.
#[inline]
pub unsafe fn switch_and_link(
    arg: EncodedValue,
    sp: StackPointer,
    stack_base: StackPointer,
) -> (EncodedValue, Option<StackPointer>) {
    let (ret_val, ret_sp);

    asm!(
        // RBX is reserved by LLVM and cannot be listed as a clobber.
        "push rbx",

        // Continue in the trampoline or at label 2 of switch_yield.
        "call [rdx]",

        // Back from the coroutine:
        // - RSI: top of the coroutine stack, or 0 from switch_and_reset.
        // - RDI: argument passed from the coroutine.
        "pop rbx",

        inlateout("rdi") arg => ret_val,
        lateout("rsi") ret_sp,
        in("rsi") stack_base.get() as u64,
        in("rdx") sp.get() as u64,

        // Callee-saved registers not covered by clobber_abi. RBP is pushed by
        // the other side so that it forms a frame record.
        lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
        clobber_abi("sysv64"),
    );

    (ret_val, StackPointer::new(ret_sp))
}

/// Returns control from a coroutine to its resumer, and returns the argument
/// of the next `switch_and_link`.
// Always inlined to keep the return address predictor balanced.
#[inline(always)]
pub unsafe fn switch_yield(arg: EncodedValue, parent_link: *mut StackPointer) -> EncodedValue {
    let ret_val;

    asm!(
        "push rbp",
        "push rbx",

        // Resume address for the next switch_and_link().
        "lea rax, [rip + 2f]",
        "push rax",

        // Our stack pointer is returned out of switch_and_link().
        "mov rsi, rsp",

        "mov rsp, [rdx]",
        "pop rbp",
        "ret",

        // Resumed by switch_and_link():
        // - RSP points to the top of the parent stack.
        // - RDX points to the top of our stack, including the return address.
        // - RSI points to the base of our stack.
        "2:",
        "push rbp",
        "mov [rsi - 16], rsp",
        "lea rsp, [rdx + 8]",
        "pop rbx",
        "pop rbp",

        inlateout("rdi") arg => ret_val,
        in("rdx") parent_link as u64,
        lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
        clobber_abi("sysv64"),
    );

    ret_val
}

/// Returns control to the resumer for the last time.
///
/// The resumer sees a null stack pointer and must not switch into this stack
/// again without re-initializing it.
#[inline(always)]
pub unsafe fn switch_and_reset(arg: EncodedValue, parent_link: *mut StackPointer) -> ! {
    asm!(
        "mov rsp, [{parent_link}]",
        "pop rbp",
        "ret",

        parent_link = in(reg) parent_link as u64,
        in("rdi") arg,
        in("rsi") 0,
        options(noreturn),
    );
}
