//! Stackful, single-threaded, cooperative coroutines.
//!
//! A [`Context`] owns a guard-paged stack and an entry function to run on it.
//! Control moves between the owner and the coroutine with a single symmetric
//! operation: the owner calls [`Context::transfer`] to run the coroutine until
//! it yields or returns, and the coroutine calls [`Yielder::transfer`] to hand
//! control back. Exactly one side runs at any time and nothing is scheduled
//! behind the caller's back.
//!
//! ## Example
//!
//! ```rust
//! use cocontext::{Context, Yielder};
//!
//! fn counter(y: &Yielder) -> i32 {
//!     for _ in 0..5 {
//!         y.suspend();
//!     }
//!     100
//! }
//!
//! let mut ctx = Context::new(counter).unwrap();
//! let ret = loop {
//!     let ret = ctx.transfer();
//!     println!("[main] back in main");
//!     if ctx.has_ended() {
//!         break ret;
//!     }
//! };
//! assert_eq!(ret, 100);
//! ctx.destroy().unwrap();
//! ```
//!
//! ## Parameter slot
//!
//! Every context embeds a small [`PARAM_SLOT_SIZE`]-byte slot that both sides
//! can reach, through [`Context::param_ptr`] and [`Yielder::param_ptr`], to
//! pass a small value across a transfer. Its contents are never looked at by
//! this crate.
//!
//! ## Fatal errors
//!
//! Some failures leave no safe way to continue: a context whose validity
//! marker is gone, a coroutine destroying its own stack, a stack that cannot be
//! unmapped. These are reported through the fatal path, which calls the
//! handler installed with [`set_panic_handler`], prints the message to stderr
//! and exits the process with [`FATAL_EXIT_CODE`]. Creation errors take the
//! same path when the context is created with `hardfail`.
//!
//! ## Supported targets
//!
//! Unix on x86_64 and AArch64.

#![warn(missing_docs)]

mod arch;
mod builder;
mod context;
mod error;
mod panic;
pub mod stack;
mod util;

pub use self::builder::Builder;
pub use self::context::{
    Context, EntryFn, State, Yielder, DEFAULT_STACK_SIZE, MIN_PANIC_STACK_SIZE, PARAM_SLOT_ALIGN,
    PARAM_SLOT_SIZE,
};
pub use self::error::{Error, Result};
pub use self::panic::{panic_handler, set_panic_handler, PanicHandler, FATAL_EXIT_CODE};
pub use self::stack::MAX_STACK_SIZE;

#[cfg(test)]
mod tests;
