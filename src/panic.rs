//! Process-wide fatal error reporting.
//!
//! Errors that leave a context in a state with no safe continuation (a
//! corrupted handle, a coroutine freeing its own stack, a failed unmap) never
//! unwind. Instead the installed handler is given a chance to report the
//! message, after which the process terminates with [`FATAL_EXIT_CODE`].
//!
//! The handler is global configuration. It is meant to be installed once at
//! startup; replacing it while another thread may hit a fatal error is not
//! supported.

use std::io::{self, Write};
use std::process;
use std::sync::RwLock;

use crate::Error;

/// Exit status used when the process is terminated by the fatal path.
pub const FATAL_EXIT_CODE: i32 = 3;

/// Signature of a fatal error handler.
///
/// The handler receives a human readable message. It is not expected to
/// return, but if it does the process is terminated anyway.
pub type PanicHandler = fn(message: &str);

static PANIC_HANDLER: RwLock<Option<PanicHandler>> = RwLock::new(None);

/// Installs `handler` as the process-wide fatal error handler, or restores the
/// default behavior when given `None`.
///
/// Returns the previously installed handler.
pub fn set_panic_handler(handler: Option<PanicHandler>) -> Option<PanicHandler> {
    let mut slot = PANIC_HANDLER.write().unwrap_or_else(|e| e.into_inner());
    core::mem::replace(&mut *slot, handler)
}

/// Returns the currently installed fatal error handler.
pub fn panic_handler() -> Option<PanicHandler> {
    *PANIC_HANDLER.read().unwrap_or_else(|e| e.into_inner())
}

/// Reports `err` and terminates the process.
#[cold]
pub(crate) fn fatal(err: &Error) -> ! {
    let message = err.to_string();
    log::error!("fatal coroutine error: {}", message);

    // A handler that unwinds must not carry the unwind across a stack switch.
    let _exit = scopeguard::guard_on_unwind((), |()| process::exit(FATAL_EXIT_CODE));

    if let Some(handler) = panic_handler() {
        handler(&message);
    }

    let _ = writeln!(io::stderr(), "{}", message);
    process::exit(FATAL_EXIT_CODE)
}
