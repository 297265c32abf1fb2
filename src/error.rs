//! Error type shared by the allocator and the context operations.

use std::io;

/// Errors produced while creating, validating or tearing down a context.
///
/// Only [`InvalidArgument`](Error::InvalidArgument),
/// [`OutOfMemory`](Error::OutOfMemory) and
/// [`StackTooLarge`](Error::StackTooLarge) are ever returned to the caller,
/// and only when the context was created without `hardfail`. Every other
/// variant describes a state with no safe continuation and always goes
/// through the fatal path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No entry function was supplied.
    #[error("invalid argument to coroutine function")]
    InvalidArgument,

    /// The operating system refused to map or protect the stack region.
    #[error("coroutine create ran out of memory")]
    OutOfMemory(#[source] io::Error),

    /// The requested stack exceeds [`MAX_STACK_SIZE`](crate::MAX_STACK_SIZE).
    #[error("stack size {requested} is too large (> 1MB)")]
    StackTooLarge {
        /// Size that was asked for, in bytes.
        requested: usize,
    },

    /// The validity marker of a context is missing.
    #[error("coroutine context is not valid")]
    BadContext,

    /// A coroutine tried to free the stack it is running on.
    #[error("cannot destroy context in coroutine")]
    WrongStackDestroy,

    /// Unmapping the stack region failed.
    #[error("cannot free coroutine context")]
    ReleaseFailed(#[source] io::Error),

    /// A panic escaped the entry function of a coroutine.
    ///
    /// Only reported when the coroutine stack has at least
    /// [`MIN_PANIC_STACK_SIZE`](crate::MIN_PANIC_STACK_SIZE) usable bytes.
    /// On smaller stacks the panic usually hits the guard page before it
    /// gets here.
    #[error("coroutine entry function panicked")]
    EntryPanicked,
}

impl Error {
    /// Returns the OS error code attached to this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::OutOfMemory(e) | Error::ReleaseFailed(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Whether this error takes the fatal path regardless of `hardfail`.
    pub fn is_always_fatal(&self) -> bool {
        matches!(
            self,
            Error::BadContext
                | Error::WrongStackDestroy
                | Error::ReleaseFailed(_)
                | Error::EntryPanicked
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
