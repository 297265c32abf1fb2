use crate::{Context, EntryFn, Result};

/// Creation options for a [`Context`].
///
/// ```
/// use cocontext::{Builder, Yielder};
///
/// fn body(_: &Yielder) -> i32 {
///     42
/// }
///
/// let mut ctx = Builder::new().stack_size(64 * 1024).create(body).unwrap();
/// assert!(ctx.stack_size() >= 64 * 1024);
/// assert_eq!(ctx.transfer(), 42);
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct Builder {
    stack_size: Option<usize>,
    hardfail: bool,
}

impl Builder {
    /// Default options: [`DEFAULT_STACK_SIZE`](crate::DEFAULT_STACK_SIZE)
    /// stack, errors returned to the caller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stack of at least `size` usable bytes.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Report creation failures through the fatal path instead of returning
    /// them.
    pub fn hardfail(mut self, hardfail: bool) -> Self {
        self.hardfail = hardfail;
        self
    }

    /// Creates a context running `entry`.
    pub fn create(&self, entry: EntryFn) -> Result<Context> {
        Context::create(Some(entry), self.stack_size, self.hardfail)
    }
}
