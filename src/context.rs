use core::cell::{Cell, UnsafeCell};
use core::ffi::c_void;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};
use std::panic::{self, AssertUnwindSafe};

use crate::arch;
use crate::panic::fatal;
use crate::stack::{GuardedRegion, StackPointer, STACK_ALIGNMENT};
use crate::util::{self, EncodedValue};
use crate::{Error, Result};

/// Stack size used when none, or a smaller one, is requested.
pub const DEFAULT_STACK_SIZE: usize = 8192;

/// Size in bytes of the parameter slot embedded in every context.
pub const PARAM_SLOT_SIZE: usize = 32;

/// Alignment of the parameter slot.
pub const PARAM_SLOT_ALIGN: usize = 16;

const CONTEXT_MAGIC: u32 = 0xC0C0_7E47;

/// Smallest usable stack on which a panic escaping the entry function is
/// still reported as [`Error::EntryPanicked`] (with backtraces disabled).
///
/// The default panic hook and the unwinder both run on the coroutine stack.
/// With less room than this, the default [`DEFAULT_STACK_SIZE`] included, they
/// can run into the guard page first and the process dies from the fault.
pub const MIN_PANIC_STACK_SIZE: usize = 256 * 1024;

/// Function executed on the coroutine stack. Its return value becomes the
/// result of the transfer that observes its completion.
///
/// An entry function that may panic needs a stack of at least
/// [`MIN_PANIC_STACK_SIZE`] bytes for the panic to reach the fatal path.
pub type EntryFn = fn(&Yielder<'_>) -> i32;

/// Lifecycle of a coroutine as seen from its owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// Created but never transferred into.
    Created,
    /// The entry function has yielded and not finished yet.
    Suspended,
    /// The entry function has returned.
    Completed,
}

#[repr(C, align(16))]
struct ParamSlot(UnsafeCell<[u8; PARAM_SLOT_SIZE]>);

// Only the switch code and the transfer bookkeeping touch this.
struct MachineState {
    // Stack pointer to switch to on the next resume. None while the coroutine
    // is running and after it has completed.
    stack_ptr: Cell<Option<StackPointer>>,

    // Value of `stack_ptr` straight after initialization. A suspended
    // coroutine can never be back at this value since suspending pushes
    // registers.
    initial_stack_ptr: StackPointer,

    // Slot near the stack base holding the resumer's stack pointer. Filled in
    // on first entry.
    parent_link: Cell<*mut StackPointer>,
}

/// The metadata record at the top of every guarded region.
///
/// `magic` must stay the first field.
#[repr(C)]
struct ContextHeader {
    magic: Cell<u32>,
    on_stack: Cell<bool>,
    yielded: Cell<u32>,
    result: Cell<i32>,
    entry: EntryFn,
    region: GuardedRegion,
    stack_high: StackPointer,
    stack_low: StackPointer,
    machine: MachineState,
    param: ParamSlot,
}

/// Checks the validity marker and hands out the record.
///
/// # Safety
///
/// `header` must point to readable memory the size of a `ContextHeader`.
unsafe fn validate<'a>(header: NonNull<ContextHeader>) -> &'a ContextHeader {
    let ctx = &*header.as_ptr();
    if ctx.magic.get() != CONTEXT_MAGIC {
        fatal(&Error::BadContext);
    }
    ctx
}

unsafe fn create_raw(
    entry: Option<EntryFn>,
    stack_size: Option<usize>,
) -> Result<NonNull<ContextHeader>> {
    let entry = entry.ok_or(Error::InvalidArgument)?;
    let size = stack_size.unwrap_or(0).max(DEFAULT_STACK_SIZE);
    let region = GuardedRegion::reserve(size)?;

    // The record sits on an aligned address at the very top of the region and
    // the stack grows down from just below it:
    //
    //   [context record]____ stack high
    //   [stack]_____________ stack low
    //   [guard page]________ region base
    let base = region.base().as_ptr() as usize;
    let offset = (region.len() - mem::size_of::<ContextHeader>()) & !(STACK_ALIGNMENT - 1);
    debug_assert!(base + offset >= region.usable_low().get());
    let header = (base + offset) as *mut ContextHeader;
    let stack_high = StackPointer::new_unchecked(header as usize);
    let stack_low = region.usable_low();
    let header = NonNull::new_unchecked(header);

    let initial_stack_ptr = arch::init_stack(stack_high, coroutine_main, header);

    header.as_ptr().write(ContextHeader {
        magic: Cell::new(CONTEXT_MAGIC),
        on_stack: Cell::new(false),
        yielded: Cell::new(0),
        result: Cell::new(0),
        entry,
        region,
        stack_high,
        stack_low,
        machine: MachineState {
            stack_ptr: Cell::new(Some(initial_stack_ptr)),
            initial_stack_ptr,
            parent_link: Cell::new(ptr::null_mut()),
        },
        param: ParamSlot(UnsafeCell::new([0; PARAM_SLOT_SIZE])),
    });

    Ok(header)
}

/// Root of every coroutine stack.
unsafe extern "C" fn coroutine_main(
    _arg: EncodedValue,
    parent_link: *mut StackPointer,
    obj: *mut NonNull<ContextHeader>,
) -> ! {
    let header = obj.read();
    header.as_ref().machine.parent_link.set(parent_link);

    let yielder = Yielder {
        header,
        marker: PhantomData,
    };
    let entry = header.as_ref().entry;

    // Unwinding must not reach the switch code.
    let code = match panic::catch_unwind(AssertUnwindSafe(|| entry(&yielder))) {
        Ok(code) => code,
        Err(_) => fatal(&Error::EntryPanicked),
    };

    arch::switch_and_reset(util::encode_code(code), parent_link)
}

/// The symmetric transfer: resumes the coroutine when called from outside its
/// stack, yields back to the resumer when called from inside.
unsafe fn transfer_raw(header: NonNull<ContextHeader>) -> i32 {
    let ctx = validate(header);
    if ctx.on_stack.get() {
        yield_raw(header, ctx)
    } else {
        resume_raw(header, ctx)
    }
}

unsafe fn resume_raw(header: NonNull<ContextHeader>, ctx: &ContextHeader) -> i32 {
    let stack_ptr = match ctx.machine.stack_ptr.get() {
        Some(stack_ptr) => stack_ptr,
        None => {
            log::warn!(
                "transfer into completed coroutine {:p}, returning its result again",
                header
            );
            return ctx.result.get();
        }
    };

    log::trace!("resuming coroutine {:p}", header);
    ctx.machine.stack_ptr.set(None);
    ctx.on_stack.set(true);
    let (ret_val, stack_ptr) =
        arch::switch_and_link(util::encode_code(0), stack_ptr, ctx.stack_high);
    ctx.on_stack.set(false);
    ctx.machine.stack_ptr.set(stack_ptr);

    let code = util::decode_code(ret_val);
    if stack_ptr.is_none() {
        ctx.yielded.set(0);
        ctx.result.set(code);
        log::trace!("coroutine {:p} completed with {}", header, code);
    }
    code
}

unsafe fn yield_raw(header: NonNull<ContextHeader>, ctx: &ContextHeader) -> i32 {
    log::trace!("coroutine {:p} yielding", header);
    ctx.yielded.set(1);
    let ret_val = arch::switch_yield(util::encode_code(0), ctx.machine.parent_link.get());
    util::decode_code(ret_val)
}

unsafe fn destroy_raw(header: NonNull<ContextHeader>) -> Result<()> {
    let ctx = validate(header);
    if ctx.on_stack.get() {
        fatal(&Error::WrongStackDestroy);
    }

    let region = ptr::read(&ctx.region);

    // Invalidate before the memory goes away.
    ctx.magic.set(0);

    if let Err(e) = region.release() {
        fatal(&e);
    }
    log::debug!("destroyed coroutine context {:p}", header);
    Ok(())
}

unsafe fn param_ptr_raw<T>(header: NonNull<ContextHeader>) -> *mut T {
    assert!(
        mem::size_of::<T>() <= PARAM_SLOT_SIZE,
        "type is too big for the parameter slot"
    );
    assert!(
        mem::align_of::<T>() <= PARAM_SLOT_ALIGN,
        "type is over-aligned for the parameter slot"
    );
    validate(header).param.0.get().cast()
}

/// An owned coroutine: a guarded stack, the entry function that runs on it and
/// the bookkeeping needed to switch in and out.
///
/// Dropping a `Context` destroys it. A context that is suspended in the middle
/// of its entry function can be dropped; whatever is on its stack is discarded
/// without running destructors.
pub struct Context {
    header: NonNull<ContextHeader>,

    // Contexts must be !Send and !Sync.
    /// ```compile_fail
    /// fn send<T: Send>() {}
    /// send::<cocontext::Context>();
    /// ```
    marker: PhantomData<*mut ()>,
}

impl Context {
    /// Creates a context for `entry` with the default stack size, returning
    /// errors instead of taking the fatal path.
    pub fn new(entry: EntryFn) -> Result<Self> {
        Self::create(Some(entry), None, false)
    }

    /// Allocates a guarded stack and initializes a context over it.
    ///
    /// The stack gets at least `stack_size` bytes and never less than
    /// [`DEFAULT_STACK_SIZE`]; use [`Context::stack_size`] to see what was
    /// actually granted. With `hardfail` set, any error is reported through the
    /// fatal path instead of being returned.
    pub fn create(entry: Option<EntryFn>, stack_size: Option<usize>, hardfail: bool) -> Result<Self> {
        match unsafe { create_raw(entry, stack_size) } {
            Ok(header) => {
                let ctx = Self {
                    header,
                    marker: PhantomData,
                };
                log::debug!(
                    "created coroutine context {:p} with {} usable stack bytes",
                    header,
                    ctx.stack_size()
                );
                Ok(ctx)
            }
            Err(e) if hardfail => fatal(&e),
            Err(e) => Err(e),
        }
    }

    #[inline]
    fn header(&self) -> &ContextHeader {
        unsafe { validate(self.header) }
    }

    /// Transfers control into the coroutine.
    ///
    /// The first call starts the entry function, later calls continue after
    /// the point where it last yielded. Returns `0` when the coroutine yields
    /// and the entry function's return value when it completes. Once
    /// completed, further calls return that value again without running
    /// anything.
    pub fn transfer(&mut self) -> i32 {
        unsafe { transfer_raw(self.header) }
    }

    /// Alias of [`Context::transfer`].
    #[inline]
    pub fn resume(&mut self) -> i32 {
        self.transfer()
    }

    /// Returns `true` unless the coroutine is suspended mid-body.
    ///
    /// This is also `true` for a context that has never been transferred
    /// into, so check it after a transfer rather than before the first one:
    ///
    /// ```
    /// use cocontext::{Context, Yielder};
    ///
    /// fn body(y: &Yielder) -> i32 {
    ///     y.suspend();
    ///     7
    /// }
    ///
    /// let mut ctx = Context::new(body).unwrap();
    /// assert!(ctx.has_ended());
    /// let mut ret;
    /// loop {
    ///     ret = ctx.transfer();
    ///     if ctx.has_ended() {
    ///         break;
    ///     }
    /// }
    /// assert_eq!(ret, 7);
    /// ```
    pub fn has_ended(&self) -> bool {
        self.header().yielded.get() == 0
    }

    /// Returns the lifecycle state of the coroutine.
    ///
    /// Unlike [`Context::has_ended`] this tells a fresh context apart from a
    /// completed one.
    pub fn state(&self) -> State {
        let machine = &self.header().machine;
        match machine.stack_ptr.get() {
            None => State::Completed,
            Some(sp) if sp == machine.initial_stack_ptr => State::Created,
            Some(_) => State::Suspended,
        }
    }

    /// Returns whether the coroutine has been transferred into at least once.
    pub fn started(&self) -> bool {
        self.state() != State::Created
    }

    /// Usable stack size in bytes: the whole region minus its guard page.
    pub fn stack_size(&self) -> usize {
        self.header().region.usable_len()
    }

    /// Returns the `(low, high)` bounds of the usable stack.
    pub fn stack_bounds(&self) -> (StackPointer, StackPointer) {
        let ctx = self.header();
        (ctx.stack_low, ctx.stack_high)
    }

    /// Raw address of the parameter slot.
    ///
    /// The slot holds [`PARAM_SLOT_SIZE`] bytes, starts zeroed and is never
    /// interpreted by the transfer code.
    pub fn param_slot(&self) -> *mut u8 {
        self.header().param.0.get().cast()
    }

    /// Typed pointer to the parameter slot.
    ///
    /// # Panics
    ///
    /// Panics if `T` does not fit in the slot or needs more than
    /// [`PARAM_SLOT_ALIGN`] alignment.
    pub fn param_ptr<T>(&self) -> *mut T {
        unsafe { param_ptr_raw(self.header) }
    }

    /// Releases the stack and metadata of this context.
    ///
    /// Failing to unmap the region takes the fatal path, so this only ever
    /// returns `Ok`.
    pub fn destroy(self) -> Result<()> {
        let header = self.header;
        mem::forget(self);
        unsafe { destroy_raw(header) }
    }

    /// Turns the context into an opaque pointer, e.g. to pass it through
    /// foreign code. Use [`Context::from_raw`] to get it back.
    pub fn into_raw(self) -> *mut c_void {
        let header = self.header;
        mem::forget(self);
        header.as_ptr().cast()
    }

    /// Rebuilds a context from a pointer returned by [`Context::into_raw`].
    ///
    /// A pointer whose validity marker has been cleared or overwritten takes
    /// the fatal path on first use.
    ///
    /// # Safety
    ///
    /// `raw` must come from [`Context::into_raw`] and must not have been
    /// turned back into a `Context` already.
    pub unsafe fn from_raw(raw: *mut c_void) -> Self {
        let header = NonNull::new(raw.cast()).unwrap_or_else(|| fatal(&Error::BadContext));
        validate(header);
        Self {
            header,
            marker: PhantomData,
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let _ = unsafe { destroy_raw(self.header) };
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("addr", &self.header)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

/// The running coroutine's view of its own context.
///
/// A `Yielder` is handed to the entry function and cannot outlive that call:
///
/// ```compile_fail
/// use std::cell::Cell;
/// use cocontext::Yielder;
///
/// thread_local! {
///     static KEPT: Cell<Option<&'static Yielder<'static>>> = Cell::new(None);
/// }
///
/// fn body(y: &Yielder<'_>) -> i32 {
///     KEPT.with(|kept| kept.set(Some(y)));
///     0
/// }
/// ```
pub struct Yielder<'a> {
    header: NonNull<ContextHeader>,
    marker: PhantomData<(&'a ContextHeader, *mut ())>,
}

impl Yielder<'_> {
    /// Transfers control back to whoever last resumed this coroutine.
    ///
    /// Returns once the coroutine is resumed again; the returned code is
    /// always `0`.
    pub fn transfer(&self) -> i32 {
        unsafe { transfer_raw(self.header) }
    }

    /// Alias of [`Yielder::transfer`].
    #[inline]
    pub fn suspend(&self) -> i32 {
        self.transfer()
    }

    /// Same as [`Context::has_ended`]. Once the coroutine has yielded this
    /// stays `false` for the rest of the entry function.
    pub fn has_ended(&self) -> bool {
        unsafe { validate(self.header) }.yielded.get() == 0
    }

    /// Raw address of the parameter slot, see [`Context::param_slot`].
    pub fn param_slot(&self) -> *mut u8 {
        unsafe { validate(self.header) }.param.0.get().cast()
    }

    /// Typed pointer to the parameter slot, see [`Context::param_ptr`].
    pub fn param_ptr<T>(&self) -> *mut T {
        unsafe { param_ptr_raw(self.header) }
    }

    /// Attempts to destroy the context from its own stack.
    ///
    /// While the entry function is running this always takes the fatal path
    /// with [`Error::WrongStackDestroy`].
    ///
    /// # Safety
    ///
    /// If the check ever passed, the memory backing this `Yielder` and the
    /// owning [`Context`] would be gone; neither may be used afterwards.
    pub unsafe fn destroy(&self) -> Result<()> {
        destroy_raw(self.header)
    }
}

impl fmt::Debug for Yielder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Yielder").field("addr", &self.header).finish()
    }
}
