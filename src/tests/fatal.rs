use std::io::Write;

use super::{assert_fatal, assert_fault};
use crate::{
    panic_handler, set_panic_handler, Builder, Context, Error, PanicHandler, Yielder,
    MAX_STACK_SIZE, MIN_PANIC_STACK_SIZE,
};

fn returns_immediately(_: &Yielder) -> i32 {
    0
}

fn destroys_itself(y: &Yielder) -> i32 {
    let _ = unsafe { y.destroy() };
    0
}

fn panics(_: &Yielder) -> i32 {
    panic!("foobar");
}

#[inline(never)]
fn recurse(depth: usize) -> usize {
    let buf = [depth as u8; 512];
    std::hint::black_box(&buf);
    if depth == usize::MAX {
        return 0;
    }
    recurse(depth + 1) + buf[0] as usize
}

fn overflows(_: &Yielder) -> i32 {
    recurse(0) as i32
}

fn report_to_stderr(message: &str) {
    let _ = writeln!(std::io::stderr(), "handler saw: {}", message);
}

fn unwinding_handler(message: &str) {
    panic!("handler refusing to die: {}", message);
}

#[test]
fn replacing_panic_handler_returns_previous() {
    let original = set_panic_handler(Some(report_to_stderr));
    let expected = report_to_stderr as PanicHandler as usize;
    assert_eq!(panic_handler().map(|h| h as usize), Some(expected));
    let previous = set_panic_handler(original);
    assert_eq!(previous.map(|h| h as usize), Some(expected));
}

child_test! {
    fn corrupted_context_is_fatal() {
        let ctx = Context::new(returns_immediately).unwrap();
        let raw = ctx.into_raw();
        let ctx = unsafe { Context::from_raw(raw) };
        unsafe { raw.cast::<u32>().write(0) };
        ctx.has_ended();
    } => |output| assert_fatal(output, &Error::BadContext.to_string())
}

child_test! {
    fn corrupted_raw_handle_is_fatal() {
        let ctx = Context::new(returns_immediately).unwrap();
        let raw = ctx.into_raw();
        unsafe {
            raw.cast::<u32>().write(0xdead_beef);
            Context::from_raw(raw);
        }
    } => |output| assert_fatal(output, "coroutine context is not valid")
}

child_test! {
    fn self_destroy_is_fatal() {
        let mut ctx = Builder::new().stack_size(64 * 1024).create(destroys_itself).unwrap();
        ctx.transfer();
    } => |output| assert_fatal(output, "cannot destroy context in coroutine")
}

child_test! {
    fn hardfail_stack_too_large() {
        let _ = Context::create(Some(returns_immediately), Some(MAX_STACK_SIZE + 1), true);
    } => |output| assert_fatal(output, "is too large")
}

child_test! {
    fn hardfail_missing_entry() {
        let _ = Context::create(None, None, true);
    } => |output| assert_fatal(output, "invalid argument to coroutine function")
}

child_test! {
    fn entry_panic_is_fatal() {
        let mut ctx = Builder::new().stack_size(MIN_PANIC_STACK_SIZE).create(panics).unwrap();
        assert_eq!(ctx.stack_size(), MIN_PANIC_STACK_SIZE);
        ctx.transfer();
    } => |output| assert_fatal(output, "coroutine entry function panicked")
}

child_test! {
    fn entry_panic_on_largest_stack_is_fatal() {
        let mut ctx = Builder::new().stack_size(MAX_STACK_SIZE).create(panics).unwrap();
        ctx.transfer();
    } => |output| assert_fatal(output, "coroutine entry function panicked")
}

// Too little room for the unwinder: the guard page catches it.
child_test! {
    fn entry_panic_on_default_stack_faults() {
        let mut ctx = Context::new(panics).unwrap();
        ctx.transfer();
    } => |output| {
        assert_fault(output);
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(!stderr.contains("coroutine entry function panicked"), "{}", stderr);
    }
}

child_test! {
    fn panic_handler_is_called() {
        set_panic_handler(Some(report_to_stderr));
        let _ = Context::create(None, None, true);
    } => |output| {
        assert_fatal(output, "handler saw: invalid argument to coroutine function");
        // The default report still follows the handler.
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert_eq!(stderr.matches("invalid argument to coroutine function").count(), 2);
    }
}

child_test! {
    fn unwinding_panic_handler_still_exits() {
        set_panic_handler(Some(unwinding_handler));
        let _ = Context::create(None, None, true);
    } => |output| assert_fatal(output, "handler refusing to die")
}

child_test! {
    fn guard_page_write_faults() {
        let ctx = Context::new(returns_immediately).unwrap();
        let (low, _) = ctx.stack_bounds();
        unsafe { ((low.get() - 1) as *mut u8).write_volatile(1) };
    } => assert_fault
}

child_test! {
    fn stack_overflow_faults() {
        let mut ctx = Context::new(overflows).unwrap();
        ctx.transfer();
    } => assert_fault
}
