use std::env;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Output};

use crate::FATAL_EXIT_CODE;

const CHILD_ENV: &str = "COCONTEXT_CHILD_TEST";

/// Name of a test function as libtest knows it, from its `module_path!()`.
fn test_name(module_path: &str, func: &str) -> String {
    let module = module_path.split_once("::").map_or("", |(_, rest)| rest);
    format!("{}::{}", module, func)
}

/// Runs `body` in a fresh copy of the test binary restricted to this test.
///
/// Inside the child `body` is executed and `None` is returned; `body` is
/// expected to kill the process. In the parent the child's output is
/// returned once it has exited.
fn run_in_child(name: &str, body: impl FnOnce()) -> Option<Output> {
    if env::var(CHILD_ENV).as_deref() == Ok(name) {
        body();
        return None;
    }

    let output = Command::new(env::current_exe().unwrap())
        .args([name, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, name)
        .env("RUST_BACKTRACE", "0")
        .output()
        .unwrap();
    Some(output)
}

/// Asserts that the child went through the fatal path with `message`.
fn assert_fatal(output: &Output, message: &str) {
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(
        output.status.code(),
        Some(FATAL_EXIT_CODE),
        "unexpected exit status {:?}, stderr:\n{}",
        output.status,
        stderr
    );
    assert!(
        stderr.contains(message),
        "expected {:?} in stderr:\n{}",
        message,
        stderr
    );
}

/// Asserts that the child was killed by a memory access fault.
fn assert_fault(output: &Output) {
    let signal = output.status.signal();
    assert!(
        signal == Some(libc::SIGSEGV) || signal == Some(libc::SIGBUS),
        "expected a memory fault, got {:?}, stderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
}

macro_rules! child_test {
    ($(#[$attr:meta])* fn $name:ident() $body:block => $check:expr) => {
        $(#[$attr])*
        #[test]
        fn $name() {
            let name = crate::tests::test_name(module_path!(), stringify!($name));
            if let Some(output) = crate::tests::run_in_child(&name, || $body) {
                let check: fn(&std::process::Output) = $check;
                check(&output);
            }
        }
    };
}

mod fatal;
mod stack;
