use super::assert_fault;
use crate::stack::{page_size, GuardedRegion, MAX_STACK_SIZE};
use crate::Error;

#[test]
fn small_requests_get_one_page() {
    for requested in [0, 1, page_size() - 1, page_size()] {
        let region = GuardedRegion::reserve(requested).unwrap();
        assert_eq!(region.len(), 2 * page_size());
        assert_eq!(region.usable_len(), page_size());
        region.release().unwrap();
    }
}

#[test]
fn layout() {
    let region = GuardedRegion::reserve(3 * page_size() + 1).unwrap();
    let base = region.base().as_ptr() as usize;
    assert_eq!(base % page_size(), 0);
    assert_eq!(region.len(), 5 * page_size());
    assert_eq!(region.guard_range(), base..base + page_size());
    assert_eq!(region.usable_low().get(), base + page_size());
    assert_eq!(region.top().get(), base + region.len());
    region.release().unwrap();
}

#[test]
fn usable_pages_are_writable() {
    let region = GuardedRegion::reserve(2 * page_size()).unwrap();
    let low = region.usable_low().get() as *mut u8;
    let high = (region.top().get() - 1) as *mut u8;
    unsafe {
        low.write_volatile(0xaa);
        high.write_volatile(0x55);
        assert_eq!(low.read_volatile(), 0xaa);
        assert_eq!(high.read_volatile(), 0x55);
    }
    region.release().unwrap();
}

#[test]
fn oversized_request() {
    let err = GuardedRegion::reserve(MAX_STACK_SIZE + 1).unwrap_err();
    assert!(matches!(err, Error::StackTooLarge { .. }));
    let err = GuardedRegion::reserve(usize::MAX).unwrap_err();
    assert!(matches!(err, Error::StackTooLarge { requested: usize::MAX }));
}

child_test! {
    fn guard_page_read_faults() {
        let region = GuardedRegion::reserve(0).unwrap();
        let guard = region.guard_range().start as *const u8;
        unsafe { guard.read_volatile() };
    } => assert_fault
}
