//! Shadow-stack geometry.

use shade_engine::frames::{ExecFrame, FrameStack, FRAME_COUNT};

#[test]
fn one_page_of_frames() {
    assert_eq!(core::mem::size_of::<ExecFrame>(), 16);
    assert_eq!(FRAME_COUNT * core::mem::size_of::<ExecFrame>(), 4096);
}

#[test]
fn grows_downward_from_first() {
    let stack = FrameStack::new();
    let base = stack.base_addr();
    let first = stack.first_addr();
    assert_eq!(first, base + ((FRAME_COUNT as u64 - 1) * 16));
    assert!(first > base);
    // The sentinel slot starts zeroed, so the ret fast path cannot
    // match it against a real return address.
    // SAFETY: first_addr points at the last element of the live array.
    let sentinel = unsafe { *(first as *const ExecFrame) };
    assert_eq!(sentinel, ExecFrame::default());
}
