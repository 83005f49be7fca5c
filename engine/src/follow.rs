//! Follow/unfollow entry shims.
//!
//! `follow_me` has to redirect its own caller: the asm shim passes the
//! address of the return-address slot to the Rust worker, which
//! compiles a block for the return address and swaps the slot. When
//! the shim returns, the caller is executing out of the cache.
//!
//! `unfollow_me` and `deactivate` work by address: `switch_block`
//! recognizes calls to them and transitions the thread back to native
//! execution, where the functions then run as plain code.

use std::cell::Cell;

use shade_core::EventSink;

use crate::compile::Transformer;
use crate::ctx::ExecCtx;
use crate::Shade;

thread_local! {
    static CURRENT: Cell<*const ExecCtx> = const { Cell::new(core::ptr::null()) };
}

pub(crate) fn current_ctx_ptr() -> *const ExecCtx {
    CURRENT.with(|c| c.get())
}

pub(crate) fn set_current(ctx: *const ExecCtx) {
    CURRENT.with(|c| c.set(ctx));
}

pub(crate) fn clear_current() {
    CURRENT.with(|c| c.set(core::ptr::null()));
}

/// Boxed transformer + sink pair handed through the C-ABI shims.
pub struct FollowArgs {
    pub(crate) transformer: Box<dyn Transformer>,
    pub(crate) sink: Box<dyn EventSink>,
}

impl FollowArgs {
    pub fn new(transformer: Box<dyn Transformer>, sink: Box<dyn EventSink>) -> Box<Self> {
        Box::new(Self { transformer, sink })
    }
}

// The shims forward their arguments untouched and add the address of
// the return-address slot as the third argument.
core::arch::global_asm!(
    ".text",
    ".balign 16",
    ".globl shade_follow_me_raw",
    "shade_follow_me_raw:",
    "mov rdx, rsp",
    "jmp {do_follow}",
    ".balign 16",
    ".globl shade_activate_raw",
    "shade_activate_raw:",
    "mov rdx, rsp",
    "jmp {do_activate}",
    do_follow = sym shade_do_follow_me,
    do_activate = sym shade_do_activate,
);

extern "C" {
    /// Start following the calling thread. Consumes `args`.
    pub fn shade_follow_me_raw(shade: *const Shade, args: *mut FollowArgs);
    /// Re-arm instrumentation at `target` and re-enter the cache.
    pub fn shade_activate_raw(shade: *const Shade, target: u64);
}

pub(crate) fn unfollow_me_raw_addr() -> u64 {
    shade_unfollow_me_raw as usize as u64
}

pub(crate) fn deactivate_raw_addr() -> u64 {
    shade_deactivate_raw as usize as u64
}

/// # Safety
/// `shade` must be a live engine; `ret_slot` is the caller's
/// return-address slot, provided by the asm shim.
#[no_mangle]
unsafe extern "C" fn shade_do_follow_me(
    shade: *const Shade,
    args: *mut FollowArgs,
    ret_slot: *mut u64,
) {
    let shade = &*shade;
    let args = Box::from_raw(args);
    if let Err(e) = shade
        .inner
        .follow_current(args.transformer, args.sink, ret_slot)
    {
        // Leaving the slot untouched keeps the caller native.
        log::warn!("follow_me failed: {e}");
    }
}

/// Teardown entry. Recognized by address inside `switch_block`, so an
/// instrumented call to it transitions out of translated code first
/// and this body runs natively.
///
/// # Safety
/// `shade` must be a live engine.
#[no_mangle]
pub unsafe extern "C" fn shade_unfollow_me_raw(shade: *const Shade) {
    (*shade).inner.unfollow_current();
}

/// Deactivation entry, recognized by address like unfollow.
///
/// # Safety
/// `shade` must be a live engine.
#[no_mangle]
pub unsafe extern "C" fn shade_deactivate_raw(shade: *const Shade) {
    (*shade).inner.deactivate_current();
}

/// # Safety
/// As for [`shade_do_follow_me`].
#[no_mangle]
unsafe extern "C" fn shade_do_activate(shade: *const Shade, target: u64, ret_slot: *mut u64) {
    let shade = &*shade;
    if let Err(e) = shade.inner.activate_current(target, ret_slot) {
        log::warn!("activate failed: {e}");
    }
}
