//! Linux OS helpers: page readability, thread liveness, and the two
//! signal-driven mechanisms (remote follow and trap-flag single-step).

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, Once, OnceLock};
use std::time::Duration;

use shade_core::{cpu::RFLAGS_TF, Error, EventSink, MemoryRange, Result};

use crate::compile::Transformer;
use crate::follow;
use crate::gates;
use crate::slab::page_size;
use crate::EngineInner;

pub fn gettid() -> u64 {
    // SAFETY: gettid has no failure mode.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Whether the kernel still knows the thread.
pub fn thread_alive(tid: u64) -> bool {
    // SAFETY: tgkill with signal 0 only performs the existence check.
    unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid() as i64, tid as i64, 0) == 0 }
}

/// Verify the pages covering one instruction fetch at `addr` are
/// mapped. `mincore` reports unmapped ranges with ENOMEM.
pub fn ensure_readable(addr: u64) -> Result<()> {
    let page = page_size() as u64;
    let start = addr & !(page - 1);
    let end = (addr + 16 + page - 1) & !(page - 1);
    let mut resident = [0u8; 4];
    // SAFETY: start/end are page-aligned and the vector covers the
    // span (at most two pages for a 15-byte fetch + slack).
    let ret = unsafe {
        libc::mincore(
            start as *mut libc::c_void,
            (end - start) as usize,
            resident.as_mut_ptr() as *mut libc::c_uchar,
        )
    };
    if ret != 0 {
        return Err(Error::PageUnreadable { addr });
    }
    Ok(())
}

/// The mapping of our own image containing `anchor`, for the default
/// self-exclusion.
pub fn own_image_range(anchor: u64) -> Option<MemoryRange> {
    let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
    for line in maps.lines() {
        let range = line.split_whitespace().next()?;
        let (lo, hi) = range.split_once('-')?;
        let lo = u64::from_str_radix(lo, 16).ok()?;
        let hi = u64::from_str_radix(hi, 16).ok()?;
        if anchor >= lo && anchor < hi {
            return Some(MemoryRange::new(lo, (hi - lo) as usize));
        }
    }
    None
}

// -- Single-step fallback --

static TRAP_HANDLER: Once = Once::new();

/// Install the SIGTRAP handler backing the single-step fallback for
/// instructions outside the decoder's vocabulary.
pub fn arm_single_step() {
    TRAP_HANDLER.call_once(|| unsafe {
        let mut sa: libc::sigaction = core::mem::zeroed();
        sa.sa_sigaction = on_sigtrap as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(libc::SIGTRAP, &sa, core::ptr::null_mut()) != 0 {
            log::warn!("failed to install SIGTRAP handler");
        }
    });
}

/// Trap-flag single step completed: clear TF and re-enter translation
/// at the instruction the guest stopped at.
unsafe extern "C" fn on_sigtrap(_sig: i32, _info: *mut libc::siginfo_t, uctx: *mut libc::c_void) {
    let uc = &mut *(uctx as *mut libc::ucontext_t);
    let gregs = &mut uc.uc_mcontext.gregs;
    gregs[libc::REG_EFL as usize] &= !(RFLAGS_TF as i64);

    let ctx = follow::current_ctx_ptr();
    if ctx.is_null() {
        return;
    }
    let ctx = &*ctx;
    let Some(engine) = ctx.engine.upgrade() else {
        return;
    };
    let rip = gregs[libc::REG_RIP as usize] as u64;
    let mut inner = ctx.inner.lock();
    if let Ok(block) = gates::obtain_block(ctx, &mut inner, &engine, rip) {
        gregs[libc::REG_RIP as usize] = (*block).code_start as i64;
    }
}

// -- Remote follow --

struct PendingFollow {
    engine: Arc<EngineInner>,
    transformer: Box<dyn Transformer>,
    sink: Box<dyn EventSink>,
}

fn pending() -> &'static Mutex<HashMap<u64, PendingFollow>> {
    static PENDING: OnceLock<Mutex<HashMap<u64, PendingFollow>>> = OnceLock::new();
    PENDING.get_or_init(|| Mutex::new(HashMap::new()))
}

fn follow_signal() -> i32 {
    libc::SIGRTMIN() + 7
}

static FOLLOW_HANDLER: Once = Once::new();

fn install_follow_handler() {
    FOLLOW_HANDLER.call_once(|| unsafe {
        let mut sa: libc::sigaction = core::mem::zeroed();
        sa.sa_sigaction = on_follow_signal as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(follow_signal(), &sa, core::ptr::null_mut()) != 0 {
            log::warn!("failed to install remote-follow handler");
        }
    });
}

/// Interrupt `tid` and redirect it into the cache from its signal
/// frame. Best-effort: a thread parked in a blocking syscall picks the
/// redirection up when the syscall returns.
pub(crate) fn request_follow(
    engine: Arc<EngineInner>,
    tid: u64,
    transformer: Box<dyn Transformer>,
    sink: Box<dyn EventSink>,
) -> Result<()> {
    install_follow_handler();
    pending().lock().unwrap().insert(
        tid,
        PendingFollow {
            engine,
            transformer,
            sink,
        },
    );

    // SAFETY: plain tgkill.
    let ret =
        unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid() as i64, tid as i64, follow_signal()) };
    if ret != 0 {
        pending().lock().unwrap().remove(&tid);
        return Err(Error::ThreadVanished(tid));
    }

    for _ in 0..500 {
        if !pending().lock().unwrap().contains_key(&tid) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    pending().lock().unwrap().remove(&tid);
    Err(Error::Os(io::Error::new(
        io::ErrorKind::TimedOut,
        "target thread did not take the follow signal",
    )))
}

unsafe extern "C" fn on_follow_signal(
    _sig: i32,
    _info: *mut libc::siginfo_t,
    uctx: *mut libc::c_void,
) {
    let tid = gettid();
    let Some(p) = pending().lock().unwrap().remove(&tid) else {
        return;
    };
    let uc = &mut *(uctx as *mut libc::ucontext_t);
    let gregs = &mut uc.uc_mcontext.gregs;
    let rip = gregs[libc::REG_RIP as usize] as u64;

    match p.engine.follow_at(tid, p.transformer, p.sink, rip) {
        Ok(code) => gregs[libc::REG_RIP as usize] = code as i64,
        Err(e) => log::warn!("remote follow of thread {tid} failed: {e}"),
    }
}
