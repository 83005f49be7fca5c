//! shade: an x86-64 dynamic binary instrumentation engine.
//!
//! Given a thread and user-supplied transformation/observation hooks,
//! the engine transparently redirects that thread to execute out of a
//! private translated code cache while preserving observable behavior.
//! Translation is on demand, one basic block at a time; control
//! transfers are virtualized, direct edges are backpatched into direct
//! jumps, indirect edges go through per-site inline caches, and
//! returns ride a shadow return stack.
//!
//! The public surface is [`Shade`]; per-thread machinery lives in
//! [`ctx`], emission in [`helpers`]/[`virt`], and the slow-path C-ABI
//! entry points in [`gates`].

pub mod backpatch;
pub mod block;
pub mod compile;
pub mod ctx;
pub mod follow;
pub mod frames;
pub mod gates;
pub mod helpers;
pub mod os;
pub mod slab;
pub mod virt;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use shade_core::{
    Backpatch, CallDetails, CpuContext, Error, EventSink, MemoryRange, Observer, ProbeId, Result,
};

pub use compile::{BlockIterator, DefaultTransformer, FnTransformer, Transformer};
pub use ctx::CtxStats;
pub use follow::FollowArgs;

use ctx::{state, ExecCtx};

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Inline-cache entries per indirect site, clamped to `[2, 32]`.
    pub ic_entries: usize,
    /// Initial trust threshold (see `set_trust_threshold`).
    pub trust_threshold: i32,
    /// How long a torn-down context lingers before the collector
    /// assumes its thread has left translated code.
    pub teardown_grace: Duration,
    pub code_slab_size: usize,
    pub data_slab_size: usize,
    /// Scratch buffer used when recompiling in place.
    pub scratch_size: usize,
    /// Exclude the engine's own image so instrumented code can call
    /// into the public API natively.
    pub exclude_self: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ic_entries: 2,
            trust_threshold: 1,
            teardown_grace: Duration::from_millis(20),
            code_slab_size: 4 << 20,
            data_slab_size: 1 << 20,
            scratch_size: 128 << 10,
            exclude_self: true,
        }
    }
}

struct ProbeTable {
    next_id: u64,
    by_addr: HashMap<u64, Vec<(ProbeId, shade_core::probe::ProbeCallback)>>,
}

/// Shared engine state behind the public handle.
pub struct EngineInner {
    pub config: Config,
    /// Address inside our text section; slabs are allocated near it so
    /// emitted code reaches the gates with `call rel32`.
    pub anchor: u64,
    pub thread_exit_addr: u64,
    trust: AtomicI32,
    weak_self: Weak<EngineInner>,
    contexts: Mutex<Vec<Arc<ExecCtx>>>,
    excluded: RwLock<Vec<MemoryRange>>,
    probes: Mutex<ProbeTable>,
    observer: RwLock<Option<Arc<dyn Observer>>>,
}

impl EngineInner {
    fn arc(&self) -> Arc<EngineInner> {
        self.weak_self.upgrade().expect("engine already dropped")
    }

    pub(crate) fn trust_threshold(&self) -> i32 {
        self.trust.load(Ordering::Acquire)
    }

    pub(crate) fn is_excluded(&self, addr: u64) -> bool {
        self.excluded.read().iter().any(|r| r.contains(addr))
    }

    pub(crate) fn has_probes_at(&self, addr: u64) -> bool {
        self.probes.lock().by_addr.contains_key(&addr)
    }

    pub(crate) fn observer(&self) -> Option<Arc<dyn Observer>> {
        self.observer.read().clone()
    }

    fn ctx_for_thread(&self, tid: u64) -> Option<Arc<ExecCtx>> {
        self.contexts.lock().iter().find(|c| c.thread_id == tid).cloned()
    }

    /// Fire every probe registered for `target`, outside the probe
    /// lock so callbacks may add or remove probes.
    pub(crate) fn run_probes(&self, target: u64, cpu: &mut CpuContext) {
        let Some(mut list) = self.probes.lock().by_addr.remove(&target) else {
            return;
        };
        // SAFETY: cpu.rsp is the guest stack; its top is the return
        // address pushed by the intercepted call.
        let return_address = unsafe { *(cpu.rsp as *const u64) };
        let mut details = CallDetails {
            target,
            return_address,
            stack_pointer: cpu.rsp,
            cpu_context: cpu,
        };
        for (_, cb) in list.iter_mut() {
            cb(&mut details);
        }
        let mut table = self.probes.lock();
        let slot = table.by_addr.entry(target).or_default();
        list.extend(slot.drain(..));
        *slot = list;
    }

    // -- Follow paths --

    pub(crate) fn follow_current(
        &self,
        transformer: Box<dyn Transformer>,
        sink: Box<dyn EventSink>,
        ret_slot: *mut u64,
    ) -> Result<()> {
        let tid = os::gettid();
        if !follow::current_ctx_ptr().is_null() {
            return Err(Error::AlreadyFollowing(tid));
        }
        // SAFETY: ret_slot points at our caller's return-address slot,
        // provided by the asm shim.
        let pc = unsafe { *ret_slot };
        let code = self.follow_at(tid, transformer, sink, pc)?;
        unsafe { *ret_slot = code };
        Ok(())
    }

    /// Create and register a context for `tid` (the calling thread)
    /// and return the translated entry for `pc`.
    pub(crate) fn follow_at(
        &self,
        tid: u64,
        transformer: Box<dyn Transformer>,
        sink: Box<dyn EventSink>,
        pc: u64,
    ) -> Result<u64> {
        if self.ctx_for_thread(tid).is_some() {
            return Err(Error::AlreadyFollowing(tid));
        }
        let arc = self.arc();
        let ctx = ExecCtx::new(&arc, tid, transformer, sink)?;
        self.contexts.lock().push(ctx.clone());
        follow::set_current(Arc::as_ptr(&ctx));

        let compiled = {
            let mut inner = ctx.inner.lock();
            compile::compile_block(&ctx, &mut inner, self, pc)
        };
        match compiled {
            // SAFETY: block just compiled under the code lock.
            Ok(block) => Ok(unsafe { (*block).code_start }),
            Err(e) => {
                follow::clear_current();
                self.contexts.lock().retain(|c| c.thread_id != tid);
                Err(e)
            }
        }
    }

    pub(crate) fn unfollow_current(&self) {
        let p = follow::current_ctx_ptr();
        if p.is_null() {
            return;
        }
        // SAFETY: the TLS pointer is cleared before its context is
        // collected.
        let ctx = unsafe { &*p };
        ctx.begin_unfollow();
        if ctx.pending_calls.load(Ordering::Acquire) == 0 {
            let mut inner = ctx.inner.lock();
            ctx.finalize_unfollow(&mut inner);
            follow::clear_current();
        }
    }

    pub(crate) fn deactivate_current(&self) {
        let p = follow::current_ctx_ptr();
        if p.is_null() {
            return;
        }
        let ctx = unsafe { &*p };
        ctx.set_inert(true);
        ctx.activation_target.store(0, Ordering::Release);
    }

    pub(crate) fn activate_current(&self, target: u64, ret_slot: *mut u64) -> Result<()> {
        let p = follow::current_ctx_ptr();
        if p.is_null() {
            return Err(Error::NotFollowing);
        }
        let ctx = unsafe { &*p };
        ctx.activation_target.store(target, Ordering::Release);
        // Re-enter the cache so the activation target can be observed.
        let mut inner = ctx.inner.lock();
        let pc = unsafe { *ret_slot };
        let block = gates::obtain_block(ctx, &mut inner, self, pc)?;
        unsafe { *ret_slot = (*block).code_start };
        Ok(())
    }

    // -- Invalidation --

    fn invalidate_ctx(&self, ctx: &ExecCtx, addr: u64) {
        let me = os::gettid();
        let mut inner = ctx.inner.lock();
        let Some(&block) = inner.blocks.get(&addr) else {
            return;
        };

        backpatch::unlink_edges(&mut inner, addr);

        if ctx.thread_id == me {
            // Executing thread is here, inside engine code: rewriting
            // the block head is race-free. The stub is a call to the
            // invalidator helper followed by the block pointer it
            // reads through its return address.
            // SAFETY: block and slabs belong to this context; code
            // lock held.
            unsafe {
                let slab = &inner.slabs[(*block).slab_index as usize];
                let inv = slab.helpers.invalidator;
                let rwx = slab.mem.rwx;
                let head = (*block).code_start;
                let _ = slab::thaw(head, 16, rwx);
                let mut w = shade_backend::writer::CodeWriter::new(head as *mut u8, 16);
                w.emit_call_near(inv);
                w.emit_u64(block as u64);
                let _ = slab::freeze(head, 16, rwx);
            }
        } else {
            // Another thread may be running the block right now; the
            // safe moves are dropping the mapping and unlinking the
            // edges above, which were single atomic stores. The stale
            // body runs at most to its next dispatch.
            inner.blocks.remove(&addr);
        }
        log::debug!("invalidated block {addr:#x} in thread {}", ctx.thread_id);
    }
}

/// The engine handle.
///
/// Construction is cheap; each followed thread gets its own context,
/// code cache and slab chain on first follow.
pub struct Shade {
    pub(crate) inner: Arc<EngineInner>,
}

impl Clone for Shade {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Shade {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Effective configuration (after clamping).
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn with_config(mut config: Config) -> Self {
        config.ic_entries = config.ic_entries.clamp(2, 32);
        let anchor = gates::shade_gate_dispatch as usize as u64;
        let trust = config.trust_threshold;
        let exclude_self = config.exclude_self;
        let inner = Arc::new_cyclic(|weak| EngineInner {
            config,
            anchor,
            thread_exit_addr: libc::pthread_exit as usize as u64,
            trust: AtomicI32::new(trust),
            weak_self: weak.clone(),
            contexts: Mutex::new(Vec::new()),
            excluded: RwLock::new(Vec::new()),
            probes: Mutex::new(ProbeTable {
                next_id: 1,
                by_addr: HashMap::new(),
            }),
            observer: RwLock::new(None),
        });
        if exclude_self {
            if let Some(range) = os::own_image_range(anchor) {
                inner.excluded.write().push(range);
            }
        }
        Shade { inner }
    }

    // -- Following --

    /// Begin following the calling thread: when this returns, the
    /// caller is executing out of the translated cache.
    ///
    /// # Safety
    /// Redirects the caller's return address into generated code. The
    /// calling code (and everything it runs until `unfollow_me`) must
    /// be decodable by the engine.
    pub unsafe fn follow_me(&self, transformer: Box<dyn Transformer>, sink: Box<dyn EventSink>) {
        let args = Box::into_raw(FollowArgs::new(transformer, sink));
        follow::shade_follow_me_raw(self as *const Shade, args);
    }

    /// Stop following the calling thread. Safe to call from
    /// instrumented code: the dispatcher recognizes the entry point
    /// and transitions out of translated execution first.
    pub fn unfollow_me(&self) {
        // SAFETY: plain state transition on our own engine.
        unsafe { follow::shade_unfollow_me_raw(self as *const Shade) };
    }

    pub fn is_following_me(&self) -> bool {
        !follow::current_ctx_ptr().is_null()
    }

    /// Follow another thread of this process (best-effort, signal
    /// based).
    pub fn follow(
        &self,
        tid: u64,
        transformer: Box<dyn Transformer>,
        sink: Box<dyn EventSink>,
    ) -> Result<()> {
        os::request_follow(self.inner.arc(), tid, transformer, sink)
    }

    /// Request that `tid` stop being followed; takes effect at its
    /// next event site or control transfer.
    pub fn unfollow(&self, tid: u64) -> Result<()> {
        let ctx = self.inner.ctx_for_thread(tid).ok_or(Error::NotFollowing)?;
        ctx.begin_unfollow();
        Ok(())
    }

    // -- Activation --

    /// Arm instrumentation to engage when execution reaches `target`.
    ///
    /// # Safety
    /// Re-enters the translated cache via the caller's return address,
    /// with the same contract as [`Shade::follow_me`].
    pub unsafe fn activate(&self, target: u64) {
        follow::shade_activate_raw(self as *const Shade, target);
    }

    /// Make instrumentation inert for the calling thread without
    /// leaving the cache.
    pub fn deactivate(&self) {
        // SAFETY: plain state transition on our own engine.
        unsafe { follow::shade_deactivate_raw(self as *const Shade) };
    }

    // -- Policy --

    /// Exclude a guest range: calls into it run natively and re-enter
    /// translation on return.
    pub fn exclude(&self, range: MemoryRange) {
        self.inner.excluded.write().push(range);
    }

    pub fn set_trust_threshold(&self, threshold: i32) {
        self.inner.trust.store(threshold, Ordering::Release);
    }

    pub fn get_trust_threshold(&self) -> i32 {
        self.inner.trust_threshold()
    }

    pub fn set_observer(&self, observer: Arc<dyn Observer>) {
        *self.inner.observer.write() = Some(observer);
    }

    // -- Invalidation & prefetch --

    /// Invalidate the translation of the block containing `addr` in
    /// every live context.
    pub fn invalidate(&self, addr: u64) {
        let ctxs = self.inner.contexts.lock().clone();
        for ctx in ctxs {
            self.inner.invalidate_ctx(&ctx, addr);
        }
    }

    pub fn invalidate_for_thread(&self, tid: u64, addr: u64) -> Result<()> {
        let ctx = self.inner.ctx_for_thread(tid).ok_or(Error::NotFollowing)?;
        self.inner.invalidate_ctx(&ctx, addr);
        Ok(())
    }

    /// Compile (if needed) the block at `addr` in the calling thread's
    /// context and pre-set its recycle count, e.g. to seed a forked
    /// child's cache.
    pub fn prefetch(&self, addr: u64, recycle_count: u32) -> Result<()> {
        let p = follow::current_ctx_ptr();
        if p.is_null() {
            return Err(Error::NotFollowing);
        }
        // SAFETY: TLS pointer is valid while following.
        let ctx = unsafe { &*p };
        let mut inner = ctx.inner.lock();
        let block = gates::obtain_block(ctx, &mut inner, &self.inner, addr)?;
        unsafe { (*block).recycle_count = recycle_count };
        Ok(())
    }

    /// Replay a backpatch descriptor captured by an observer.
    pub fn prefetch_backpatch(&self, descriptor: &Backpatch) -> Result<()> {
        let p = follow::current_ctx_ptr();
        if p.is_null() {
            return Err(Error::NotFollowing);
        }
        let ctx = unsafe { &*p };
        let mut inner = ctx.inner.lock();
        backpatch::apply_prefetch(ctx, &mut inner, &self.inner, descriptor)
    }

    // -- Probes --

    pub fn add_call_probe(
        &self,
        addr: u64,
        callback: shade_core::probe::ProbeCallback,
    ) -> ProbeId {
        let id = {
            let mut table = self.inner.probes.lock();
            let id = ProbeId(table.next_id);
            table.next_id += 1;
            table.by_addr.entry(addr).or_default().push((id, callback));
            id
        };
        // Existing translations predate the probe; force recompiles.
        self.invalidate(addr);
        id
    }

    pub fn remove_call_probe(&self, id: ProbeId) {
        let addr = {
            let mut table = self.inner.probes.lock();
            let mut found = None;
            table.by_addr.retain(|&addr, list| {
                let before = list.len();
                list.retain(|(pid, _)| *pid != id);
                if list.len() != before {
                    found = Some(addr);
                }
                !list.is_empty()
            });
            found
        };
        if let Some(addr) = addr {
            self.invalidate(addr);
        }
    }

    // -- Maintenance --

    /// Flush every context's event sink.
    pub fn flush(&self) {
        let ctxs = self.inner.contexts.lock().clone();
        for ctx in ctxs {
            ctx.inner.lock().sink.flush();
        }
    }

    /// Unfollow every thread, then collect until quiescent.
    pub fn stop(&self) {
        {
            let ctxs = self.inner.contexts.lock().clone();
            for ctx in ctxs {
                ctx.begin_unfollow();
            }
        }
        for _ in 0..200 {
            let pending = self.garbage_collect();
            if !pending && self.inner.contexts.lock().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Sweep destroyed contexts. Returns true while any context is
    /// still pending destruction.
    pub fn garbage_collect(&self) -> bool {
        let me = os::gettid();
        let grace = self.inner.config.teardown_grace;
        let mut ctxs = self.inner.contexts.lock();
        let mut pending = false;
        ctxs.retain(|ctx| {
            if ctx.run_state() != state::DESTROY_PENDING {
                // A vanished thread is reaped silently whatever state
                // its context was left in.
                if !os::thread_alive(ctx.thread_id) {
                    log::debug!("thread {} vanished; collecting context", ctx.thread_id);
                    return false;
                }
                return true;
            }
            let stamp = *ctx.destroy_at.lock();
            let elapsed_out = stamp.map(|t| t.elapsed() >= grace).unwrap_or(true);
            let collect =
                ctx.thread_id == me || elapsed_out || !os::thread_alive(ctx.thread_id);
            if collect {
                log::debug!("collected context of thread {}", ctx.thread_id);
                false
            } else {
                pending = true;
                true
            }
        });
        pending
    }

    /// Counters for a followed thread's context.
    pub fn stats(&self, tid: u64) -> Option<CtxStats> {
        let ctx = self.inner.ctx_for_thread(tid)?;
        let stats = ctx.inner.lock().stats;
        Some(stats)
    }

    /// Shadow-stack depth of a followed thread, for diagnostics.
    pub fn shadow_depth(&self, tid: u64) -> Option<usize> {
        Some(self.inner.ctx_for_thread(tid)?.shadow_depth())
    }
}

impl Default for Shade {
    fn default() -> Self {
        Self::new()
    }
}
