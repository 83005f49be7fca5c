//! Slow-path entry gates.
//!
//! Ordinary `extern "C"` functions called from emitted thunks, always
//! on the followed thread with its context saved by a prolog. They
//! resolve untranslated targets to blocks (`switch_block`), feed the
//! event sink, run callouts and probes, and drive the cooperative
//! unfollow protocol: any gate may return a guest address, which the
//! emitted tail turns into a native resume.

use std::sync::atomic::Ordering;

use shade_core::{CpuContext, Event, EventMask, GateKind};

use crate::backpatch;
use crate::block::{trust_decision, BlockFlags, ExecBlock, TransferSite, TrustDecision};
use crate::compile;
use crate::ctx::{state, CalloutRecord, CtxInner, ExecCtx};
use crate::follow;
use crate::EngineInner;

fn gate_kind(raw: u32) -> GateKind {
    match raw {
        0 => GateKind::CallImm,
        1 => GateKind::CallReg,
        2 => GateKind::CallMem,
        3 => GateKind::JmpImm,
        4 => GateKind::JmpReg,
        5 => GateKind::JmpMem,
        6 => GateKind::JmpCond,
        7 => GateKind::JmpContinuation,
        8 => GateKind::RetSlowPath,
        _ => GateKind::Sysenter,
    }
}

/// Look up or compile the block for `addr`, applying the
/// recycle/trust policy to existing mappings.
pub(crate) fn obtain_block(
    ctx: &ExecCtx,
    inner: &mut CtxInner,
    engine: &EngineInner,
    addr: u64,
) -> shade_core::Result<*mut ExecBlock> {
    if let Some(&block) = inner.blocks.get(&addr) {
        // SAFETY: block records live as long as the context.
        let decision = trust_decision(unsafe { &*block }, engine.trust_threshold());
        match decision {
            TrustDecision::Reuse => {
                unsafe { (*block).recycle_count += 1 };
                inner.stats.blocks_recycled += 1;
                return Ok(block);
            }
            TrustDecision::Recompile => {
                compile::recompile_block(ctx, inner, engine, block)?;
                return Ok(block);
            }
        }
    }
    compile::compile_block(ctx, inner, engine, addr)
}

/// Core dispatch: resolve `target` to somewhere execution can
/// continue. Returns a translated address, or a guest address when the
/// thread should leave (or stay out of) translated code.
pub(crate) fn switch_block(
    ctx: &ExecCtx,
    engine: &EngineInner,
    inner: &mut CtxInner,
    target: u64,
    site: *mut TransferSite,
) -> u64 {
    // Calls into the engine's own teardown entry points transition the
    // thread back to native execution.
    if target == follow::unfollow_me_raw_addr() {
        ctx.begin_unfollow();
        return target;
    }
    if target == follow::deactivate_raw_addr() {
        ctx.set_inert(true);
        ctx.activation_target.store(0, Ordering::Release);
        return target;
    }
    if target == engine.thread_exit_addr {
        ctx.begin_unfollow();
        return target;
    }

    if ctx.run_state() == state::UNFOLLOW_PENDING && ctx.pending_calls.load(Ordering::Acquire) == 0
    {
        ctx.finalize_unfollow(inner);
        follow::clear_current();
        return target;
    }

    // Already inside our cache (e.g. a return address produced by a
    // relocated call): resume right there.
    if ctx.contains_code(inner, target) {
        return target;
    }

    // Excluded code is never translated. A dynamically-resolved
    // transfer into an excluded range (typically a return into the
    // host image) resumes natively.
    if engine.is_excluded(target) {
        return target;
    }

    let activation = ctx.activation_target.load(Ordering::Acquire);

    match obtain_block(ctx, inner, engine, target) {
        Ok(block) => {
            if activation != 0 && target == activation {
                // SAFETY: code lock held.
                unsafe { (*block).flags |= BlockFlags::ACTIVATION_TARGET };
                ctx.activation_target.store(0, Ordering::Release);
                ctx.set_inert(false);
                log::debug!("thread {}: activated at {target:#x}", ctx.thread_id);
            } else if !site.is_null() {
                backpatch::maybe_backpatch(ctx, engine, inner, site, block, target);
            }
            unsafe { (*block).code_start }
        }
        Err(e) => {
            // Do not corrupt the cache over an unreadable target;
            // resuming natively is the documented last resort.
            log::warn!("dispatch to {target:#x} failed: {e}; resuming natively");
            target
        }
    }
}

/// Shared unfollow poll: 0 to continue in translated code, or a guest
/// address to resume natively.
fn maybe_unfollow(ctx: &ExecCtx, inner: &mut CtxInner, resume: u64) -> u64 {
    if ctx.run_state() == state::UNFOLLOW_PENDING && ctx.pending_calls.load(Ordering::Acquire) == 0
    {
        ctx.finalize_unfollow(inner);
        follow::clear_current();
        resume
    } else {
        0
    }
}

// -- Gates proper --

/// # Safety
/// Called from emitted code with a live context and site descriptor.
pub unsafe extern "C" fn shade_gate_dispatch(
    ctx: *const ExecCtx,
    target: u64,
    site: *mut TransferSite,
    kind: u32,
) -> u64 {
    let ctx = &*ctx;
    let kind = gate_kind(kind);
    let Some(engine) = ctx.engine.upgrade() else {
        return target;
    };
    if let Some(obs) = engine.observer() {
        obs.increment(kind);
        obs.increment_total();
    }
    let mut inner = ctx.inner.lock();
    inner.stats.slow_dispatches += 1;
    log::trace!("gate {kind:?}: {target:#x}");
    switch_block(ctx, &engine, &mut inner, target, site)
}

/// Three-tier return resolution, invoked by `stack_pop_and_go` when
/// the shadow-stack fast path missed. Rewrites the application stack
/// top in place; the emitted code then executes a native `ret`.
///
/// # Safety
/// As for [`shade_gate_dispatch`].
pub unsafe extern "C" fn shade_gate_ret_slow(ctx: *const ExecCtx, location: u64) {
    let ctx = &*ctx;
    let Some(engine) = ctx.engine.upgrade() else {
        return;
    };
    let slot = ctx.app_stack() as *mut u64;
    let target = *slot;

    let mut inner = ctx.inner.lock();

    // Slab-containment tier: returning into code we produced.
    if ctx.contains_code(&inner, target) {
        return;
    }

    if let Some(obs) = engine.observer() {
        obs.increment(GateKind::RetSlowPath);
        obs.increment_total();
    }
    inner.stats.slow_dispatches += 1;

    // The shadow stack is out of sync with the guest stack; drop it.
    ctx.clear_frames();

    log::trace!("ret slow path at {location:#x} -> {target:#x}");
    *slot = switch_block(ctx, &engine, &mut inner, target, core::ptr::null_mut());
}

/// # Safety
/// As for [`shade_gate_dispatch`].
pub unsafe extern "C" fn shade_gate_begin_call(ctx: *const ExecCtx, _ret_addr: u64) {
    let ctx = &*ctx;
    ctx.pending_calls.fetch_add(1, Ordering::AcqRel);
}

/// # Safety
/// As for [`shade_gate_dispatch`].
pub unsafe extern "C" fn shade_gate_end_call(ctx: *const ExecCtx, location: u64) -> u64 {
    let ctx = &*ctx;
    ctx.pending_calls.fetch_sub(1, Ordering::AcqRel);
    let mut inner = ctx.inner.lock();
    maybe_unfollow(ctx, &mut inner, location)
}

/// # Safety
/// As for [`shade_gate_dispatch`]; `cpu` points at the prolog frame.
pub unsafe extern "C" fn shade_gate_exec(
    ctx: *const ExecCtx,
    location: u64,
    cpu: *mut CpuContext,
) -> u64 {
    let ctx = &*ctx;
    let mut inner = ctx.inner.lock();
    if !ctx.is_inert() && inner.sink_mask.contains(EventMask::EXEC) {
        (*cpu).rip = location;
        let event = Event::Exec { location };
        inner.sink.process(&event, Some(&*cpu));
    }
    maybe_unfollow(ctx, &mut inner, location)
}

/// # Safety
/// As for [`shade_gate_exec`].
pub unsafe extern "C" fn shade_gate_block(
    ctx: *const ExecCtx,
    block: *mut ExecBlock,
    cpu: *mut CpuContext,
) -> u64 {
    let ctx = &*ctx;
    let start = (*block).real_start;
    let end = start + (*block).real_size as u64;
    let mut inner = ctx.inner.lock();
    if !ctx.is_inert() && inner.sink_mask.contains(EventMask::BLOCK) {
        (*cpu).rip = start;
        let event = Event::Block { start, end };
        inner.sink.process(&event, Some(&*cpu));
    }
    maybe_unfollow(ctx, &mut inner, start)
}

/// # Safety
/// As for [`shade_gate_exec`].
pub unsafe extern "C" fn shade_gate_call_event(
    ctx: *const ExecCtx,
    location: u64,
    target: u64,
    cpu: *mut CpuContext,
) -> u64 {
    let ctx = &*ctx;
    let mut inner = ctx.inner.lock();
    if !ctx.is_inert() && inner.sink_mask.contains(EventMask::CALL) {
        (*cpu).rip = location;
        let event = Event::Call {
            location,
            target,
            depth: inner.depth,
        };
        inner.sink.process(&event, Some(&*cpu));
    }
    inner.depth += 1;
    maybe_unfollow(ctx, &mut inner, location)
}

/// # Safety
/// As for [`shade_gate_exec`].
pub unsafe extern "C" fn shade_gate_ret_event(
    ctx: *const ExecCtx,
    location: u64,
    cpu: *mut CpuContext,
) -> u64 {
    let ctx = &*ctx;
    let mut inner = ctx.inner.lock();
    inner.depth = (inner.depth - 1).max(0);
    if !ctx.is_inert() && inner.sink_mask.contains(EventMask::RET) {
        (*cpu).rip = location;
        // The return target is still on the application stack.
        let target = *((*cpu).rsp as *const u64);
        let event = Event::Ret {
            location,
            target,
            depth: inner.depth,
        };
        inner.sink.process(&event, Some(&*cpu));
    }
    maybe_unfollow(ctx, &mut inner, location)
}

/// # Safety
/// As for [`shade_gate_exec`]; `record` lives in the context.
pub unsafe extern "C" fn shade_gate_callout(
    ctx: *const ExecCtx,
    record: *mut CalloutRecord,
    cpu: *mut CpuContext,
) {
    let ctx = &*ctx;
    ctx.pending_calls.fetch_add(1, Ordering::AcqRel);
    (*cpu).rip = (*record).guest_pc;
    ((*record).callback)(&mut *cpu);
    ctx.pending_calls.fetch_sub(1, Ordering::AcqRel);
}

/// # Safety
/// As for [`shade_gate_exec`].
pub unsafe extern "C" fn shade_gate_probes(
    ctx: *const ExecCtx,
    block: *mut ExecBlock,
    cpu: *mut CpuContext,
) {
    let ctx = &*ctx;
    let Some(engine) = ctx.engine.upgrade() else {
        return;
    };
    ctx.pending_calls.fetch_add(1, Ordering::AcqRel);
    let target = (*block).real_start;
    (*cpu).rip = target;
    engine.run_probes(target, &mut *cpu);
    ctx.pending_calls.fetch_sub(1, Ordering::AcqRel);
}

/// Invalidation landing: recompile the block and return where to
/// resume.
///
/// # Safety
/// As for [`shade_gate_dispatch`].
pub unsafe extern "C" fn shade_gate_recompile(ctx: *const ExecCtx, block: *mut ExecBlock) -> u64 {
    let ctx = &*ctx;
    let Some(engine) = ctx.engine.upgrade() else {
        return (*block).real_start;
    };
    let mut inner = ctx.inner.lock();
    match compile::recompile_block(ctx, &mut inner, &engine, block) {
        Ok(()) => (*block).code_start,
        Err(e) => {
            log::warn!(
                "recompile of {:#x} failed: {e}; resuming natively",
                (*block).real_start
            );
            (*block).real_start
        }
    }
}
