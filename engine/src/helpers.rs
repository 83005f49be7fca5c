//! Per-slab emitted helpers.
//!
//! Each code slab starts with a block of communication cells followed
//! by the helper bodies: three prolog/epilog pairs, the shadow-frame
//! push, the three-tier return handler and the invalidator. Helpers
//! are entered with `call rel32`, immediately pop their return address
//! into a slab-local cell, and finish with an indirect jump through
//! that cell, so the byte after the call site is the continuation.
//!
//! Every excursion is bracketed by a 128-byte stack displacement at
//! the call site to stay clear of the System V red zone.

use shade_backend::regs::{Reg, MINIMAL_SAVED};
use shade_backend::writer::{ArithOp, Cc, CodeWriter};
use shade_core::Result;

use crate::ctx::{ExecCtx, HOT_CURRENT_FRAME, HOT_FRAMES_BASE};
use crate::gates;
use crate::slab::{freeze, CodeSlab};

/// Addresses of the helpers emitted into one code slab.
#[derive(Debug, Clone, Copy, Default)]
pub struct HelperSet {
    pub ic_prolog: u64,
    pub ic_epilog: u64,
    pub min_prolog: u64,
    pub min_epilog: u64,
    pub full_prolog: u64,
    pub full_epilog: u64,
    pub frame_push: u64,
    pub stack_pop_and_go: u64,
    pub invalidator: u64,
}

/// Cell indices within the slab prelude.
const CELL_SCRATCH: u64 = 0;
const CELL_RESUME: u64 = 1;
const CELL_MP_RET: u64 = 2;
const CELL_ME_RET: u64 = 3;
const CELL_FP_RET: u64 = 4;
const CELL_FE_RET: u64 = 5;
const CELL_ICP_RET: u64 = 6;
const CELL_ICE_RET: u64 = 7;
const CELL_FPU_RET: u64 = 8;
const CELL_SPG_SITE: u64 = 9;
const CELL_INV_SITE: u64 = 10;
const CELL_COUNT: u64 = 16;

/// fxsave64 area.
const FXSAVE_SIZE: i32 = 512;
/// Upper halves of ymm0-ymm15.
const YMM_HI_SIZE: i32 = 256;

/// Emit the helpers at the head of a fresh slab. The communication
/// cells sit in the slab's companion RW page.
pub fn emit_slab_prelude(slab: &mut CodeSlab, ctx: &ExecCtx) -> Result<()> {
    let avx2 = std::arch::is_x86_feature_detected!("avx2");
    let base = slab.cursor_ptr();
    let cap = slab.remaining();

    // SAFETY: fresh slab memory, mapped writable (RWX or pre-freeze).
    let mut w = unsafe { CodeWriter::new(base, cap) };

    let cells = slab.cells.base() as u64;
    debug_assert!(slab.cells.size() >= CELL_COUNT as usize * 8);
    let cell = |i: u64| cells + i * 8;

    slab.scratch_cell = cell(CELL_SCRATCH);
    slab.resume_cell = cell(CELL_RESUME);

    let mut set = HelperSet::default();

    set.min_prolog = w.pc();
    emit_min_prolog(&mut w, ctx, cell(CELL_MP_RET), avx2);
    set.min_epilog = w.pc();
    emit_min_epilog(&mut w, cell(CELL_ME_RET), avx2);

    set.full_prolog = w.pc();
    emit_full_prolog(&mut w, ctx, cell(CELL_FP_RET), avx2);
    set.full_epilog = w.pc();
    emit_full_epilog(&mut w, cell(CELL_FE_RET), avx2);

    set.ic_prolog = w.pc();
    emit_ic_prolog(&mut w, ctx, cell(CELL_ICP_RET));
    set.ic_epilog = w.pc();
    emit_ic_epilog(&mut w, cell(CELL_ICE_RET));

    set.frame_push = w.pc();
    emit_frame_push(&mut w, ctx, cell(CELL_FPU_RET));

    set.stack_pop_and_go = w.pc();
    emit_stack_pop_and_go(&mut w, ctx, cell(CELL_SPG_SITE), &set);

    set.invalidator = w.pc();
    emit_invalidator(&mut w, ctx, cell(CELL_INV_SITE), slab.resume_cell, &set);

    w.flush();
    let len = w.offset();
    slab.reserve(len).expect("slab prelude exceeds slab size");
    freeze(base as u64, len, slab.mem.rwx)?;
    slab.helpers = set;
    Ok(())
}

/// Minimal prolog: flags, caller-saved GPRs (plus rbx, repurposed as
/// the frame base), SSE state, optional YMM upper halves.
///
/// On entry (after the return-address pop) the stack holds the
/// red-zone-shifted application stack. On exit rsp points at the
/// 16-byte-aligned FP save area and rbx at the lowest saved GPR.
fn emit_min_prolog(w: &mut CodeWriter, ctx: &ExecCtx, ret_cell: u64, avx2: bool) {
    w.emit_pop_rip(ret_cell);
    w.emit_pushfq();
    for &reg in MINIMAL_SAVED {
        w.emit_push(reg);
    }
    w.emit_mov_rr(Reg::Rbx, Reg::Rsp);
    // Original application rsp: undo the pushes and the red-zone skip.
    let pushed = (MINIMAL_SAVED.len() as i32 + 1) * 8;
    w.emit_lea(Reg::Rax, Reg::Rsp, pushed + 128);
    w.emit_mov_ri(Reg::Rcx, ctx.app_stack_addr());
    w.emit_store(Reg::Rcx, 0, Reg::Rax);
    w.emit_arith_ri(ArithOp::And, Reg::Rsp, -16);
    w.emit_arith_ri(ArithOp::Sub, Reg::Rsp, FXSAVE_SIZE);
    w.emit_fxsave();
    if avx2 {
        w.emit_arith_ri(ArithOp::Sub, Reg::Rsp, YMM_HI_SIZE);
        for i in 0..16 {
            w.emit_vextracti128(i, i as i32 * 16);
        }
    }
    w.emit_jmp_rip(ret_cell);
}

fn emit_min_epilog(w: &mut CodeWriter, ret_cell: u64, avx2: bool) {
    w.emit_pop_rip(ret_cell);
    if avx2 {
        for i in 0..16 {
            w.emit_vinserti128(i, i as i32 * 16);
        }
        w.emit_arith_ri(ArithOp::Add, Reg::Rsp, YMM_HI_SIZE);
    }
    w.emit_fxrstor();
    w.emit_mov_rr(Reg::Rsp, Reg::Rbx);
    for &reg in MINIMAL_SAVED.iter().rev() {
        w.emit_pop(reg);
    }
    w.emit_popfq();
    w.emit_jmp_rip(ret_cell);
}

/// Full prolog: the complete `CpuContext` record. Push order yields
/// ascending memory `rip, r15..r8, rdi, rsi, rbp, rsp, rbx, rdx, rcx,
/// rax` with the flags qword above; rbx ends up pointing at the
/// record base (the rip slot).
fn emit_full_prolog(w: &mut CodeWriter, ctx: &ExecCtx, ret_cell: u64, avx2: bool) {
    w.emit_pop_rip(ret_cell);
    w.emit_pushfq();
    w.emit_push(Reg::Rax);
    w.emit_push(Reg::Rcx);
    w.emit_push(Reg::Rdx);
    // Four qwords pushed so far (incl. flags): recover the original
    // application rsp while rax is already saved.
    w.emit_lea(Reg::Rax, Reg::Rsp, 4 * 8 + 128);
    w.emit_push(Reg::Rbx);
    w.emit_push(Reg::Rax); // rsp slot
    w.emit_push(Reg::Rbp);
    w.emit_push(Reg::Rsi);
    w.emit_push(Reg::Rdi);
    for r in [
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ] {
        w.emit_push(r);
    }
    w.emit_bytes(&[0x6A, 0x00]); // push 0: the rip slot, filled by gates
    w.emit_mov_rr(Reg::Rbx, Reg::Rsp);
    w.emit_mov_ri(Reg::Rcx, ctx.app_stack_addr());
    w.emit_store(Reg::Rcx, 0, Reg::Rax);
    w.emit_arith_ri(ArithOp::And, Reg::Rsp, -16);
    w.emit_arith_ri(ArithOp::Sub, Reg::Rsp, FXSAVE_SIZE);
    w.emit_fxsave();
    if avx2 {
        w.emit_arith_ri(ArithOp::Sub, Reg::Rsp, YMM_HI_SIZE);
        for i in 0..16 {
            w.emit_vextracti128(i, i as i32 * 16);
        }
    }
    w.emit_jmp_rip(ret_cell);
}

fn emit_full_epilog(w: &mut CodeWriter, ret_cell: u64, avx2: bool) {
    w.emit_pop_rip(ret_cell);
    if avx2 {
        for i in 0..16 {
            w.emit_vinserti128(i, i as i32 * 16);
        }
        w.emit_arith_ri(ArithOp::Add, Reg::Rsp, YMM_HI_SIZE);
    }
    w.emit_fxrstor();
    w.emit_mov_rr(Reg::Rsp, Reg::Rbx);
    w.emit_arith_ri(ArithOp::Add, Reg::Rsp, 8); // discard rip slot
    for r in [
        Reg::R15,
        Reg::R14,
        Reg::R13,
        Reg::R12,
        Reg::R11,
        Reg::R10,
        Reg::R9,
        Reg::R8,
    ] {
        w.emit_pop(r);
    }
    w.emit_pop(Reg::Rdi);
    w.emit_pop(Reg::Rsi);
    w.emit_pop(Reg::Rbp);
    w.emit_arith_ri(ArithOp::Add, Reg::Rsp, 8); // rsp slot: implicit
    w.emit_pop(Reg::Rbx);
    w.emit_pop(Reg::Rdx);
    w.emit_pop(Reg::Rcx);
    w.emit_pop(Reg::Rax);
    w.emit_popfq();
    w.emit_jmp_rip(ret_cell);
}

/// IC prolog: flags + rax + rbx only. Enough for the inline-cache
/// compare chain and operand resolution; no FP or vector state.
fn emit_ic_prolog(w: &mut CodeWriter, ctx: &ExecCtx, ret_cell: u64) {
    w.emit_pop_rip(ret_cell);
    w.emit_pushfq();
    w.emit_push(Reg::Rax);
    w.emit_push(Reg::Rbx);
    w.emit_mov_rr(Reg::Rbx, Reg::Rsp);
    w.emit_lea(Reg::Rax, Reg::Rbx, 3 * 8 + 128);
    w.emit_push(Reg::Rax);
    w.emit_mov_ri(Reg::Rax, ctx.app_stack_addr());
    w.emit_pop_mem(Reg::Rax, 0);
    w.emit_jmp_rip(ret_cell);
}

fn emit_ic_epilog(w: &mut CodeWriter, ret_cell: u64) {
    w.emit_pop_rip(ret_cell);
    w.emit_mov_rr(Reg::Rsp, Reg::Rbx);
    w.emit_pop(Reg::Rbx);
    w.emit_pop(Reg::Rax);
    w.emit_popfq();
    w.emit_jmp_rip(ret_cell);
}

/// Shadow-frame push. Contract: rax = guest return address, rcx =
/// translated return address; everything else, flags included, is
/// preserved. A full stack silently drops the push.
fn emit_frame_push(w: &mut CodeWriter, ctx: &ExecCtx, ret_cell: u64) {
    w.emit_pop_rip(ret_cell);
    w.emit_pushfq();
    w.emit_push(Reg::Rbx);
    w.emit_push(Reg::Rdx);
    w.emit_mov_ri(Reg::Rbx, ctx.hot_addr());
    w.emit_load(Reg::Rdx, Reg::Rbx, HOT_CURRENT_FRAME as i32);
    w.emit_cmp_mem(Reg::Rdx, Reg::Rbx, HOT_FRAMES_BASE as i32);
    let skip = w.new_label();
    w.emit_jcc_label(Cc::Be, skip);
    w.emit_arith_ri(ArithOp::Sub, Reg::Rdx, 16);
    w.emit_store(Reg::Rdx, 0, Reg::Rax);
    w.emit_store(Reg::Rdx, 8, Reg::Rcx);
    w.emit_store(Reg::Rbx, HOT_CURRENT_FRAME as i32, Reg::Rdx);
    w.bind(skip);
    w.emit_pop(Reg::Rdx);
    w.emit_pop(Reg::Rbx);
    w.emit_popfq();
    w.emit_jmp_rip(ret_cell);
}

/// The three-tier return handler.
///
/// Sites emit `call stack_pop_and_go` followed by an inline qword
/// holding the guest address of the ret instruction, so on entry the
/// return address points at that datum and the application stack top
/// holds the guest return target.
///
/// Tier 1 compares the target against the newest shadow frame and,
/// on a match, swaps the stack top for the translated address and
/// executes a native `ret`. Everything else restores state and hands
/// the resolution to the slow-path gate, which also covers the
/// slab-containment tier.
fn emit_stack_pop_and_go(w: &mut CodeWriter, ctx: &ExecCtx, site_cell: u64, set: &HelperSet) {
    w.emit_pop_rip(site_cell);
    w.emit_pushfq();
    w.emit_push(Reg::Rax);
    w.emit_push(Reg::Rcx);
    w.emit_push(Reg::Rdx);
    // Stack: [rdx][rcx][rax][flags][guest target]
    w.emit_mov_ri(Reg::Rax, ctx.hot_addr());
    w.emit_load(Reg::Rcx, Reg::Rax, HOT_CURRENT_FRAME as i32);
    w.emit_load(Reg::Rdx, Reg::Rsp, 32);
    w.emit_cmp_mem(Reg::Rdx, Reg::Rcx, 0);
    let slow = w.new_label();
    w.emit_jcc_label(Cc::Ne, slow);
    w.emit_load(Reg::Rdx, Reg::Rcx, 8);
    w.emit_store(Reg::Rsp, 32, Reg::Rdx);
    w.emit_arith_ri(ArithOp::Add, Reg::Rcx, 16);
    w.emit_store(Reg::Rax, HOT_CURRENT_FRAME as i32, Reg::Rcx);
    w.emit_pop(Reg::Rdx);
    w.emit_pop(Reg::Rcx);
    w.emit_pop(Reg::Rax);
    w.emit_popfq();
    w.emit_ret();

    w.bind(slow);
    w.emit_pop(Reg::Rdx);
    w.emit_pop(Reg::Rcx);
    w.emit_pop(Reg::Rax);
    w.emit_popfq();
    w.emit_lea(Reg::Rsp, Reg::Rsp, -128);
    w.emit_call_near(set.min_prolog);
    w.emit_mov_ri(Reg::Rdi, ctx as *const ExecCtx as u64);
    w.emit_load_rip(Reg::Rsi, site_cell);
    w.emit_load(Reg::Rsi, Reg::Rsi, 0);
    w.emit_call_addr(gates::shade_gate_ret_slow as usize as u64);
    w.emit_call_near(set.min_epilog);
    w.emit_lea(Reg::Rsp, Reg::Rsp, 128);
    w.emit_ret();
}

/// Invalidation landing pad: an invalidated block's head is rewritten
/// to `call invalidator` followed by an inline pointer to the block
/// record; the gate recompiles and returns the replacement address.
fn emit_invalidator(
    w: &mut CodeWriter,
    ctx: &ExecCtx,
    site_cell: u64,
    resume_cell: u64,
    set: &HelperSet,
) {
    w.emit_pop_rip(site_cell);
    w.emit_lea(Reg::Rsp, Reg::Rsp, -128);
    w.emit_call_near(set.min_prolog);
    w.emit_mov_ri(Reg::Rdi, ctx as *const ExecCtx as u64);
    w.emit_load_rip(Reg::Rsi, site_cell);
    w.emit_load(Reg::Rsi, Reg::Rsi, 0);
    w.emit_call_addr(gates::shade_gate_recompile as usize as u64);
    w.emit_store_rip(resume_cell, Reg::Rax);
    w.emit_call_near(set.min_epilog);
    w.emit_lea(Reg::Rsp, Reg::Rsp, 128);
    w.emit_jmp_rip(resume_cell);
}
