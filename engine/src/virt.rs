//! Control-flow virtualizer.
//!
//! Per-opcode emission strategies replacing every guest control
//! transfer with a sequence that resolves the true target in
//! translated space and keeps the shadow frame stack and the hardware
//! stack coherent with what the guest expects. Direct sites get a
//! patchable jump head for static backpatching; indirect sites carry
//! an inline cache scanned before falling back to the dispatch gate.

use shade_backend::insn::{BranchTarget, Insn, InsnKind, MemOperand};
use shade_backend::regs::Reg;
use shade_backend::writer::{ArithOp, Cc};
use shade_core::GateKind;

use crate::block::{IcEntry, TransferSite};
use crate::compile::BlockIterator;
use crate::ctx::ExecCtx;
use crate::{gates, os};

impl BlockIterator<'_> {
    #[inline]
    fn ctx_addr(&self) -> u64 {
        self.ctx as *const ExecCtx as u64
    }

    /// Emit the current instruction, virtualizing control transfers.
    pub fn keep(&mut self) {
        if self.kept {
            return;
        }
        self.kept = true;
        let Some(insn) = self.current else { return };

        if self.mask.contains(shade_core::EventMask::EXEC) {
            self.emit_exec_event(insn.address);
        }

        match insn.kind {
            InsnKind::Other | InsnKind::Int3 => {
                shade_backend::reloc::relocate(&insn, &mut self.w);
            }
            InsnKind::Syscall => {
                // On x86-64 the kernel returns to the next instruction,
                // which is translated code here, so the instruction can
                // run in place.
                shade_backend::reloc::relocate(&insn, &mut self.w);
            }
            InsnKind::CallImm { target } => self.virtualize_call_imm(&insn, target),
            InsnKind::CallInd { target } => self.virtualize_indirect(&insn, target, true),
            InsnKind::JmpImm { target } => {
                self.emit_transfer_imm(GateKind::JmpImm, target);
                self.ended = true;
            }
            InsnKind::JmpInd { target } => self.virtualize_indirect(&insn, target, false),
            InsnKind::Jcc { cc, target } => self.virtualize_jcc(&insn, cc, target),
            InsnKind::Jcxz { target } => self.virtualize_jcxz(&insn, target),
            InsnKind::Ret { pop } => self.virtualize_ret(&insn, pop),
            InsnKind::Sysenter | InsnKind::Unsupported => {
                // `sysenter` is a 32-bit construct; on the 64-bit
                // target it lands in the single-step fallback with
                // everything else the decoder does not speak.
                self.emit_single_step(&insn);
            }
        }
    }

    // -- Block head --

    pub(crate) fn emit_block_head(&mut self) {
        // SAFETY: block record is alive for the context's lifetime.
        let start = unsafe { (*self.block).real_start };

        if self.engine.has_probes_at(start) {
            self.emit_probe_trampoline();
        }
        if self.mask.contains(shade_core::EventMask::BLOCK) {
            self.emit_block_event();
        }
    }

    fn emit_probe_trampoline(&mut self) {
        let ctx = self.ctx_addr();
        let block = self.block as u64;
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, -128);
        self.w.emit_call_near(self.helpers.full_prolog);
        self.w.emit_mov_ri(Reg::Rdi, ctx);
        self.w.emit_mov_ri(Reg::Rsi, block);
        self.w.emit_mov_rr(Reg::Rdx, Reg::Rbx);
        self.w
            .emit_call_addr(gates::shade_gate_probes as usize as u64);
        self.w.emit_call_near(self.helpers.full_epilog);
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, 128);
    }

    fn emit_block_event(&mut self) {
        let ctx = self.ctx_addr();
        let block = self.block as u64;
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, -128);
        self.w.emit_call_near(self.helpers.full_prolog);
        self.w.emit_mov_ri(Reg::Rdi, ctx);
        self.w.emit_mov_ri(Reg::Rsi, block);
        self.w.emit_mov_rr(Reg::Rdx, Reg::Rbx);
        self.w
            .emit_call_addr(gates::shade_gate_block as usize as u64);
        self.emit_event_check_tail(self.helpers.full_epilog);
    }

    // -- Events --

    fn emit_exec_event(&mut self, location: u64) {
        let ctx = self.ctx_addr();
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, -128);
        self.w.emit_call_near(self.helpers.full_prolog);
        self.w.emit_mov_ri(Reg::Rdi, ctx);
        self.w.emit_mov_ri(Reg::Rsi, location);
        self.w.emit_mov_rr(Reg::Rdx, Reg::Rbx);
        self.w.emit_call_addr(gates::shade_gate_exec as usize as u64);
        self.emit_event_check_tail(self.helpers.full_epilog);
    }

    fn emit_call_event(&mut self, location: u64, target: Option<u64>) {
        let ctx = self.ctx_addr();
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, -128);
        self.w.emit_call_near(self.helpers.full_prolog);
        self.w.emit_mov_ri(Reg::Rdi, ctx);
        self.w.emit_mov_ri(Reg::Rsi, location);
        match target {
            Some(t) => self.w.emit_mov_ri(Reg::Rdx, t),
            // Dynamic target, resolved into the scratch cell just
            // before this event fires.
            None => self.w.emit_load_rip(Reg::Rdx, self.scratch_cell),
        }
        self.w.emit_mov_rr(Reg::Rcx, Reg::Rbx);
        self.w
            .emit_call_addr(gates::shade_gate_call_event as usize as u64);
        self.emit_event_check_tail(self.helpers.full_epilog);
    }

    fn emit_ret_event(&mut self, location: u64) {
        let ctx = self.ctx_addr();
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, -128);
        self.w.emit_call_near(self.helpers.full_prolog);
        self.w.emit_mov_ri(Reg::Rdi, ctx);
        self.w.emit_mov_ri(Reg::Rsi, location);
        self.w.emit_mov_rr(Reg::Rdx, Reg::Rbx);
        self.w
            .emit_call_addr(gates::shade_gate_ret_event as usize as u64);
        self.emit_event_check_tail(self.helpers.full_epilog);
    }

    pub(crate) fn emit_callout(&mut self, record: u64) {
        let ctx = self.ctx_addr();
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, -128);
        self.w.emit_call_near(self.helpers.full_prolog);
        self.w.emit_mov_ri(Reg::Rdi, ctx);
        self.w.emit_mov_ri(Reg::Rsi, record);
        self.w.emit_mov_rr(Reg::Rdx, Reg::Rbx);
        self.w
            .emit_call_addr(gates::shade_gate_callout as usize as u64);
        self.w.emit_call_near(self.helpers.full_epilog);
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, 128);
    }

    /// Shared tail after an event gate: rax is either zero (carry on)
    /// or a guest address to resume natively, which doubles as the
    /// unfollow poll at every event site.
    fn emit_event_check_tail(&mut self, epilog: u64) {
        let bail = self.w.new_label();
        let done = self.w.new_label();
        self.w.emit_test_rr(Reg::Rax, Reg::Rax);
        self.w.emit_jcc_label(Cc::Ne, bail);
        self.w.emit_call_near(epilog);
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, 128);
        self.w.emit_jmp_label(done);
        self.w.bind(bail);
        self.w.emit_store_rip(self.resume_cell, Reg::Rax);
        self.w.emit_call_near(epilog);
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, 128);
        self.w.emit_jmp_rip(self.resume_cell);
        self.w.bind(done);
    }

    // -- Transfer sites --

    fn alloc_site(&mut self, kind: GateKind) -> *mut TransferSite {
        let site = self
            .ctx
            .alloc_site(self.inner, self.engine)
            .expect("transfer-site allocation failed");
        // SAFETY: freshly reserved data-slab memory.
        unsafe {
            site.write(TransferSite {
                kind,
                block: self.block,
                jmp_addr: 0,
                body_addr: 0,
                guest_target: 0,
                ic_data: 0,
                ic_count: 0,
            });
        }
        self.inner.sites.push(site);
        site
    }

    /// The slow-path transfer thunk for a statically-known target,
    /// headed by a patchable `jmp rel32` whose operand is 4-byte
    /// aligned. With a zero displacement the jump falls through into
    /// the thunk body; the backpatcher later points it straight at the
    /// resolved block (and unpatching restores the zero).
    pub(crate) fn emit_transfer_imm(&mut self, kind: GateKind, target: u64) -> *mut TransferSite {
        let site = self.alloc_site(kind);
        // SAFETY: site was just written; we own the slab memory.
        unsafe {
            (*site).guest_target = target;
        }
        let pad = (4 - ((self.w.pc() as usize + 1) & 3)) & 3;
        self.w.emit_nops(pad);
        let jmp_addr = self.w.pc();
        self.w.emit_u8(0xE9);
        self.w.emit_u32(0);
        let body_addr = self.w.pc();
        unsafe {
            (*site).jmp_addr = jmp_addr;
            (*site).body_addr = body_addr;
        }

        self.emit_dispatch_body(kind, site, Some(target));
        site
    }

    /// Slow-path thunk for a dynamic target already resolved into the
    /// slab scratch cell. Not statically patchable.
    fn emit_transfer_dyn(&mut self, kind: GateKind, site: *mut TransferSite) {
        // SAFETY: as in emit_transfer_imm.
        unsafe {
            (*site).body_addr = self.w.pc();
        }
        self.emit_dispatch_body(kind, site, None);
    }

    fn emit_dispatch_body(&mut self, kind: GateKind, site: *mut TransferSite, target: Option<u64>) {
        let ctx = self.ctx_addr();
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, -128);
        self.w.emit_call_near(self.helpers.min_prolog);
        self.w.emit_mov_ri(Reg::Rdi, ctx);
        match target {
            Some(t) => self.w.emit_mov_ri(Reg::Rsi, t),
            None => self.w.emit_load_rip(Reg::Rsi, self.scratch_cell),
        }
        self.w.emit_mov_ri(Reg::Rdx, site as u64);
        self.w.emit_mov_ri(Reg::Rcx, kind as u32 as u64);
        self.w
            .emit_call_addr(gates::shade_gate_dispatch as usize as u64);
        self.w.emit_store_rip(self.resume_cell, Reg::Rax);
        self.w.emit_call_near(self.helpers.min_epilog);
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, 128);
        self.w.emit_jmp_rip(self.resume_cell);
    }

    // -- Calls --

    fn virtualize_call_imm(&mut self, insn: &Insn, target: u64) {
        let ret_addr = insn.end();
        let excluded =
            self.engine.is_excluded(target) && self.ctx.activation_target.load(core::sync::atomic::Ordering::Acquire) == 0;

        if self.mask.contains(shade_core::EventMask::CALL) {
            self.emit_call_event(insn.address, Some(target));
        }

        if excluded {
            self.emit_excluded_call(target, ret_addr);
            return;
        }

        let cont = self.emit_shadow_push(ret_addr);
        self.w.emit_push_imm64(ret_addr);
        self.emit_transfer_imm(GateKind::CallImm, target);
        self.w.bind(cont);
        // Compilation continues here: the shadow frame's translated
        // return address points at this spot.
    }

    /// An excluded call runs natively and re-enters translation on
    /// return: the relocated call instruction lives in the cache, so
    /// the callee's `ret` lands on the code emitted right after it.
    fn emit_excluded_call(&mut self, target: u64, ret_addr: u64) {
        let ctx = self.ctx_addr();

        self.w.emit_lea(Reg::Rsp, Reg::Rsp, -128);
        self.w.emit_call_near(self.helpers.min_prolog);
        self.w.emit_mov_ri(Reg::Rdi, ctx);
        self.w.emit_mov_ri(Reg::Rsi, ret_addr);
        self.w
            .emit_call_addr(gates::shade_gate_begin_call as usize as u64);
        self.w.emit_call_near(self.helpers.min_epilog);
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, 128);

        self.w.emit_call_addr(target);

        self.w.emit_lea(Reg::Rsp, Reg::Rsp, -128);
        self.w.emit_call_near(self.helpers.min_prolog);
        self.w.emit_mov_ri(Reg::Rdi, ctx);
        self.w.emit_mov_ri(Reg::Rsi, ret_addr);
        self.w
            .emit_call_addr(gates::shade_gate_end_call as usize as u64);
        self.emit_event_check_tail(self.helpers.min_epilog);
    }

    /// Stage the `(guest_return, translated_return)` pair and push it
    /// onto the shadow stack. Returns the label for the translated
    /// return point, to be bound after the transfer code.
    fn emit_shadow_push(&mut self, ret_addr: u64) -> shade_backend::writer::Label {
        let cont = self.w.new_label();
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, -128);
        self.w.emit_push(Reg::Rax);
        self.w.emit_push(Reg::Rcx);
        self.w.emit_mov_ri(Reg::Rax, ret_addr);
        self.w.emit_lea_rip_label(Reg::Rcx, cont);
        self.w.emit_call_near(self.helpers.frame_push);
        self.w.emit_pop(Reg::Rcx);
        self.w.emit_pop(Reg::Rax);
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, 128);
        cont
    }

    // -- Indirect transfers --

    fn virtualize_indirect(&mut self, insn: &Insn, target: BranchTarget, is_call: bool) {
        // fs/gs-based targets are rare enough to single-step.
        if let BranchTarget::Mem(m) = &target {
            if m.segment.is_some() {
                self.emit_single_step(insn);
                return;
            }
        }

        let kind = match (&target, is_call) {
            (BranchTarget::Reg(_), true) => GateKind::CallReg,
            (BranchTarget::Reg(_), false) => GateKind::JmpReg,
            (_, true) => GateKind::CallMem,
            (_, false) => GateKind::JmpMem,
        };

        // Resolve the dynamic target exactly once, before the return
        // address lands on the stack.
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, -128);
        self.w.emit_call_near(self.helpers.ic_prolog);
        self.emit_resolve_operand(insn, &target);
        self.w.emit_store_rip(self.scratch_cell, Reg::Rax);
        self.w.emit_call_near(self.helpers.ic_epilog);
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, 128);

        let cont = if is_call {
            if self.mask.contains(shade_core::EventMask::CALL) {
                self.emit_call_event(insn.address, None);
            }
            let ret_addr = insn.end();
            let cont = self.emit_shadow_push(ret_addr);
            self.w.emit_push_imm64(ret_addr);
            Some(cont)
        } else {
            None
        };

        self.emit_ic_site(kind);

        match cont {
            Some(label) => self.w.bind(label),
            None => self.ended = true,
        }
    }

    /// Inline cache: an array of `(guest, translated)` pairs embedded
    /// in the code, scanned with an unrolled compare chain. A miss
    /// falls through to the dispatch gate, which populates the first
    /// empty entry.
    fn emit_ic_site(&mut self, kind: GateKind) {
        let site = self.alloc_site(kind);
        let count = self.engine.config.ic_entries as u32;

        let over = self.w.new_label();
        self.w.emit_jmp_label(over);
        self.w.emit_align_data(8);
        let ic_data = self.w.pc();
        for _ in 0..count {
            self.w.emit_u64(0);
            self.w.emit_u64(0);
        }
        // SAFETY: site freshly allocated, code lock held.
        unsafe {
            (*site).ic_data = ic_data;
            (*site).ic_count = count;
        }
        self.w.bind(over);

        self.w.emit_lea(Reg::Rsp, Reg::Rsp, -128);
        self.w.emit_call_near(self.helpers.ic_prolog);
        self.w.emit_load_rip(Reg::Rax, self.scratch_cell);

        let commit = self.w.new_label();
        for i in 0..count as u64 {
            let entry = ic_data + i * core::mem::size_of::<IcEntry>() as u64;
            let next = self.w.new_label();
            self.w.emit_cmp_rip(Reg::Rax, entry);
            self.w.emit_jcc_label(Cc::Ne, next);
            self.w.emit_load_rip(Reg::Rax, entry + 8);
            self.w.emit_jmp_label(commit);
            self.w.bind(next);
        }

        // Miss: restore and take the slow path.
        self.w.emit_call_near(self.helpers.ic_epilog);
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, 128);
        self.emit_transfer_dyn(kind, site);

        // Hit: jump through the resume cell.
        self.w.bind(commit);
        self.w.emit_store_rip(self.resume_cell, Reg::Rax);
        self.w.emit_call_near(self.helpers.ic_epilog);
        self.w.emit_lea(Reg::Rsp, Reg::Rsp, 128);
        self.w.emit_jmp_rip(self.resume_cell);
    }

    /// Load the dynamic branch target into rax, inside an IC-prolog
    /// region: rbx is the save-frame base, the guest's rax/rbx live at
    /// [rbx+8]/[rbx+0], and the guest rsp is rbx + 24 + 128.
    fn emit_resolve_operand(&mut self, insn: &Insn, target: &BranchTarget) {
        const SAVED_RAX: i32 = 8;
        const SAVED_RBX: i32 = 0;
        const APP_RSP_OFF: i32 = 24 + 128;

        let load_guest_reg = |it: &mut Self, dst: Reg, reg: Reg| match reg {
            Reg::Rax => it.w.emit_load(dst, Reg::Rbx, SAVED_RAX),
            Reg::Rbx => it.w.emit_load(dst, Reg::Rbx, SAVED_RBX),
            Reg::Rsp => it.w.emit_lea(dst, Reg::Rbx, APP_RSP_OFF),
            other => it.w.emit_mov_rr(dst, other),
        };

        match target {
            BranchTarget::Reg(r) => load_guest_reg(self, Reg::Rax, *r),
            BranchTarget::Imm(a) => self.w.emit_mov_ri(Reg::Rax, *a),
            BranchTarget::Mem(m) if m.rip_relative => {
                self.w.emit_mov_ri(Reg::Rax, m.rip_target(insn.len));
                self.w.emit_load(Reg::Rax, Reg::Rax, 0);
            }
            BranchTarget::Mem(m) => self.emit_resolve_mem(m, load_guest_reg),
        }
    }

    fn emit_resolve_mem(
        &mut self,
        m: &MemOperand,
        load_guest_reg: impl Fn(&mut Self, Reg, Reg),
    ) {
        let shift = m.scale.trailing_zeros() as u8;
        let clobbered = |r: Reg| matches!(r, Reg::Rax | Reg::Rbx | Reg::Rsp);

        let plain = m.base.map_or(true, |b| !clobbered(b))
            && m.index.map_or(true, |i| !clobbered(i));

        if plain {
            match (m.base, m.index) {
                (Some(b), Some(i)) => self.w.emit_load_sib(Reg::Rax, b, i, shift, m.disp),
                (Some(b), None) => self.w.emit_load(Reg::Rax, b, m.disp),
                (None, Some(i)) => {
                    self.w.emit_mov_ri(Reg::Rax, m.disp as i64 as u64);
                    self.w.emit_lea_sib(Reg::Rax, Reg::Rax, i, shift, 0);
                    self.w.emit_load(Reg::Rax, Reg::Rax, 0);
                }
                (None, None) => {
                    self.w.emit_mov_ri(Reg::Rax, m.disp as i64 as u64);
                    self.w.emit_load(Reg::Rax, Reg::Rax, 0);
                }
            }
            return;
        }

        // A component is one of the registers the IC prolog repurposed;
        // compute the address from the saved values.
        match m.base {
            Some(b) => load_guest_reg(self, Reg::Rax, b),
            None => self.w.emit_mov_ri(Reg::Rax, 0),
        }
        if let Some(i) = m.index {
            if clobbered(i) {
                self.w.emit_push(Reg::Rcx);
                load_guest_reg(self, Reg::Rcx, i);
                self.w.emit_lea_sib(Reg::Rax, Reg::Rax, Reg::Rcx, shift, m.disp);
                self.w.emit_pop(Reg::Rcx);
            } else {
                self.w.emit_lea_sib(Reg::Rax, Reg::Rax, i, shift, m.disp);
            }
        } else if m.disp != 0 {
            self.w.emit_lea(Reg::Rax, Reg::Rax, m.disp);
        }
        self.w.emit_load(Reg::Rax, Reg::Rax, 0);
    }

    // -- Conditional branches --

    fn virtualize_jcc(&mut self, insn: &Insn, cc: Cc, target: u64) {
        let taken = self.w.new_label();
        self.w.emit_jcc_label(cc, taken);
        self.emit_transfer_imm(GateKind::JmpCond, insn.end());
        self.w.bind(taken);
        self.emit_transfer_imm(GateKind::JmpCond, target);
        self.ended = true;
    }

    /// `jrcxz`/`loop*` only exist with rel8 displacements; re-emit the
    /// original opcode locally and route both edges through full
    /// transfer code.
    fn virtualize_jcxz(&mut self, insn: &Insn, target: u64) {
        let taken = self.w.new_label();
        let fall = self.w.new_label();
        self.w.emit_rel8_label(insn.bytes()[0], taken);
        self.w.emit_jmp_label(fall);
        self.w.bind(taken);
        self.emit_transfer_imm(GateKind::JmpCond, target);
        self.w.bind(fall);
        self.emit_transfer_imm(GateKind::JmpCond, insn.end());
        self.ended = true;
    }

    // -- Returns --

    fn virtualize_ret(&mut self, insn: &Insn, pop: u16) {
        if self.mask.contains(shade_core::EventMask::RET) {
            self.emit_ret_event(insn.address);
        }

        if pop != 0 {
            // `ret n`: move the return target up over the popped
            // arguments, adjust rsp, then handle it as a plain ret.
            let n = pop as i32;
            self.w.emit_push(Reg::Rax);
            self.w.emit_load(Reg::Rax, Reg::Rsp, 8);
            self.w.emit_store(Reg::Rsp, 8 + n, Reg::Rax);
            self.w.emit_pop(Reg::Rax);
            self.w.emit_lea(Reg::Rsp, Reg::Rsp, n);
        }

        self.w.emit_call_near(self.helpers.stack_pop_and_go);
        // Inline datum read by the helper: the ret's guest address.
        self.w.emit_u64(insn.address);
        self.ended = true;
    }

    // -- Fallback --

    /// Single-step trampoline: set the trap flag and run the original
    /// instruction natively; the trap handler re-enters translation at
    /// the next pc.
    fn emit_single_step(&mut self, insn: &Insn) {
        os::arm_single_step();
        self.w.emit_pushfq();
        self.w
            .emit_arith_mem_imm(ArithOp::Or, Reg::Rsp, 0, shade_core::cpu::RFLAGS_TF as i32);
        self.w.emit_popfq();
        self.w.emit_jmp_abs(insn.address);
        self.ended = true;
    }
}
