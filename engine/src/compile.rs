//! Block compiler.
//!
//! Translation is strictly on demand, one basic block at a time. The
//! compiler drives the user transformer over an iterator that decodes
//! guest instructions through the relocator; `keep()` emits each one,
//! virtualizing control transfers. Commit appends the
//! self-modification snapshot and reserves the slab space.

use std::mem;

use shade_backend::insn::Insn;
use shade_backend::reloc::Relocator;
use shade_backend::writer::CodeWriter;
use shade_core::{CpuContext, Event, EventMask, GateKind, Result};

use crate::block::ExecBlock;
use crate::ctx::{CalloutRecord, CtxInner, ExecCtx};
use crate::helpers::HelperSet;
use crate::slab::{freeze, thaw};
use crate::{os, EngineInner};

/// Free space required in the active slab before a block compile
/// starts; below this a fresh slab is pushed first.
pub const MIN_SLAB_SPACE: usize = 16 * 1024;

/// Mid-block clip threshold: when the writer has less than this left,
/// the block is cut and chained to a continuation. Sized for the
/// worst single instruction: an indirect call with a full 32-entry
/// inline cache plus event emission.
pub const CONTINUATION_RESERVE: usize = 4096;

/// Upper bound on one block's emission, so a thawed region stays
/// reasonable.
const MAX_BLOCK_EMIT: usize = 64 * 1024;

/// User rewrite callback driving the translation of one block.
///
/// Must pump `iter.next()` until it returns `None`; for each
/// instruction it may call `keep()` (emit with virtualization),
/// `put_callout()` (inject a callback), or neither (drop the
/// instruction). Extra instructions can be emitted between guest
/// instructions through `iter.writer()`.
pub trait Transformer: Send {
    fn transform_block(&mut self, iter: &mut BlockIterator<'_>);
}

/// Pass-through transformer: keeps every instruction.
#[derive(Debug, Default)]
pub struct DefaultTransformer;

impl Transformer for DefaultTransformer {
    fn transform_block(&mut self, iter: &mut BlockIterator<'_>) {
        while iter.next().is_some() {
            iter.keep();
        }
    }
}

/// Closure adapter for [`Transformer`].
pub struct FnTransformer<F>(pub F);

impl<F> Transformer for FnTransformer<F>
where
    F: FnMut(&mut BlockIterator<'_>) + Send,
{
    fn transform_block(&mut self, iter: &mut BlockIterator<'_>) {
        (self.0)(iter)
    }
}

/// Iterator handed to the transformer; owns the output writer for the
/// duration of one block.
pub struct BlockIterator<'a> {
    pub(crate) ctx: &'a ExecCtx,
    pub(crate) engine: &'a EngineInner,
    pub(crate) inner: &'a mut CtxInner,
    pub(crate) w: CodeWriter,
    pub(crate) relocator: Relocator,
    pub(crate) block: *mut ExecBlock,
    pub(crate) mask: EventMask,
    pub(crate) helpers: HelperSet,
    pub(crate) scratch_cell: u64,
    pub(crate) resume_cell: u64,
    pub(crate) current: Option<Insn>,
    pub(crate) kept: bool,
    pub(crate) ended: bool,
    pub(crate) continuation: Option<u64>,
}

impl BlockIterator<'_> {
    /// Decode the next guest instruction, or `None` at the end of the
    /// block (control transfer emitted, or out of emission space).
    pub fn next(&mut self) -> Option<&Insn> {
        if self.ended {
            self.current = None;
            return None;
        }
        if self.w.remaining() < CONTINUATION_RESERVE {
            self.continuation = Some(self.relocator.pc());
            self.current = None;
            return None;
        }
        // SAFETY: the page was checked readable at block start and the
        // decoder reads at most 15 bytes past the current pc.
        let insn = unsafe { self.relocator.read_one() };
        self.kept = false;
        self.current = Some(insn);
        self.current.as_ref()
    }

    /// Guest address of the current instruction.
    pub fn address(&self) -> u64 {
        self.current.map(|i| i.address).unwrap_or(0)
    }

    /// Raw writer access, for transformer-inserted instructions.
    pub fn writer(&mut self) -> &mut CodeWriter {
        &mut self.w
    }

    /// Inject a callback receiving the full CPU context, executed at
    /// the current instruction's position.
    pub fn put_callout(&mut self, callback: Box<dyn FnMut(&mut CpuContext) + Send>) {
        let record = Box::new(CalloutRecord {
            callback,
            guest_pc: self.address(),
        });
        let ptr = &*record as *const CalloutRecord as u64;
        self.inner.callouts.push(record);
        self.emit_callout(ptr);
    }
}

/// Emission sink for one translation: directly into a slab, or into
/// the scratch buffer pretending to live at an existing block's
/// address.
enum EmitTarget {
    Slab,
    Scratch { logical: u64 },
}

struct TransformOut {
    w: CodeWriter,
    real_size: usize,
}

fn run_transform(
    ctx: &ExecCtx,
    inner: &mut CtxInner,
    engine: &EngineInner,
    block: *mut ExecBlock,
    start: u64,
    target: EmitTarget,
) -> Result<TransformOut> {
    let slab_index = match target {
        EmitTarget::Slab => inner.slabs.len() - 1,
        EmitTarget::Scratch { .. } => unsafe { (*block).slab_index as usize },
    };
    let slab = &inner.slabs[slab_index];
    let helpers = slab.helpers;
    let scratch_cell = slab.scratch_cell;
    let resume_cell = slab.resume_cell;

    let w = match target {
        EmitTarget::Slab => {
            let base = slab.cursor_ptr();
            let cap = slab.remaining().min(MAX_BLOCK_EMIT);
            thaw(base as u64, cap, slab.mem.rwx)?;
            // SAFETY: region reserved for this compile under the code
            // lock, thawed above.
            unsafe { CodeWriter::new(base, cap) }
        }
        EmitTarget::Scratch { logical } => {
            let cap = inner.scratch.len();
            let base = inner.scratch.as_mut_ptr();
            // SAFETY: scratch buffer owned by the context.
            unsafe { CodeWriter::new_redirected(base, cap, logical) }
        }
    };

    let mask = inner.sink_mask;
    let mut transformer = mem::replace(&mut inner.transformer, Box::new(DefaultTransformer));

    let mut it = BlockIterator {
        ctx,
        engine,
        inner,
        w,
        relocator: Relocator::new(start),
        block,
        mask,
        helpers,
        scratch_cell,
        resume_cell,
        current: None,
        kept: false,
        ended: false,
        continuation: None,
    };

    it.emit_block_head();
    transformer.transform_block(&mut it);

    if !it.ended {
        // The block was clipped (or the transformer stopped early):
        // chain seamlessly to the rest of the guest code.
        let cont = it.continuation.unwrap_or_else(|| it.relocator.pc());
        it.emit_transfer_imm(GateKind::JmpContinuation, cont);
    }
    // Unreachable; trap if the impossible happens.
    it.w.emit_int3();
    it.w.flush();

    let BlockIterator {
        w,
        relocator,
        inner,
        ..
    } = it;
    inner.transformer = transformer;

    Ok(TransformOut {
        w,
        real_size: relocator.consumed(),
    })
}

/// Compile a fresh block for `start` and install it in the mapping.
pub(crate) fn compile_block(
    ctx: &ExecCtx,
    inner: &mut CtxInner,
    engine: &EngineInner,
    start: u64,
) -> Result<*mut ExecBlock> {
    let block = compile_unmapped(ctx, inner, engine, start)?;
    inner.blocks.insert(start, block);
    Ok(block)
}

/// Compile without touching the mapping (also used for storage
/// blocks).
pub(crate) fn compile_unmapped(
    ctx: &ExecCtx,
    inner: &mut CtxInner,
    engine: &EngineInner,
    start: u64,
) -> Result<*mut ExecBlock> {
    os::ensure_readable(start)?;
    ctx.ensure_code_space(inner, engine, MIN_SLAB_SPACE)?;

    let block = ctx.alloc_block(inner, engine, start)?;
    let slab_index = inner.slabs.len() - 1;
    let code_start = inner.slabs[slab_index].cursor_ptr() as u64;
    // SAFETY: freshly allocated record, only this thread sees it.
    unsafe {
        (*block).slab_index = slab_index as u32;
        (*block).code_start = code_start;
    }

    let out = run_transform(ctx, inner, engine, block, start, EmitTarget::Slab)?;
    let code_size = out.w.offset();
    let real_size = out.real_size;

    // Snapshot for the self-modification check. Dropped when it would
    // not fit the slab; a missing snapshot reads as "stale" and forces
    // recompilation, never stale reuse.
    let trust = engine.trust_threshold();
    let avail = inner.slabs[slab_index].remaining();
    let mut total = code_size;
    let mut snapshot: *const u8 = core::ptr::null();
    if trust > 0 && code_size + real_size <= avail {
        let snap = (code_start + code_size as u64) as *mut u8;
        let rwx = inner.slabs[slab_index].mem.rwx;
        thaw(snap as u64, real_size, rwx)?;
        // SAFETY: guest range checked readable; snapshot area thawed.
        unsafe {
            core::ptr::copy_nonoverlapping(start as *const u8, snap, real_size);
        }
        snapshot = snap;
        total += real_size;
    }

    let slab = &mut inner.slabs[slab_index];
    let capacity = ((total + 15) & !15).min(slab.remaining());
    slab.reserve(capacity).expect("block emission exceeded slab");
    freeze(code_start, total, slab.mem.rwx)?;

    // SAFETY: as above.
    unsafe {
        (*block).real_size = real_size as u32;
        (*block).code_size = code_size as u32;
        (*block).capacity = capacity as u32;
        (*block).snapshot = snapshot;
    }

    inner.stats.blocks_compiled += 1;
    if inner.sink_mask.contains(EventMask::COMPILE) {
        inner.sink.process(
            &Event::Compile {
                start,
                end: start + real_size as u64,
            },
            None,
        );
    }
    log::debug!(
        "thread {}: compiled block {start:#x}+{real_size} -> {code_start:#x}+{code_size}",
        ctx.thread_id
    );
    Ok(block)
}

/// Recompile an existing block after invalidation or a failed
/// snapshot check.
///
/// The new code is emitted into the scratch buffer as if it lived at
/// the block's code address. If it fits the reserved capacity it is
/// copied over in place; otherwise a storage block is compiled and
/// the old site is overwritten with a jump to it, keeping the
/// original code-start valid for every site already patched to it.
pub(crate) fn recompile_block(
    ctx: &ExecCtx,
    inner: &mut CtxInner,
    engine: &EngineInner,
    block: *mut ExecBlock,
) -> Result<()> {
    // SAFETY: block records are arena-allocated and never freed while
    // the context lives; we hold the code lock.
    let (start, code_start, capacity, slab_index) = unsafe {
        (
            (*block).real_start,
            (*block).code_start,
            (*block).capacity as usize,
            (*block).slab_index as usize,
        )
    };
    os::ensure_readable(start)?;

    let out = run_transform(
        ctx,
        inner,
        engine,
        block,
        start,
        EmitTarget::Scratch {
            logical: code_start,
        },
    )?;
    let code_size = out.w.offset();
    let real_size = out.real_size;

    let trust = engine.trust_threshold();
    let snap_size = if trust > 0 { real_size } else { 0 };
    let total = code_size + snap_size;
    let rwx = inner.slabs[slab_index].mem.rwx;

    if total <= capacity {
        thaw(code_start, capacity, rwx)?;
        // SAFETY: copying into this block's reserved capacity, under
        // the code lock.
        unsafe {
            core::ptr::copy_nonoverlapping(
                inner.scratch.as_ptr(),
                code_start as *mut u8,
                code_size,
            );
            if snap_size > 0 {
                core::ptr::copy_nonoverlapping(
                    start as *const u8,
                    (code_start + code_size as u64) as *mut u8,
                    snap_size,
                );
            }
        }
        freeze(code_start, total, rwx)?;
        unsafe {
            (*block).real_size = real_size as u32;
            (*block).code_size = code_size as u32;
            (*block).snapshot = if snap_size > 0 {
                (code_start + code_size as u64) as *const u8
            } else {
                core::ptr::null()
            };
            (*block).recycle_count = 0;
        }
    } else {
        // Outgrown: chain to a storage block.
        let storage = compile_unmapped(ctx, inner, engine, start)?;
        thaw(code_start, 16, rwx)?;
        let head = code_start as *mut u8;
        // SAFETY: the old block body is at least one transfer thunk
        // long, far larger than the 14-byte absolute jump.
        unsafe {
            let mut w = CodeWriter::new(head, capacity);
            w.emit_jmp_abs((*storage).code_start);
            (*block).storage_block = storage;
            (*block).real_size = (*storage).real_size;
            (*block).recycle_count = 0;
        }
        freeze(code_start, 16, rwx)?;
    }

    inner.stats.blocks_compiled += 1;
    if inner.sink_mask.contains(EventMask::COMPILE) {
        inner.sink.process(
            &Event::Compile {
                start,
                end: start + real_size as u64,
            },
            None,
        );
    }
    log::debug!(
        "thread {}: recompiled block {start:#x} ({} bytes)",
        ctx.thread_id,
        code_size
    );
    Ok(())
}
