//! Per-thread execution context.
//!
//! One `ExecCtx` exists per followed thread. The hot header is read
//! and written by emitted code (by absolute address, resolved at
//! emission time); everything else is ordinary Rust state. The code
//! lock (`inner`) serializes compilation, backpatching and
//! invalidation; on the fast path only the owning thread touches the
//! context.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::mem::offset_of;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use shade_core::{CpuContext, EventMask, EventSink, Result};

use crate::block::{ExecBlock, IcEntry, TransferSite};
use crate::compile::Transformer;
use crate::frames::FrameStack;
use crate::helpers;
use crate::slab::{AddressSpec, CodeSlab, DataSlab, Mapping};
use crate::EngineInner;

/// Run states. The progression is monotonic:
/// `ACTIVE → UNFOLLOW_PENDING → DESTROY_PENDING`.
pub mod state {
    pub const ACTIVE: u32 = 0;
    pub const UNFOLLOW_PENDING: u32 = 1;
    pub const DESTROY_PENDING: u32 = 2;
}

/// Header addressed from emitted code.
#[repr(C)]
#[derive(Debug, Default)]
pub struct CtxHot {
    /// Application stack pointer recorded by every prolog.
    pub app_stack: u64,
    /// Most recent shadow frame; equals the sentinel when empty.
    pub current_frame: u64,
    /// Lowest valid frame address (overflow bound).
    pub frames_base: u64,
}

pub const HOT_APP_STACK: usize = offset_of!(CtxHot, app_stack);
pub const HOT_CURRENT_FRAME: usize = offset_of!(CtxHot, current_frame);
pub const HOT_FRAMES_BASE: usize = offset_of!(CtxHot, frames_base);

/// Per-context counters, surfaced for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct CtxStats {
    pub blocks_compiled: u64,
    pub blocks_recycled: u64,
    pub static_backpatches: u64,
    pub ic_backpatches: u64,
    pub slow_dispatches: u64,
}

/// User callback injected by a transformer, kept alive by the context.
pub struct CalloutRecord {
    pub callback: Box<dyn FnMut(&mut CpuContext) + Send>,
    pub guest_pc: u64,
}

/// State behind the code lock.
pub struct CtxInner {
    pub slabs: Vec<CodeSlab>,
    pub data: Vec<DataSlab>,
    /// Scratch buffer recompiles are emitted into before the copy
    /// over the live site.
    pub scratch: Vec<u8>,
    /// Guest start address → block record.
    pub blocks: HashMap<u64, *mut ExecBlock>,
    /// Guest start address → transfer sites statically patched to it,
    /// for unlinking on invalidation.
    pub incoming: HashMap<u64, Vec<*mut TransferSite>>,
    /// Guest start address → inline-cache entries resolving to it.
    pub ic_refs: HashMap<u64, Vec<*mut IcEntry>>,
    /// Every transfer site, for backpatch replay lookup.
    pub sites: Vec<*mut TransferSite>,
    pub transformer: Box<dyn Transformer>,
    pub sink: Box<dyn EventSink>,
    pub sink_mask: EventMask,
    pub callouts: Vec<Box<CalloutRecord>>,
    pub stats: CtxStats,
    /// Call depth reported in CALL/RET events.
    pub depth: i32,
}

pub struct ExecCtx {
    hot: UnsafeCell<CtxHot>,
    pub state: AtomicU32,
    /// Set between `deactivate` and reaching the activation target;
    /// gates pass events through without delivering them.
    pub inert: AtomicU32,
    pub pending_calls: AtomicI32,
    pub activation_target: AtomicU64,
    pub thread_id: u64,
    pub destroy_at: Mutex<Option<Instant>>,
    pub frames: FrameStack,
    pub engine: Weak<EngineInner>,
    /// The code lock.
    pub inner: Mutex<CtxInner>,
}

// SAFETY: the hot header and emitted-code cells are only written by
// the owning thread; cross-thread access (unfollow, invalidate, GC)
// goes through the atomics and the code lock.
unsafe impl Send for ExecCtx {}
unsafe impl Sync for ExecCtx {}

impl ExecCtx {
    pub fn new(
        engine: &Arc<EngineInner>,
        thread_id: u64,
        transformer: Box<dyn Transformer>,
        sink: Box<dyn EventSink>,
    ) -> Result<Arc<Self>> {
        let sink_mask = sink.mask();
        let ctx = Arc::new(Self {
            hot: UnsafeCell::new(CtxHot::default()),
            state: AtomicU32::new(state::ACTIVE),
            inert: AtomicU32::new(0),
            pending_calls: AtomicI32::new(0),
            activation_target: AtomicU64::new(0),
            thread_id,
            destroy_at: Mutex::new(None),
            frames: FrameStack::new(),
            engine: Arc::downgrade(engine),
            inner: Mutex::new(CtxInner {
                slabs: Vec::new(),
                data: Vec::new(),
                scratch: vec![0u8; engine.config.scratch_size],
                blocks: HashMap::new(),
                incoming: HashMap::new(),
                ic_refs: HashMap::new(),
                sites: Vec::new(),
                transformer,
                sink,
                sink_mask,
                callouts: Vec::new(),
                stats: CtxStats::default(),
                depth: 0,
            }),
        });

        {
            let hot = ctx.hot.get();
            // SAFETY: no emitted code exists yet; exclusive access.
            unsafe {
                (*hot).current_frame = ctx.frames.first_addr();
                (*hot).frames_base = ctx.frames.base_addr();
            }
        }

        {
            let mut inner = ctx.inner.lock();
            ctx.push_code_slab(&mut inner, engine)?;
            ctx.push_data_slab(&mut inner, engine)?;
            inner.sink.start();
        }

        log::debug!("created context for thread {thread_id}");
        Ok(ctx)
    }

    // -- Hot header --

    #[inline]
    pub fn hot_addr(&self) -> u64 {
        self.hot.get() as u64
    }

    #[inline]
    pub fn app_stack_addr(&self) -> u64 {
        self.hot_addr() + HOT_APP_STACK as u64
    }

    /// # Safety
    /// Caller must be the owning thread, or know it is parked outside
    /// translated code.
    pub unsafe fn app_stack(&self) -> u64 {
        (*self.hot.get()).app_stack
    }

    pub fn shadow_depth(&self) -> usize {
        // SAFETY: a racy read is fine; used for reporting only.
        let current = unsafe { (*self.hot.get()).current_frame };
        ((self.frames.first_addr() - current) / core::mem::size_of::<crate::frames::ExecFrame>() as u64)
            as usize
    }

    /// Drop every shadow frame (ret slow path, deactivate).
    pub fn clear_frames(&self) {
        // SAFETY: only called on the owning thread (gates) or with the
        // thread outside translated code.
        unsafe {
            (*self.hot.get()).current_frame = self.frames.first_addr();
        }
    }

    // -- Slab management --

    pub fn push_code_slab(&self, inner: &mut CtxInner, engine: &EngineInner) -> Result<()> {
        let mem = Mapping::allocate_near(
            &AddressSpec::near(engine.anchor),
            engine.config.code_slab_size,
            true,
        )?;
        // Communication cells live next door, permanently writable.
        let cells = Mapping::allocate_near(&AddressSpec::near(mem.base() as u64), 4096, false)?;
        let mut slab = CodeSlab::new(mem, cells);
        helpers::emit_slab_prelude(&mut slab, self)?;
        inner.slabs.push(slab);
        log::debug!(
            "thread {}: code slab {} at {:#x}",
            self.thread_id,
            inner.slabs.len() - 1,
            inner.slabs.last().unwrap().mem.base() as u64
        );
        Ok(())
    }

    pub fn push_data_slab(&self, inner: &mut CtxInner, engine: &EngineInner) -> Result<()> {
        // Anchor data to the most recent code slab so RIP-relative
        // references from emitted code always reach.
        let near = inner
            .slabs
            .last()
            .map(|s| s.mem.base() as u64)
            .unwrap_or(engine.anchor);
        let mem = Mapping::allocate_near(&AddressSpec::near(near), engine.config.data_slab_size, false)?;
        inner.data.push(DataSlab::new(mem));
        Ok(())
    }

    /// Make sure the active code slab has at least `min` bytes free.
    pub fn ensure_code_space(
        &self,
        inner: &mut CtxInner,
        engine: &EngineInner,
        min: usize,
    ) -> Result<()> {
        if inner.slabs.last().map(|s| s.remaining()).unwrap_or(0) < min {
            self.push_code_slab(inner, engine)?;
        }
        Ok(())
    }

    /// Reserve data-slab memory, pushing a new slab when full.
    pub fn data_reserve(
        &self,
        inner: &mut CtxInner,
        engine: &EngineInner,
        size: usize,
        align: usize,
    ) -> Result<*mut u8> {
        if let Some(p) = inner.data.last_mut().and_then(|d| d.reserve(size, align)) {
            return Ok(p);
        }
        self.push_data_slab(inner, engine)?;
        Ok(inner
            .data
            .last_mut()
            .and_then(|d| d.reserve(size, align))
            .expect("fresh data slab too small for reservation"))
    }

    /// Whether `addr` lies inside this context's translated code.
    pub fn contains_code(&self, inner: &CtxInner, addr: u64) -> bool {
        inner.slabs.iter().any(|s| s.contains(addr))
    }

    /// Allocate a block record in a data slab.
    pub fn alloc_block(
        &self,
        inner: &mut CtxInner,
        engine: &EngineInner,
        real_start: u64,
    ) -> Result<*mut ExecBlock> {
        let p = self.data_reserve(
            inner,
            engine,
            core::mem::size_of::<ExecBlock>(),
            core::mem::align_of::<ExecBlock>(),
        )? as *mut ExecBlock;
        // SAFETY: freshly reserved, properly aligned.
        unsafe { p.write(ExecBlock::new(real_start)) };
        Ok(p)
    }

    /// Allocate a transfer-site descriptor in a data slab.
    pub fn alloc_site(&self, inner: &mut CtxInner, engine: &EngineInner) -> Result<*mut TransferSite> {
        let p = self.data_reserve(
            inner,
            engine,
            core::mem::size_of::<TransferSite>(),
            core::mem::align_of::<TransferSite>(),
        )? as *mut TransferSite;
        Ok(p)
    }

    // -- State machine --

    pub fn run_state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// `ACTIVE → UNFOLLOW_PENDING`. Returns false when already past.
    pub fn begin_unfollow(&self) -> bool {
        self.state
            .compare_exchange(
                state::ACTIVE,
                state::UNFOLLOW_PENDING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `UNFOLLOW_PENDING → DESTROY_PENDING`; stops the sink and stamps
    /// the teardown clock for the collector.
    pub fn finalize_unfollow(&self, inner: &mut CtxInner) {
        if self
            .state
            .compare_exchange(
                state::UNFOLLOW_PENDING,
                state::DESTROY_PENDING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            inner.sink.stop();
            inner.sink.flush();
            *self.destroy_at.lock() = Some(Instant::now());
            log::debug!("thread {}: unfollow finalized", self.thread_id);
        }
    }

    pub fn is_inert(&self) -> bool {
        self.inert.load(Ordering::Acquire) != 0
    }

    pub fn set_inert(&self, inert: bool) {
        self.inert.store(inert as u32, Ordering::Release);
    }
}
