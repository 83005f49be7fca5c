//! Translated-block records and the trust/recycle decision.

use shade_core::GateKind;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        /// Block compiled at the activation target; never backpatched
        /// away.
        const ACTIVATION_TARGET = 1 << 0;
    }
}

/// One translated guest basic block. Records live in data slabs and
/// are never freed before their context dies, so raw pointers to them
/// may be embedded in emitted code.
#[repr(C)]
#[derive(Debug)]
pub struct ExecBlock {
    /// Guest start address.
    pub real_start: u64,
    /// Translated code start. Stable across recompiles; a recompile
    /// that outgrows `capacity` chains to a storage block from here.
    pub code_start: u64,
    pub real_size: u32,
    pub code_size: u32,
    /// Bytes reserved in the code slab, including the snapshot.
    pub capacity: u32,
    pub flags: BlockFlags,
    pub recycle_count: u32,
    pub slab_index: u32,
    /// Overflow block a grown recompile was redirected to, if any.
    pub storage_block: *mut ExecBlock,
    /// Byte-for-byte copy of the guest bytes at last compile, appended
    /// after the translated code. Null when the trust threshold keeps
    /// no snapshots.
    pub snapshot: *const u8,
}

impl ExecBlock {
    pub fn new(real_start: u64) -> Self {
        Self {
            real_start,
            code_start: 0,
            real_size: 0,
            code_size: 0,
            capacity: 0,
            flags: BlockFlags::empty(),
            recycle_count: 0,
            slab_index: 0,
            storage_block: core::ptr::null_mut(),
            snapshot: core::ptr::null(),
        }
    }

    /// Compare the snapshot against the live guest bytes.
    ///
    /// # Safety
    /// The guest range `real_start..real_start + real_size` must be
    /// readable.
    pub unsafe fn snapshot_matches(&self) -> bool {
        if self.snapshot.is_null() {
            return false;
        }
        let live = core::slice::from_raw_parts(self.real_start as *const u8, self.real_size as usize);
        let snap = core::slice::from_raw_parts(self.snapshot, self.real_size as usize);
        live == snap
    }
}

/// What to do with an existing mapping when its guest address is
/// reached again through the slow path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    Reuse,
    Recompile,
}

/// The trust matrix: negative thresholds never reuse, blocks recycled
/// at least `trust` times are reused unchecked, everything else is
/// decided by snapshot comparison.
pub fn trust_decision(block: &ExecBlock, trust: i32) -> TrustDecision {
    if trust < 0 {
        return TrustDecision::Recompile;
    }
    if block.recycle_count >= trust as u32 {
        return TrustDecision::Reuse;
    }
    // SAFETY: the block was compiled from this range; it was readable
    // then and blocks are only re-reached while mapped.
    if unsafe { block.snapshot_matches() } {
        TrustDecision::Reuse
    } else {
        TrustDecision::Recompile
    }
}

/// Inline-cache entry embedded in an indirect transfer site.
/// `guest == 0` marks an empty slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IcEntry {
    pub guest: u64,
    pub code: u64,
}

/// Descriptor of one virtualized control-transfer site, allocated in a
/// data slab and handed to the dispatch gate by address.
#[repr(C)]
#[derive(Debug)]
pub struct TransferSite {
    pub kind: GateKind,
    pub block: *mut ExecBlock,
    /// Address of the patchable `jmp rel32`; its displacement operand
    /// is 4-byte aligned so it can be rewritten atomically.
    pub jmp_addr: u64,
    /// Slow-path body; a zero displacement in the patchable jump falls
    /// through to it, and unpatching restores that state.
    pub body_addr: u64,
    /// Immediate guest target, 0 for dynamic sites.
    pub guest_target: u64,
    /// First inline-cache entry, 0 when the site has no cache.
    pub ic_data: u64,
    pub ic_count: u32,
}

impl TransferSite {
    #[inline]
    pub fn ic_entries(&self) -> &'static mut [IcEntry] {
        // SAFETY: ic_data points at ic_count entries inside this
        // site's code slab, alive as long as the context.
        unsafe {
            core::slice::from_raw_parts_mut(self.ic_data as *mut IcEntry, self.ic_count as usize)
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(
            self.kind,
            GateKind::CallImm | GateKind::JmpImm | GateKind::JmpCond | GateKind::JmpContinuation
        )
    }
}
