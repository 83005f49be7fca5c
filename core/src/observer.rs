//! Slow-path dispatch counters and backpatch notifications.

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies which virtualized site kind entered the slow path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GateKind {
    CallImm = 0,
    CallReg = 1,
    CallMem = 2,
    JmpImm = 3,
    JmpReg = 4,
    JmpMem = 5,
    JmpCond = 6,
    /// Out-of-space continuation jump at the tail of a clipped block.
    JmpContinuation = 7,
    RetSlowPath = 8,
    Sysenter = 9,
}

pub const GATE_KIND_COUNT: usize = 10;

/// Kind tag inside a [`Backpatch`] descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BackpatchKind {
    /// Direct jump written over a transfer site.
    Static = 0,
    /// Inline-cache entry population.
    InlineCache = 1,
}

/// Layout version of [`Backpatch`]. Bump on any field change; replay
/// rejects foreign versions.
pub const BACKPATCH_VERSION: u32 = 1;

/// Opaque-to-the-caller record of one backpatch, replayable into
/// another engine via `prefetch_backpatch`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backpatch {
    pub version: u32,
    pub kind: BackpatchKind,
    /// Guest start of the block containing the patched site.
    pub block_start: u64,
    /// Byte offset of the site inside that block's translated code.
    pub site_offset: u32,
    /// Guest address the site now resolves to.
    pub target: u64,
}

/// Optional engine observer: per-gate counters plus backpatch capture.
pub trait Observer: Send + Sync {
    fn increment(&self, _kind: GateKind) {}

    fn increment_total(&self) {}

    fn notify_backpatch(&self, _patch: &Backpatch) {}
}

/// Observer keeping one atomic counter per gate kind.
#[derive(Debug, Default)]
pub struct CountingObserver {
    counts: [AtomicU64; GATE_KIND_COUNT],
    total: AtomicU64,
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, kind: GateKind) -> u64 {
        self.counts[kind as usize].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl Observer for CountingObserver {
    fn increment(&self, kind: GateKind) {
        self.counts[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    fn increment_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }
}
