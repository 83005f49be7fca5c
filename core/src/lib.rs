//! Shared leaf types for the shade engine.
//!
//! Everything here is consumed by both the x86-64 backend and the engine
//! proper: architectural state snapshots, trace events, gate/observer
//! vocabulary, probes, address ranges and the error type.

pub mod cpu;
pub mod error;
pub mod event;
pub mod observer;
pub mod probe;
pub mod range;

pub use cpu::CpuContext;
pub use error::Error;
pub use event::{Event, EventMask, EventSink, NullSink, VecSink};
pub use observer::{Backpatch, BackpatchKind, CountingObserver, GateKind, Observer, BACKPATCH_VERSION};
pub use probe::{CallDetails, ProbeId};
pub use range::MemoryRange;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;
