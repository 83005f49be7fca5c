//! Trace events delivered to a caller-supplied sink.

use std::sync::{Arc, Mutex};

use crate::cpu::CpuContext;

bitflags::bitflags! {
    /// Which event kinds a sink wants to receive.
    ///
    /// The engine only emits instrumentation for kinds present in the
    /// mask, so an empty mask costs nothing at run time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u32 {
        const CALL    = 1 << 0;
        const RET     = 1 << 1;
        const EXEC    = 1 << 2;
        const BLOCK   = 1 << 3;
        const COMPILE = 1 << 4;
    }
}

/// One trace event. Addresses are guest addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A call was executed at `location`, transferring to `target`.
    Call { location: u64, target: u64, depth: i32 },
    /// A return was executed at `location`, transferring to `target`.
    Ret { location: u64, target: u64, depth: i32 },
    /// One instruction at `location` is about to execute.
    Exec { location: u64 },
    /// The translated block covering `start..end` began executing.
    Block { start: u64, end: u64 },
    /// The block covering `start..end` was compiled (or recompiled).
    Compile { start: u64, end: u64 },
}

/// Consumer of trace events.
///
/// `process` runs on the followed thread, between the engine's prolog
/// and epilog; it must not re-enter the engine.
pub trait EventSink: Send {
    fn mask(&self) -> EventMask;

    fn start(&mut self) {}

    fn process(&mut self, event: &Event, cpu: Option<&CpuContext>);

    fn stop(&mut self) {}

    fn flush(&mut self) {}
}

/// Sink that discards everything. Useful when only a transformer or
/// probes are wanted.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn mask(&self) -> EventMask {
        EventMask::empty()
    }

    fn process(&mut self, _event: &Event, _cpu: Option<&CpuContext>) {}
}

/// Sink that appends every event to a shared vector.
pub struct VecSink {
    mask: EventMask,
    events: Arc<Mutex<Vec<Event>>>,
}

impl VecSink {
    pub fn new(mask: EventMask) -> Self {
        Self {
            mask,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle to the collected events, usable after the sink has been
    /// handed to the engine.
    pub fn events(&self) -> Arc<Mutex<Vec<Event>>> {
        self.events.clone()
    }
}

impl EventSink for VecSink {
    fn mask(&self) -> EventMask {
        self.mask
    }

    fn process(&mut self, event: &Event, _cpu: Option<&CpuContext>) {
        self.events.lock().unwrap().push(*event);
    }
}
