//! Tests for the shared leaf types.

use shade_core::{
    Backpatch, BackpatchKind, CountingObserver, Event, EventMask, EventSink, GateKind,
    MemoryRange, NullSink, Observer, VecSink, BACKPATCH_VERSION,
};

#[test]
fn event_mask_bits_are_distinct() {
    let all = EventMask::CALL | EventMask::RET | EventMask::EXEC | EventMask::BLOCK
        | EventMask::COMPILE;
    assert_eq!(all.bits().count_ones(), 5);
    assert!(!EventMask::empty().contains(EventMask::EXEC));
}

#[test]
fn vec_sink_collects() {
    let mut sink = VecSink::new(EventMask::EXEC | EventMask::CALL);
    let log = sink.events();
    sink.process(&Event::Exec { location: 0x10 }, None);
    sink.process(
        &Event::Call {
            location: 0x10,
            target: 0x20,
            depth: 0,
        },
        None,
    );
    let events = log.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], Event::Exec { location: 0x10 });
}

#[test]
fn null_sink_wants_nothing() {
    let sink = NullSink;
    assert!(sink.mask().is_empty());
}

#[test]
fn counting_observer() {
    let obs = CountingObserver::new();
    obs.increment(GateKind::CallReg);
    obs.increment(GateKind::CallReg);
    obs.increment(GateKind::RetSlowPath);
    obs.increment_total();
    assert_eq!(obs.count(GateKind::CallReg), 2);
    assert_eq!(obs.count(GateKind::RetSlowPath), 1);
    assert_eq!(obs.count(GateKind::JmpImm), 0);
    assert_eq!(obs.total(), 1);
}

#[test]
fn memory_range_bounds() {
    let r = MemoryRange::new(0x1000, 0x100);
    assert!(r.contains(0x1000));
    assert!(r.contains(0x10FF));
    assert!(!r.contains(0x1100));
    assert!(!r.contains(0xFFF));
    assert_eq!(r.end(), 0x1100);
}

#[test]
fn backpatch_descriptor_versioned() {
    let patch = Backpatch {
        version: BACKPATCH_VERSION,
        kind: BackpatchKind::Static,
        block_start: 0x1000,
        site_offset: 0x40,
        target: 0x2000,
    };
    assert_eq!(patch.version, 1);
    // The descriptor is an opaque-but-stable blob for observers.
    assert_eq!(core::mem::size_of::<Backpatch>(), 32);
}
