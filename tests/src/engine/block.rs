//! Exec-block records: the trust/recycle decision matrix and
//! snapshot comparison.

use shade_engine::block::{trust_decision, ExecBlock, TrustDecision};

fn block_over(code: &[u8]) -> ExecBlock {
    let mut b = ExecBlock::new(code.as_ptr() as u64);
    b.real_size = code.len() as u32;
    b
}

#[test]
fn negative_threshold_always_recompiles() {
    let guest = [0x90u8; 8];
    let mut b = block_over(&guest);
    b.recycle_count = 1000;
    assert_eq!(trust_decision(&b, -1), TrustDecision::Recompile);
}

#[test]
fn recycled_enough_is_trusted_unchecked() {
    let guest = [0x90u8; 8];
    let mut b = block_over(&guest);
    b.recycle_count = 3;
    // No snapshot at all: would fail the compare, but trust wins.
    assert_eq!(trust_decision(&b, 3), TrustDecision::Reuse);
    assert_eq!(trust_decision(&b, 2), TrustDecision::Reuse);
}

#[test]
fn untrusted_block_compares_snapshot() {
    let guest = [0x48u8, 0x89, 0xC8, 0xC3];
    let snapshot = guest; // byte-identical copy
    let mut b = block_over(&guest);
    b.snapshot = snapshot.as_ptr();
    b.recycle_count = 0;
    assert_eq!(trust_decision(&b, 5), TrustDecision::Reuse);

    let stale = [0x48u8, 0x89, 0xC8, 0xCC]; // guest bytes changed
    b.snapshot = stale.as_ptr();
    assert_eq!(trust_decision(&b, 5), TrustDecision::Recompile);
}

#[test]
fn missing_snapshot_reads_as_stale() {
    let guest = [0x90u8; 4];
    let b = block_over(&guest);
    assert_eq!(trust_decision(&b, 1), TrustDecision::Recompile);
}

#[test]
fn snapshot_compare_is_byte_exact() {
    let guest = [1u8, 2, 3, 4, 5];
    let mut snap = guest;
    let mut b = block_over(&guest);
    b.snapshot = snap.as_ptr();
    // SAFETY: both slices are live locals.
    assert!(unsafe { b.snapshot_matches() });
    snap[4] = 6;
    assert!(unsafe { !b.snapshot_matches() });
}
