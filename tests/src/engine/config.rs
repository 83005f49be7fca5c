//! Engine configuration and construction.

use shade_engine::{Config, Shade};

#[test]
fn ic_entries_clamped_to_valid_range() {
    let mut cfg = Config::default();
    cfg.ic_entries = 1;
    let shade = Shade::with_config(cfg);
    assert_eq!(shade.config().ic_entries, 2);

    let mut cfg = Config::default();
    cfg.ic_entries = 100;
    let shade = Shade::with_config(cfg);
    assert_eq!(shade.config().ic_entries, 32);
}

#[test]
fn trust_threshold_is_runtime_settable() {
    let shade = Shade::new();
    assert_eq!(shade.get_trust_threshold(), 1);
    shade.set_trust_threshold(-1);
    assert_eq!(shade.get_trust_threshold(), -1);
    shade.set_trust_threshold(10);
    assert_eq!(shade.get_trust_threshold(), 10);
}

#[test]
fn fresh_engine_is_idle() {
    let shade = Shade::new();
    assert!(!shade.is_following_me());
    assert!(!shade.garbage_collect());
    assert!(shade.stats(0xFFFF_FFFF).is_none());
}
