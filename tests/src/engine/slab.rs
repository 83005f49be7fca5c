//! Slab allocator: near placement, bump allocation, W^X transitions.

use shade_engine::slab::{freeze, thaw, AddressSpec, CodeSlab, DataSlab, Mapping};

fn anchor() -> u64 {
    // Any address inside our own text section.
    anchor as usize as u64
}

#[test]
fn near_allocation_respects_distance() {
    let spec = AddressSpec::near(anchor());
    let m = Mapping::allocate_near(&spec, 64 * 1024, true).expect("near allocation");
    let base = m.base() as u64;
    let lo = base.min(spec.near);
    let hi = (base + m.size() as u64).max(spec.near);
    assert!(hi - lo <= spec.max_distance, "slab out of rel32 reach");
    assert!(m.size() >= 64 * 1024);
}

#[test]
fn mapping_is_writable_and_bump_allocates() {
    let spec = AddressSpec::near(anchor());
    let m = Mapping::allocate_near(&spec, 16 * 1024, true).expect("alloc");
    let cells = Mapping::allocate_near(&AddressSpec::near(m.base() as u64), 4096, false)
        .expect("cells alloc");
    let rwx = m.rwx;
    let mut slab = CodeSlab::new(m, cells);

    // Thaw covers the pre-freeze case on W^X hosts.
    thaw(slab.mem.base() as u64, 64, rwx).unwrap();
    let p = slab.reserve(64).expect("reserve");
    // SAFETY: freshly reserved writable slab bytes.
    unsafe {
        p.write(0xCC);
        assert_eq!(p.read(), 0xCC);
    }
    freeze(slab.mem.base() as u64, 64, rwx).unwrap();

    let before = slab.remaining();
    slab.reserve(100).unwrap();
    assert_eq!(slab.remaining(), before - 100);
    assert!(slab.contains(slab.cursor_ptr() as u64 - 1));
}

#[test]
fn slab_refuses_overcommit() {
    let spec = AddressSpec::near(anchor());
    let m = Mapping::allocate_near(&spec, 4096, true).expect("alloc");
    let cells = Mapping::allocate_near(&AddressSpec::near(m.base() as u64), 4096, false)
        .expect("cells alloc");
    let mut slab = CodeSlab::new(m, cells);
    assert!(slab.reserve(8192).is_none());
    assert!(slab.reserve(4096).is_some());
    assert!(slab.reserve(1).is_none());
}

#[test]
fn data_slab_alignment() {
    let spec = AddressSpec::near(anchor());
    let m = Mapping::allocate_near(&spec, 4096, false).expect("alloc");
    let mut data = DataSlab::new(m);
    let _ = data.reserve(3, 1).unwrap();
    let p = data.reserve(16, 16).unwrap();
    assert_eq!(p as usize & 15, 0);
    let q = data.reserve(8, 8).unwrap();
    assert_eq!(q as usize & 7, 0);
    assert!(data.remaining() < 4096);
}
