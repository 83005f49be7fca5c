//! Static and inline-cache backpatching.
//!
//! Direct sites carry a patchable `jmp rel32` whose displacement
//! operand is 4-byte aligned: installing or removing an edge is a
//! single atomic store, so a thread racing through the site never sees
//! a torn instruction. Indirect sites get their inline cache populated
//! one entry at a time, translated address first.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use shade_core::{Backpatch, BackpatchKind, BACKPATCH_VERSION};

use crate::block::{ExecBlock, TransferSite};
use crate::ctx::{state, CtxInner, ExecCtx};
use crate::slab::{freeze, thaw};
use crate::EngineInner;

/// Atomically point a site's patchable jump at `target`, or back at
/// its own slow-path body when `target` is the body address.
fn store_jmp_disp(jmp_addr: u64, target: u64) {
    let operand = jmp_addr + 1;
    debug_assert_eq!(operand & 3, 0, "patchable jmp operand misaligned");
    let disp = target as i64 - (jmp_addr as i64 + 5);
    assert!(
        (i32::MIN as i64..=i32::MAX as i64).contains(&disp),
        "backpatch displacement out of range"
    );
    // SAFETY: operand lies inside a live code slab and is aligned.
    let cell = unsafe { &*(operand as *const AtomicU32) };
    cell.store(disp as u32, Ordering::Release);
}

/// Install the resolved edge for a slow-path dispatch, when allowed.
pub(crate) fn maybe_backpatch(
    ctx: &ExecCtx,
    engine: &EngineInner,
    inner: &mut CtxInner,
    site: *mut TransferSite,
    block: *mut ExecBlock,
    guest_target: u64,
) {
    // SAFETY: sites and blocks are arena-allocated, code lock held.
    let site = unsafe { &mut *site };
    let blk = unsafe { &*block };

    if site.is_static() {
        let trust = engine.trust_threshold();
        if ctx.run_state() != state::ACTIVE
            || blk.flags.contains(crate::block::BlockFlags::ACTIVATION_TARGET)
            || trust < 0
            || blk.recycle_count < trust as u32
        {
            return;
        }
        let rwx = slab_rwx(inner, site.jmp_addr);
        let _ = thaw(site.jmp_addr + 1, 4, rwx);
        store_jmp_disp(site.jmp_addr, blk.code_start);
        let _ = freeze(site.jmp_addr + 1, 4, rwx);

        inner
            .incoming
            .entry(guest_target)
            .or_default()
            .push(site as *mut TransferSite);
        inner.stats.static_backpatches += 1;

        notify(engine, site, BackpatchKind::Static, guest_target, site.jmp_addr);
        log::debug!(
            "static backpatch {:?} at {:#x} -> {:#x}",
            site.kind,
            site.jmp_addr,
            blk.code_start
        );
    } else {
        ic_backpatch(engine, inner, site, guest_target, blk.code_start);
    }
}

/// Populate the first empty inline-cache entry. Idempotent when the
/// target is already cached; a full cache stays as it is.
pub(crate) fn ic_backpatch(
    engine: &EngineInner,
    inner: &mut CtxInner,
    site: &mut TransferSite,
    guest_target: u64,
    code: u64,
) {
    if site.ic_data == 0 {
        return;
    }
    let entries = site.ic_entries();
    if entries.iter().any(|e| e.guest == guest_target) {
        return;
    }
    let Some(slot) = entries.iter_mut().find(|e| e.guest == 0) else {
        return;
    };

    let slot_addr = slot as *const _ as u64;
    let rwx = slab_rwx(inner, slot_addr);
    let _ = thaw(slot_addr, 16, rwx);
    // Translated address first: an entry is only live once its guest
    // key is published.
    // SAFETY: entry memory is 8-aligned inside a live code slab.
    unsafe {
        (*(slot_addr as *const AtomicU64).add(1)).store(code, Ordering::Release);
        (*(slot_addr as *const AtomicU64)).store(guest_target, Ordering::Release);
    }
    let _ = freeze(slot_addr, 16, rwx);

    inner
        .ic_refs
        .entry(guest_target)
        .or_default()
        .push(slot as *mut _);
    inner.stats.ic_backpatches += 1;

    notify(engine, site, BackpatchKind::InlineCache, guest_target, site.ic_data);
    log::debug!("ic backpatch {guest_target:#x} -> {code:#x}");
}

fn notify(engine: &EngineInner, site: &TransferSite, kind: BackpatchKind, target: u64, at: u64) {
    if let Some(obs) = engine.observer() {
        // SAFETY: owning block outlives the site.
        let owner = unsafe { &*site.block };
        let patch = Backpatch {
            version: BACKPATCH_VERSION,
            kind,
            block_start: owner.real_start,
            site_offset: (at - owner.code_start) as u32,
            target,
        };
        obs.notify_backpatch(&patch);
    }
}

fn slab_rwx(inner: &CtxInner, addr: u64) -> bool {
    inner
        .slabs
        .iter()
        .find(|s| s.contains(addr))
        .map(|s| s.mem.rwx)
        .unwrap_or(true)
}

/// Unlink every edge resolving to `guest_start`: patched jumps fall
/// back to their slow-path bodies and inline-cache entries are
/// emptied (guest key first). Used by invalidation.
pub(crate) fn unlink_edges(inner: &mut CtxInner, guest_start: u64) {
    if let Some(sites) = inner.incoming.remove(&guest_start) {
        for site in sites {
            // SAFETY: arena-allocated site, code lock held.
            let site = unsafe { &*site };
            let rwx = slab_rwx(inner, site.jmp_addr);
            let _ = thaw(site.jmp_addr + 1, 4, rwx);
            store_jmp_disp(site.jmp_addr, site.body_addr);
            let _ = freeze(site.jmp_addr + 1, 4, rwx);
        }
    }
    if let Some(entries) = inner.ic_refs.remove(&guest_start) {
        for entry in entries {
            let addr = entry as u64;
            let rwx = slab_rwx(inner, addr);
            let _ = thaw(addr, 16, rwx);
            // SAFETY: as above; disable the key before the value.
            unsafe {
                (*(addr as *const AtomicU64)).store(0, Ordering::Release);
                (*(addr as *const AtomicU64).add(1)).store(0, Ordering::Release);
            }
            let _ = freeze(addr, 16, rwx);
        }
    }
}

/// Replay a captured backpatch descriptor into this context.
pub(crate) fn apply_prefetch(
    ctx: &ExecCtx,
    inner: &mut CtxInner,
    engine: &EngineInner,
    desc: &Backpatch,
) -> shade_core::Result<()> {
    if desc.version != BACKPATCH_VERSION {
        log::warn!("ignoring backpatch descriptor v{}", desc.version);
        return Ok(());
    }

    let owner = crate::gates::obtain_block(ctx, inner, engine, desc.block_start)?;
    let target = crate::gates::obtain_block(ctx, inner, engine, desc.target)?;
    // SAFETY: blocks just obtained under the code lock.
    let (owner_code, target_code) = unsafe { ((*owner).code_start, (*target).code_start) };
    let at = owner_code + desc.site_offset as u64;

    let Some(site) = inner
        .sites
        .iter()
        .copied()
        .find(|&s| unsafe { (*s).jmp_addr == at || (*s).ic_data == at })
    else {
        log::debug!("backpatch site {at:#x} not found in replayed block");
        return Ok(());
    };

    match desc.kind {
        BackpatchKind::Static => {
            let rwx = slab_rwx(inner, at);
            let _ = thaw(at + 1, 4, rwx);
            store_jmp_disp(at, target_code);
            let _ = freeze(at + 1, 4, rwx);
            inner.incoming.entry(desc.target).or_default().push(site);
            inner.stats.static_backpatches += 1;
        }
        BackpatchKind::InlineCache => {
            // SAFETY: site registered by this context.
            let site = unsafe { &mut *site };
            ic_backpatch(engine, inner, site, desc.target, target_code);
        }
    }
    Ok(())
}
