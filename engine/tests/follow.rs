//! End-to-end scenarios: follow a real thread through hand-assembled
//! guest code and observe events, caching, backpatching, exclusion,
//! probes, callouts, invalidation and teardown.
//!
//! The asm driver below is the only code that runs between
//! `follow_me` and the guest: every instruction in it is within the
//! engine's vocabulary, so the whole excursion is decodable.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shade_backend::insn::InsnKind;
use shade_backend::regs::Reg;
use shade_backend::writer::{ArithOp, Cc, CodeWriter};
use shade_core::{CountingObserver, Event, EventMask, EventSink, GateKind, NullSink, VecSink};
use shade_engine::slab::{freeze, AddressSpec, Mapping};
use shade_engine::{Config, DefaultTransformer, FnTransformer, FollowArgs, Shade, Transformer};

// ── Test driver ─────────────────────────────────────────────
//
//   rdi = engine, rsi = follow args, rdx = guest fn, rcx = guest arg
//
// After the call to shade_follow_me_raw returns, this code executes
// out of the translated cache; the call to shade_unfollow_me_raw is
// recognized by the dispatcher and transitions back to native.
core::arch::global_asm!(
    ".text",
    ".balign 16",
    ".globl shade_test_drive",
    "shade_test_drive:",
    "push rbx",
    "push r12",
    "push r13",
    "mov rbx, rdx",
    "mov r12, rdi",
    "mov r13, rcx",
    "call shade_follow_me_raw",
    "mov rdi, r13",
    "call rbx",
    "mov rbx, rax",
    "mov rdi, r12",
    "call shade_unfollow_me_raw",
    "mov rax, rbx",
    "pop r13",
    "pop r12",
    "pop rbx",
    "ret",
);

extern "C" {
    fn shade_test_drive(shade: *const Shade, args: *mut FollowArgs, guest: u64, arg: u64) -> u64;
}

fn drive(
    shade: &Shade,
    transformer: Box<dyn Transformer>,
    sink: Box<dyn EventSink>,
    guest: u64,
    arg: u64,
) -> u64 {
    let args = Box::into_raw(FollowArgs::new(transformer, sink));
    // SAFETY: the driver asm only uses instructions the engine
    // decodes, and unfollows before returning.
    unsafe { shade_test_drive(shade as *const Shade, args, guest, arg) }
}

// ── Guest code buffers ──────────────────────────────────────

struct GuestBuf {
    base: *mut u8,
    size: usize,
}

// SAFETY: base points to an anonymous mmap'd region used only as guest
// code/data; tests share it across threads via Arc<GuestBuf>.
unsafe impl Send for GuestBuf {}
unsafe impl Sync for GuestBuf {}

impl GuestBuf {
    fn new(size: usize) -> Self {
        // SAFETY: anonymous RWX mapping for hand-assembled guests.
        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert!(base != libc::MAP_FAILED);
        Self {
            base: base as *mut u8,
            size,
        }
    }

    fn addr(&self) -> u64 {
        self.base as u64
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.addr() && addr < self.addr() + self.size as u64
    }

    fn writer(&self) -> CodeWriter {
        // SAFETY: RWX mapping owned by this buffer.
        unsafe { CodeWriter::new(self.base, self.size) }
    }
}

impl Drop for GuestBuf {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

/// fn() -> u64 returning 1 with three known instruction addresses:
/// `mov eax, 1; mov ebx, 2; ret`.
fn build_straight_line(buf: &GuestBuf) -> [u64; 3] {
    let mut w = buf.writer();
    let a0 = w.pc();
    w.emit_bytes(&[0xB8, 0x01, 0x00, 0x00, 0x00]); // mov eax, 1
    let a1 = w.pc();
    w.emit_bytes(&[0xBB, 0x02, 0x00, 0x00, 0x00]); // mov ebx, 2
    let a2 = w.pc();
    w.emit_ret();
    w.flush();
    [a0, a1, a2]
}

/// fn(iterations) -> iterations, as a counted loop:
///   xor rax; mov rcx, rdi; head: add rax,1; sub rcx,1; jne head; ret
fn build_counting_loop(buf: &GuestBuf) -> u64 {
    let mut w = buf.writer();
    let entry = w.pc();
    w.emit_mov_ri(Reg::Rax, 0);
    w.emit_mov_rr(Reg::Rcx, Reg::Rdi);
    let head = w.new_label();
    w.bind(head);
    w.emit_arith_ri(ArithOp::Add, Reg::Rax, 1);
    w.emit_arith_ri(ArithOp::Sub, Reg::Rcx, 1);
    w.emit_jcc_label(Cc::Ne, head);
    w.emit_ret();
    w.flush();
    entry
}

// ── ES1: straight line ──────────────────────────────────────

#[test]
fn straight_line_exec_events() {
    let shade = Shade::new();
    let guest = GuestBuf::new(4096);
    let pcs = build_straight_line(&guest);

    let sink = VecSink::new(EventMask::EXEC);
    let log = sink.events();

    let ret = drive(
        &shade,
        Box::new(DefaultTransformer),
        Box::new(sink),
        pcs[0],
        0,
    );
    assert_eq!(ret, 1, "guest return value must be preserved");
    assert!(!shade.is_following_me());

    let events = log.lock().unwrap();
    let guest_pcs: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            Event::Exec { location } if guest.contains(*location) => Some(*location),
            _ => None,
        })
        .collect();
    assert_eq!(guest_pcs, pcs, "one EXEC per guest instruction, in order");

    assert!(!shade.garbage_collect());
}

// ── ES2: loop recycle ───────────────────────────────────────

#[test]
fn loop_compiles_once_and_recycles() {
    let shade = Shade::new();
    let guest = GuestBuf::new(4096);
    let entry = build_counting_loop(&guest);
    let tid = shade_engine::os::gettid();

    let ret = drive(
        &shade,
        Box::new(DefaultTransformer),
        Box::new(NullSink),
        entry,
        1000,
    );
    assert_eq!(ret, 1000);

    let stats = shade.stats(tid).expect("context still listed before GC");
    // Driver block + guest entry + loop head + exit: compilation does
    // not scale with iteration count.
    assert!(
        stats.blocks_compiled <= 8,
        "expected a handful of compiles, got {}",
        stats.blocks_compiled
    );
    assert!(stats.blocks_recycled >= 1, "loop head must be recycled");
    assert!(
        stats.static_backpatches >= 1,
        "hot loop edges must be patched to direct jumps"
    );
    shade.garbage_collect();
}

// ── ES3: indirect-call inline cache ─────────────────────────

/// fn(table) -> sum over 300 calls of call [r8 + rcx*8] cycling
/// three targets.
fn build_table_dispatcher(buf: &GuestBuf) -> (u64, [u64; 3], usize) {
    let mut w = buf.writer();
    let t0 = w.pc();
    w.emit_arith_ri(ArithOp::Add, Reg::Rax, 1);
    w.emit_ret();
    let t1 = w.pc();
    w.emit_arith_ri(ArithOp::Add, Reg::Rax, 3);
    w.emit_ret();
    let t2 = w.pc();
    w.emit_arith_ri(ArithOp::Add, Reg::Rax, 5);
    w.emit_ret();

    let entry = w.pc();
    w.emit_mov_rr(Reg::R8, Reg::Rdi);
    w.emit_mov_ri(Reg::Rcx, 0);
    w.emit_mov_ri(Reg::Rax, 0);
    w.emit_mov_ri(Reg::R9, 300);
    let head = w.new_label();
    // Terminate the setup block here so the indirect call below lives
    // in exactly one translated block (and thus one inline cache).
    w.emit_jmp_label(head);
    w.bind(head);
    w.emit_bytes(&[0x41, 0xFF, 0x14, 0xC8]); // call [r8 + rcx*8]
    w.emit_arith_ri(ArithOp::Add, Reg::Rcx, 1);
    w.emit_arith_ri(ArithOp::Cmp, Reg::Rcx, 3);
    let no_reset = w.new_label();
    w.emit_jcc_label(Cc::Ne, no_reset);
    w.emit_mov_ri(Reg::Rcx, 0);
    w.bind(no_reset);
    w.emit_arith_ri(ArithOp::Sub, Reg::R9, 1);
    w.emit_jcc_label(Cc::Ne, head);
    w.emit_ret();
    w.flush();
    (entry, [t0, t1, t2], 300)
}

#[test]
fn indirect_call_warms_inline_cache() {
    let mut cfg = Config::default();
    cfg.ic_entries = 4;
    let shade = Shade::with_config(cfg);
    let observer = Arc::new(CountingObserver::new());
    shade.set_observer(observer.clone());

    let guest = GuestBuf::new(4096);
    let (entry, _targets, calls) = build_table_dispatcher(&guest);
    let table: Box<[u64; 3]> = Box::new([_targets[0], _targets[1], _targets[2]]);

    let ret = drive(
        &shade,
        Box::new(DefaultTransformer),
        Box::new(NullSink),
        entry,
        table.as_ptr() as u64,
    );
    // 100 rounds of (+1 +3 +5).
    assert_eq!(ret, (calls as u64 / 3) * 9);

    // After warmup every dispatch resolves inside the inline cache:
    // the call_mem gate fires exactly once per distinct target.
    assert_eq!(observer.count(GateKind::CallMem), 3);
    assert!(observer.total() >= 3);
    shade.garbage_collect();
}

// ── ES4 mechanics: distrust forces retranslation ────────────

#[test]
fn negative_trust_recompiles_every_entry() {
    let mut cfg = Config::default();
    cfg.trust_threshold = -1;
    let shade = Shade::with_config(cfg);
    let guest = GuestBuf::new(4096);
    let entry = build_counting_loop(&guest);
    let tid = shade_engine::os::gettid();

    let iterations = 5;
    let ret = drive(
        &shade,
        Box::new(DefaultTransformer),
        Box::new(NullSink),
        entry,
        iterations,
    );
    assert_eq!(ret, iterations);

    let stats = shade.stats(tid).unwrap();
    // Every re-entry of the loop head re-translates: compiles scale
    // with iterations instead of block count, and nothing is ever
    // backpatched.
    assert!(
        stats.blocks_compiled as u64 >= iterations,
        "expected per-entry recompilation, got {}",
        stats.blocks_compiled
    );
    assert_eq!(stats.static_backpatches, 0);
    shade.garbage_collect();
}

// ── ES5: excluded range ─────────────────────────────────────

static NATIVE_CALLS: AtomicU64 = AtomicU64::new(0);

#[no_mangle]
extern "C" fn shade_test_native_helper() -> u64 {
    NATIVE_CALLS.fetch_add(1, Ordering::SeqCst);
    1234
}

#[test]
fn excluded_call_runs_native_and_reenters() {
    let shade = Shade::new();
    let helper = shade_test_native_helper as usize as u64;

    // The guest must sit within rel32 reach of the helper so the call
    // can be a direct one (exclusion is decided at compile time for
    // direct targets).
    let spec = AddressSpec::near(helper);
    let mem = Mapping::allocate_near(&spec, 4096, true).expect("near guest");
    let entry = mem.base() as u64;
    {
        // SAFETY: fresh writable mapping.
        let mut w = unsafe { CodeWriter::new(mem.base(), 4096) };
        w.emit_call_addr(helper); // E8 rel32, target excluded
        w.emit_arith_ri(ArithOp::Add, Reg::Rax, 7);
        w.emit_ret();
        w.flush();
        freeze(entry, w.offset(), mem.rwx).unwrap();
    }

    let sink = VecSink::new(EventMask::EXEC);
    let log = sink.events();

    NATIVE_CALLS.store(0, Ordering::SeqCst);
    let ret = drive(&shade, Box::new(DefaultTransformer), Box::new(sink), entry, 0);
    assert_eq!(ret, 1234 + 7, "guest resumed in translated code after the call");
    assert_eq!(NATIVE_CALLS.load(Ordering::SeqCst), 1);

    // No instruction inside the excluded callee was instrumented.
    let events = log.lock().unwrap();
    assert!(events.iter().all(|e| match e {
        Event::Exec { location } => *location < helper || *location >= helper + 64,
        _ => true,
    }));
    shade.garbage_collect();
}

// ── Callouts ────────────────────────────────────────────────

#[test]
fn callout_sees_and_mutates_cpu_context() {
    let shade = Shade::new();
    let guest = GuestBuf::new(4096);
    let pcs = build_straight_line(&guest);

    let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in = seen.clone();

    let ret_pc = pcs[2];
    let transformer = FnTransformer(move |it: &mut shade_engine::BlockIterator<'_>| {
        while let Some(insn) = it.next() {
            let is_ret = matches!(insn.kind, InsnKind::Ret { .. }) && insn.address == ret_pc;
            if is_ret {
                let seen = seen_in.clone();
                it.put_callout(Box::new(move |cpu| {
                    seen.lock().unwrap().push(cpu.rax);
                    cpu.rax = 99;
                }));
            }
            it.keep();
        }
    });

    let ret = drive(&shade, Box::new(transformer), Box::new(NullSink), pcs[0], 0);
    assert_eq!(ret, 99, "callout mutation must be restored into the thread");
    assert_eq!(*seen.lock().unwrap(), vec![1], "callout saw rax after mov eax, 1");
    shade.garbage_collect();
}

// ── Call probes ─────────────────────────────────────────────

#[test]
fn call_probe_fires_with_details() {
    let shade = Shade::new();
    let guest = GuestBuf::new(4096);

    // inner: mov eax, 7; ret     outer: call inner; add rax, 1; ret
    let mut w = guest.writer();
    let inner = w.pc();
    w.emit_bytes(&[0xB8, 0x07, 0x00, 0x00, 0x00]);
    w.emit_ret();
    let outer = w.pc();
    w.emit_call_addr(inner);
    let after_call = w.pc();
    w.emit_arith_ri(ArithOp::Add, Reg::Rax, 1);
    w.emit_ret();
    w.flush();

    let hits: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let hits_in = hits.clone();
    let id = shade.add_call_probe(
        inner,
        Box::new(move |details| {
            hits_in
                .lock()
                .unwrap()
                .push((details.target, details.return_address));
        }),
    );

    let ret = drive(&shade, Box::new(DefaultTransformer), Box::new(NullSink), outer, 0);
    assert_eq!(ret, 8);

    let recorded = hits.lock().unwrap().clone();
    assert_eq!(recorded, vec![(inner, after_call)]);

    shade.remove_call_probe(id);
    shade.garbage_collect();
}

// ── Invalidation from a callout (in-place trampoline) ───────

#[test]
fn invalidate_recompiles_running_loop() {
    let shade = Shade::new();
    let guest = GuestBuf::new(4096);
    let entry = build_counting_loop(&guest);
    // Loop head starts after `xor eax,eax` (2 bytes) + `mov rcx,rdi`
    // (3 bytes).
    let head = entry + 5;
    let tid = shade_engine::os::gettid();

    let shade2 = shade.clone();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_in = fired.clone();

    let transformer = FnTransformer(move |it: &mut shade_engine::BlockIterator<'_>| {
        while let Some(insn) = it.next() {
            let at_head = insn.address == head;
            if at_head {
                let shade = shade2.clone();
                let fired = fired_in.clone();
                it.put_callout(Box::new(move |_cpu| {
                    if fired.fetch_add(1, Ordering::SeqCst) == 2 {
                        shade.invalidate(head);
                    }
                }));
            }
            it.keep();
        }
    });

    let iterations = 50;
    let ret = drive(&shade, Box::new(transformer), Box::new(NullSink), entry, iterations);
    assert_eq!(ret, iterations, "loop survives mid-flight invalidation");
    assert!(fired.load(Ordering::SeqCst) as u64 >= iterations);

    let stats = shade.stats(tid).unwrap();
    assert!(
        stats.blocks_compiled >= 4,
        "invalidation must have forced a recompile"
    );
    shade.garbage_collect();
}

// ── Deactivation makes instrumentation inert ────────────────

#[test]
fn deactivate_stops_event_delivery() {
    let shade = Shade::new();
    let guest = GuestBuf::new(4096);
    let entry = build_counting_loop(&guest);
    let head = entry + 5;

    let sink = VecSink::new(EventMask::EXEC);
    let log = sink.events();

    let shade2 = shade.clone();
    let iter = Arc::new(AtomicUsize::new(0));
    let iter_in = iter.clone();
    let transformer = FnTransformer(move |it: &mut shade_engine::BlockIterator<'_>| {
        while let Some(insn) = it.next() {
            if insn.address == head {
                let shade = shade2.clone();
                let iter = iter_in.clone();
                it.put_callout(Box::new(move |_cpu| {
                    if iter.fetch_add(1, Ordering::SeqCst) == 3 {
                        shade.deactivate();
                    }
                }));
            }
            it.keep();
        }
    });

    let iterations = 100;
    let ret = drive(&shade, Box::new(transformer), Box::new(sink), entry, iterations);
    assert_eq!(ret, iterations);

    let exec_in_guest = log
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, Event::Exec { location } if guest.contains(*location)))
        .count();
    // Events flow for the first few iterations only; the remaining
    // ~96 iterations of 3 instructions stay silent.
    assert!(exec_in_guest > 0);
    assert!(
        exec_in_guest < 3 * iterations as usize / 2,
        "deactivate must stop event delivery, saw {exec_in_guest}"
    );
    shade.garbage_collect();
}

// ── Transformer stopping early: continuation chaining ───────

#[test]
fn single_instruction_blocks_chain_seamlessly() {
    // Self-exclusion off: the driver's own instructions then chain
    // through continuations as well, and the unfollow call is caught
    // by the dispatcher's known-address check instead of the excluded
    // fast path.
    let mut cfg = Config::default();
    cfg.exclude_self = false;
    let shade = Shade::with_config(cfg);
    let guest = GuestBuf::new(4096);
    let pcs = build_straight_line(&guest);
    let tid = shade_engine::os::gettid();

    // Keep exactly one instruction per block; everything else flows
    // through out-of-space style continuations.
    let transformer = FnTransformer(|it: &mut shade_engine::BlockIterator<'_>| {
        if it.next().is_some() {
            it.keep();
        }
    });

    let ret = drive(&shade, Box::new(transformer), Box::new(NullSink), pcs[0], 0);
    assert_eq!(ret, 1);

    let stats = shade.stats(tid).unwrap();
    assert!(
        stats.blocks_compiled >= 6,
        "one block per instruction, got {}",
        stats.blocks_compiled
    );
    shade.garbage_collect();
}

// ── Cooperative unfollow of another thread ──────────────────

#[test]
fn unfollow_tid_takes_effect_at_event_site() {
    let shade = Arc::new(Shade::new());
    let guest = Arc::new(GuestBuf::new(4096));
    let entry = build_counting_loop(&guest);

    let (tid_tx, tid_rx) = std::sync::mpsc::channel();
    let shade2 = shade.clone();
    let guest2 = guest.clone();

    let sink = VecSink::new(EventMask::EXEC);
    let log = sink.events();

    let handle = std::thread::spawn(move || {
        tid_tx.send(shade_engine::os::gettid()).unwrap();
        let _ = &guest2;
        drive(
            &shade2,
            Box::new(DefaultTransformer),
            Box::new(sink),
            entry,
            2_000_000,
        )
    });

    let tid = tid_rx.recv().unwrap();
    std::thread::sleep(Duration::from_millis(5));
    // The loop polls for unfollow at every EXEC site.
    let _ = shade.unfollow(tid);

    let ret = handle.join().unwrap();
    assert_eq!(ret, 2_000_000, "loop completes natively after unfollow");

    let exec_count = log.lock().unwrap().len();
    assert!(
        exec_count < 3 * 2_000_000,
        "instrumentation must have stopped early"
    );

    for _ in 0..100 {
        if !shade.garbage_collect() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ── GC grace period ─────────────────────────────────────────

#[test]
fn gc_waits_out_the_grace_period() {
    let mut cfg = Config::default();
    cfg.teardown_grace = Duration::from_millis(200);
    let shade = Arc::new(Shade::with_config(cfg));
    let guest = Arc::new(GuestBuf::new(4096));
    let pcs = build_straight_line(&guest);

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let (quit_tx, quit_rx) = std::sync::mpsc::channel::<()>();
    let shade2 = shade.clone();
    let guest2 = guest.clone();
    let handle = std::thread::spawn(move || {
        let _ = &guest2;
        let tid = shade_engine::os::gettid();
        let r = drive(
            &shade2,
            Box::new(DefaultTransformer),
            Box::new(NullSink),
            pcs[0],
            0,
        );
        done_tx.send((tid, r)).unwrap();
        // Stay alive so only the grace clock can free the context.
        let _ = quit_rx.recv();
    });

    let (tid, r) = done_rx.recv().unwrap();
    assert_eq!(r, 1);

    // Context is destroy-pending, thread alive, grace not elapsed:
    // the collector must hold on to it.
    assert!(shade.garbage_collect(), "context must linger inside grace");
    assert!(shade.stats(tid).is_some());

    std::thread::sleep(Duration::from_millis(250));
    assert!(!shade.garbage_collect(), "grace elapsed, context collected");
    assert!(shade.stats(tid).is_none());

    quit_tx.send(()).unwrap();
    handle.join().unwrap();
}

// ── ES6: concurrent followers + cross-thread invalidate ─────

#[test]
fn concurrent_loops_survive_invalidation() {
    let shade = Arc::new(Shade::new());
    let guest = Arc::new(GuestBuf::new(4096));
    let entry = build_counting_loop(&guest);
    let head = entry + 5;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let shade = shade.clone();
        let guest = guest.clone();
        handles.push(std::thread::spawn(move || {
            let _ = &guest;
            drive(
                &shade,
                Box::new(DefaultTransformer),
                Box::new(NullSink),
                entry,
                3_000_000,
            )
        }));
    }

    // Hammer both contexts with invalidations while they run.
    for _ in 0..20 {
        std::thread::sleep(Duration::from_millis(1));
        shade.invalidate(entry);
        shade.invalidate(head);
    }

    for h in handles {
        assert_eq!(h.join().unwrap(), 3_000_000);
    }
    shade.stop();
}

// ── stop() drains everything ────────────────────────────────

#[test]
fn stop_unfollows_and_collects() {
    let shade = Shade::new();
    let guest = GuestBuf::new(4096);
    let pcs = build_straight_line(&guest);
    let _ = drive(
        &shade,
        Box::new(DefaultTransformer),
        Box::new(NullSink),
        pcs[0],
        0,
    );
    shade.stop();
    assert!(!shade.garbage_collect());
}
