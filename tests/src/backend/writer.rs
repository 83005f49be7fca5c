//! Byte-exact checks for the machine-code writer, plus a few
//! execution tests of composite sequences.

use shade_backend::regs::Reg;
use shade_backend::writer::{ArithOp, Cc, CodeWriter};

use crate::tools::ExecBuf;

fn emit(f: impl FnOnce(&mut CodeWriter)) -> Vec<u8> {
    let mut buf = vec![0u8; 256];
    // SAFETY: writing into a local buffer.
    let mut w = unsafe { CodeWriter::new(buf.as_mut_ptr(), buf.len()) };
    f(&mut w);
    w.flush();
    let n = w.offset();
    buf.truncate(n);
    buf
}

#[test]
fn push_pop_encodings() {
    assert_eq!(emit(|w| w.emit_push(Reg::Rax)), [0x50]);
    assert_eq!(emit(|w| w.emit_push(Reg::R8)), [0x41, 0x50]);
    assert_eq!(emit(|w| w.emit_pop(Reg::Rcx)), [0x59]);
    assert_eq!(emit(|w| w.emit_pop(Reg::R15)), [0x41, 0x5F]);
}

#[test]
fn mov_reg_reg() {
    // mov rax, rcx
    assert_eq!(emit(|w| w.emit_mov_rr(Reg::Rax, Reg::Rcx)), [0x48, 0x89, 0xC8]);
    // mov r8, rsp
    assert_eq!(emit(|w| w.emit_mov_rr(Reg::R8, Reg::Rsp)), [0x49, 0x89, 0xE0]);
}

#[test]
fn mov_imm_forms() {
    // Zero: xor r32, r32.
    assert_eq!(emit(|w| w.emit_mov_ri(Reg::Rax, 0)), [0x31, 0xC0]);
    // 32-bit: plain mov r32, imm32 (implicit zero extension).
    assert_eq!(
        emit(|w| w.emit_mov_ri(Reg::Rcx, 0x1234)),
        [0xB9, 0x34, 0x12, 0x00, 0x00]
    );
    // Full 64-bit form.
    assert_eq!(
        emit(|w| w.emit_mov_ri(Reg::Rax, 0x1122_3344_5566_7788)),
        [0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
    );
}

#[test]
fn load_store_special_bases() {
    // rbp base always needs a disp8.
    assert_eq!(
        emit(|w| w.emit_load(Reg::Rax, Reg::Rbp, 0)),
        [0x48, 0x8B, 0x45, 0x00]
    );
    // rsp base always needs a SIB byte.
    assert_eq!(
        emit(|w| w.emit_load(Reg::Rax, Reg::Rsp, 8)),
        [0x48, 0x8B, 0x44, 0x24, 0x08]
    );
    assert_eq!(
        emit(|w| w.emit_store(Reg::Rsp, 32, Reg::Rdx)),
        [0x48, 0x89, 0x54, 0x24, 0x20]
    );
}

#[test]
fn lea_red_zone_skip() {
    // The canonical red-zone hop: lea rsp, [rsp - 128].
    assert_eq!(
        emit(|w| w.emit_lea(Reg::Rsp, Reg::Rsp, -128)),
        [0x48, 0x8D, 0x64, 0x24, 0x80]
    );
}

#[test]
fn arith_imm8_vs_imm32() {
    assert_eq!(
        emit(|w| w.emit_arith_ri(ArithOp::And, Reg::Rsp, -16)),
        [0x48, 0x83, 0xE4, 0xF0]
    );
    assert_eq!(
        emit(|w| w.emit_arith_ri(ArithOp::Sub, Reg::Rsp, 512)),
        [0x48, 0x81, 0xEC, 0x00, 0x02, 0x00, 0x00]
    );
}

#[test]
fn flags_and_traps() {
    assert_eq!(emit(|w| w.emit_pushfq()), [0x9C]);
    assert_eq!(emit(|w| w.emit_popfq()), [0x9D]);
    assert_eq!(emit(|w| w.emit_ret()), [0xC3]);
    assert_eq!(emit(|w| w.emit_int3()), [0xCC]);
    assert_eq!(emit(|w| w.emit_ud2()), [0x0F, 0x0B]);
}

#[test]
fn absolute_jump_thunk() {
    let bytes = emit(|w| w.emit_jmp_abs(0x1122_3344_5566_7788));
    assert_eq!(&bytes[..6], [0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(
        u64::from_le_bytes(bytes[6..14].try_into().unwrap()),
        0x1122_3344_5566_7788
    );
}

#[test]
fn label_fixups_resolve() {
    let bytes = emit(|w| {
        let skip = w.new_label();
        w.emit_jmp_label(skip);
        w.emit_int3();
        w.bind(skip);
        w.emit_ret();
    });
    // jmp rel32 over one int3: displacement 1.
    assert_eq!(bytes, [0xE9, 0x01, 0x00, 0x00, 0x00, 0xCC, 0xC3]);
}

#[test]
fn jcc_label_and_invert() {
    assert_eq!(Cc::E.invert(), Cc::Ne);
    assert_eq!(Cc::B.invert(), Cc::Ae);
    let bytes = emit(|w| {
        let l = w.new_label();
        w.emit_jcc_label(Cc::Ne, l);
        w.bind(l);
        w.emit_ret();
    });
    assert_eq!(bytes, [0x0F, 0x85, 0x00, 0x00, 0x00, 0x00, 0xC3]);
}

#[test]
#[should_panic(expected = "unresolved label")]
fn unbound_label_panics() {
    let mut buf = vec![0u8; 64];
    let mut w = unsafe { CodeWriter::new(buf.as_mut_ptr(), buf.len()) };
    let l = w.new_label();
    w.emit_jmp_label(l);
    w.flush();
}

#[test]
fn exec_push_imm64_roundtrip() {
    let buf = ExecBuf::new(4096);
    let mut w = buf.writer();
    w.emit_push_imm64(0xDEAD_BEEF_CAFE_F00D);
    w.emit_pop(Reg::Rax);
    w.emit_ret();
    w.flush();
    // SAFETY: just-emitted code with a C-compatible tail.
    let got = unsafe { buf.call(0) };
    assert_eq!(got, 0xDEAD_BEEF_CAFE_F00D);
}

#[test]
fn exec_rip_relative_load() {
    let buf = ExecBuf::new(4096);
    let mut w = buf.writer();
    // Inline datum first, entry point after it.
    let cell = w.pc();
    w.emit_u64(0x4242_4242_1111_2222);
    let entry = w.offset();
    w.emit_load_rip(Reg::Rax, cell);
    w.emit_ret();
    w.flush();
    let got = unsafe { buf.call(entry) };
    assert_eq!(got, 0x4242_4242_1111_2222);
}

#[test]
fn exec_sib_addressing() {
    let buf = ExecBuf::new(4096);
    let table: [u64; 4] = [10, 20, 30, 40];
    let mut w = buf.writer();
    // rax = table[2] via [base + index*8]
    w.emit_mov_ri(Reg::Rcx, table.as_ptr() as u64);
    w.emit_mov_ri(Reg::Rdx, 2);
    w.emit_load_sib(Reg::Rax, Reg::Rcx, Reg::Rdx, 3, 0);
    w.emit_ret();
    w.flush();
    let got = unsafe { buf.call(0) };
    assert_eq!(got, 30);
}
