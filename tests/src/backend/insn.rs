//! Decoder coverage: lengths, classification and branch-target
//! extraction.

use shade_backend::insn::{decode, BranchTarget, InsnKind};
use shade_backend::regs::Reg;
use shade_backend::writer::Cc;

#[test]
fn ret_forms() {
    let i = decode(&[0xC3], 0x1000);
    assert_eq!(i.kind, InsnKind::Ret { pop: 0 });
    assert_eq!(i.len, 1);

    let i = decode(&[0xC2, 0x08, 0x00], 0x1000);
    assert_eq!(i.kind, InsnKind::Ret { pop: 8 });
    assert_eq!(i.len, 3);
}

#[test]
fn call_rel32_target_math() {
    // call +0x10 from 0x1000: target = 0x1000 + 5 + 0x10.
    let i = decode(&[0xE8, 0x10, 0x00, 0x00, 0x00], 0x1000);
    assert_eq!(i.kind, InsnKind::CallImm { target: 0x1015 });
    assert_eq!(i.len, 5);
}

#[test]
fn jmp_rel8_backwards() {
    // jmp -2: an infinite loop onto itself.
    let i = decode(&[0xEB, 0xFE], 0x2000);
    assert_eq!(i.kind, InsnKind::JmpImm { target: 0x2000 });
}

#[test]
fn jcc_short_and_near() {
    let i = decode(&[0x75, 0x10], 0x1000);
    assert_eq!(
        i.kind,
        InsnKind::Jcc {
            cc: Cc::Ne,
            target: 0x1012
        }
    );

    let i = decode(&[0x0F, 0x84, 0x00, 0x00, 0x00, 0x00], 0x2000);
    assert_eq!(
        i.kind,
        InsnKind::Jcc {
            cc: Cc::E,
            target: 0x2006
        }
    );
}

#[test]
fn jrcxz_and_loop() {
    let i = decode(&[0xE3, 0x05], 0x1000);
    assert_eq!(i.kind, InsnKind::Jcxz { target: 0x1007 });
    let i = decode(&[0xE2, 0xFB], 0x1000); // loop -5
    assert_eq!(i.kind, InsnKind::Jcxz { target: 0xFFD });
}

#[test]
fn indirect_call_register() {
    let i = decode(&[0xFF, 0xD0], 0x1000); // call rax
    assert_eq!(
        i.kind,
        InsnKind::CallInd {
            target: BranchTarget::Reg(Reg::Rax)
        }
    );

    let i = decode(&[0x41, 0xFF, 0xD0], 0x1000); // call r8
    assert_eq!(
        i.kind,
        InsnKind::CallInd {
            target: BranchTarget::Reg(Reg::R8)
        }
    );
}

#[test]
fn indirect_call_sib_memory() {
    // call [rax + rcx*8]
    let i = decode(&[0xFF, 0x14, 0xC8], 0x1000);
    match i.kind {
        InsnKind::CallInd {
            target: BranchTarget::Mem(m),
        } => {
            assert_eq!(m.base, Some(Reg::Rax));
            assert_eq!(m.index, Some(Reg::Rcx));
            assert_eq!(m.scale, 8);
            assert_eq!(m.disp, 0);
            assert!(!m.rip_relative);
        }
        other => panic!("unexpected kind {other:?}"),
    }
}

#[test]
fn indirect_jmp_rip_relative() {
    // jmp [rip + 0x20] at 0x4000; insn is 6 bytes.
    let i = decode(&[0xFF, 0x25, 0x20, 0x00, 0x00, 0x00], 0x4000);
    match i.kind {
        InsnKind::JmpInd {
            target: BranchTarget::Mem(m),
        } => {
            assert!(m.rip_relative);
            assert_eq!(m.rip_target(i.len), 0x4026);
        }
        other => panic!("unexpected kind {other:?}"),
    }
}

#[test]
fn rip_relative_load_geometry() {
    // mov rax, [rip + 0x100] at 0x5000 (7 bytes).
    let i = decode(&[0x48, 0x8B, 0x05, 0x00, 0x01, 0x00, 0x00], 0x5000);
    assert_eq!(i.kind, InsnKind::Other);
    let rip = i.rip_rel.expect("rip-relative geometry");
    assert_eq!(rip.disp_offset, 3);
    assert_eq!(rip.trailing, 0);
    assert_eq!(rip.target, 0x5107);
}

#[test]
fn mov_imm_lengths() {
    assert_eq!(decode(&[0xB8, 1, 0, 0, 0], 0).len, 5);
    let movabs = [0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8];
    assert_eq!(decode(&movabs, 0).len, 10);
}

#[test]
fn common_alu_and_stack() {
    assert_eq!(decode(&[0x48, 0x83, 0xC0, 0x01], 0).len, 4); // add rax, 1
    assert_eq!(decode(&[0x50], 0).len, 1); // push rax
    assert_eq!(decode(&[0x6A, 0x05], 0).len, 2); // push 5
    assert_eq!(decode(&[0x48, 0x85, 0xC0], 0).len, 3); // test rax, rax
    assert_eq!(decode(&[0x0F, 0xB6, 0xC0], 0).len, 3); // movzx eax, al
}

#[test]
fn syscall_and_traps() {
    assert_eq!(decode(&[0x0F, 0x05], 0).kind, InsnKind::Syscall);
    assert_eq!(decode(&[0xCC], 0).kind, InsnKind::Int3);
    assert_eq!(decode(&[0x0F, 0x34], 0).kind, InsnKind::Sysenter);
}

#[test]
fn prefixes_are_consumed() {
    assert_eq!(decode(&[0x66, 0x90], 0).len, 2);
    assert_eq!(decode(&[0xF3, 0x90], 0).len, 2); // pause
    assert_eq!(decode(&[0xF0, 0x48, 0x0F, 0xB1, 0x0F], 0).len, 5); // lock cmpxchg [rdi], rcx
}

#[test]
fn unsupported_falls_out() {
    assert_eq!(decode(&[0x0F, 0x0B], 0).kind, InsnKind::Unsupported); // ud2
    assert_eq!(decode(&[0xEA], 0).kind, InsnKind::Unsupported); // far jmp
    // Address-size override is not relocated.
    assert_eq!(decode(&[0x67, 0x8B, 0x00], 0).kind, InsnKind::Unsupported);
}

#[test]
fn far_call_through_memory_is_unsupported() {
    // call far [rax] (FF /3)
    assert_eq!(decode(&[0xFF, 0x18], 0).kind, InsnKind::Unsupported);
}

#[test]
fn raw_bytes_roundtrip() {
    let bytes = [0x48, 0x8D, 0x64, 0x24, 0x80]; // lea rsp, [rsp-128]
    let i = decode(&bytes, 0x1000);
    assert_eq!(i.bytes(), &bytes);
    assert_eq!(i.end(), 0x1005);
    assert!(!i.is_control_transfer());
}
