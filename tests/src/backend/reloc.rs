//! Relocator behavior: verbatim copies and RIP-relative fixups.

use shade_backend::insn::{decode, InsnKind};
use shade_backend::reloc::{relocate, Relocator};
use shade_backend::regs::Reg;

use crate::tools::ExecBuf;

#[test]
fn verbatim_copy() {
    let src = [0x48, 0x83, 0xC0, 0x2A]; // add rax, 42
    let insn = decode(&src, 0x1000);

    let mut out = vec![0u8; 64];
    let mut w = unsafe { shade_backend::CodeWriter::new(out.as_mut_ptr(), out.len()) };
    relocate(&insn, &mut w);
    assert_eq!(&out[..4], &src);
}

#[test]
fn rip_relative_redisplaced() {
    // Source buffer: `mov rax, [rip + disp]` pointing at a cell 0x100
    // bytes in, relocated into a second buffer. The displacement must
    // be rewritten so the copy still reads the original cell.
    let src = ExecBuf::new(4096);
    let dst = ExecBuf::new(4096);

    let cell_addr = src.addr() + 0x100;
    src.write(0x100, &0x1234_5678_9ABC_DEF0u64.to_le_bytes());
    {
        let mut w = src.writer();
        w.emit_load_rip(Reg::Rax, cell_addr);
        w.emit_ret();
        w.flush();
    }

    // SAFETY: src holds the two decodable instructions just emitted.
    let mut r = Relocator::new(src.addr());
    let insn = unsafe { r.read_one() };
    assert_eq!(insn.kind, InsnKind::Other);
    assert_eq!(insn.rip_rel.unwrap().target, cell_addr);

    let mut w = dst.writer();
    relocate(&insn, &mut w);
    w.emit_ret();
    w.flush();

    // The copy decodes to the same absolute target...
    let copied = unsafe { core::slice::from_raw_parts(dst.addr() as *const u8, 16) };
    let redecoded = decode(copied, dst.addr());
    assert_eq!(redecoded.rip_rel.unwrap().target, cell_addr);

    // ...and executing it reads the original cell.
    let got = unsafe { dst.call(0) };
    assert_eq!(got, 0x1234_5678_9ABC_DEF0);
}

#[test]
fn relocator_tracks_consumption() {
    let src = ExecBuf::new(4096);
    {
        let mut w = src.writer();
        w.emit_mov_ri(Reg::Rax, 7); // 5 bytes
        w.emit_ret(); // 1 byte
        w.flush();
    }
    let mut r = Relocator::new(src.addr());
    // SAFETY: decoding the bytes emitted above.
    let first = unsafe { r.read_one() };
    assert_eq!(first.kind, InsnKind::Other);
    assert_eq!(r.consumed(), 5);
    let second = unsafe { r.read_one() };
    assert_eq!(second.kind, InsnKind::Ret { pop: 0 });
    assert_eq!(r.consumed(), 6);
    assert_eq!(r.pc(), src.addr() + 6);
}
