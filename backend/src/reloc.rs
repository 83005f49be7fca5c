//! Instruction relocator.
//!
//! Copies decoded guest instructions into the output stream at a new
//! address. Everything except RIP-relative operands is
//! position-independent and copied verbatim; RIP-relative operands are
//! re-displaced when the original target is still within signed 32-bit
//! reach of the new location, and rewritten through a scratch register
//! otherwise.

use crate::insn::{decode_at, Insn, InsnKind, MAX_INSN_LEN};
use crate::regs::Reg;
use crate::writer::CodeWriter;

/// Streaming decoder over guest memory.
pub struct Relocator {
    start: u64,
    pc: u64,
}

impl Relocator {
    pub fn new(input: u64) -> Self {
        Self {
            start: input,
            pc: input,
        }
    }

    /// Guest address of the next undecoded instruction.
    #[inline]
    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// Guest bytes consumed so far.
    #[inline]
    pub fn consumed(&self) -> usize {
        (self.pc - self.start) as usize
    }

    /// Decode the next instruction and advance.
    ///
    /// # Safety
    /// At least [`MAX_INSN_LEN`] bytes at the current pc must be
    /// readable guest memory.
    pub unsafe fn read_one(&mut self) -> Insn {
        let insn = decode_at(self.pc);
        self.pc += insn.len as u64;
        insn
    }
}

/// Emit a relocated copy of a non-transfer instruction.
///
/// Control transfers never reach this; the virtualizer owns them.
pub fn relocate(insn: &Insn, w: &mut CodeWriter) {
    debug_assert!(matches!(
        insn.kind,
        InsnKind::Other | InsnKind::Syscall | InsnKind::Int3
    ));

    let Some(rip) = insn.rip_rel else {
        w.emit_bytes(insn.bytes());
        return;
    };

    // Try to keep the original encoding with an adjusted displacement.
    let new_end = w.pc() as i64 + insn.len as i64;
    let disp = rip.target as i64 - new_end;
    if let Ok(disp) = i32::try_from(disp) {
        let start = w.offset();
        w.emit_bytes(insn.bytes());
        w.patch_u32(start + rip.disp_offset as usize, disp as u32);
        return;
    }

    // Out of reach: route the access through a scratch register. The
    // push clobbers the qword below the application stack pointer,
    // which the red-zone skip discipline already gives up on.
    let bytes = insn.bytes();
    let modrm_off = insn.modrm_offset.expect("rip-relative insn without modrm") as usize;
    let reg_bits = (bytes[modrm_off] >> 3) & 7;
    let rex_off = find_rex(bytes);
    let reg_full = reg_bits
        | match rex_off {
            Some(i) if bytes[i] & 0x04 != 0 => 8,
            _ => 0,
        };

    let scratch = if reg_full == Reg::Rdi as u8 {
        Reg::Rsi
    } else {
        Reg::Rdi
    };

    w.emit_push(scratch);
    w.emit_mov_ri(scratch, rip.target);

    // Re-emit with the memory operand rewritten to [scratch].
    let mut patched = [0u8; MAX_INSN_LEN];
    patched[..bytes.len()].copy_from_slice(bytes);
    patched[modrm_off] = (bytes[modrm_off] & 0x38) | scratch.low3();
    if let Some(i) = rex_off {
        patched[i] &= !0x01; // clear REX.B
    }
    let disp_off = rip.disp_offset as usize;
    w.emit_bytes(&patched[..disp_off]);
    w.emit_bytes(&bytes[disp_off + 4..]); // skip the old disp32

    w.emit_pop(scratch);
}

/// Locate the REX byte: after any legacy prefixes, before the opcode.
fn find_rex(bytes: &[u8]) -> Option<usize> {
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            0xF0 | 0xF2 | 0xF3 | 0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x66 => continue,
            0x40..=0x4F => return Some(i),
            _ => return None,
        }
    }
    None
}
