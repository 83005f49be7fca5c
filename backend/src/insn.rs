//! x86-64 instruction decoder.
//!
//! Decodes instruction boundaries plus everything the virtualizer needs
//! to know: is this a control transfer, and if so what kind and where
//! to. Non-transfer instructions are classified `Other` and carried as
//! raw bytes (with their ModR/M and RIP-relative geometry recorded so
//! the relocator can fix displacements). Anything outside the decoder's
//! vocabulary is `Unsupported` and handled by the single-step fallback.

use crate::regs::Reg;
use crate::writer::Cc;

/// Longest legal x86 instruction.
pub const MAX_INSN_LEN: usize = 15;

/// Segment override relevant on x86-64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Fs,
    Gs,
}

/// Decoded memory operand of an indirect control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub segment: Option<Segment>,
    pub base: Option<Reg>,
    pub index: Option<Reg>,
    pub scale: u8,
    pub disp: i32,
    /// True for `[rip + disp]`; `base`/`index` are `None` then.
    pub rip_relative: bool,
    /// Address of the instruction carrying the operand, for
    /// RIP-relative resolution.
    pub origin_ip: u64,
}

impl MemOperand {
    /// Absolute address a RIP-relative operand refers to.
    /// `insn_len` is the length of the carrying instruction.
    pub fn rip_target(&self, insn_len: u8) -> u64 {
        debug_assert!(self.rip_relative);
        (self.origin_ip + insn_len as u64).wrapping_add(self.disp as i64 as u64)
    }
}

/// Operand of a control-transfer instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTarget {
    /// Immediate absolute guest address (already resolved from the
    /// relative displacement).
    Imm(u64),
    Reg(Reg),
    Mem(MemOperand),
}

/// Classification of one decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnKind {
    /// Anything that is not a control transfer.
    Other,
    CallImm { target: u64 },
    CallInd { target: BranchTarget },
    JmpImm { target: u64 },
    JmpInd { target: BranchTarget },
    Jcc { cc: Cc, target: u64 },
    /// `jrcxz` (and `loop*`): rel8-only conditional transfers.
    Jcxz { target: u64 },
    Ret { pop: u16 },
    Syscall,
    Sysenter,
    Int3,
    /// Outside the decoder's vocabulary; single-stepped.
    Unsupported,
}

/// RIP-relative geometry of an `Other` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipRel {
    /// Offset of the disp32 field within the instruction.
    pub disp_offset: u8,
    /// Immediate bytes following the displacement.
    pub trailing: u8,
    /// Absolute address the operand refers to.
    pub target: u64,
}

/// One decoded guest instruction.
#[derive(Debug, Clone, Copy)]
pub struct Insn {
    pub address: u64,
    pub len: u8,
    pub kind: InsnKind,
    /// Offset of the ModR/M byte, when present.
    pub modrm_offset: Option<u8>,
    pub rip_rel: Option<RipRel>,
    bytes: [u8; MAX_INSN_LEN],
}

impl Insn {
    /// Raw encoding of the instruction.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Guest address of the following instruction.
    #[inline]
    pub fn end(&self) -> u64 {
        self.address + self.len as u64
    }

    pub fn is_control_transfer(&self) -> bool {
        !matches!(self.kind, InsnKind::Other | InsnKind::Unsupported)
    }
}

/// Immediate classes attached to an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Imm {
    None,
    Ib,
    Iw,
    /// Word or dword depending on the 0x66 prefix.
    Iz,
    /// mov r64, imm: dword, word or full qword depending on prefixes.
    Iv,
    /// 64-bit absolute moffs (A0-A3).
    Moffs,
    /// enter: iw + ib.
    Enter,
}

fn imm_len(imm: Imm, opsize16: bool, rexw: bool) -> usize {
    match imm {
        Imm::None => 0,
        Imm::Ib => 1,
        Imm::Iw => 2,
        Imm::Iz => {
            if opsize16 {
                2
            } else {
                4
            }
        }
        Imm::Iv => {
            if rexw {
                8
            } else if opsize16 {
                2
            } else {
                4
            }
        }
        Imm::Moffs => 8,
        Imm::Enter => 3,
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self) -> Option<u8> {
        let b = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn take_n(&mut self, n: usize) -> Option<&'a [u8]> {
        let s = self.bytes.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(s)
    }
}

/// Decode one instruction from `bytes` located at guest `address`.
///
/// `bytes` should hold up to [`MAX_INSN_LEN`] bytes; shorter slices are
/// fine at the end of a mapping and yield `Unsupported` when an
/// instruction would run off the end.
pub fn decode(bytes: &[u8], address: u64) -> Insn {
    match decode_inner(bytes, address) {
        Some(insn) => insn,
        None => unsupported(bytes, address),
    }
}

/// Decode directly from guest memory.
///
/// # Safety
/// At least [`MAX_INSN_LEN`] bytes starting at `address` must be
/// readable.
pub unsafe fn decode_at(address: u64) -> Insn {
    let slice = core::slice::from_raw_parts(address as *const u8, MAX_INSN_LEN);
    decode(slice, address)
}

fn unsupported(bytes: &[u8], address: u64) -> Insn {
    let mut raw = [0u8; MAX_INSN_LEN];
    let n = bytes.len().min(1);
    raw[..n].copy_from_slice(&bytes[..n]);
    Insn {
        address,
        len: 1,
        kind: InsnKind::Unsupported,
        modrm_offset: None,
        rip_rel: None,
        bytes: raw,
    }
}

fn decode_inner(bytes: &[u8], address: u64) -> Option<Insn> {
    let mut r = Reader { bytes, pos: 0 };

    // Legacy prefixes.
    let mut segment = None;
    let mut opsize16 = false;
    loop {
        match *r.bytes.get(r.pos)? {
            0xF0 | 0xF2 | 0xF3 | 0x26 | 0x2E | 0x36 | 0x3E => {
                r.pos += 1;
            }
            0x64 => {
                segment = Some(Segment::Fs);
                r.pos += 1;
            }
            0x65 => {
                segment = Some(Segment::Gs);
                r.pos += 1;
            }
            0x66 => {
                opsize16 = true;
                r.pos += 1;
            }
            // Address-size override: rare, not worth relocating.
            0x67 => return None,
            _ => break,
        }
    }

    // REX.
    let mut rex: u8 = 0;
    if let Some(&b) = r.bytes.get(r.pos) {
        if (0x40..=0x4F).contains(&b) {
            rex = b;
            r.pos += 1;
        }
    }

    let opcode = r.take()?;

    // VEX prefixes: length-decode only, classified Other.
    if opcode == 0xC4 || opcode == 0xC5 {
        return decode_vex(bytes, address, r, opcode);
    }

    let (has_modrm, imm, kind_hint) = classify_one_byte(opcode, &mut r)?;

    finish(
        bytes, address, r, segment, opsize16, rex, has_modrm, imm, kind_hint,
    )
}

/// What a classified opcode turns into once operands are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hint {
    Other,
    CallRel32,
    JmpRel32,
    JmpRel8,
    JccRel8(u8),
    JccRel32(u8),
    JcxzRel8,
    RetImm,
    RetBare,
    Syscall,
    Sysenter,
    Int3,
    /// FF group: /2 call, /4 jmp, others plain ALU.
    Grp5,
}

fn classify_one_byte(op: u8, r: &mut Reader<'_>) -> Option<(bool, Imm, Hint)> {
    use Hint::*;
    let entry = match op {
        // ALU block: 00-3D, excluding the segment/BCD holes already
        // consumed or invalid in 64-bit mode.
        0x00..=0x05
        | 0x08..=0x0D
        | 0x10..=0x15
        | 0x18..=0x1D
        | 0x20..=0x25
        | 0x28..=0x2D
        | 0x30..=0x35
        | 0x38..=0x3D => {
            let low = op & 7;
            match low {
                0..=3 => (true, Imm::None, Other),
                4 => (false, Imm::Ib, Other),
                _ => (false, Imm::Iz, Other),
            }
        }
        0x0F => return classify_two_byte(r),
        0x50..=0x5F => (false, Imm::None, Other), // push/pop r
        0x63 => (true, Imm::None, Other),         // movsxd
        0x68 => (false, Imm::Iz, Other),          // push imm
        0x69 => (true, Imm::Iz, Other),           // imul r, rm, iz
        0x6A => (false, Imm::Ib, Other),          // push imm8
        0x6B => (true, Imm::Ib, Other),           // imul r, rm, ib
        0x70..=0x7F => (false, Imm::Ib, JccRel8(op & 0x0F)),
        0x80 => (true, Imm::Ib, Other),
        0x81 => (true, Imm::Iz, Other),
        0x83 => (true, Imm::Ib, Other),
        0x84..=0x8B => (true, Imm::None, Other), // test/xchg/mov
        0x8C => (true, Imm::None, Other),        // mov rm, sreg
        0x8D => (true, Imm::None, Other),        // lea
        0x8E => (true, Imm::None, Other),        // mov sreg, rm
        0x8F => (true, Imm::None, Other),        // pop rm
        0x90..=0x97 => (false, Imm::None, Other), // xchg ax, r / nop
        0x98 | 0x99 | 0x9B | 0x9C | 0x9D | 0x9E | 0x9F => (false, Imm::None, Other),
        0xA0..=0xA3 => (false, Imm::Moffs, Other),
        0xA4..=0xA7 | 0xAA..=0xAF => (false, Imm::None, Other), // string ops
        0xA8 => (false, Imm::Ib, Other),
        0xA9 => (false, Imm::Iz, Other),
        0xB0..=0xB7 => (false, Imm::Ib, Other), // mov r8, imm8
        0xB8..=0xBF => (false, Imm::Iv, Other), // mov r, imm
        0xC0 | 0xC1 => (true, Imm::Ib, Other),  // shift rm, imm8
        0xC2 => (false, Imm::Iw, RetImm),
        0xC3 => (false, Imm::None, RetBare),
        0xC6 => (true, Imm::Ib, Other),
        0xC7 => (true, Imm::Iz, Other),
        0xC8 => (false, Imm::Enter, Other),
        0xC9 => (false, Imm::None, Other), // leave
        0xCC => (false, Imm::None, Int3),
        0xCD => (false, Imm::Ib, Other), // int n: kept verbatim
        0xD0..=0xD3 => (true, Imm::None, Other), // shifts
        0xD7 => (false, Imm::None, Other), // xlat
        0xD8..=0xDF => (true, Imm::None, Other), // x87
        0xE0..=0xE2 => (false, Imm::Ib, JcxzRel8), // loopcc: rel8, rcx-coupled
        0xE3 => (false, Imm::Ib, JcxzRel8),
        0xE8 => (false, Imm::Iz, CallRel32),
        0xE9 => (false, Imm::Iz, JmpRel32),
        0xEB => (false, Imm::Ib, JmpRel8),
        0xF5 | 0xF8..=0xFD => (false, Imm::None, Other), // flag ops
        0xF6 => {
            // Group 3: /0 and /1 carry an imm8.
            let modrm = *r.bytes.get(r.pos)?;
            let ext = (modrm >> 3) & 7;
            (true, if ext <= 1 { Imm::Ib } else { Imm::None }, Other)
        }
        0xF7 => {
            let modrm = *r.bytes.get(r.pos)?;
            let ext = (modrm >> 3) & 7;
            (true, if ext <= 1 { Imm::Iz } else { Imm::None }, Other)
        }
        0xFE => (true, Imm::None, Other),
        0xFF => (true, Imm::None, Grp5),
        _ => return None,
    };
    Some(entry)
}

fn classify_two_byte(r: &mut Reader<'_>) -> Option<(bool, Imm, Hint)> {
    use Hint::*;
    let op = r.take()?;
    let entry = match op {
        0x05 => (false, Imm::None, Syscall),
        0x0B => return None, // ud2
        0x31 => (false, Imm::None, Other), // rdtsc
        0x34 => (false, Imm::None, Sysenter),
        0x38 => {
            // Three-byte map 0F 38: ModR/M, no immediate.
            let _op3 = r.take()?;
            (true, Imm::None, Other)
        }
        0x3A => {
            // Three-byte map 0F 3A: ModR/M + imm8.
            let _op3 = r.take()?;
            (true, Imm::Ib, Other)
        }
        0x10..=0x17 | 0x28..=0x2F | 0x50..=0x6F | 0x74..=0x7F => (true, Imm::None, Other), // SSE
        0x70..=0x73 => (true, Imm::Ib, Other), // pshuf / shift groups
        0x18..=0x1F => (true, Imm::None, Other), // prefetch / hint nop
        0x40..=0x4F => (true, Imm::None, Other), // cmov
        0x80..=0x8F => (false, Imm::Iz, JccRel32(op & 0x0F)),
        0x90..=0x9F => (true, Imm::None, Other), // setcc
        0xA2 => (false, Imm::None, Other),       // cpuid
        0xA3 | 0xAB | 0xB3 | 0xBB => (true, Imm::None, Other), // bt/bts/btr/btc
        0xA4 | 0xAC => (true, Imm::Ib, Other),   // shld/shrd imm8
        0xA5 | 0xAD => (true, Imm::None, Other), // shld/shrd cl
        0xAE => (true, Imm::None, Other),        // grp15: fxsave/ldmxcsr/fences
        0xAF => (true, Imm::None, Other),        // imul
        0xB0 | 0xB1 => (true, Imm::None, Other), // cmpxchg
        0xB6 | 0xB7 | 0xBE | 0xBF => (true, Imm::None, Other), // movzx/movsx
        0xBA => (true, Imm::Ib, Other),          // bt group, imm8
        0xBC | 0xBD => (true, Imm::None, Other), // bsf/bsr
        0xC0 | 0xC1 => (true, Imm::None, Other), // xadd
        0xC2 | 0xC4..=0xC6 => (true, Imm::Ib, Other), // cmpps etc.
        0xC3 => (true, Imm::None, Other),        // movnti
        0xC7 => (true, Imm::None, Other),        // cmpxchg8b/16b group
        0xC8..=0xCF => (false, Imm::None, Other), // bswap
        0xD0..=0xFE => (true, Imm::None, Other), // SSE block
        _ => return None,
    };
    Some(entry)
}

struct ModrmInfo {
    offset: u8,
    reg_ext: u8,
    operand: Option<MemOrReg>,
}

enum MemOrReg {
    Reg(Reg),
    Mem {
        base: Option<Reg>,
        index: Option<Reg>,
        scale: u8,
        disp: i32,
        rip_relative: bool,
        disp32_offset: Option<u8>,
    },
}

fn parse_modrm(r: &mut Reader<'_>, rex: u8) -> Option<ModrmInfo> {
    let offset = r.pos as u8;
    let modrm = r.take()?;
    let mode = modrm >> 6;
    let reg_ext = (modrm >> 3) & 7;
    let rm = modrm & 7;
    let b = rex & 0x01 != 0;
    let x = rex & 0x02 != 0;

    if mode == 3 {
        let reg = Reg::from_index(rm | if b { 8 } else { 0 });
        return Some(ModrmInfo {
            offset,
            reg_ext,
            operand: Some(MemOrReg::Reg(reg)),
        });
    }

    let mut base = None;
    let mut index = None;
    let mut scale = 1u8;
    let mut rip_relative = false;
    let mut disp32_offset = None;

    let mut disp_size = match mode {
        0 => 0usize,
        1 => 1,
        _ => 4,
    };

    if rm == 4 {
        let sib = r.take()?;
        let sh = sib >> 6;
        let idx = (sib >> 3) & 7;
        let bse = sib & 7;
        scale = 1 << sh;
        if !(idx == 4 && !x) {
            index = Some(Reg::from_index(idx | if x { 8 } else { 0 }));
        }
        if bse == 5 && mode == 0 {
            disp_size = 4;
        } else {
            base = Some(Reg::from_index(bse | if b { 8 } else { 0 }));
        }
    } else if rm == 5 && mode == 0 {
        rip_relative = true;
        disp_size = 4;
    } else {
        base = Some(Reg::from_index(rm | if b { 8 } else { 0 }));
    }

    let disp = match disp_size {
        0 => 0,
        1 => r.take()? as i8 as i32,
        _ => {
            disp32_offset = Some(r.pos as u8);
            let s = r.take_n(4)?;
            i32::from_le_bytes([s[0], s[1], s[2], s[3]])
        }
    };

    Some(ModrmInfo {
        offset,
        reg_ext,
        operand: Some(MemOrReg::Mem {
            base,
            index,
            scale,
            disp,
            rip_relative,
            disp32_offset,
        }),
    })
}

#[allow(clippy::too_many_arguments)]
fn finish(
    bytes: &[u8],
    address: u64,
    mut r: Reader<'_>,
    segment: Option<Segment>,
    opsize16: bool,
    rex: u8,
    has_modrm: bool,
    imm: Imm,
    hint: Hint,
) -> Option<Insn> {
    let rexw = rex & 0x08 != 0;

    let modrm = if has_modrm || matches!(hint, Hint::Grp5) {
        Some(parse_modrm(&mut r, rex)?)
    } else {
        None
    };

    let ilen = imm_len(imm, opsize16, rexw);
    let imm_bytes = r.take_n(ilen)?;
    let len = r.pos;
    if len > MAX_INSN_LEN {
        return None;
    }

    let mut raw = [0u8; MAX_INSN_LEN];
    raw[..len].copy_from_slice(&bytes[..len]);

    let end = address + len as u64;
    let rel_target = |imm_bytes: &[u8]| -> u64 {
        match imm_bytes.len() {
            1 => end.wrapping_add(imm_bytes[0] as i8 as i64 as u64),
            2 => {
                let d = i16::from_le_bytes([imm_bytes[0], imm_bytes[1]]);
                end.wrapping_add(d as i64 as u64)
            }
            _ => {
                let d = i32::from_le_bytes([imm_bytes[0], imm_bytes[1], imm_bytes[2], imm_bytes[3]]);
                end.wrapping_add(d as i64 as u64)
            }
        }
    };

    let mut rip_rel = None;
    let mut kind = match hint {
        Hint::Other => InsnKind::Other,
        Hint::CallRel32 => InsnKind::CallImm {
            target: rel_target(imm_bytes),
        },
        Hint::JmpRel32 | Hint::JmpRel8 => InsnKind::JmpImm {
            target: rel_target(imm_bytes),
        },
        Hint::JccRel8(n) | Hint::JccRel32(n) => InsnKind::Jcc {
            cc: Cc::from_nibble(n),
            target: rel_target(imm_bytes),
        },
        Hint::JcxzRel8 => InsnKind::Jcxz {
            target: rel_target(imm_bytes),
        },
        Hint::RetImm => InsnKind::Ret {
            pop: u16::from_le_bytes([imm_bytes[0], imm_bytes[1]]),
        },
        Hint::RetBare => InsnKind::Ret { pop: 0 },
        Hint::Syscall => InsnKind::Syscall,
        Hint::Sysenter => InsnKind::Sysenter,
        Hint::Int3 => InsnKind::Int3,
        Hint::Grp5 => InsnKind::Other, // refined below
    };

    if let Some(ref info) = modrm {
        if hint == Hint::Grp5 {
            let target = match info.operand {
                Some(MemOrReg::Reg(reg)) => Some(BranchTarget::Reg(reg)),
                Some(MemOrReg::Mem {
                    base,
                    index,
                    scale,
                    disp,
                    rip_relative,
                    ..
                }) => Some(BranchTarget::Mem(MemOperand {
                    segment,
                    base,
                    index,
                    scale,
                    disp,
                    rip_relative,
                    origin_ip: address,
                })),
                None => None,
            };
            kind = match (info.reg_ext, target) {
                (2, Some(t)) => InsnKind::CallInd { target: t },
                (4, Some(t)) => InsnKind::JmpInd { target: t },
                // Far call/jmp through memory.
                (3, _) | (5, _) => InsnKind::Unsupported,
                // inc/dec/push rm.
                _ => InsnKind::Other,
            };
        }

        if kind == InsnKind::Other {
            if let Some(MemOrReg::Mem {
                rip_relative: true,
                disp,
                disp32_offset: Some(off),
                ..
            }) = info.operand
            {
                rip_rel = Some(RipRel {
                    disp_offset: off,
                    trailing: ilen as u8,
                    target: end.wrapping_add(disp as i64 as u64),
                });
            }
        }
    }

    Some(Insn {
        address,
        len: len as u8,
        kind,
        modrm_offset: modrm.map(|m| m.offset),
        rip_rel,
        bytes: raw,
    })
}

fn decode_vex(bytes: &[u8], address: u64, mut r: Reader<'_>, opcode: u8) -> Option<Insn> {
    // C5: two-byte VEX (implied 0F map). C4: three-byte VEX.
    let (map, vex_rex) = if opcode == 0xC5 {
        let b1 = r.take()?;
        (1u8, if b1 & 0x80 == 0 { 0x04u8 } else { 0 })
    } else {
        let b1 = r.take()?;
        let _b2 = r.take()?;
        let mut rex = 0u8;
        if b1 & 0x80 == 0 {
            rex |= 0x04; // R
        }
        if b1 & 0x40 == 0 {
            rex |= 0x02; // X
        }
        if b1 & 0x20 == 0 {
            rex |= 0x01; // B
        }
        (b1 & 0x1F, rex)
    };
    let _op = r.take()?;
    let info = parse_modrm(&mut r, vex_rex)?;
    let ilen = if map == 3 { 1 } else { 0 };
    let _imm = r.take_n(ilen)?;
    let len = r.pos;
    if len > MAX_INSN_LEN {
        return None;
    }

    let mut raw = [0u8; MAX_INSN_LEN];
    raw[..len].copy_from_slice(&bytes[..len]);

    let end = address + len as u64;
    let rip_rel = match info.operand {
        Some(MemOrReg::Mem {
            rip_relative: true,
            disp,
            disp32_offset: Some(off),
            ..
        }) => Some(RipRel {
            disp_offset: off,
            trailing: ilen as u8,
            target: end.wrapping_add(disp as i64 as u64),
        }),
        _ => None,
    };

    Some(Insn {
        address,
        len: len as u8,
        kind: InsnKind::Other,
        modrm_offset: Some(info.offset),
        rip_rel,
        bytes: raw,
    })
}
