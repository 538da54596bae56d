//! Thumb / Thumb-2 instruction encoding and relocation
//!
//! Thumb mixes 16- and 32-bit encodings; a halfword starting `0b11101`,
//! `0b11110`, or `0b11111` opens a 32-bit instruction. Thumb PC semantics:
//! reading PC yields the current instruction address plus 4, and literal
//! and ADR-like forms use `(PC + 4) & !3` as their base.
//!
//! Absolute jumps use the six-halfword sequence
//! `push {r4}; ldr r4, [pc, #4]; bx r4; pop {r4}; <literal>` where the pop
//! is dead padding that keeps the literal word-aligned. The `ldr` reads
//! from `align4(PC + 4) + 4`, which only lands on the literal when the
//! sequence starts at a 4-byte-aligned address; the trampoline emitters pad
//! with a `nop` to guarantee that.

use crate::buffer::HalfBuf;
use crate::ArchError;

/// `nop` (T1).
pub const NOP: u16 = 0xBF00;

/// The four instruction halfwords of the absolute jump, ahead of the
/// 32-bit target literal: `push {r4}; ldr r4, [pc, #4]; bx r4; pop {r4}`.
pub const ABS_JUMP: [u16; 4] = [0xB410, 0x4C01, 0x4720, 0xBC10];

// === Encoders ===

/// `push {r<r>}` - low registers only.
pub fn push_one(r: u32) -> u16 {
    0xB400 | (1 << r) as u16
}

/// `pop {r<r>}` - low registers only.
pub fn pop_one(r: u32) -> u16 {
    0xBC00 | (1 << r) as u16
}

/// `bx r<rm>`
pub fn bx(rm: u32) -> u16 {
    0x4700 | (rm << 3) as u16
}

/// `ldr r<rt>, [pc, #imm8*4]` (T1)
pub fn ldr_pc(rt: u32, imm8: u32) -> u16 {
    0x4800 | (rt << 8) as u16 | (imm8 & 0xFF) as u16
}

/// `cmp r<rn>, #0` (T1)
pub fn cmp_imm0(rn: u32) -> u16 {
    0x2800 | (rn << 8) as u16
}

/// `b<cond> <imm8*2>` (T1) - target is `PC + 4 + imm8*2`.
pub fn b_cond(cond: u32, imm8: u32) -> u16 {
    0xD000 | (cond << 8) as u16 | (imm8 & 0xFF) as u16
}

/// `movw r<rd>, #imm16` (T3), packed low-halfword-first.
pub fn movw(rd: u32, imm16: u16) -> u32 {
    let imm = imm16 as u32;
    let i = (imm >> 11) & 1;
    let imm4 = (imm >> 12) & 0xF;
    let imm3 = (imm >> 8) & 0x7;
    let imm8 = imm & 0xFF;

    let hw1 = 0xF240 | (i << 10) | imm4;
    let hw2 = (imm3 << 12) | (rd << 8) | imm8;
    (hw2 << 16) | hw1
}

/// `movt r<rd>, #imm16` (T1), packed low-halfword-first.
pub fn movt(rd: u32, imm16: u16) -> u32 {
    let imm = imm16 as u32;
    let i = (imm >> 11) & 1;
    let imm4 = (imm >> 12) & 0xF;
    let imm3 = (imm >> 8) & 0x7;
    let imm8 = imm & 0xFF;

    let hw1 = 0xF2C0 | (i << 10) | imm4;
    let hw2 = (imm3 << 12) | (rd << 8) | imm8;
    (hw2 << 16) | hw1
}

/// `ldr.w r<rt>, [r<rn>, #imm12]`, packed low-halfword-first.
pub fn ldr_w(rt: u32, rn: u32, imm12: u32) -> u32 {
    let hw1 = 0xF8D0 | rn;
    let hw2 = (rt << 12) | (imm12 & 0xFFF);
    (hw2 << 16) | hw1
}

// === Classification ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind16 {
    Other,
    /// `b<cond>` T1
    BCond,
    /// `b` T2
    B,
    /// `ldr r<t>, [pc, #imm8*4]` T1
    LdrLit,
    /// `adr` T1 (`add r<d>, pc, #imm8*4`)
    Adr,
    /// `cbz` / `cbnz`
    Cbz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind32 {
    Other,
    /// `bl` T1
    Bl,
    /// `b<cond>.w` T3
    BCond,
    /// `b.w` T4
    B,
    /// `ldr.w r<t>, [pc, #±imm12]`
    LdrLit,
    /// `adr` T2 (sub form)
    AdrSub,
    /// `adr` T3 (add form)
    AdrAdd,
}

/// Does this halfword open a 32-bit Thumb-2 instruction?
pub fn is_32bit(hw: u16) -> bool {
    hw & 0xE000 == 0xE000 && hw & 0x1800 != 0
}

pub fn classify16(hw: u16) -> Kind16 {
    if hw & 0xF000 == 0xD000 {
        let cond = (hw >> 8) & 0xF;
        if cond < 0xE {
            return Kind16::BCond;
        }
    }
    if hw & 0xF800 == 0xE000 {
        return Kind16::B;
    }
    if hw & 0xF800 == 0x4800 {
        return Kind16::LdrLit;
    }
    if hw & 0xF800 == 0xA000 {
        return Kind16::Adr;
    }
    if hw & 0xF500 == 0xB100 {
        return Kind16::Cbz;
    }
    Kind16::Other
}

pub fn classify32(hw1: u16, hw2: u16) -> Kind32 {
    let op1 = (hw1 >> 11) & 0x3;

    if op1 == 2 && hw2 & 0xD000 == 0xD000 {
        return Kind32::Bl;
    }
    if op1 == 2 && hw2 & 0xD000 == 0x8000 {
        let cond = (hw1 >> 6) & 0xF;
        if cond < 0xE {
            return Kind32::BCond;
        }
    }
    if op1 == 2 && hw2 & 0xD000 == 0x9000 {
        return Kind32::B;
    }
    if hw1 & 0xFF7F == 0xF85F {
        return Kind32::LdrLit;
    }
    if hw1 & 0xFBFF == 0xF2AF && hw2 & 0x8000 == 0 {
        return Kind32::AdrSub;
    }
    if hw1 & 0xFBFF == 0xF20F && hw2 & 0x8000 == 0 {
        return Kind32::AdrAdd;
    }
    Kind32::Other
}

// === Relocation ===

fn sign_extend(val: u32, bits: u32) -> i32 {
    let sign = 1u32 << (bits - 1);
    (val ^ sign).wrapping_sub(sign) as i32
}

fn to_u32(target: u64) -> Result<u32, ArchError> {
    u32::try_from(target).map_err(|_| ArchError::Unsupported)
}

/// Pad with a `nop` so the next emission starts at `phase` bytes past a
/// 4-byte boundary (0 or 2).
fn pad_to_phase(buf: &mut HalfBuf, phase: usize) -> Result<(), ArchError> {
    if buf.len_bytes() % 4 != phase {
        buf.emit16(NOP)?;
    }
    Ok(())
}

/// Emit the 12-byte absolute jump. The buffer position must be 4-aligned
/// so the `ldr r4, [pc, #4]` reads the embedded literal.
pub fn emit_abs_jump(buf: &mut HalfBuf, target: u64) -> Result<(), ArchError> {
    debug_assert_eq!(buf.len_bytes() % 4, 0);
    let target = to_u32(target)?;
    for hw in ABS_JUMP {
        buf.emit16(hw)?;
    }
    buf.emit_literal(target)
}

fn emit_mov32(buf: &mut HalfBuf, rd: u32, value: u32) -> Result<(), ArchError> {
    buf.emit32(movw(rd, value as u16))?;
    buf.emit32(movt(rd, (value >> 16) as u16))
}

/// The conditional skip branches over the 12-byte absolute jump.
const SKIP_IMM8: u32 = 5;

fn relocate16(hw: u16, pc: u64, buf: &mut HalfBuf) -> Result<(), ArchError> {
    match classify16(hw) {
        Kind16::BCond => {
            let cond = ((hw >> 8) & 0xF) as u32;
            let off = (sign_extend((hw & 0xFF) as u32, 8) * 2) as i64;
            let target = pc.wrapping_add(4).wrapping_add(off as u64);

            pad_to_phase(buf, 2)?;
            buf.emit16(b_cond(cond ^ 1, SKIP_IMM8))?;
            emit_abs_jump(buf, target | 1)
        }
        Kind16::B => {
            let off = (sign_extend((hw & 0x7FF) as u32, 11) * 2) as i64;
            let target = pc.wrapping_add(4).wrapping_add(off as u64);

            pad_to_phase(buf, 0)?;
            emit_abs_jump(buf, target | 1)
        }
        Kind16::LdrLit => {
            let rt = ((hw >> 8) & 0x7) as u32;
            let imm8 = (hw & 0xFF) as u64;
            let target = (pc.wrapping_add(4) & !3) + imm8 * 4;

            emit_mov32(buf, rt, to_u32(target)?)?;
            buf.emit32(ldr_w(rt, rt, 0))
        }
        Kind16::Adr => {
            let rd = ((hw >> 8) & 0x7) as u32;
            let imm8 = (hw & 0xFF) as u64;
            let target = (pc.wrapping_add(4) & !3) + imm8 * 4;

            emit_mov32(buf, rd, to_u32(target)?)
        }
        Kind16::Cbz => {
            let rn = (hw & 0x7) as u32;
            let op = (hw >> 11) & 1;
            let i = ((hw >> 9) & 1) as u32;
            let imm5 = ((hw >> 3) & 0x1F) as u32;
            let off = ((i << 6) | (imm5 << 1)) as u64;
            let target = pc.wrapping_add(4).wrapping_add(off);

            // cbz has no condition field to invert; expand to cmp + b<cond>.
            pad_to_phase(buf, 0)?;
            buf.emit16(cmp_imm0(rn))?;
            let cond = if op == 1 { 0x0 } else { 0x1 }; // eq skips cbnz, ne skips cbz
            buf.emit16(b_cond(cond, SKIP_IMM8))?;
            emit_abs_jump(buf, target | 1)
        }
        Kind16::Other => buf.emit16(hw),
    }
}

fn relocate32(hw1: u16, hw2: u16, pc: u64, buf: &mut HalfBuf) -> Result<(), ArchError> {
    match classify32(hw1, hw2) {
        Kind32::Bl => {
            let s = ((hw1 >> 10) & 1) as u32;
            let j1 = ((hw2 >> 13) & 1) as u32;
            let j2 = ((hw2 >> 11) & 1) as u32;
            let imm10 = (hw1 & 0x3FF) as u32;
            let imm11 = (hw2 & 0x7FF) as u32;
            let i1 = !(j1 ^ s) & 1;
            let i2 = !(j2 ^ s) & 1;
            let off = sign_extend(
                (s << 24) | (i1 << 23) | (i2 << 22) | (imm10 << 12) | (imm11 << 1),
                25,
            ) as i64;
            let target = pc.wrapping_add(4).wrapping_add(off as u64);

            pad_to_phase(buf, 0)?;
            // Link register = the instruction after this 20-byte block,
            // with the Thumb bit set.
            let ret = buf.pc() + 20;
            emit_mov32(buf, 14, to_u32(ret)? | 1)?;
            emit_abs_jump(buf, target | 1)
        }
        Kind32::BCond => {
            let s = ((hw1 >> 10) & 1) as u32;
            let cond = ((hw1 >> 6) & 0xF) as u32;
            let imm6 = (hw1 & 0x3F) as u32;
            let j1 = ((hw2 >> 13) & 1) as u32;
            let j2 = ((hw2 >> 11) & 1) as u32;
            let imm11 = (hw2 & 0x7FF) as u32;
            let off = sign_extend(
                (s << 20) | (j2 << 19) | (j1 << 18) | (imm6 << 12) | (imm11 << 1),
                21,
            ) as i64;
            let target = pc.wrapping_add(4).wrapping_add(off as u64);

            pad_to_phase(buf, 2)?;
            buf.emit16(b_cond(cond ^ 1, SKIP_IMM8))?;
            emit_abs_jump(buf, target | 1)
        }
        Kind32::B => {
            let s = ((hw1 >> 10) & 1) as u32;
            let j1 = ((hw2 >> 13) & 1) as u32;
            let j2 = ((hw2 >> 11) & 1) as u32;
            let imm10 = (hw1 & 0x3FF) as u32;
            let imm11 = (hw2 & 0x7FF) as u32;
            let i1 = !(j1 ^ s) & 1;
            let i2 = !(j2 ^ s) & 1;
            let off = sign_extend(
                (s << 24) | (i1 << 23) | (i2 << 22) | (imm10 << 12) | (imm11 << 1),
                25,
            ) as i64;
            let target = pc.wrapping_add(4).wrapping_add(off as u64);

            pad_to_phase(buf, 0)?;
            emit_abs_jump(buf, target | 1)
        }
        Kind32::LdrLit => {
            let rt = ((hw2 >> 12) & 0xF) as u32;
            let imm12 = (hw2 & 0xFFF) as u64;
            let u = (hw1 >> 7) & 1;
            let base = pc.wrapping_add(4) & !3;
            let target = if u == 1 {
                base + imm12
            } else {
                base.wrapping_sub(imm12)
            };

            emit_mov32(buf, rt, to_u32(target)?)?;
            buf.emit32(ldr_w(rt, rt, 0))
        }
        Kind32::AdrSub | Kind32::AdrAdd => {
            let rd = ((hw2 >> 8) & 0xF) as u32;
            let i = ((hw1 >> 10) & 1) as u64;
            let imm3 = ((hw2 >> 12) & 0x7) as u64;
            let imm8 = (hw2 & 0xFF) as u64;
            let imm = (i << 11) | (imm3 << 8) | imm8;
            let base = pc.wrapping_add(4) & !3;
            let target = if classify32(hw1, hw2) == Kind32::AdrSub {
                base.wrapping_sub(imm)
            } else {
                base + imm
            };

            emit_mov32(buf, rd, to_u32(target)?)
        }
        Kind32::Other => {
            buf.emit16(hw1)?;
            buf.emit16(hw2)
        }
    }
}

/// Relocate a stream of Thumb halfwords observed starting at `src_pc`.
///
/// A 32-bit instruction straddling the end of `src` cannot be split and is
/// rejected.
pub fn relocate_stream(src: &[u16], src_pc: u64, buf: &mut HalfBuf) -> Result<(), ArchError> {
    let n_bytes = src.len() * 2;
    let mut pos = 0usize;

    while pos < n_bytes {
        let hw1 = src[pos / 2];
        let pc = src_pc + pos as u64;

        if is_32bit(hw1) {
            if pos + 4 > n_bytes {
                return Err(ArchError::Unsupported);
            }
            let hw2 = src[pos / 2 + 1];
            relocate32(hw1, hw2, pc, buf)?;
            pos += 4;
        } else {
            relocate16(hw1, pc, buf)?;
            pos += 2;
        }
    }

    Ok(())
}
