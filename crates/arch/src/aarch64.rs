//! AArch64 instruction encoding and relocation
//!
//! The encoder functions are the only place A64 opcode bit layouts live;
//! each one maps operands to a single instruction word and never touches
//! memory. The relocator classifies one instruction observed at a given PC
//! and appends a semantically equivalent sequence to a [`CodeBuf`] that may
//! be placed at any other address.
//!
//! x16 (IP0) is the scratch register for materialized addresses; it is
//! call-clobbered by the procedure call standard, so prologue instructions
//! cannot depend on it.

use crate::buffer::CodeBuf;
use crate::ArchError;

/// `bti c` - landing pad for indirect call targets (ARMv8.5+).
///
/// Decodes as a HINT (no-op) on cores without BTI.
pub const BTI_C: u32 = 0xD503245F;

/// `nop`
pub const NOP: u32 = 0xD503201F;

// === Encoders ===

/// `ldr x<rt>, [pc, #offset]` - load-literal, 64-bit.
///
/// `offset` is in bytes and must be word-aligned.
pub fn ldr_literal(rt: u32, offset: i32) -> u32 {
    0x58000000 | ((((offset >> 2) as u32) & 0x7FFFF) << 5) | rt
}

/// `br x<rn>`
pub fn br(rn: u32) -> u32 {
    0xD61F0000 | (rn << 5)
}

/// `blr x<rn>`
pub fn blr(rn: u32) -> u32 {
    0xD63F0000 | (rn << 5)
}

/// `ret`
pub fn ret() -> u32 {
    0xD65F03C0
}

/// `b #offset` - PC-relative, signed, word-aligned.
pub fn b(offset: i32) -> u32 {
    0x14000000 | (((offset >> 2) as u32) & 0x3FFFFFF)
}

/// `adr x<rd>, #offset`
///
/// offset = immhi:immlo, signed, byte granularity, ±1 MiB.
pub fn adr(rd: u32, offset: i32) -> u32 {
    let off = offset as u32;
    0x10000000 | ((off & 0x3) << 29) | (((off >> 2) & 0x7FFFF) << 5) | rd
}

/// `movz x<rd>, #imm16, lsl #shift` - shift in {0, 16, 32, 48}.
pub fn movz(rd: u32, imm16: u16, shift: u32) -> u32 {
    0xD2800000 | ((shift / 16) << 21) | ((imm16 as u32) << 5) | rd
}

/// `movk x<rd>, #imm16, lsl #shift`
pub fn movk(rd: u32, imm16: u16, shift: u32) -> u32 {
    0xF2800000 | ((shift / 16) << 21) | ((imm16 as u32) << 5) | rd
}

/// `str x<rt>, [sp, #-16]!` - push one GPR keeping 16-byte stack alignment.
pub fn push_one(rt: u32) -> u32 {
    0xF81F0FE0 | rt
}

/// `ldr x<rt>, [sp], #16` - pop the GPR pushed by [`push_one`].
pub fn pop_one(rt: u32) -> u32 {
    0xF84107E0 | rt
}

/// `ldr w<rt>, [x<rn>]`
pub fn ldr_imm_w(rt: u32, rn: u32) -> u32 {
    0xB9400000 | (rn << 5) | rt
}

/// `ldr x<rt>, [x<rn>]`
pub fn ldr_imm_x(rt: u32, rn: u32) -> u32 {
    0xF9400000 | (rn << 5) | rt
}

/// `ldrsw x<rt>, [x<rn>]`
pub fn ldrsw_imm(rt: u32, rn: u32) -> u32 {
    0xB9800000 | (rn << 5) | rt
}

/// `prfm <prfop=rt>, [x<rn>]`
pub fn prfm_imm(rt: u32, rn: u32) -> u32 {
    0xF9800000 | (rn << 5) | rt
}

/// `ldr s<rt>, [x<rn>]` - 32-bit SIMD&FP load.
pub fn ldr_imm_s(rt: u32, rn: u32) -> u32 {
    0xBD400000 | (rn << 5) | rt
}

/// `ldr d<rt>, [x<rn>]` - 64-bit SIMD&FP load.
pub fn ldr_imm_d(rt: u32, rn: u32) -> u32 {
    0xFD400000 | (rn << 5) | rt
}

/// `ldr q<rt>, [x<rn>]` - 128-bit SIMD&FP load.
pub fn ldr_imm_q(rt: u32, rn: u32) -> u32 {
    0x3DC00000 | (rn << 5) | rt
}

// === Classification ===

const B_MASK: u32 = 0xFC000000;
const B_OP: u32 = 0x14000000;
const BL_OP: u32 = 0x94000000;
const B_COND_MASK: u32 = 0xFF000010;
const B_COND_OP: u32 = 0x54000000;
const CB_MASK: u32 = 0x7F000000;
const CBZ_OP: u32 = 0x34000000;
const CBNZ_OP: u32 = 0x35000000;
const TB_MASK: u32 = 0x7F000000;
const TBZ_OP: u32 = 0x36000000;
const TBNZ_OP: u32 = 0x37000000;
const ADR_MASK: u32 = 0x9F000000;
const ADR_OP: u32 = 0x10000000;
const ADRP_OP: u32 = 0x90000000;
const LDR_LIT_MASK: u32 = 0x3B000000;
const LDR_LIT_OP: u32 = 0x18000000;

/// PC-relative instruction classes the relocator understands. Everything
/// else is [`Kind::Other`] and is copied verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Other,
    B,
    Bl,
    BCond,
    Cbz,
    Cbnz,
    Tbz,
    Tbnz,
    Adr,
    Adrp,
    LdrLit,
}

/// Classify one instruction word.
pub fn classify(instr: u32) -> Kind {
    if instr & B_MASK == B_OP {
        return Kind::B;
    }
    if instr & B_MASK == BL_OP {
        return Kind::Bl;
    }
    if instr & B_COND_MASK == B_COND_OP {
        return Kind::BCond;
    }
    if instr & CB_MASK == CBZ_OP {
        return Kind::Cbz;
    }
    if instr & CB_MASK == CBNZ_OP {
        return Kind::Cbnz;
    }
    if instr & TB_MASK == TBZ_OP {
        return Kind::Tbz;
    }
    if instr & TB_MASK == TBNZ_OP {
        return Kind::Tbnz;
    }
    if instr & ADR_MASK == ADR_OP {
        return Kind::Adr;
    }
    if instr & ADR_MASK == ADRP_OP {
        return Kind::Adrp;
    }
    if instr & LDR_LIT_MASK == LDR_LIT_OP {
        return Kind::LdrLit;
    }
    Kind::Other
}

// === Decode helpers ===

fn sign_extend(val: u64, bits: u32) -> i64 {
    let sign = 1u64 << (bits - 1);
    (val ^ sign).wrapping_sub(sign) as i64
}

/// Branch offset of a `B`/`BL` (imm26, bytes).
pub fn b_offset(instr: u32) -> i64 {
    sign_extend((instr & 0x3FFFFFF) as u64, 26) << 2
}

/// Branch offset of a `B.cond` (imm19, bytes).
pub fn cond_offset(instr: u32) -> i64 {
    sign_extend(((instr >> 5) & 0x7FFFF) as u64, 19) << 2
}

/// Branch offset of a `CBZ`/`CBNZ` (imm19, bytes).
pub fn cb_offset(instr: u32) -> i64 {
    cond_offset(instr)
}

/// Branch offset of a `TBZ`/`TBNZ` (imm14, bytes).
pub fn tb_offset(instr: u32) -> i64 {
    sign_extend(((instr >> 5) & 0x3FFF) as u64, 14) << 2
}

/// Literal offset of an `LDR` (literal) (imm19, bytes).
pub fn ldr_lit_offset(instr: u32) -> i64 {
    cond_offset(instr)
}

/// Offset of an `ADR` (immhi:immlo, bytes).
pub fn adr_offset(instr: u32) -> i64 {
    let immlo = ((instr >> 29) & 0x3) as u64;
    let immhi = ((instr >> 5) & 0x7FFFF) as u64;
    sign_extend((immhi << 2) | immlo, 21)
}

/// Offset of an `ADRP` (immhi:immlo pages, bytes).
pub fn adrp_offset(instr: u32) -> i64 {
    adr_offset(instr) << 12
}

fn rd(instr: u32) -> u32 {
    instr & 0x1F
}

// === Relocation ===

/// Instruction count of the absolute jump sequence.
pub const ABS_JUMP_WORDS: u32 = 4;

/// Conditional relocations branch over the absolute jump plus themselves.
const SKIP_WORDS: i32 = 1 + ABS_JUMP_WORDS as i32;

/// Emit the 16-byte absolute jump:
///
/// ```text
/// ldr x16, [pc, #8]
/// br  x16
/// <target low 32>
/// <target high 32>
/// ```
pub fn emit_abs_jump(buf: &mut CodeBuf, target: u64) -> Result<(), ArchError> {
    buf.emit(ldr_literal(16, 8))?;
    buf.emit(br(16))?;
    buf.emit_addr(target)
}

/// Materialize a 64-bit immediate into `rd` with the shortest `movz`/`movk`
/// run: `movz` for the first non-zero 16-bit chunk, `movk` for the rest.
/// Zero is a single `movz rd, #0`.
pub fn emit_mov_imm64(buf: &mut CodeBuf, rd: u32, imm: u64) -> Result<(), ArchError> {
    let chunks = [
        imm as u16,
        (imm >> 16) as u16,
        (imm >> 32) as u16,
        (imm >> 48) as u16,
    ];
    let mut seeded = false;
    for (i, &chunk) in chunks.iter().enumerate() {
        if chunk == 0 {
            continue;
        }
        let shift = 16 * i as u32;
        if seeded {
            buf.emit(movk(rd, chunk, shift))?;
        } else {
            buf.emit(movz(rd, chunk, shift))?;
            seeded = true;
        }
    }
    if !seeded {
        buf.emit(movz(rd, 0, 0))?;
    }
    Ok(())
}

fn relocate_b_cond(instr: u32, target: u64, buf: &mut CodeBuf) -> Result<(), ArchError> {
    // b.cond <target>  ->  b.!cond skip
    //                      <absolute jump to target>
    //                  skip:
    let inverted = instr ^ 0x1;
    let skip = B_COND_OP | (((SKIP_WORDS as u32) & 0x7FFFF) << 5) | (inverted & 0xF);
    buf.emit(skip)?;
    emit_abs_jump(buf, target)
}

fn relocate_cb(instr: u32, target: u64, buf: &mut CodeBuf) -> Result<(), ArchError> {
    // cbz xN, <target>  ->  cbnz xN, skip  (and vice versa)
    let sf = instr & (1 << 31);
    let op = (instr ^ (1 << 24)) & (1 << 24);
    let rt = instr & 0x1F;
    let skip = CBZ_OP | sf | op | (((SKIP_WORDS as u32) & 0x7FFFF) << 5) | rt;
    buf.emit(skip)?;
    emit_abs_jump(buf, target)
}

fn relocate_tb(instr: u32, target: u64, buf: &mut CodeBuf) -> Result<(), ArchError> {
    // tbz xN, #bit, <target>  ->  tbnz xN, #bit, skip  (and vice versa)
    let b5 = instr & (1 << 31);
    let op = (instr ^ (1 << 24)) & (1 << 24);
    let b40 = instr & (0x1F << 19);
    let rt = instr & 0x1F;
    let skip = TBZ_OP | b5 | op | b40 | (((SKIP_WORDS as u32) & 0x3FFF) << 5) | rt;
    buf.emit(skip)?;
    emit_abs_jump(buf, target)
}

fn relocate_ldr_lit(instr: u32, target: u64, buf: &mut CodeBuf) -> Result<(), ArchError> {
    let rt = instr & 0x1F;
    let opc = (instr >> 30) & 0x3;
    let v = (instr >> 26) & 0x1;

    // The load width comes from the original's V and opc fields.
    let load = if v == 1 {
        match opc {
            0 => ldr_imm_s(rt, 16),
            1 => ldr_imm_d(rt, 16),
            2 => ldr_imm_q(rt, 16),
            _ => return Err(ArchError::Unsupported),
        }
    } else {
        match opc {
            0 => ldr_imm_w(rt, 16),
            1 => ldr_imm_x(rt, 16),
            2 => ldrsw_imm(rt, 16),
            _ => prfm_imm(rt, 16),
        }
    };

    emit_mov_imm64(buf, 16, target)?;
    buf.emit(load)
}

/// Relocate one instruction observed at `pc`, appending an equivalent
/// sequence (1–5 words) to `buf`.
pub fn relocate(instr: u32, pc: u64, buf: &mut CodeBuf) -> Result<(), ArchError> {
    match classify(instr) {
        Kind::Other => buf.emit(instr),
        Kind::B => {
            let target = pc.wrapping_add(b_offset(instr) as u64);
            emit_abs_jump(buf, target)
        }
        Kind::Bl => {
            let target = pc.wrapping_add(b_offset(instr) as u64);
            // Link register = the instruction after this 5-word block.
            buf.emit(adr(30, 20))?;
            emit_abs_jump(buf, target)
        }
        Kind::BCond => {
            let target = pc.wrapping_add(cond_offset(instr) as u64);
            relocate_b_cond(instr, target, buf)
        }
        Kind::Cbz | Kind::Cbnz => {
            let target = pc.wrapping_add(cb_offset(instr) as u64);
            relocate_cb(instr, target, buf)
        }
        Kind::Tbz | Kind::Tbnz => {
            let target = pc.wrapping_add(tb_offset(instr) as u64);
            relocate_tb(instr, target, buf)
        }
        Kind::Adr => {
            let target = pc.wrapping_add(adr_offset(instr) as u64);
            emit_mov_imm64(buf, rd(instr), target)
        }
        Kind::Adrp => {
            let target = (pc & !0xFFF).wrapping_add(adrp_offset(instr) as u64);
            emit_mov_imm64(buf, rd(instr), target)
        }
        Kind::LdrLit => {
            let target = pc.wrapping_add(ldr_lit_offset(instr) as u64);
            relocate_ldr_lit(instr, target, buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reloc(instr: u32, pc: u64) -> Vec<u32> {
        let mut buf = CodeBuf::new(128, 0x7000_0000);
        relocate(instr, pc, &mut buf).unwrap();
        buf.words().to_vec()
    }

    #[test]
    fn test_fixed_encodings() {
        assert_eq!(ldr_literal(16, 8), 0x58000050);
        assert_eq!(br(16), 0xD61F0200);
        assert_eq!(blr(16), 0xD63F0200);
        assert_eq!(ret(), 0xD65F03C0);
        assert_eq!(NOP, 0xD503201F);
        assert_eq!(BTI_C, 0xD503245F);
        assert_eq!(push_one(0), 0xF81F0FE0);
        assert_eq!(pop_one(0), 0xF84107E0);
        assert_eq!(b(8), 0x14000002);
        assert_eq!(adr(30, 8), 0x1000005E);
    }

    #[test]
    fn test_movz_movk() {
        assert_eq!(movz(0, 0x1234, 0), 0xD2824680);
        assert_eq!(movk(0, 0x5678, 16), 0xF2AACF00);
        assert_eq!(movk(7, 0xDEF0, 48), 0xF2FBDE07);
    }

    #[test]
    fn test_classify_branches() {
        assert_eq!(classify(0x14000002), Kind::B);
        assert_eq!(classify(0x97FFFFF0), Kind::Bl);
        assert_eq!(classify(0x54000040), Kind::BCond);
        assert_eq!(classify(0x34000083), Kind::Cbz);
        assert_eq!(classify(0xB5000083), Kind::Cbnz);
        assert_eq!(classify(0x36180040), Kind::Tbz);
        assert_eq!(classify(0x37180040), Kind::Tbnz);
    }

    #[test]
    fn test_classify_addressing() {
        assert_eq!(classify(0x10000001), Kind::Adr);
        assert_eq!(classify(0x90000001), Kind::Adrp);
        assert_eq!(classify(0x58000041), Kind::LdrLit);
        assert_eq!(classify(0x1C000040), Kind::LdrLit);
    }

    #[test]
    fn test_classify_other() {
        assert_eq!(classify(NOP), Kind::Other);
        // add x0, x0, #1
        assert_eq!(classify(0x91000400), Kind::Other);
        // ldr x0, [x1] (register base, not literal)
        assert_eq!(classify(0xF9400020), Kind::Other);
    }

    #[test]
    fn test_decode_offsets() {
        assert_eq!(b_offset(0x14000002), 8);
        assert_eq!(b_offset(0x17FFFFFF), -4);
        assert_eq!(cond_offset(0x54000040), 8);
        assert_eq!(tb_offset(0x36180040), 8);
        assert_eq!(adr_offset(adr(5, -16)), -16);
        assert_eq!(adr_offset(adr(5, 1044)), 1044);
        assert_eq!(adrp_offset(0x90000001 | (1 << 29)), 0x1000);
    }

    #[test]
    fn test_mov_imm64_zero() {
        let mut buf = CodeBuf::new(64, 0);
        emit_mov_imm64(&mut buf, 3, 0).unwrap();
        assert_eq!(buf.words(), &[movz(3, 0, 0)]);
    }

    #[test]
    fn test_mov_imm64_single_chunk() {
        let mut buf = CodeBuf::new(64, 0);
        emit_mov_imm64(&mut buf, 0, 0x5678_0000_0000).unwrap();
        assert_eq!(buf.words(), &[movz(0, 0x5678, 32)]);
    }

    #[test]
    fn test_mov_imm64_sparse() {
        let mut buf = CodeBuf::new(64, 0);
        emit_mov_imm64(&mut buf, 9, 0xFFFF_0000_0000_1234).unwrap();
        assert_eq!(buf.words(), &[movz(9, 0x1234, 0), movk(9, 0xFFFF, 48)]);
    }

    #[test]
    fn test_mov_imm64_full() {
        let mut buf = CodeBuf::new(64, 0);
        emit_mov_imm64(&mut buf, 0, 0xDEF0_9ABC_5678_1234).unwrap();
        assert_eq!(
            buf.words(),
            &[
                movz(0, 0x1234, 0),
                movk(0, 0x5678, 16),
                movk(0, 0x9ABC, 32),
                movk(0, 0xDEF0, 48),
            ]
        );
    }

    #[test]
    fn test_relocate_verbatim() {
        assert_eq!(reloc(NOP, 0x1000), vec![NOP]);
        assert_eq!(reloc(0x91000400, 0x1000), vec![0x91000400]);
    }

    #[test]
    fn test_relocate_b() {
        let words = reloc(b(0x1000), 0x4000_0000);
        assert_eq!(
            words,
            vec![ldr_literal(16, 8), br(16), 0x4000_1000, 0x0000_0000]
        );
    }

    #[test]
    fn test_relocate_bl_links_past_block() {
        let words = reloc(0x94000004, 0x4000_0000);
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], adr(30, 20));
        assert_eq!(&words[1..], &[ldr_literal(16, 8), br(16), 0x4000_0010, 0]);
    }

    #[test]
    fn test_relocate_b_cond_inverts_and_skips() {
        // b.eq +8 at 0x1000
        let words = reloc(0x54000040, 0x1000);
        assert_eq!(words[0], 0x540000A1); // b.ne skip(5 words)
        assert_eq!(&words[1..], &[ldr_literal(16, 8), br(16), 0x1008, 0]);
    }

    #[test]
    fn test_relocate_cbz() {
        // cbz x3, +16 at 0x2000
        let words = reloc(0xB4000083, 0x2000);
        assert_eq!(words[0], 0xB50000A3); // cbnz x3, skip
        assert_eq!(&words[1..], &[ldr_literal(16, 8), br(16), 0x2010, 0]);
    }

    #[test]
    fn test_relocate_tbz_preserves_fields() {
        // tbz x0, #3, +8 at 0x3000
        let words = reloc(0x36180040, 0x3000);
        assert_eq!(words[0], 0x371800A0); // tbnz x0, #3, skip
        assert_eq!(&words[1..], &[ldr_literal(16, 8), br(16), 0x3008, 0]);
    }

    #[test]
    fn test_relocate_adr() {
        let words = reloc(adr(5, 0x100), 0x10_0000);
        let mut expect = CodeBuf::new(64, 0);
        emit_mov_imm64(&mut expect, 5, 0x10_0100).unwrap();
        assert_eq!(words, expect.words());
    }

    #[test]
    fn test_relocate_adrp_page_math() {
        // adrp x1, +1 page at a mid-page PC
        let instr = 0x90000001 | (1 << 29);
        let words = reloc(instr, 0x40_0ABC);
        let mut expect = CodeBuf::new(64, 0);
        emit_mov_imm64(&mut expect, 1, 0x40_1000).unwrap();
        assert_eq!(words, expect.words());
    }

    #[test]
    fn test_relocate_ldr_literal_widths() {
        // ldr x1, +8
        let words = reloc(0x58000041, 0x5000);
        assert_eq!(*words.last().unwrap(), ldr_imm_x(1, 16));
        // ldr w1, +8
        let words = reloc(0x18000041, 0x5000);
        assert_eq!(*words.last().unwrap(), ldr_imm_w(1, 16));
        // ldrsw x1, +8
        let words = reloc(0x98000041, 0x5000);
        assert_eq!(*words.last().unwrap(), ldrsw_imm(1, 16));
    }

    #[test]
    fn test_relocate_ldr_literal_simd() {
        // ldr s0 / d0 / q0, +8
        let words = reloc(0x1C000040, 0x5000);
        assert_eq!(*words.last().unwrap(), ldr_imm_s(0, 16));
        let words = reloc(0x5C000040, 0x5000);
        assert_eq!(*words.last().unwrap(), ldr_imm_d(0, 16));
        let words = reloc(0x9C000040, 0x5000);
        assert_eq!(*words.last().unwrap(), ldr_imm_q(0, 16));
    }

    #[test]
    fn test_relocate_ldr_literal_simd_opc3_unsupported() {
        let mut buf = CodeBuf::new(128, 0);
        let res = relocate(0xDC000040, 0x5000, &mut buf);
        assert!(matches!(res, Err(ArchError::Unsupported)));
    }

    #[test]
    fn test_relocation_deterministic_across_pcs() {
        // Same instruction at two PCs: identical shape, only literals move.
        let a = reloc(b(0x1000), 0x1000_0000);
        let b_ = reloc(b(0x1000), 0x2000_0000);
        assert_eq!(a.len(), b_.len());
        assert_eq!(a[..2], b_[..2]);
        assert_eq!(a[2], 0x1000_1000);
        assert_eq!(b_[2], 0x2000_1000);
    }
}
