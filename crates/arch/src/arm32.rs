//! 32-bit ARM (A32) instruction encoding and relocation
//!
//! A32 PC semantics: reading PC yields the current instruction address
//! plus 8. Every decode helper folds that pipeline offset in, so computed
//! targets are plain absolute addresses.

use crate::buffer::CodeBuf;
use crate::ArchError;

/// `mov r0, r0` - the conventional A32 no-op.
pub const NOP: u32 = 0xE1A00000;

/// `ldr pc, [pc, #-12]` - loads PC from the word embedded one instruction
/// back (PC reads as the `ldr` address + 8, so -12 lands on it).
pub const LDR_PC_M12: u32 = 0xE51FF00C;

const COND_AL: u32 = 0xE0000000;

// === Encoders ===

/// `b <offset>` - offset in bytes from the branch instruction itself.
pub fn b(offset: i32) -> u32 {
    COND_AL | 0x0A000000 | ((((offset - 8) >> 2) as u32) & 0x00FFFFFF)
}

/// `bl <offset>`
pub fn bl(offset: i32) -> u32 {
    COND_AL | 0x0B000000 | ((((offset - 8) >> 2) as u32) & 0x00FFFFFF)
}

/// `bx r<rm>`
pub fn bx(rm: u32) -> u32 {
    0xE12FFF10 | rm
}

/// `movw r<rd>, #imm16` (ARMv6T2+)
pub fn movw(rd: u32, imm16: u16) -> u32 {
    let imm = imm16 as u32;
    0xE3000000 | ((imm & 0xF000) << 4) | (rd << 12) | (imm & 0xFFF)
}

/// `movt r<rd>, #imm16` (ARMv6T2+)
pub fn movt(rd: u32, imm16: u16) -> u32 {
    let imm = imm16 as u32;
    0xE3400000 | ((imm & 0xF000) << 4) | (rd << 12) | (imm & 0xFFF)
}

/// `str r<rd>, [sp, #-4]!` - push one register.
pub fn push_one(rd: u32) -> u32 {
    0xE52D0004 | (rd << 12)
}

/// `ldr r<rd>, [sp], #4` - pop one register.
pub fn pop_one(rd: u32) -> u32 {
    0xE49D0004 | (rd << 12)
}

/// `add lr, pc, #imm` with the original condition preserved.
pub fn add_lr_pc(cond: u32, imm: u32) -> u32 {
    cond | 0x028FE000 | (imm & 0xFF)
}

/// `ldr r<rt>, [r<rn>]`
pub fn ldr_reg(rt: u32, rn: u32) -> u32 {
    0xE5900000 | (rn << 16) | (rt << 12)
}

// === Classification ===

const LDR_LIT_MASK: u32 = 0x0F7F0000;
const LDR_LIT_OP: u32 = 0x051F0000;
const ADR_MASK: u32 = 0x0FFF0000;
const ADR_ADD_OP: u32 = 0x028F0000;
const ADR_SUB_OP: u32 = 0x024F0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Other,
    B,
    Bl,
    LdrLit,
    Adr,
}

/// Classify one A32 word. The cond=0b1111 extension space is never
/// PC-relative in a way this relocator rewrites, so it falls to `Other`.
pub fn classify(instr: u32) -> Kind {
    if instr >> 28 == 0xF {
        return Kind::Other;
    }
    if instr & 0x0E000000 == 0x0A000000 {
        return Kind::B;
    }
    if instr & 0x0E000000 == 0x0B000000 {
        return Kind::Bl;
    }
    if instr & LDR_LIT_MASK == LDR_LIT_OP {
        return Kind::LdrLit;
    }
    if instr & ADR_MASK == ADR_ADD_OP || instr & ADR_MASK == ADR_SUB_OP {
        return Kind::Adr;
    }
    Kind::Other
}

// === Decode helpers ===

fn sign_extend(val: u32, bits: u32) -> i32 {
    let sign = 1u32 << (bits - 1);
    (val ^ sign).wrapping_sub(sign) as i32
}

/// Byte offset of a `B`/`BL`, pipeline offset included.
pub fn b_offset(instr: u32) -> i32 {
    (sign_extend(instr & 0x00FFFFFF, 24) << 2) + 8
}

/// Byte offset of an `LDR r<t>, [pc, #±imm12]`, pipeline offset included.
pub fn ldr_lit_offset(instr: u32) -> i32 {
    let imm = (instr & 0xFFF) as i32;
    if instr & (1 << 23) != 0 {
        imm + 8
    } else {
        -imm + 8
    }
}

fn rd(instr: u32) -> u32 {
    (instr >> 12) & 0xF
}

fn cond(instr: u32) -> u32 {
    instr & 0xF0000000
}

// === Relocation ===

fn to_u32(target: u64) -> Result<u32, ArchError> {
    u32::try_from(target).map_err(|_| ArchError::Unsupported)
}

/// Emit the 12-byte absolute jump:
///
/// ```text
/// b   +4                ; skip the embedded word
/// .word <target>
/// ldr pc, [pc, #-12]
/// ```
pub fn emit_abs_jump(buf: &mut CodeBuf, target: u64) -> Result<(), ArchError> {
    buf.emit(0xEA000000)?;
    buf.emit(to_u32(target)?)?;
    buf.emit(LDR_PC_M12)
}

fn emit_mov32(buf: &mut CodeBuf, cond: u32, rd: u32, value: u32) -> Result<(), ArchError> {
    buf.emit(cond | (movw(rd, value as u16) & 0x0FFFFFFF))?;
    buf.emit(cond | (movt(rd, (value >> 16) as u16) & 0x0FFFFFFF))
}

/// Relocate one A32 instruction observed at `pc`, appending an equivalent
/// sequence (1–4 words) to `buf`.
pub fn relocate(instr: u32, pc: u64, buf: &mut CodeBuf) -> Result<(), ArchError> {
    match classify(instr) {
        Kind::Other => buf.emit(instr),
        Kind::B => {
            let target = pc.wrapping_add(b_offset(instr) as i64 as u64);
            let c = cond(instr);
            if c == COND_AL {
                emit_abs_jump(buf, target)
            } else {
                // b<cond> <target>  ->  b<!cond> skip
                //                       <absolute jump to target>
                //                   skip:
                let inv = c ^ 0x10000000;
                buf.emit(inv | 0x0A000002)?;
                emit_abs_jump(buf, target)
            }
        }
        Kind::Bl => {
            let target = pc.wrapping_add(b_offset(instr) as i64 as u64);
            let c = cond(instr);
            // Link register = the instruction after the 4-word block;
            // add lr, pc, #8 reads PC as its own address + 8.
            buf.emit(add_lr_pc(c, 8))?;
            emit_abs_jump(buf, target)
        }
        Kind::LdrLit => {
            let target = pc.wrapping_add(ldr_lit_offset(instr) as i64 as u64);
            let rt = rd(instr);
            let c = cond(instr);
            emit_mov32(buf, c, rt, to_u32(target)?)?;
            buf.emit(c | (ldr_reg(rt, rt) & 0x0FFFFFFF))
        }
        Kind::Adr => {
            let imm = instr & 0xFF;
            let rot = ((instr >> 8) & 0xF) * 2;
            let mut off = imm.rotate_right(rot) as i64;
            if instr & 0x00F00000 == 0x00400000 {
                off = -off;
            }
            let target = pc.wrapping_add(8).wrapping_add(off as u64);
            emit_mov32(buf, cond(instr), rd(instr), to_u32(target)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reloc(instr: u32, pc: u64) -> Vec<u32> {
        let mut buf = CodeBuf::new(64, 0x8000);
        relocate(instr, pc, &mut buf).unwrap();
        buf.words().to_vec()
    }

    #[test]
    fn test_fixed_encodings() {
        assert_eq!(NOP, 0xE1A00000);
        assert_eq!(LDR_PC_M12, 0xE51FF00C);
        assert_eq!(movw(0, 0x1234), 0xE3010234);
        assert_eq!(movt(0, 0x5678), 0xE3450678);
        assert_eq!(push_one(4), 0xE52D4004);
        assert_eq!(pop_one(4), 0xE49D4004);
        assert_eq!(b(8), 0xEA000000);
        assert_eq!(bl(8), 0xEB000000);
        assert_eq!(bx(0), 0xE12FFF10);
        assert_eq!(ldr_reg(3, 3), 0xE5933000);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(0xEA000010), Kind::B); // b
        assert_eq!(classify(0x0A000010), Kind::B); // beq
        assert_eq!(classify(0xEB000010), Kind::Bl); // bl
        assert_eq!(classify(0xE59F1008), Kind::LdrLit); // ldr r1, [pc, #8]
        assert_eq!(classify(0xE51F2004), Kind::LdrLit); // ldr r2, [pc, #-4]
        assert_eq!(classify(0xE28F5008), Kind::Adr); // add r5, pc, #8
        assert_eq!(classify(0xE24F5008), Kind::Adr); // sub r5, pc, #8
        assert_eq!(classify(NOP), Kind::Other);
        assert_eq!(classify(0xE5912000), Kind::Other); // ldr r2, [r1]
        assert_eq!(classify(0xFA000010), Kind::Other); // blx (cond=0b1111 space)
    }

    #[test]
    fn test_b_offset_pipeline() {
        // b with imm24=0 branches to pc+8
        assert_eq!(b_offset(0xEA000000), 8);
        assert_eq!(b_offset(0xEAFFFFFF), 4);
        assert_eq!(b_offset(0xEA000001), 12);
    }

    #[test]
    fn test_ldr_lit_offset_signs() {
        assert_eq!(ldr_lit_offset(0xE59F1008), 16); // +8 literal, +8 pipeline
        assert_eq!(ldr_lit_offset(0xE51F100C), -4);
    }

    #[test]
    fn test_relocate_unconditional_b() {
        let words = reloc(0xEA000002, 0x1_0000); // b +16
        assert_eq!(words, vec![0xEA000000, 0x1_0010, LDR_PC_M12]);
    }

    #[test]
    fn test_relocate_conditional_b_inverts() {
        let words = reloc(0x0A000002, 0x1_0000); // beq +16
        assert_eq!(words[0], 0x1A000002); // bne over the jump
        assert_eq!(&words[1..], &[0xEA000000, 0x1_0010, LDR_PC_M12]);
    }

    #[test]
    fn test_relocate_bl_sets_lr_past_block() {
        let words = reloc(0xEB000002, 0x1_0000); // bl +16
        assert_eq!(words[0], 0xE28FE008); // add lr, pc, #8
        assert_eq!(&words[1..], &[0xEA000000, 0x1_0010, LDR_PC_M12]);
    }

    #[test]
    fn test_relocate_bl_preserves_cond() {
        let words = reloc(0x0B000002, 0x1_0000); // bleq +16
        assert_eq!(words[0], 0x028FE008);
    }

    #[test]
    fn test_relocate_ldr_literal() {
        // ldr r1, [pc, #8] at 0x2_0000 reads 0x2_0010
        let words = reloc(0xE59F1008, 0x2_0000);
        assert_eq!(
            words,
            vec![
                0xE3000000 | (1 << 12) | 0x010, // movw r1, #0x0010
                0xE3400000 | (1 << 12) | 0x002, // movt r1, #0x0002
                0xE5911000,                     // ldr r1, [r1]
            ]
        );
    }

    #[test]
    fn test_relocate_adr_rotated_imm() {
        // add r5, pc, #8 -> r5 = pc + 16
        let words = reloc(0xE28F5008, 0x2_0000);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0] & 0xFFF, 0x010);
        // sub r5, pc, #8 -> r5 = pc
        let words = reloc(0xE24F5008, 0x2_0000);
        assert_eq!(words[0] & 0xFFF, 0x000);
        assert_eq!(words[1] & 0xFFF, 0x002); // movt carries the high half
    }

    #[test]
    fn test_relocate_target_must_fit_32_bits() {
        let res = relocate(0xEA000002, 0x1_0000_0000, &mut CodeBuf::new(64, 0));
        assert!(matches!(res, Err(ArchError::Unsupported)));
    }
}
