//! armature arch - ARM instruction encoders and relocators
//!
//! Pure code generation for the three supported instruction-set modes:
//! AArch64, 32-bit ARM (A32), and Thumb/Thumb-2. Nothing in this crate
//! reads or writes process memory; every entry point maps bytes in to
//! bytes out. The [`Mode`] profile ties the per-mode constants and
//! builders together so the hooking layers above stay
//! architecture-agnostic.

pub mod aarch64;
pub mod arm32;
mod buffer;
pub mod thumb;

pub use buffer::{CodeBuf, HalfBuf};

/// Relocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArchError {
    /// The instruction is recognized as PC-relative but no equivalent
    /// sequence can be emitted (unrepresentable target, truncated
    /// encoding, unallocated operand combination).
    #[error("instruction cannot be relocated")]
    Unsupported,

    /// The relocated sequence would exceed the trampoline capacity.
    #[error("relocated code exceeds the trampoline capacity")]
    Overflow,
}

/// Is the Thumb mode bit set on this function address?
pub fn is_thumb(addr: u64) -> bool {
    addr & 1 == 1
}

/// Strip the Thumb mode bit, yielding the canonical code address.
pub fn strip_thumb(addr: u64) -> u64 {
    addr & !1
}

/// Set the Thumb mode bit on a code address.
pub fn with_thumb(addr: u64) -> u64 {
    addr | 1
}

/// Instruction-set mode of a single hook target.
///
/// On AArch64 every target is [`Mode::Aarch64`]; on 32-bit ARM the Thumb
/// bit of the target address picks [`Mode::Arm32`] or [`Mode::Thumb`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Aarch64,
    Arm32,
    Thumb,
}

impl Mode {
    /// Bytes overwritten at the target: the detour-jump pattern size.
    pub const fn patch_size(self) -> usize {
        match self {
            Mode::Aarch64 => 16,
            Mode::Arm32 => 12,
            Mode::Thumb => 12,
        }
    }

    /// Executable bytes reserved for a trampoline.
    pub const fn capacity(self) -> usize {
        match self {
            Mode::Aarch64 => 128,
            Mode::Arm32 => 64,
            Mode::Thumb => 64,
        }
    }

    /// The fixed detour-jump pattern written over the target prologue.
    ///
    /// `detour` keeps whatever Thumb bit the caller supplied; on Thumb the
    /// embedded literal is consumed by `bx`, which uses the bit to select
    /// the execution state.
    pub fn detour_jump(self, detour: u64) -> Result<Vec<u8>, ArchError> {
        match self {
            Mode::Aarch64 => {
                let mut buf = CodeBuf::new(self.patch_size(), 0);
                aarch64::emit_abs_jump(&mut buf, detour)?;
                Ok(buf.into_bytes())
            }
            Mode::Arm32 => {
                let mut buf = CodeBuf::new(self.patch_size(), 0);
                arm32::emit_abs_jump(&mut buf, detour)?;
                Ok(buf.into_bytes())
            }
            Mode::Thumb => {
                let mut buf = HalfBuf::new(self.patch_size(), 0);
                thumb::emit_abs_jump(&mut buf, detour)?;
                Ok(buf.into_bytes())
            }
        }
    }

    /// Assemble a trampoline image for `prologue`, the original bytes read
    /// from canonical address `target`. `base` is the address the image
    /// will execute at.
    ///
    /// Layout: landing pad (`bti c` on AArch64, a no-op elsewhere),
    /// the relocated prologue, then an absolute jump back to
    /// `target + patch_size`.
    pub fn trampoline(self, prologue: &[u8], target: u64, base: u64) -> Result<Vec<u8>, ArchError> {
        if prologue.len() != self.patch_size() {
            return Err(ArchError::Unsupported);
        }

        match self {
            Mode::Aarch64 => {
                let mut buf = CodeBuf::new(self.capacity(), base);
                buf.emit(aarch64::BTI_C)?;
                for (i, word) in prologue.chunks_exact(4).enumerate() {
                    let instr = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                    let pc = target + (i as u64 * 4);
                    aarch64::relocate(instr, pc, &mut buf)?;
                }
                aarch64::emit_abs_jump(&mut buf, target + self.patch_size() as u64)?;
                Ok(buf.into_bytes())
            }
            Mode::Arm32 => {
                let mut buf = CodeBuf::new(self.capacity(), base);
                buf.emit(arm32::NOP)?;
                for (i, word) in prologue.chunks_exact(4).enumerate() {
                    let instr = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                    let pc = target + (i as u64 * 4);
                    arm32::relocate(instr, pc, &mut buf)?;
                }
                arm32::emit_abs_jump(&mut buf, target + self.patch_size() as u64)?;
                Ok(buf.into_bytes())
            }
            Mode::Thumb => {
                let halves: Vec<u16> = prologue
                    .chunks_exact(2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .collect();

                let mut buf = HalfBuf::new(self.capacity(), base);
                buf.emit16(thumb::NOP)?;
                thumb::relocate_stream(&halves, target, &mut buf)?;
                // Return to the rest of the body in Thumb state.
                if buf.len_bytes() % 4 != 0 {
                    buf.emit16(thumb::NOP)?;
                }
                thumb::emit_abs_jump(&mut buf, with_thumb(target + self.patch_size() as u64))?;
                Ok(buf.into_bytes())
            }
        }
    }
}
