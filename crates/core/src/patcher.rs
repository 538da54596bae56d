//! Patch sequencer
//!
//! The sole writer of target bytes. Widens the target pages, writes
//! either the detour jump or the saved original prologue, flushes the
//! instruction cache, and narrows protection back on every exit path.
//! Callers hold the registry lock across the whole sequence.

use crate::error::Result;
use crate::platform::Platform;

/// Restores read-execute protection when dropped.
struct ExecRestore<'a> {
    platform: &'a dyn Platform,
    addr: usize,
    len: usize,
}

impl Drop for ExecRestore<'_> {
    fn drop(&mut self) {
        if self.platform.make_executable(self.addr, self.len).is_err() {
            tracing::warn!("target {:#x} left writable after patch", self.addr);
        }
    }
}

/// Overwrite the first `bytes.len()` bytes at `target`.
///
/// Either all bytes are written and made coherent, or the target is
/// untouched; protection is restored in both cases.
pub(crate) fn write_target(platform: &dyn Platform, target: usize, bytes: &[u8]) -> Result<()> {
    platform.make_writable(target, bytes.len())?;
    let _restore = ExecRestore {
        platform,
        addr: target,
        len: bytes.len(),
    };

    unsafe { platform.write_code(target as *mut u8, bytes)? };
    platform.flush_icache(target, bytes.len());
    Ok(())
}
