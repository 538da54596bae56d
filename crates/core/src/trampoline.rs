//! Trampoline construction
//!
//! A trampoline is an executable fragment holding the relocated target
//! prologue followed by an absolute jump back into the unpatched body.
//! The region is written exactly once here and is read-only to callers
//! from then on.

use std::ptr::NonNull;
use std::sync::Arc;

use armature_arch::Mode;

use crate::error::Result;
use crate::platform::Platform;

/// An owned executable region holding one trampoline.
pub(crate) struct Trampoline {
    base: NonNull<u8>,
    len: usize,
    capacity: usize,
    platform: Arc<dyn Platform>,
}

// The region is written once at build time and freed once on drop; the
// platform handle serializes nothing else through it.
unsafe impl Send for Trampoline {}

impl Trampoline {
    /// Allocate a region of the mode's capacity, assemble the relocated
    /// prologue plus return jump into it, and flush the instruction
    /// cache over its extent. Frees the region on any failure.
    pub(crate) fn build(
        platform: Arc<dyn Platform>,
        mode: Mode,
        prologue: &[u8],
        target: u64,
    ) -> Result<Self> {
        let capacity = mode.capacity();
        let base = platform.alloc_executable(capacity)?;

        let code = match mode.trampoline(prologue, target, base.as_ptr() as u64) {
            Ok(code) => code,
            Err(e) => {
                unsafe { platform.free_executable(base, capacity) };
                return Err(e.into());
            }
        };

        if let Err(e) = unsafe { platform.write_code(base.as_ptr(), &code) } {
            unsafe { platform.free_executable(base, capacity) };
            return Err(e);
        }
        platform.flush_icache(base.as_ptr() as usize, code.len());

        tracing::debug!(
            "trampoline for {:#x} at {:#x} ({} bytes)",
            target,
            base.as_ptr() as usize,
            code.len()
        );

        Ok(Self {
            base,
            len: code.len(),
            capacity,
            platform,
        })
    }

    /// Base address of the executable region.
    pub(crate) fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Assembled code length in bytes.
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        unsafe { self.platform.free_executable(self.base, self.capacity) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MmapPlatform;
    use armature_arch::aarch64;
    use parking_lot::Mutex;

    fn nop_prologue() -> Vec<u8> {
        std::iter::repeat(aarch64::NOP.to_le_bytes())
            .take(4)
            .flatten()
            .collect()
    }

    /// Adapter that forwards to [`MmapPlatform`] and records every
    /// region allocation and release as `(address, size)`.
    struct RecordingPlatform {
        inner: MmapPlatform,
        allocs: Mutex<Vec<(usize, usize)>>,
        frees: Mutex<Vec<(usize, usize)>>,
    }

    impl RecordingPlatform {
        fn new() -> Self {
            Self {
                inner: MmapPlatform,
                allocs: Mutex::new(Vec::new()),
                frees: Mutex::new(Vec::new()),
            }
        }
    }

    impl Platform for RecordingPlatform {
        fn alloc_executable(&self, size: usize) -> Result<NonNull<u8>> {
            let region = self.inner.alloc_executable(size)?;
            self.allocs.lock().push((region.as_ptr() as usize, size));
            Ok(region)
        }

        unsafe fn free_executable(&self, region: NonNull<u8>, size: usize) {
            self.frees.lock().push((region.as_ptr() as usize, size));
            self.inner.free_executable(region, size);
        }

        fn make_writable(&self, addr: usize, len: usize) -> Result<()> {
            self.inner.make_writable(addr, len)
        }

        fn make_executable(&self, addr: usize, len: usize) -> Result<()> {
            self.inner.make_executable(addr, len)
        }

        unsafe fn write_code(&self, dst: *mut u8, src: &[u8]) -> Result<()> {
            self.inner.write_code(dst, src)
        }

        fn flush_icache(&self, addr: usize, len: usize) {
            self.inner.flush_icache(addr, len)
        }
    }

    #[test]
    fn test_build_publishes_assembled_code() {
        let platform: Arc<dyn Platform> = Arc::new(MmapPlatform);
        let tramp =
            Trampoline::build(platform, Mode::Aarch64, &nop_prologue(), 0x40_0000).unwrap();

        assert_ne!(tramp.addr(), 0);
        assert_eq!(tramp.len(), 36); // bti + 4 nops + 4-word jump
        let words = unsafe {
            std::slice::from_raw_parts(tramp.addr() as *const u32, tramp.len() / 4)
        };
        assert_eq!(words[0], aarch64::BTI_C);
        assert_eq!(words[8], 0x0000_0000);
        assert_eq!(words[7], 0x40_0010);
    }

    #[test]
    fn test_build_failure_frees_region() {
        let recorder = Arc::new(RecordingPlatform::new());
        let platform: Arc<dyn Platform> = recorder.clone();

        // ldr q-form with the unallocated opc=3/V=1 combination
        let mut prologue = nop_prologue();
        prologue[..4].copy_from_slice(&0xDC000040u32.to_le_bytes());
        let res = Trampoline::build(platform, Mode::Aarch64, &prologue, 0x40_0000);
        assert!(res.is_err());

        // The failing allocation was released, at its full capacity.
        let allocs = recorder.allocs.lock().clone();
        let frees = recorder.frees.lock().clone();
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].1, Mode::Aarch64.capacity());
        assert_eq!(frees, allocs);
    }

    #[test]
    fn test_region_released_on_drop_not_before() {
        let recorder = Arc::new(RecordingPlatform::new());
        let platform: Arc<dyn Platform> = recorder.clone();

        let tramp = Trampoline::build(platform, Mode::Aarch64, &nop_prologue(), 0x40_0000).unwrap();
        let base = tramp.addr();
        assert!(recorder.frees.lock().is_empty());

        drop(tramp);
        assert_eq!(
            recorder.frees.lock().as_slice(),
            &[(base, Mode::Aarch64.capacity())]
        );
    }
}
