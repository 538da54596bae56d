//! User-space platform adapter
//!
//! Executable regions come from anonymous RWX mappings; target-page
//! protection changes go through `region`; cache maintenance is the
//! architecture's clean/invalidate/barrier dance issued directly.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use super::Platform;
use crate::error::{HookError, Result};

/// Platform adapter backed by `mmap`/`mprotect`.
pub struct MmapPlatform;

impl Platform for MmapPlatform {
    fn alloc_executable(&self, size: usize) -> Result<NonNull<u8>> {
        let size = NonZeroUsize::new(size).ok_or(HookError::InvalidArgument)?;

        let mapping = unsafe {
            mmap_anonymous(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(|e| {
            tracing::error!("executable mmap of {} bytes failed: {}", size, e);
            HookError::OutOfMemory
        })?;

        Ok(mapping.cast())
    }

    unsafe fn free_executable(&self, region: NonNull<u8>, size: usize) {
        if let Err(e) = munmap(region.cast(), size) {
            tracing::warn!("munmap of trampoline region failed: {}", e);
        }
    }

    fn make_writable(&self, addr: usize, len: usize) -> Result<()> {
        unsafe {
            region::protect(
                addr as *const u8,
                len,
                region::Protection::READ_WRITE_EXECUTE,
            )
        }
        .map_err(|e| {
            tracing::error!("could not make {:#x}+{} writable: {}", addr, len, e);
            HookError::PermissionDenied
        })
    }

    fn make_executable(&self, addr: usize, len: usize) -> Result<()> {
        unsafe { region::protect(addr as *const u8, len, region::Protection::READ_EXECUTE) }
            .map_err(|e| {
                tracing::error!("could not restore {:#x}+{} to rx: {}", addr, len, e);
                HookError::PermissionDenied
            })
    }

    unsafe fn write_code(&self, dst: *mut u8, src: &[u8]) -> Result<()> {
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        Ok(())
    }

    fn flush_icache(&self, addr: usize, len: usize) {
        flush_icache_impl(addr, len);
    }
}

#[cfg(target_arch = "aarch64")]
fn flush_icache_impl(addr: usize, len: usize) {
    use std::arch::asm;

    let start = addr;
    let end = addr + len;

    unsafe {
        asm!("dsb ish");
        for p in (start..end).step_by(4) {
            asm!("dc cvau, {0}", in(reg) p);
        }
        asm!("dsb ish");
        for p in (start..end).step_by(4) {
            asm!("ic ivau, {0}", in(reg) p);
        }
        asm!("dsb ish");
        asm!("isb");
    }
}

#[cfg(target_arch = "arm")]
fn flush_icache_impl(addr: usize, len: usize) {
    // __ARM_NR_cacheflush
    const CACHEFLUSH: libc::c_long = 0x0F0002;
    unsafe {
        libc::syscall(CACHEFLUSH, addr, addr + len, 0usize);
    }
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "arm")))]
fn flush_icache_impl(_addr: usize, _len: usize) {
    // Non-ARM hosts only assemble and inspect code, never execute it.
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
