//! Platform adapter
//!
//! The narrow contract the hooking core consumes for everything that
//! touches process or kernel memory: executable allocation, page
//! protection, code writes, instruction-cache maintenance, and (for
//! privileged embedders) symbol resolution.
//!
//! [`MmapPlatform`] is the user-space implementation. A kernel embedder
//! provides its own `Platform` whose `write_code` wraps the kernel's
//! atomic text-patching primitive and whose protection hooks are no-ops,
//! and injects it through [`crate::registry::init_with`].

use std::ptr::NonNull;

use crate::error::{HookError, Result};

#[cfg(unix)]
mod mmap;

#[cfg(unix)]
pub use mmap::MmapPlatform;

/// Memory and symbol services consumed by the hooking core.
pub trait Platform: Send + Sync {
    /// Allocate `size` bytes of zero-filled read-write-execute memory.
    fn alloc_executable(&self, size: usize) -> Result<NonNull<u8>>;

    /// Release a region returned by [`Platform::alloc_executable`].
    ///
    /// # Safety
    /// `region` must come from `alloc_executable` on this platform with
    /// the same `size`, and no code in it may still be executing.
    unsafe fn free_executable(&self, region: NonNull<u8>, size: usize);

    /// Widen protection on the page(s) spanning `[addr, addr + len)` so
    /// they can be written.
    fn make_writable(&self, addr: usize, len: usize) -> Result<()>;

    /// Narrow protection on the page(s) spanning `[addr, addr + len)`
    /// back to read-execute.
    fn make_executable(&self, addr: usize, len: usize) -> Result<()>;

    /// Copy machine code into a code region.
    ///
    /// # Safety
    /// `dst` must be writable for `src.len()` bytes under this platform's
    /// rules (after `make_writable`, or through a kernel patch primitive
    /// that manages protection itself).
    unsafe fn write_code(&self, dst: *mut u8, src: &[u8]) -> Result<()>;

    /// Make `[addr, addr + len)` coherent for instruction fetch: data
    /// cache clean to the point of unification, instruction cache
    /// invalidate, then an instruction synchronization barrier.
    fn flush_icache(&self, addr: usize, len: usize);

    /// Resolve a symbol to an address. Only meaningful for privileged
    /// embedders; the default refuses.
    fn resolve_symbol(&self, name: &str) -> Result<usize> {
        Err(HookError::ResolveFailure(name.to_string()))
    }
}
