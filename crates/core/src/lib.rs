//! armature - runtime function interception for the ARM family
//!
//! Given the address of a loaded function (the *target*) and a
//! replacement (the *detour*), armature rewrites the target's prologue so
//! future calls run the detour, and hands back a *trampoline* that still
//! behaves like the unpatched original. AArch64, A32, and Thumb-2 targets
//! are supported; Thumb targets are recognized by the mode bit of their
//! address.
//!
//! # Example
//!
//! ```ignore
//! let (key, original) = unsafe {
//!     armature_core::hook(target as *const (), detour as *const ())?
//! };
//! let original: extern "C" fn(i32, i32) -> i32 =
//!     unsafe { std::mem::transmute(original) };
//! assert_eq!(original(3, 4), 6);
//! armature_core::unhook(key)?;
//! ```
//!
//! The staged API (`create_hook`/`enable_hook`/`disable_hook`/
//! `destroy_hook`) exposes the individual lifecycle transitions;
//! `hook_batch`/`unhook_batch` install sets of hooks transactionally;
//! [`define_hook!`] declares named, typed hooks.

pub mod error;
mod patcher;
pub mod platform;
pub mod registry;
mod trampoline;
pub mod typed;

// Re-export the architecture profile for embedders that inspect code.
pub use armature_arch::{self as arch, Mode};

pub use error::HookError;
pub use platform::Platform;
#[cfg(unix)]
pub use platform::MmapPlatform;
pub use registry::{
    count, create_hook, destroy_hook, disable_hook, enable_hook, find, hook, hook_batch, init,
    init_with, is_active, resolve_symbol, shutdown, trampoline_of, unhook, unhook_all,
    unhook_batch, HookDesc, HookKey, Isa,
};
pub use typed::TypedHook;
