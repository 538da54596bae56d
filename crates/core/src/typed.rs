//! Typed declarative hooks
//!
//! Wraps the registry behind a statically declared hook with a concrete
//! function signature, so detours can call the preserved original without
//! hand-written transmutes at every call site.

use parking_lot::RwLock;

use crate::error::{HookError, Result};
use crate::registry::{self, HookKey};

/// A named hook bound to a detour of function-pointer type `F`.
///
/// Declared through [`define_hook!`](crate::define_hook); installable and
/// removable by name.
pub struct TypedHook<F> {
    name: &'static str,
    detour: F,
    key: RwLock<Option<HookKey>>,
    original: RwLock<Option<usize>>,
}

// The mutable slots are behind RwLocks; `F` is a plain function pointer.
unsafe impl<F: Send> Send for TypedHook<F> {}
unsafe impl<F: Sync> Sync for TypedHook<F> {}

impl<F: Copy> TypedHook<F> {
    pub const fn new(name: &'static str, detour: F) -> Self {
        Self {
            name,
            detour,
            key: RwLock::new(None),
            original: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn detour_addr(&self) -> Result<*const ()> {
        if std::mem::size_of::<F>() != std::mem::size_of::<*const ()>() {
            return Err(HookError::InvalidArgument);
        }
        // F is a function pointer; reinterpret its value as an address.
        Ok(unsafe { std::mem::transmute_copy::<F, *const ()>(&self.detour) })
    }

    /// Install this hook at `target` (create + enable).
    ///
    /// # Safety
    /// `target` must be a function whose signature matches `F`.
    pub unsafe fn install(&self, target: *const ()) -> Result<()> {
        if self.key.read().is_some() {
            return Err(HookError::AlreadyHooked);
        }

        let detour = self.detour_addr()?;
        let (key, original) = registry::hook(target, detour)?;
        *self.key.write() = Some(key);
        *self.original.write() = Some(original as usize);

        tracing::info!("installed hook '{}' at {:#x}", self.name, target as usize);
        Ok(())
    }

    /// Resolve `symbol` through the platform adapter and install there.
    ///
    /// # Safety
    /// The resolved symbol must be a function whose signature matches `F`.
    pub unsafe fn install_by_symbol(&self, symbol: &str) -> Result<()> {
        let target = registry::resolve_symbol(symbol)?;
        self.install(target)
    }

    /// The preserved original as a callable of the hook's own signature.
    ///
    /// # Safety
    /// The returned value aliases the trampoline; it must not be called
    /// after [`TypedHook::remove`].
    pub unsafe fn original(&self) -> Option<F> {
        self.original
            .read()
            .map(|addr| std::mem::transmute_copy::<usize, F>(&addr))
    }

    pub fn is_installed(&self) -> bool {
        self.key.read().is_some()
    }

    pub fn is_active(&self) -> bool {
        self.key.read().map(registry::is_active).unwrap_or(false)
    }

    /// Re-arm a disabled hook.
    pub fn enable(&self) -> Result<()> {
        match *self.key.read() {
            Some(key) => registry::enable_hook(key),
            None => Err(HookError::NotFound),
        }
    }

    /// Put the original prologue back while keeping the hook installed.
    pub fn disable(&self) -> Result<()> {
        match *self.key.read() {
            Some(key) => registry::disable_hook(key),
            None => Err(HookError::NotFound),
        }
    }

    /// Unhook and forget the original.
    pub fn remove(&self) -> Result<()> {
        if let Some(key) = self.key.write().take() {
            registry::unhook(key)?;
            tracing::info!("removed hook '{}'", self.name);
        }
        *self.original.write() = None;
        Ok(())
    }
}

/// Declare a static [`TypedHook`] with a concrete signature.
///
/// # Example
/// ```ignore
/// fn getuid_detour() -> u64 {
///     let original = unsafe { GETUID_HOOK.original() }.expect("installed");
///     original()
/// }
///
/// define_hook! {
///     /// Intercepts getuid.
///     pub static GETUID_HOOK: fn() -> u64 = getuid_detour;
/// }
///
/// unsafe { GETUID_HOOK.install(target)? };
/// let uid = unsafe { GETUID_HOOK.original() }.unwrap()();
/// GETUID_HOOK.remove()?;
/// ```
#[macro_export]
macro_rules! define_hook {
    (
        $(#[$meta:meta])*
        $vis:vis static $name:ident: fn($($arg:ty),* $(,)?) $(-> $ret:ty)? = $detour:expr;
    ) => {
        $(#[$meta])*
        $vis static $name: std::sync::LazyLock<
            $crate::TypedHook<fn($($arg),*) $(-> $ret)?>,
        > = std::sync::LazyLock::new(|| {
            $crate::TypedHook::new(stringify!($name), $detour)
        });
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_detour() {}

    #[test]
    fn test_uninstalled_hook_reports_inactive() {
        let hook: TypedHook<fn()> = TypedHook::new("test", noop_detour);
        assert_eq!(hook.name(), "test");
        assert!(!hook.is_installed());
        assert!(!hook.is_active());
        assert!(unsafe { hook.original() }.is_none());
        assert_eq!(hook.enable(), Err(HookError::NotFound));
        assert_eq!(hook.disable(), Err(HookError::NotFound));
        // Removing an uninstalled hook is a no-op.
        assert_eq!(hook.remove(), Ok(()));
    }

    #[test]
    fn test_detour_addr_is_the_function() {
        let hook: TypedHook<fn()> = TypedHook::new("test", noop_detour);
        let addr = hook.detour_addr().unwrap();
        assert_eq!(addr as usize, noop_detour as usize);
    }

    #[test]
    fn test_install_by_symbol_without_resolver_fails() {
        let hook: TypedHook<fn()> = TypedHook::new("test", noop_detour);
        let res = unsafe { hook.install_by_symbol("__arm64_sys_getuid") };
        assert!(matches!(res, Err(HookError::ResolveFailure(_))));
    }
}
