//! Hook registry and lifecycle
//!
//! Owns every hook record and drives the state machine:
//!
//! ```text
//! None --create--> Created --enable--> Active
//!   ^                 |  ^                |
//!   +-----destroy-----+  +----disable----+
//! ```
//!
//! All operations run under one registry mutex; the patch sequencer and
//! the trampoline builder are only ever invoked with it held. Records are
//! addressed through opaque [`HookKey`]s, never through references that
//! could outlive them.

use std::sync::{Arc, LazyLock};

use armature_arch::{self as arch, Mode};
use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};

use crate::error::{HookError, Result};
use crate::patcher;
use crate::platform::{MmapPlatform, Platform};
use crate::trampoline::Trampoline;

new_key_type! {
    /// Handle to a hook record owned by the registry.
    pub struct HookKey;
}

/// Target/detour pair for batch installation.
#[derive(Debug, Clone, Copy)]
pub struct HookDesc {
    pub target: *const (),
    pub detour: *const (),
}

/// Machine instruction set the registry patches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isa {
    Aarch64,
    /// 32-bit ARM; the Thumb bit of each target address picks A32 or
    /// Thumb per hook.
    Arm,
}

impl Isa {
    /// The ISA of the running process, if it is one this library patches.
    pub fn native() -> Option<Isa> {
        if cfg!(target_arch = "aarch64") {
            Some(Isa::Aarch64)
        } else if cfg!(target_arch = "arm") {
            Some(Isa::Arm)
        } else {
            None
        }
    }

    fn mode_of(self, addr: u64) -> Mode {
        match self {
            Isa::Aarch64 => Mode::Aarch64,
            Isa::Arm => {
                if arch::is_thumb(addr) {
                    Mode::Thumb
                } else {
                    Mode::Arm32
                }
            }
        }
    }
}

/// Largest patch size across modes.
const MAX_PATCH: usize = 16;

struct HookRecord {
    /// Canonical target address (Thumb bit stripped).
    target: usize,
    detour: usize,
    mode: Mode,
    trampoline: Trampoline,
    /// Captured once, before any write to the target; never mutated.
    original: [u8; MAX_PATCH],
    active: bool,
}

impl HookRecord {
    fn original_bytes(&self) -> &[u8] {
        &self.original[..self.mode.patch_size()]
    }

    /// Trampoline address as the caller invokes it, Thumb bit restored.
    fn callable(&self) -> usize {
        if self.mode == Mode::Thumb {
            arch::with_thumb(self.trampoline.addr() as u64) as usize
        } else {
            self.trampoline.addr()
        }
    }
}

pub(crate) struct Registry {
    hooks: SlotMap<HookKey, HookRecord>,
    isa: Option<Isa>,
    platform: Arc<dyn Platform>,
}

impl Registry {
    fn new() -> Self {
        Self::with(Isa::native(), Arc::new(MmapPlatform))
    }

    pub(crate) fn with(isa: Option<Isa>, platform: Arc<dyn Platform>) -> Self {
        Self {
            hooks: SlotMap::with_key(),
            isa,
            platform,
        }
    }

    fn configure(&mut self, isa: Isa, platform: Arc<dyn Platform>) -> Result<()> {
        if !self.hooks.is_empty() {
            return Err(HookError::InvalidState);
        }
        self.isa = Some(isa);
        self.platform = platform;
        Ok(())
    }

    /// Allocate a record in state Created: capture the original prologue,
    /// build the trampoline, and report the original-callable address.
    unsafe fn create(&mut self, target: *const (), detour: *const ()) -> Result<(HookKey, *const ())> {
        if target.is_null() || detour.is_null() {
            return Err(HookError::InvalidArgument);
        }
        let isa = self.isa.ok_or(HookError::InvalidArgument)?;

        let raw = target as usize as u64;
        let mode = isa.mode_of(raw);
        let canonical = arch::strip_thumb(raw) as usize;
        if canonical % 4 != 0 {
            return Err(HookError::InvalidArgument);
        }
        if mode == Mode::Aarch64 && (detour as usize) % 4 != 0 {
            return Err(HookError::InvalidArgument);
        }

        tracing::debug!(
            "creating hook {:#x} -> {:#x} ({:?})",
            canonical,
            detour as usize,
            mode
        );

        let n = mode.patch_size();
        let mut original = [0u8; MAX_PATCH];
        std::ptr::copy_nonoverlapping(canonical as *const u8, original.as_mut_ptr(), n);

        let trampoline =
            Trampoline::build(self.platform.clone(), mode, &original[..n], canonical as u64)?;

        let record = HookRecord {
            target: canonical,
            detour: detour as usize,
            mode,
            trampoline,
            original,
            active: false,
        };
        let callable = record.callable();
        let key = self.hooks.insert(record);

        tracing::info!("created hook at {:#x}", canonical);
        Ok((key, callable as *const ()))
    }

    /// Created -> Active: write the detour jump over the prologue.
    fn enable(&mut self, key: HookKey) -> Result<()> {
        let rec = self.hooks.get(key).ok_or(HookError::NotFound)?;
        if rec.active {
            return Err(HookError::AlreadyHooked);
        }
        let (target, mode, detour) = (rec.target, rec.mode, rec.detour);

        if self
            .hooks
            .iter()
            .any(|(k, r)| k != key && r.active && r.target == target)
        {
            return Err(HookError::AlreadyHooked);
        }

        let jump = mode.detour_jump(detour as u64)?;
        patcher::write_target(&*self.platform, target, &jump)?;

        self.hooks[key].active = true;
        tracing::info!("enabled hook {:#x} -> {:#x}", target, detour);
        Ok(())
    }

    /// Active -> Created: restore the captured prologue.
    fn disable(&mut self, key: HookKey) -> Result<()> {
        let rec = self.hooks.get(key).ok_or(HookError::NotFound)?;
        if !rec.active {
            return Err(HookError::InvalidState);
        }
        let target = rec.target;

        patcher::write_target(&*self.platform, target, rec.original_bytes())?;

        self.hooks[key].active = false;
        tracing::info!("disabled hook at {:#x}", target);
        Ok(())
    }

    /// Created -> None. A still-active hook is reverted best-effort
    /// before its trampoline is released.
    fn destroy(&mut self, key: HookKey) -> Result<()> {
        let rec = self.hooks.remove(key).ok_or(HookError::NotFound)?;
        if rec.active {
            if let Err(e) = patcher::write_target(&*self.platform, rec.target, rec.original_bytes())
            {
                tracing::warn!("destroy could not restore {:#x}: {}", rec.target, e);
            }
        }

        tracing::info!("destroyed hook at {:#x}", rec.target);
        Ok(())
    }

    fn is_active(&self, key: HookKey) -> bool {
        self.hooks.get(key).map(|r| r.active).unwrap_or(false)
    }

    fn trampoline_of(&self, key: HookKey) -> Option<usize> {
        self.hooks.get(key).map(|r| r.callable())
    }

    /// Active record for a canonical target, if any.
    fn find(&self, canonical: usize) -> Option<HookKey> {
        self.hooks
            .iter()
            .find(|(_, r)| r.active && r.target == canonical)
            .map(|(k, _)| k)
    }

    /// Number of active hooks.
    fn count(&self) -> usize {
        self.hooks.values().filter(|r| r.active).count()
    }

    /// Revert and drop every record, reporting the last failure seen.
    fn unhook_all(&mut self) -> Result<()> {
        let mut last = Ok(());
        let keys: Vec<HookKey> = self.hooks.keys().collect();
        for key in keys {
            match unhook_locked(self, key) {
                Ok(()) => {}
                Err(e) => last = Err(e),
            }
        }
        last
    }
}

// Composite operations run against a held registry so the lock spans the
// whole sequence.

unsafe fn hook_locked(
    reg: &mut Registry,
    target: *const (),
    detour: *const (),
) -> Result<(HookKey, *const ())> {
    let (key, original) = reg.create(target, detour)?;
    if let Err(e) = reg.enable(key) {
        let _ = reg.destroy(key);
        return Err(e);
    }
    Ok((key, original))
}

fn unhook_locked(reg: &mut Registry, key: HookKey) -> Result<()> {
    match reg.disable(key) {
        // Destroying a merely-created hook is fine.
        Ok(()) | Err(HookError::InvalidState) => {}
        Err(e) => return Err(e),
    }
    reg.destroy(key)
}

static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(|| Mutex::new(Registry::new()));

/// Initialize the registry. Idempotent.
pub fn init() -> Result<()> {
    LazyLock::force(&REGISTRY);
    Ok(())
}

/// Select the instruction set and platform adapter. Only permitted while
/// no hooks exist; the default is the native ISA on [`MmapPlatform`].
pub fn init_with(isa: Isa, platform: Arc<dyn Platform>) -> Result<()> {
    REGISTRY.lock().configure(isa, platform)
}

/// Remove every remaining hook and release its resources.
pub fn shutdown() {
    if let Err(e) = unhook_all() {
        tracing::warn!("shutdown could not fully revert: {}", e);
    }
}

/// Create a hook in state Created.
///
/// Returns the record key and the address through which the unpatched
/// original can be called (Thumb bit included when the target is Thumb).
///
/// # Safety
/// `target` must point to at least the patch size of valid, executing
/// code owned by this process; `detour` must be a function with a
/// signature compatible with the target's callers.
pub unsafe fn create_hook(target: *const (), detour: *const ()) -> Result<(HookKey, *const ())> {
    REGISTRY.lock().create(target, detour)
}

/// Write the detour jump for a created hook.
pub fn enable_hook(key: HookKey) -> Result<()> {
    REGISTRY.lock().enable(key)
}

/// Restore the original prologue of an active hook.
pub fn disable_hook(key: HookKey) -> Result<()> {
    REGISTRY.lock().disable(key)
}

/// Free a hook record, reverting it first if still active.
pub fn destroy_hook(key: HookKey) -> Result<()> {
    REGISTRY.lock().destroy(key)
}

/// Create and enable in one step, rolling the record back on failure.
///
/// # Safety
/// See [`create_hook`].
pub unsafe fn hook(target: *const (), detour: *const ()) -> Result<(HookKey, *const ())> {
    hook_locked(&mut REGISTRY.lock(), target, detour)
}

/// Disable (if needed) and destroy a hook.
pub fn unhook(key: HookKey) -> Result<()> {
    unhook_locked(&mut REGISTRY.lock(), key)
}

/// Install every descriptor transactionally: on the first failure all
/// previously installed entries are unhooked and that failure returned.
///
/// # Safety
/// See [`create_hook`]; applies to every descriptor.
pub unsafe fn hook_batch(descs: &[HookDesc]) -> Result<Vec<(HookKey, *const ())>> {
    if descs.is_empty() {
        return Err(HookError::InvalidArgument);
    }

    let mut reg = REGISTRY.lock();
    let mut installed = Vec::with_capacity(descs.len());

    for desc in descs {
        match hook_locked(&mut reg, desc.target, desc.detour) {
            Ok(pair) => installed.push(pair),
            Err(e) => {
                for (key, _) in installed.into_iter().rev() {
                    if let Err(undo) = unhook_locked(&mut reg, key) {
                        tracing::warn!("batch rollback failed for a hook: {}", undo);
                    }
                }
                return Err(e);
            }
        }
    }

    Ok(installed)
}

/// Unhook every key, reporting the last non-OK status seen.
pub fn unhook_batch(keys: &[HookKey]) -> Result<()> {
    if keys.is_empty() {
        return Err(HookError::InvalidArgument);
    }

    let mut reg = REGISTRY.lock();
    let mut last = Ok(());
    for &key in keys {
        if let Err(e) = unhook_locked(&mut reg, key) {
            last = Err(e);
        }
    }
    last
}

/// Number of active hooks.
pub fn count() -> usize {
    REGISTRY.lock().count()
}

/// Key of the active hook for `target`, if any. The Thumb bit is ignored
/// for the lookup.
pub fn find(target: *const ()) -> Option<HookKey> {
    let canonical = arch::strip_thumb(target as usize as u64) as usize;
    REGISTRY.lock().find(canonical)
}

/// Is this record currently Active?
pub fn is_active(key: HookKey) -> bool {
    REGISTRY.lock().is_active(key)
}

/// Original-callable trampoline address for a record.
pub fn trampoline_of(key: HookKey) -> Option<*const ()> {
    REGISTRY.lock().trampoline_of(key).map(|a| a as *const ())
}

/// Revert and drop every hook.
pub fn unhook_all() -> Result<()> {
    REGISTRY.lock().unhook_all()
}

/// Resolve a symbol through the platform adapter.
pub fn resolve_symbol(name: &str) -> Result<*const ()> {
    let addr = REGISTRY.lock().platform.resolve_symbol(name)?;
    Ok(addr as *const ())
}
