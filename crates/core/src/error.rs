//! Error taxonomy
//!
//! One error kind per failure class; `Display` gives the one-line
//! human-readable description for each.

use armature_arch::ArchError;

/// Error type for hook operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    /// Null or misaligned pointer, empty batch, or an unusable registry
    /// configuration.
    #[error("invalid argument")]
    InvalidArgument,

    /// Executable memory allocation failed.
    #[error("out of executable memory")]
    OutOfMemory,

    /// Page protection could not be widened, or the platform write
    /// primitive refused the patch.
    #[error("memory permission denied")]
    PermissionDenied,

    /// The canonical target already has an active hook.
    #[error("target already hooked")]
    AlreadyHooked,

    /// No hook matches the given key or target.
    #[error("hook not found")]
    NotFound,

    /// The target prologue contains an instruction that cannot be
    /// relocated, or its relocation does not fit the trampoline.
    #[error("unsupported instruction in prologue")]
    UnsupportedInstruction,

    /// The requested transition is not allowed from the hook's current
    /// state.
    #[error("invalid hook state for this operation")]
    InvalidState,

    /// Symbol lookup failed.
    #[error("failed to resolve symbol: {0}")]
    ResolveFailure(String),
}

impl From<ArchError> for HookError {
    fn from(err: ArchError) -> Self {
        match err {
            ArchError::Unsupported | ArchError::Overflow => HookError::UnsupportedInstruction,
        }
    }
}

/// Result type for hook operations.
pub type Result<T> = std::result::Result<T, HookError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_strings_are_single_ascii_lines() {
        let errors = [
            HookError::InvalidArgument,
            HookError::OutOfMemory,
            HookError::PermissionDenied,
            HookError::AlreadyHooked,
            HookError::NotFound,
            HookError::UnsupportedInstruction,
            HookError::InvalidState,
            HookError::ResolveFailure("tcp4_seq_show".into()),
        ];
        for err in errors {
            let msg = err.to_string();
            assert!(!msg.is_empty());
            assert!(msg.is_ascii());
            assert!(!msg.contains('\n'));
        }
    }

    #[test]
    fn test_arch_errors_map_to_unsupported() {
        assert_eq!(
            HookError::from(ArchError::Unsupported),
            HookError::UnsupportedInstruction
        );
        assert_eq!(
            HookError::from(ArchError::Overflow),
            HookError::UnsupportedInstruction
        );
    }
}
