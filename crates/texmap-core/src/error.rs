//! Typed error hierarchy for memory-domain operations.
//!
//! Uses `thiserror` for library-grade errors.  Every variant folds into one
//! of three categories ([`ErrorKind`]) that callers branch on:
//!
//! - `InvalidArgument`: malformed metadata or a request the mapper cannot
//!   satisfy with its current configuration.
//! - `InvalidState`: protocol misuse (e.g. mapping twice without unmap).
//! - `DeviceFailure`: the device context reported an error.
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`MemError::error_code`]
//! for structured telemetry without string parsing.

use crate::image::PixelFormat;
use crate::tensor::MemoryType;

/// Coarse error category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidState,
    DeviceFailure,
}

/// All errors originating from texmap.
#[derive(Debug, thiserror::Error)]
pub enum MemError {
    // ── Argument validation ──────────────────────────────────────────
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Null pointer passed for {0}")]
    NullPointer(&'static str),

    #[error("Plane count mismatch: mapper configured for {expected} planes, image has {actual}")]
    PlaneCountMismatch { expected: usize, actual: usize },

    #[error("Memory domain mismatch: expected {expected:?}, got {actual:?}")]
    DomainMismatch {
        expected: MemoryType,
        actual: MemoryType,
    },

    #[error("Pixel format mismatch: expected {expected:?}, got {actual:?}")]
    FormatMismatch {
        expected: PixelFormat,
        actual: PixelFormat,
    },

    // ── Protocol state ───────────────────────────────────────────────
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // ── Device ───────────────────────────────────────────────────────
    #[error("Device failure in {op}: {detail}")]
    DeviceFailure { op: &'static str, detail: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Config error: {0}")]
    Config(String),
}

impl MemError {
    /// Shorthand for a [`MemError::DeviceFailure`].
    pub fn device(op: &'static str, detail: impl Into<String>) -> Self {
        Self::DeviceFailure {
            op,
            detail: detail.into(),
        }
    }

    /// Category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_)
            | Self::NullPointer(_)
            | Self::PlaneCountMismatch { .. }
            | Self::DomainMismatch { .. }
            | Self::FormatMismatch { .. }
            | Self::Config(_) => ErrorKind::InvalidArgument,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::DeviceFailure { .. } => ErrorKind::DeviceFailure,
        }
    }

    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: argument validation
    /// - 2xx: protocol state
    /// - 3xx: device
    /// - 4xx: configuration
    pub fn error_code(&self) -> u32 {
        match self {
            Self::InvalidArgument(_) => 100,
            Self::NullPointer(_) => 101,
            Self::PlaneCountMismatch { .. } => 102,
            Self::DomainMismatch { .. } => 103,
            Self::FormatMismatch { .. } => 104,
            Self::InvalidState(_) => 200,
            Self::DeviceFailure { .. } => 300,
            Self::Config(_) => 400,
        }
    }

    /// Whether the failing operation may be retried at this layer.
    ///
    /// Always `false`: device failures usually mean a lost context, which is
    /// handled by whoever owns the context.
    pub fn is_recoverable(&self) -> bool {
        false
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_variants_fold_into_categories() {
        let err = MemError::PlaneCountMismatch {
            expected: 2,
            actual: 3,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.error_code(), 102);

        let err = MemError::device("copy_to_staging", "context lost");
        assert_eq!(err.kind(), ErrorKind::DeviceFailure);
        assert!(err.to_string().contains("copy_to_staging"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn invalid_state_has_its_own_code_range() {
        let err = MemError::InvalidState("already mapped".into());
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.error_code() / 100, 2);
    }
}
