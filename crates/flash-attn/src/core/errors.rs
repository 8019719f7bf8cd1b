//! Error types emitted by the attention engine.
//!
//! Every precondition is checked before any tile is computed, so a returned
//! error always means no output buffer and no cache slot has been touched.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AttentionError>;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// Rank or dimension inconsistency among Q/K/V, cache tensors or tables.
    #[error("shape mismatch: {context}")]
    ShapeMismatch { context: String },
    /// Head-dim, rotary-dim or page-size does not meet a required multiple.
    #[error("alignment violation: {context}")]
    AlignmentViolation { context: String },
    /// Cache, block table or rotary table too small for the requested access.
    #[error("capacity violation: {context}")]
    CapacityViolation { context: String },
    /// A combination of arguments the engine does not implement.
    #[error("unsupported configuration: {context}")]
    UnsupportedConfiguration { context: String },
    /// Tensors that must agree on element type do not.
    #[error("dtype mismatch: {context}")]
    DtypeMismatch { context: String },
    /// Engine configuration failed validation.
    #[error("invalid engine configuration: {context}")]
    Config { context: String },
    /// A tensor-library failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
    /// Malformed serialized configuration or saved context.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
        }
    }

    pub(crate) fn alignment(context: impl Into<String>) -> Self {
        Self::AlignmentViolation {
            context: context.into(),
        }
    }

    pub(crate) fn capacity(context: impl Into<String>) -> Self {
        Self::CapacityViolation {
            context: context.into(),
        }
    }

    pub(crate) fn unsupported(context: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration {
            context: context.into(),
        }
    }

    pub(crate) fn dtype(context: impl Into<String>) -> Self {
        Self::DtypeMismatch {
            context: context.into(),
        }
    }
}
