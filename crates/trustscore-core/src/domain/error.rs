//! Domain-level error taxonomy for TrustScore.
//!
//! Only input, configuration and wiring problems surface as errors. Anything
//! that goes wrong inside a layer is absorbed by the scheduler and turned into
//! that layer's fallback score.

use crate::domain::request::{Fingerprint, VerificationId};

/// Errors raised while resolving the submitted image.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("image not found: {0}")]
    NotFound(String),

    #[error("image is empty: {0}")]
    Empty(String),

    #[error("image is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("image content does not match fingerprint: expected {expected}, got {actual}")]
    FingerprintMismatch {
        expected: Fingerprint,
        actual: Fingerprint,
    },

    #[error("image source does not support {0} references")]
    Unsupported(&'static str),

    #[error("io error reading image: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced when parsing identifiers.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("fingerprint must be 64 lowercase hex chars, got {0:?}")]
    InvalidFingerprint(String),

    #[error("invalid verification id: {0:?}")]
    InvalidVerificationId(String),

    #[error("unknown layer id: {0:?}")]
    UnknownLayer(String),
}

/// TrustScore engine errors.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("input error: {0}")]
    Input(#[from] SourceError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("layer graph error: {0}")]
    Graph(#[from] crate::graph::GraphError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("report store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("verification {0} was abandoned before a report was produced")]
    Abandoned(VerificationId),
}

/// Result type for TrustScore engine operations.
pub type Result<T> = std::result::Result<T, VerifyError>;
