//! Domain models for TrustScore.
//!
//! Canonical definitions for the core entities:
//! - `VerificationRequest`: an accepted, immutable submission
//! - `LayerOutcome`: the terminal result of one layer
//! - `VerificationReport`: the aggregated, cached artifact
//! - `ProgressEvent`: transient stream entries for observers

pub mod error;
pub mod event;
pub mod outcome;
pub mod report;
pub mod request;

pub use error::{Result, SourceError, ValidationError, VerifyError};
pub use event::{ProgressEvent, ProgressEventKind};
pub use outcome::{LayerId, LayerOutcome, OutcomeKind};
pub use report::{Verdict, VerificationReport, SUSPICIOUS_THRESHOLD, VERIFIED_THRESHOLD};
pub use request::{
    Fingerprint, FingerprintKey, ImageRef, RequesterContext, VerificationId, VerificationRequest,
};
