//! Durable storage for finished verification reports.
//!
//! The report is the only artifact the engine persists. Writes happen after
//! the pipeline has produced its result; a failed write is logged by the
//! caller and never turns into a pipeline error.

pub mod fs;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{FingerprintKey, VerificationId, VerificationReport};

pub use fs::FsReportStore;
pub use memory::MemoryReportStore;

/// Errors from report persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("report serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage task failed: {0}")]
    Join(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence interface for verification reports.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Store a report, replacing any earlier report with the same id and
    /// becoming the latest report for its fingerprint key.
    async fn put(&self, report: &VerificationReport) -> StoreResult<()>;

    /// Fetch a report by verification id.
    async fn get(&self, id: &VerificationId) -> StoreResult<Option<VerificationReport>>;

    /// Most recently stored report for a fingerprint key.
    async fn latest_for(&self, key: &FingerprintKey) -> StoreResult<Option<VerificationReport>>;
}

/// The key a report is filed under.
pub fn key_of(report: &VerificationReport) -> FingerprintKey {
    FingerprintKey {
        fingerprint: report.fingerprint.clone(),
        scope: report.scope.clone(),
    }
}
