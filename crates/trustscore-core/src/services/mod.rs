//! External collaborator boundaries.
//!
//! The engine consumes these traits only; implementations live in
//! [`memory`] (in-process and demo), [`http`] (remote vision) and
//! [`source`] (image bytes).

pub mod http;
pub mod memory;
pub mod source;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::Fingerprint;
use crate::layer::LayerResult;

pub use http::HttpVisionService;
pub use source::{FsImageSource, ImageSource};

/// Structured findings from the AI-vision service.
///
/// Every field defaults so partial responses still parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionFindings {
    pub seal_authentic: bool,
    /// In `[0, 1]`.
    pub seal_confidence: f64,
    pub extracted_text: String,
    /// In `[0, 1]`.
    pub ocr_confidence: f64,
    pub layout_professional: bool,
    pub detected_editing: bool,
    pub extracted_details: ExtractedDetails,
    pub flags: Vec<String>,
}

impl VisionFindings {
    pub fn has_text(&self) -> bool {
        !self.extracted_text.trim().is_empty()
    }
}

/// Fields extracted from the document, consumed by cross-referencing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedDetails {
    pub holder_name: Option<String>,
    pub institution_name: Option<String>,
    pub degree_type: Option<String>,
    pub issue_date: Option<String>,
}

impl ExtractedDetails {
    pub fn is_empty(&self) -> bool {
        self.holder_name.is_none() && self.institution_name.is_none() && self.degree_type.is_none()
    }
}

#[async_trait]
pub trait VisionService: Send + Sync {
    async fn analyze(&self, image: &[u8]) -> LayerResult<VisionFindings>;
}

/// Ledger entry for a content hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub recorded: bool,
    pub revoked: bool,
    pub transaction_ref: Option<String>,
}

#[async_trait]
pub trait LedgerService: Send + Sync {
    /// Unavailability is reported as [`crate::layer::LayerError::Unavailable`].
    async fn lookup(&self, fingerprint: &Fingerprint) -> LayerResult<LedgerRecord>;
}

/// Best fuzzy match against prior legitimate records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossReferenceMatch {
    pub record_id: String,
    /// Similarity in `[0, 1]`.
    pub similarity: f64,
    pub revoked: bool,
    /// Number of records that matched at all.
    pub candidates: usize,
}

#[async_trait]
pub trait CrossReferenceStore: Send + Sync {
    async fn best_match(&self, details: &ExtractedDetails)
        -> LayerResult<Option<CrossReferenceMatch>>;
}

/// Reputation of a submitting origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoSignal {
    pub location: Option<String>,
    /// Recent submissions from the same cluster.
    pub cluster_count: u32,
    pub blacklisted: bool,
}

#[async_trait]
pub trait GeoReputationStore: Send + Sync {
    async fn reputation(&self, origin: &str) -> LayerResult<GeoSignal>;
}
