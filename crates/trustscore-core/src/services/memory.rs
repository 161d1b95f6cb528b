//! In-process collaborator implementations.
//!
//! Used for demo mode, local runs and tests. None of them touch the network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::{
    CrossReferenceMatch, CrossReferenceStore, ExtractedDetails, GeoReputationStore, GeoSignal,
    LedgerRecord, LedgerService, VisionFindings, VisionService,
};
use crate::domain::Fingerprint;
use crate::layer::heuristics::{ExifMarkerHeuristic, RecompressionHeuristic};
use crate::layer::{Collaborators, LayerError, LayerResult};

// ---------------------------------------------------------------------------
// Vision
// ---------------------------------------------------------------------------

/// Returns the same findings for every image.
#[derive(Debug, Clone)]
pub struct StaticVisionService {
    findings: VisionFindings,
}

impl StaticVisionService {
    pub fn new(findings: VisionFindings) -> Self {
        Self { findings }
    }

    /// Canned response for a legitimate-looking certificate.
    pub fn demo() -> Self {
        Self::new(VisionFindings {
            seal_authentic: true,
            seal_confidence: 0.9,
            extracted_text: "Demo Certificate of Achievement".into(),
            ocr_confidence: 0.95,
            layout_professional: true,
            detected_editing: false,
            extracted_details: ExtractedDetails {
                holder_name: Some("Demo Student".into()),
                institution_name: Some("Demo University".into()),
                degree_type: Some("Bachelor of Science".into()),
                issue_date: Some("2024-01-15".into()),
            },
            flags: vec!["demo_mode".into()],
        })
    }
}

#[async_trait]
impl VisionService for StaticVisionService {
    async fn analyze(&self, _image: &[u8]) -> LayerResult<VisionFindings> {
        Ok(self.findings.clone())
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Ledger backed by a `HashMap<fingerprint, record>`. Unknown hashes are
/// reported as not recorded.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<Fingerprint, LedgerRecord>>,
    unavailable: bool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A ledger whose every lookup fails as unavailable.
    pub fn unavailable() -> Self {
        Self {
            records: Mutex::default(),
            unavailable: true,
        }
    }

    pub fn record(&self, fingerprint: Fingerprint, transaction_ref: impl Into<String>) {
        self.insert(
            fingerprint,
            LedgerRecord {
                recorded: true,
                revoked: false,
                transaction_ref: Some(transaction_ref.into()),
            },
        );
    }

    pub fn insert(&self, fingerprint: Fingerprint, record: LedgerRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fingerprint, record);
    }
}

#[async_trait]
impl LedgerService for MemoryLedger {
    async fn lookup(&self, fingerprint: &Fingerprint) -> LayerResult<LedgerRecord> {
        if self.unavailable {
            return Err(LayerError::Unavailable {
                service: "ledger",
                detail: "ledger offline".into(),
            });
        }
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Cross-reference
// ---------------------------------------------------------------------------

/// A prior legitimate record known to the cross-reference store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownRecord {
    pub record_id: String,
    pub details: ExtractedDetails,
    pub revoked: bool,
}

/// Linear-scan store comparing extracted fields by normalized token overlap.
#[derive(Debug, Default)]
pub struct MemoryCrossReferenceStore {
    records: Mutex<Vec<KnownRecord>>,
}

impl MemoryCrossReferenceStore {
    /// Minimum similarity for a record to count as a candidate.
    pub const CANDIDATE_THRESHOLD: f64 = 0.6;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, record: KnownRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

fn tokens(value: &Option<String>) -> Vec<String> {
    value
        .as_deref()
        .unwrap_or_default()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn field_similarity(a: &Option<String>, b: &Option<String>) -> Option<f64> {
    let (a, b) = (tokens(a), tokens(b));
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let shared = a.iter().filter(|t| b.contains(t)).count();
    Some(2.0 * shared as f64 / (a.len() + b.len()) as f64)
}

/// Mean token-overlap similarity across the fields both sides carry.
pub fn similarity(a: &ExtractedDetails, b: &ExtractedDetails) -> f64 {
    let scores: Vec<f64> = [
        field_similarity(&a.holder_name, &b.holder_name),
        field_similarity(&a.institution_name, &b.institution_name),
        field_similarity(&a.degree_type, &b.degree_type),
    ]
    .into_iter()
    .flatten()
    .collect();
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

#[async_trait]
impl CrossReferenceStore for MemoryCrossReferenceStore {
    async fn best_match(
        &self,
        details: &ExtractedDetails,
    ) -> LayerResult<Option<CrossReferenceMatch>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut candidates: Vec<(f64, &KnownRecord)> = records
            .iter()
            .map(|record| (similarity(details, &record.details), record))
            .filter(|(score, _)| *score >= Self::CANDIDATE_THRESHOLD)
            .collect();
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        Ok(candidates.first().map(|(score, record)| CrossReferenceMatch {
            record_id: record.record_id.clone(),
            similarity: *score,
            revoked: record.revoked,
            candidates: candidates.len(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Geo
// ---------------------------------------------------------------------------

/// Origin reputation from a static table. Unknown origins are clean.
#[derive(Debug, Default)]
pub struct MemoryGeoStore {
    signals: Mutex<HashMap<String, GeoSignal>>,
}

impl MemoryGeoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, origin: impl Into<String>, signal: GeoSignal) {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(origin.into(), signal);
    }
}

#[async_trait]
impl GeoReputationStore for MemoryGeoStore {
    async fn reputation(&self, origin: &str) -> LayerResult<GeoSignal> {
        Ok(self
            .signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(origin)
            .cloned()
            .unwrap_or_default())
    }
}

/// Collaborators for demo mode: a legitimate-looking vision response, an
/// empty ledger, no prior records and no geo clusters.
pub fn demo_collaborators() -> Collaborators {
    Collaborators {
        exif: Arc::new(ExifMarkerHeuristic),
        ela: Arc::new(RecompressionHeuristic),
        vision: Arc::new(StaticVisionService::demo()),
        cross_reference: Arc::new(MemoryCrossReferenceStore::new()),
        ledger: Arc::new(MemoryLedger::new()),
        geo: Arc::new(MemoryGeoStore::new()),
    }
}
