//! The finalized verification report: the cached and persisted artifact.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::outcome::{LayerId, LayerOutcome};
use crate::domain::request::{Fingerprint, VerificationId};

/// Score at or above which a document is verified.
pub const VERIFIED_THRESHOLD: f64 = 80.0;
/// Score at or above which a document is suspicious rather than fraudulent.
pub const SUSPICIOUS_THRESHOLD: f64 = 40.0;

/// Coarse classification derived from the total score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Verified,
    Suspicious,
    Fraud,
}

impl Verdict {
    pub fn from_score(total: f64) -> Self {
        if total >= VERIFIED_THRESHOLD {
            Verdict::Verified
        } else if total >= SUSPICIOUS_THRESHOLD {
            Verdict::Suspicious
        } else {
            Verdict::Fraud
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Verified => "verified",
            Verdict::Suspicious => "suspicious",
            Verdict::Fraud => "fraud",
        };
        f.write_str(s)
    }
}

/// Final, immutable verification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub verification_id: VerificationId,
    pub fingerprint: Fingerprint,
    /// Requester scope when reports are isolated per account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Sum of clamped layer scores, 0..=100.
    pub total_score: f64,
    pub verdict: Verdict,
    /// One outcome per declared layer, in declaration order.
    pub layers: Vec<LayerOutcome>,
    pub elapsed_ms: u64,
    pub requested_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// True when any layer did not complete normally.
    pub degraded: bool,
}

impl VerificationReport {
    pub fn layer(&self, layer: LayerId) -> Option<&LayerOutcome> {
        self.layers.iter().find(|o| o.layer == layer)
    }

    /// Layers that fell back to their declared fallback score.
    pub fn degraded_layers(&self) -> Vec<LayerId> {
        self.layers
            .iter()
            .filter(|o| !o.is_completed())
            .map(|o| o.layer)
            .collect()
    }
}
