//! Per-layer results.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::error::ValidationError;

/// The fixed set of evidence layers, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerId {
    /// Image metadata analysis.
    Exif,
    /// Error-level / compression artifact analysis.
    Ela,
    /// Remote AI-vision analysis (seal, OCR, layout, structured extraction).
    Vision,
    /// Fuzzy match of extracted fields against prior legitimate records.
    CrossReference,
    /// Ledger/registry lookup of the content hash.
    Ledger,
    /// Geo/IP reputation of the submitting origin.
    Geo,
}

impl LayerId {
    pub const ALL: [LayerId; 6] = [
        LayerId::Exif,
        LayerId::Ela,
        LayerId::Vision,
        LayerId::CrossReference,
        LayerId::Ledger,
        LayerId::Geo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LayerId::Exif => "exif",
            LayerId::Ela => "ela",
            LayerId::Vision => "vision",
            LayerId::CrossReference => "cross_reference",
            LayerId::Ledger => "ledger",
            LayerId::Geo => "geo",
        }
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LayerId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownLayer(s.to_string()))
    }
}

/// How a layer reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Completed,
    TimedOut,
    Failed,
    SkippedDependencyFailed,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeKind::Completed => "completed",
            OutcomeKind::TimedOut => "timed_out",
            OutcomeKind::Failed => "failed",
            OutcomeKind::SkippedDependencyFailed => "skipped_dependency_failed",
        };
        f.write_str(s)
    }
}

/// Terminal result of one layer for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerOutcome {
    pub layer: LayerId,
    /// Score contribution, bounded to the layer's declared maximum.
    pub score: f64,
    pub flags: Vec<String>,
    /// Structured detail payload. For the vision layer this carries the
    /// extraction consumed by dependent layers.
    pub details: serde_json::Value,
    pub kind: OutcomeKind,
    pub elapsed_ms: u64,
    /// Why a fallback score was substituted, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LayerOutcome {
    pub fn completed(
        layer: LayerId,
        score: f64,
        flags: Vec<String>,
        details: serde_json::Value,
        elapsed: Duration,
    ) -> Self {
        Self {
            layer,
            score,
            flags,
            details,
            kind: OutcomeKind::Completed,
            elapsed_ms: elapsed.as_millis() as u64,
            error: None,
        }
    }

    /// An outcome that carries the layer's fallback score.
    pub fn fallback(
        layer: LayerId,
        kind: OutcomeKind,
        fallback_score: f64,
        elapsed: Duration,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            layer,
            score: fallback_score,
            flags: vec![format!("fallback:{kind}")],
            details: serde_json::Value::Null,
            kind,
            elapsed_ms: elapsed.as_millis() as u64,
            error: Some(reason.into()),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.kind == OutcomeKind::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_id_roundtrips_through_str() {
        for id in LayerId::ALL {
            assert_eq!(id.as_str().parse::<LayerId>().unwrap(), id);
            assert_eq!(
                serde_json::to_string(&id).unwrap(),
                format!("\"{}\"", id.as_str())
            );
        }
        assert!("blockchain".parse::<LayerId>().is_err());
    }

    #[test]
    fn test_layer_id_order_matches_declaration() {
        let mut sorted = LayerId::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, LayerId::ALL.to_vec());
    }

    #[test]
    fn test_fallback_outcome_is_marked() {
        let outcome = LayerOutcome::fallback(
            LayerId::Vision,
            OutcomeKind::TimedOut,
            10.0,
            Duration::from_millis(4000),
            "exceeded budget",
        );
        assert!(!outcome.is_completed());
        assert_eq!(outcome.score, 10.0);
        assert_eq!(outcome.elapsed_ms, 4000);
        assert_eq!(outcome.flags, vec!["fallback:timed_out".to_string()]);
    }

    #[test]
    fn test_outcome_kind_serializes_snake_case() {
        let json = serde_json::to_string(&OutcomeKind::SkippedDependencyFailed).unwrap();
        assert_eq!(json, "\"skipped_dependency_failed\"");
    }
}
