//! Progress events streamed to observers of a verification.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::outcome::{LayerId, OutcomeKind};
use crate::domain::report::VerificationReport;
use crate::domain::request::{Fingerprint, VerificationId};

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEventKind {
    Started {
        fingerprint: Fingerprint,
    },
    LayerStarted {
        layer: LayerId,
    },
    LayerCompleted {
        layer: LayerId,
        score: f64,
        elapsed_ms: u64,
    },
    /// A layer reached a terminal state other than `completed` and its
    /// fallback score was applied.
    DegradedLayer {
        layer: LayerId,
        outcome: OutcomeKind,
        score: f64,
    },
    Completed {
        report: Arc<VerificationReport>,
    },
}

/// One event on a verification's progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub verification_id: VerificationId,
    /// Position in this verification's stream, starting at 0.
    pub seq: u64,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ProgressEventKind,
}

impl ProgressEvent {
    pub fn new(verification_id: VerificationId, seq: u64, kind: ProgressEventKind) -> Self {
        Self {
            verification_id,
            seq,
            emitted_at: Utc::now(),
            kind,
        }
    }

    /// The `completed` event closes the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, ProgressEventKind::Completed { .. })
    }

    /// Short name of the event kind, for logs.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ProgressEventKind::Started { .. } => "started",
            ProgressEventKind::LayerStarted { .. } => "layer_started",
            ProgressEventKind::LayerCompleted { .. } => "layer_completed",
            ProgressEventKind::DegradedLayer { .. } => "degraded_layer",
            ProgressEventKind::Completed { .. } => "completed",
        }
    }
}
