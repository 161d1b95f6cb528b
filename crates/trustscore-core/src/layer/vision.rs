//! AI-vision layer.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Layer, LayerError, LayerFindings, LayerInput, LayerResult};
use crate::domain::LayerId;
use crate::services::{VisionFindings, VisionService};

/// Points for each of the four vision signals.
pub const SIGNAL_POINTS: f64 = 5.0;

/// Scores seal authenticity, OCR quality, layout and absence of editing.
///
/// The full [`VisionFindings`] are published as the outcome details; the
/// cross-reference layer reads its extraction from there.
pub struct VisionLayer {
    service: Arc<dyn VisionService>,
}

impl VisionLayer {
    pub fn new(service: Arc<dyn VisionService>) -> Self {
        Self { service }
    }
}

/// Vision score for a set of findings. Confidences outside `[0, 1]` are
/// clamped before weighting.
pub fn score(findings: &VisionFindings) -> f64 {
    let mut score = 0.0;
    if findings.seal_authentic {
        score += findings.seal_confidence.clamp(0.0, 1.0) * SIGNAL_POINTS;
    }
    if findings.has_text() {
        score += findings.ocr_confidence.clamp(0.0, 1.0) * SIGNAL_POINTS;
    }
    if findings.layout_professional {
        score += SIGNAL_POINTS;
    }
    if !findings.detected_editing {
        score += SIGNAL_POINTS;
    }
    score
}

#[async_trait]
impl Layer for VisionLayer {
    fn id(&self) -> LayerId {
        LayerId::Vision
    }

    async fn analyze(&self, input: &LayerInput) -> LayerResult<LayerFindings> {
        let findings = self.service.analyze(&input.image).await?;

        let mut out = LayerFindings::new(score(&findings));
        if !findings.seal_authentic {
            out = out.with_flag("seal_not_authentic");
        }
        if findings.detected_editing {
            out = out.with_flag("editing_detected");
        }
        for flag in &findings.flags {
            out = out.with_flag(format!("vision:{flag}"));
        }

        let details = serde_json::to_value(&findings)
            .map_err(|e| LayerError::Internal(format!("serialize vision findings: {e}")))?;
        Ok(out.with_details(details))
    }
}
