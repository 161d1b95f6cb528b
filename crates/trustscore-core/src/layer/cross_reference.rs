//! Cross-reference layer: matches the vision extraction against prior
//! legitimate records. Runs only after the vision layer completed.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{Layer, LayerError, LayerFindings, LayerInput, LayerResult};
use crate::domain::LayerId;
use crate::services::{CrossReferenceMatch, CrossReferenceStore, VisionFindings};

const DEPENDS_ON: &[LayerId] = &[LayerId::Vision];

pub const EXACT_MATCH: f64 = 0.95;
pub const STRONG_MATCH: f64 = 0.85;

pub struct CrossReferenceLayer {
    store: Arc<dyn CrossReferenceStore>,
}

impl CrossReferenceLayer {
    pub fn new(store: Arc<dyn CrossReferenceStore>) -> Self {
        Self { store }
    }
}

/// Score for the best match, or `None` when nothing matched.
pub fn score(best: Option<&CrossReferenceMatch>) -> f64 {
    match best {
        None => 0.0,
        Some(m) if m.revoked => 0.0,
        Some(m) if m.candidates > 1 => 5.0,
        Some(m) if m.similarity >= EXACT_MATCH => 20.0,
        Some(m) if m.similarity >= STRONG_MATCH => 15.0,
        Some(_) => 8.0,
    }
}

fn match_quality(best: Option<&CrossReferenceMatch>) -> &'static str {
    match best {
        None => "none",
        Some(m) if m.candidates > 1 => "partial",
        Some(m) if m.similarity >= EXACT_MATCH => "exact",
        Some(m) if m.similarity >= STRONG_MATCH => "fuzzy",
        Some(_) => "partial",
    }
}

#[async_trait]
impl Layer for CrossReferenceLayer {
    fn id(&self) -> LayerId {
        LayerId::CrossReference
    }

    fn depends_on(&self) -> &'static [LayerId] {
        DEPENDS_ON
    }

    async fn analyze(&self, input: &LayerInput) -> LayerResult<LayerFindings> {
        let upstream = input.upstream(LayerId::Vision)?;
        let vision: VisionFindings =
            serde_json::from_value(upstream.clone()).map_err(|e| LayerError::MalformedUpstream {
                layer: LayerId::Vision,
                detail: e.to_string(),
            })?;
        let extracted = vision.extracted_details;

        if extracted.is_empty() {
            return Ok(LayerFindings::new(0.0)
                .with_flag("no_extracted_details")
                .with_details(json!({ "match_quality": "none" })));
        }

        let best = self.store.best_match(&extracted).await?;
        let mut findings = LayerFindings::new(score(best.as_ref()));
        match &best {
            None => findings = findings.with_flag("no_matching_record"),
            Some(m) => {
                if m.candidates > 1 {
                    findings = findings.with_flag(format!("multiple_matches:{}", m.candidates));
                }
                if m.revoked {
                    findings = findings.with_flag("matched_record_revoked");
                }
            }
        }

        Ok(findings.with_details(json!({
            "match_quality": match_quality(best.as_ref()),
            "matched_record": best.as_ref().map(|m| m.record_id.clone()),
            "similarity": best.as_ref().map(|m| m.similarity),
            "searched": extracted,
        })))
    }
}
