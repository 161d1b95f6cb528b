//! Local-compute layers.
//!
//! The exif and ela layers share one shape: a synchronous heuristic over the
//! raw image bytes, run on the blocking pool so it cannot stall the reactor.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Layer, LayerError, LayerFindings, LayerInput, LayerResult};
use crate::domain::LayerId;

/// A pluggable scoring function over image bytes.
///
/// Heuristics are pure: the same bytes always produce the same findings.
pub trait ImageHeuristic: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn evaluate(&self, image: &[u8]) -> LayerResult<LayerFindings>;
}

/// Layer adapter running an [`ImageHeuristic`] via `spawn_blocking`.
pub struct LocalComputeLayer {
    id: LayerId,
    heuristic: Arc<dyn ImageHeuristic>,
}

impl LocalComputeLayer {
    pub fn new(id: LayerId, heuristic: Arc<dyn ImageHeuristic>) -> Self {
        Self { id, heuristic }
    }
}

#[async_trait]
impl Layer for LocalComputeLayer {
    fn id(&self) -> LayerId {
        self.id
    }

    async fn analyze(&self, input: &LayerInput) -> LayerResult<LayerFindings> {
        let heuristic = Arc::clone(&self.heuristic);
        let image = Arc::clone(&input.image);
        let name = heuristic.name();

        let findings = tokio::task::spawn_blocking(move || heuristic.evaluate(&image))
            .await
            .map_err(|e| LayerError::Internal(format!("{name} heuristic aborted: {e}")))??;

        tracing::debug!(layer = %self.id, heuristic = name, score = findings.score, "heuristic evaluated");
        Ok(findings)
    }
}
