//! Layer units and the static layer registry.
//!
//! Every layer implements [`Layer`]: same input, same output, distinct
//! evidence. The scheduler looks layers up by [`LayerId`] in a
//! [`LayerRegistry`]; there is no dynamic discovery.
//!
//! # Module layout
//!
//! - [`local`]: `LocalComputeLayer` and the `ImageHeuristic` plug point (exif, ela)
//! - [`heuristics`]: reference byte-level heuristics for the local layers
//! - [`vision`]: AI-vision layer over a `VisionService`
//! - [`cross_reference`]: fuzzy record match over the vision extraction
//! - [`ledger`]: ledger/registry lookup of the content hash
//! - [`geo`]: origin reputation and clustering

pub mod cross_reference;
pub mod geo;
pub mod heuristics;
pub mod ledger;
pub mod local;
pub mod vision;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Fingerprint, LayerId, RequesterContext};
use crate::graph::{DependencyGraph, GraphResult};
use crate::services::{CrossReferenceStore, GeoReputationStore, LedgerService, VisionService};

pub use cross_reference::CrossReferenceLayer;
pub use geo::GeoLayer;
pub use heuristics::{ExifMarkerHeuristic, RecompressionHeuristic};
pub use ledger::LedgerLayer;
pub use local::{ImageHeuristic, LocalComputeLayer};
pub use vision::VisionLayer;

/// Errors a layer may report. The scheduler converts every one of them into
/// a `failed` outcome with the layer's fallback score.
#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error("{service} unavailable: {detail}")]
    Unavailable {
        service: &'static str,
        detail: String,
    },

    #[error("malformed response from {service}: {detail}")]
    MalformedResponse {
        service: &'static str,
        detail: String,
    },

    #[error("missing output from upstream layer {layer}")]
    MissingUpstream { layer: LayerId },

    #[error("malformed output from upstream layer {layer}: {detail}")]
    MalformedUpstream { layer: LayerId, detail: String },

    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("internal layer error: {0}")]
    Internal(String),
}

/// Result type for layer analysis.
pub type LayerResult<T> = std::result::Result<T, LayerError>;

/// Everything a layer may read. Upstream payloads are present only for
/// declared dependencies that completed normally.
#[derive(Debug, Clone)]
pub struct LayerInput {
    pub fingerprint: Fingerprint,
    pub image: Arc<[u8]>,
    pub context: RequesterContext,
    upstream: BTreeMap<LayerId, serde_json::Value>,
}

impl LayerInput {
    pub fn new(fingerprint: Fingerprint, image: Arc<[u8]>, context: RequesterContext) -> Self {
        Self {
            fingerprint,
            image,
            context,
            upstream: BTreeMap::new(),
        }
    }

    pub fn with_upstream(mut self, layer: LayerId, details: serde_json::Value) -> Self {
        self.upstream.insert(layer, details);
        self
    }

    /// Structured output of a completed dependency.
    pub fn upstream(&self, layer: LayerId) -> LayerResult<&serde_json::Value> {
        self.upstream
            .get(&layer)
            .ok_or(LayerError::MissingUpstream { layer })
    }
}

/// Raw result of one analysis, before clamping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerFindings {
    pub score: f64,
    pub flags: Vec<String>,
    pub details: serde_json::Value,
}

impl LayerFindings {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            flags: Vec::new(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// A single evidence-gathering analysis.
///
/// Implementations must be side-effect free with respect to shared state and
/// safe to call repeatedly for the same input.
#[async_trait]
pub trait Layer: Send + Sync {
    fn id(&self) -> LayerId;

    /// Layers whose structured output this layer consumes.
    fn depends_on(&self) -> &'static [LayerId] {
        &[]
    }

    async fn analyze(&self, input: &LayerInput) -> LayerResult<LayerFindings>;
}

/// Layer units keyed by id.
#[derive(Clone, Default)]
pub struct LayerRegistry {
    layers: BTreeMap<LayerId, Arc<dyn Layer>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a layer under its own id, replacing any previous one.
    pub fn register(&mut self, layer: Arc<dyn Layer>) -> &mut Self {
        self.layers.insert(layer.id(), layer);
        self
    }

    pub fn with(mut self, layer: Arc<dyn Layer>) -> Self {
        self.register(layer);
        self
    }

    pub fn get(&self, id: LayerId) -> Option<Arc<dyn Layer>> {
        self.layers.get(&id).cloned()
    }

    /// Registered ids in declaration order.
    pub fn ids(&self) -> Vec<LayerId> {
        self.layers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Build the dependency graph from each layer's declared dependencies.
    pub fn graph(&self) -> GraphResult<DependencyGraph> {
        let mut graph = DependencyGraph::new();
        for id in self.layers.keys() {
            graph.add_layer(*id);
        }
        for (id, layer) in &self.layers {
            for dependency in layer.depends_on() {
                graph.add_dependency(*dependency, *id)?;
            }
        }
        Ok(graph)
    }

    /// The six standard layers wired to the given collaborators.
    pub fn standard(collaborators: Collaborators) -> Self {
        Self::new()
            .with(Arc::new(LocalComputeLayer::new(
                LayerId::Exif,
                collaborators.exif,
            )))
            .with(Arc::new(LocalComputeLayer::new(
                LayerId::Ela,
                collaborators.ela,
            )))
            .with(Arc::new(VisionLayer::new(collaborators.vision)))
            .with(Arc::new(CrossReferenceLayer::new(
                collaborators.cross_reference,
            )))
            .with(Arc::new(LedgerLayer::new(collaborators.ledger)))
            .with(Arc::new(GeoLayer::new(collaborators.geo)))
    }
}

impl std::fmt::Debug for LayerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerRegistry")
            .field("layers", &self.ids())
            .finish()
    }
}

/// The external collaborators and heuristics behind the standard layers.
#[derive(Clone)]
pub struct Collaborators {
    pub exif: Arc<dyn ImageHeuristic>,
    pub ela: Arc<dyn ImageHeuristic>,
    pub vision: Arc<dyn VisionService>,
    pub cross_reference: Arc<dyn CrossReferenceStore>,
    pub ledger: Arc<dyn LedgerService>,
    pub geo: Arc<dyn GeoReputationStore>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedLayer;

    #[test]
    fn test_standard_registry_declares_vision_dependency() {
        let registry = LayerRegistry::standard(crate::services::memory::demo_collaborators());
        assert_eq!(registry.ids(), LayerId::ALL.to_vec());
        let graph = registry.graph().unwrap();
        assert_eq!(
            graph.dependencies_of(LayerId::CrossReference).unwrap(),
            vec![LayerId::Vision]
        );
    }

    #[test]
    fn test_registry_rejects_dependency_on_missing_layer() {
        let registry = LayerRegistry::new().with(Arc::new(
            ScriptedLayer::scores(LayerId::CrossReference, 5.0).depending_on(&[LayerId::Vision]),
        ));
        assert!(registry.graph().is_err());
    }

    #[test]
    fn test_register_replaces_by_id() {
        let mut registry = LayerRegistry::new();
        registry.register(Arc::new(ScriptedLayer::scores(LayerId::Geo, 1.0)));
        registry.register(Arc::new(ScriptedLayer::scores(LayerId::Geo, 2.0)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_missing_upstream_is_an_error() {
        let input = LayerInput::new(
            Fingerprint::of_bytes(b"x"),
            Arc::from(vec![0u8]),
            RequesterContext::default(),
        );
        assert!(matches!(
            input.upstream(LayerId::Vision),
            Err(LayerError::MissingUpstream {
                layer: LayerId::Vision
            })
        ));
    }
}
