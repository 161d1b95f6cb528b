//! Scripted layer doubles (testing only)
//!
//! `ScriptedLayer` implements [`Layer`] with a fixed behavior so scheduler,
//! engine and end-to-end tests can drive every outcome kind without real
//! collaborators.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::LayerId;
use crate::layer::{Layer, LayerError, LayerFindings, LayerInput, LayerRegistry, LayerResult};

/// What a [`ScriptedLayer`] does when analyzed.
#[derive(Debug, Clone)]
pub enum Script {
    /// Complete immediately with this score.
    Score(f64),
    /// Sleep, then complete with this score.
    Delay(Duration, f64),
    /// Return a layer error.
    Fail(String),
    /// Never complete.
    Stall,
    /// Panic inside the analysis.
    Panic(String),
}

pub struct ScriptedLayer {
    id: LayerId,
    depends_on: &'static [LayerId],
    script: Script,
    details: serde_json::Value,
    calls: AtomicUsize,
    upstream_seen: Mutex<BTreeSet<LayerId>>,
}

impl ScriptedLayer {
    pub fn new(id: LayerId, script: Script) -> Self {
        Self {
            id,
            depends_on: &[],
            script,
            details: serde_json::Value::Null,
            calls: AtomicUsize::new(0),
            upstream_seen: Mutex::default(),
        }
    }

    pub fn scores(id: LayerId, score: f64) -> Self {
        Self::new(id, Script::Score(score))
    }

    pub fn delayed(id: LayerId, delay: Duration, score: f64) -> Self {
        Self::new(id, Script::Delay(delay, score))
    }

    pub fn fails(id: LayerId, reason: impl Into<String>) -> Self {
        Self::new(id, Script::Fail(reason.into()))
    }

    pub fn stalls(id: LayerId) -> Self {
        Self::new(id, Script::Stall)
    }

    pub fn panics(id: LayerId, message: impl Into<String>) -> Self {
        Self::new(id, Script::Panic(message.into()))
    }

    pub fn depending_on(mut self, layers: &'static [LayerId]) -> Self {
        self.depends_on = layers;
        self
    }

    /// Detail payload published on completion.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// How many times `analyze` was entered.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether any call received upstream output from `layer`.
    pub fn saw_upstream(&self, layer: LayerId) -> bool {
        self.upstream_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&layer)
    }

    fn findings(&self, score: f64) -> LayerFindings {
        LayerFindings::new(score).with_details(self.details.clone())
    }
}

#[async_trait]
impl Layer for ScriptedLayer {
    fn id(&self) -> LayerId {
        self.id
    }

    fn depends_on(&self) -> &'static [LayerId] {
        self.depends_on
    }

    async fn analyze(&self, input: &LayerInput) -> LayerResult<LayerFindings> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut seen = self
                .upstream_seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for dep in self.depends_on {
                if input.upstream(*dep).is_ok() {
                    seen.insert(*dep);
                }
            }
        }

        match &self.script {
            Script::Score(score) => Ok(self.findings(*score)),
            Script::Delay(delay, score) => {
                tokio::time::sleep(*delay).await;
                Ok(self.findings(*score))
            }
            Script::Fail(reason) => Err(LayerError::Unavailable {
                service: "scripted",
                detail: reason.clone(),
            }),
            Script::Stall => std::future::pending().await,
            Script::Panic(message) => panic!("{message}"),
        }
    }
}

/// Six scripted layers with the standard ids and the cross-reference layer
/// depending on vision. Returns the registry plus handles for inspection,
/// in declaration order.
pub fn standard_registry(scripts: [Script; 6]) -> (LayerRegistry, Vec<Arc<ScriptedLayer>>) {
    let layers: Vec<Arc<ScriptedLayer>> = LayerId::ALL
        .into_iter()
        .zip(scripts)
        .map(|(id, script)| {
            let layer = ScriptedLayer::new(id, script);
            Arc::new(if id == LayerId::CrossReference {
                layer.depending_on(&[LayerId::Vision])
            } else {
                layer
            })
        })
        .collect();

    let registry = layers.iter().fold(LayerRegistry::new(), |registry, layer| {
        registry.with(layer.clone() as Arc<dyn Layer>)
    });
    (registry, layers)
}

/// [`standard_registry`] where every layer completes with the given score.
pub fn scoring_registry(scores: [f64; 6]) -> (LayerRegistry, Vec<Arc<ScriptedLayer>>) {
    standard_registry(scores.map(Script::Score))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Fingerprint, RequesterContext};

    fn input() -> LayerInput {
        LayerInput::new(
            Fingerprint::of_bytes(b"img"),
            Arc::from(b"img".to_vec()),
            RequesterContext::default(),
        )
    }

    #[tokio::test]
    async fn test_scores_and_counts_calls() {
        let layer = ScriptedLayer::scores(LayerId::Exif, 7.0);
        assert_eq!(layer.analyze(&input()).await.unwrap().score, 7.0);
        assert_eq!(layer.calls(), 1);
    }

    #[tokio::test]
    async fn test_records_upstream_visibility() {
        let layer = ScriptedLayer::scores(LayerId::CrossReference, 1.0)
            .depending_on(&[LayerId::Vision]);
        layer.analyze(&input()).await.unwrap();
        assert!(!layer.saw_upstream(LayerId::Vision));

        let with_vision = input().with_upstream(LayerId::Vision, serde_json::json!({}));
        layer.analyze(&with_vision).await.unwrap();
        assert!(layer.saw_upstream(LayerId::Vision));
    }

    #[test]
    fn test_standard_registry_shape() {
        let (registry, handles) = scoring_registry([1.0; 6]);
        assert_eq!(registry.ids(), LayerId::ALL.to_vec());
        assert_eq!(handles.len(), 6);
        assert_eq!(
            registry
                .graph()
                .unwrap()
                .dependencies_of(LayerId::CrossReference)
                .unwrap(),
            vec![LayerId::Vision]
        );
    }
}
