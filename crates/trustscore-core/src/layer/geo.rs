//! Geo layer: reputation and clustering of the submitting origin.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{Layer, LayerFindings, LayerInput, LayerResult};
use crate::domain::LayerId;
use crate::services::{GeoReputationStore, GeoSignal};

pub const BASE_SCORE: f64 = 10.0;
/// Raw score for a blacklisted origin; clamps to zero.
pub const BLACKLISTED_SCORE: f64 = -10.0;
pub const HIGH_CLUSTER: u32 = 50;
pub const MODERATE_CLUSTER: u32 = 20;

/// Origin used when the requester context carries none.
pub const UNKNOWN_ORIGIN: &str = "unknown";

pub struct GeoLayer {
    store: Arc<dyn GeoReputationStore>,
}

impl GeoLayer {
    pub fn new(store: Arc<dyn GeoReputationStore>) -> Self {
        Self { store }
    }
}

/// Raw score and anomaly flags for a signal.
pub fn score(signal: &GeoSignal) -> (f64, Vec<&'static str>) {
    if signal.blacklisted {
        return (BLACKLISTED_SCORE, vec!["origin_blacklisted"]);
    }
    if signal.cluster_count > HIGH_CLUSTER {
        (BASE_SCORE - 8.0, vec!["high_volume_cluster"])
    } else if signal.cluster_count > MODERATE_CLUSTER {
        (BASE_SCORE - 3.0, vec!["moderate_cluster"])
    } else {
        (BASE_SCORE, Vec::new())
    }
}

#[async_trait]
impl Layer for GeoLayer {
    fn id(&self) -> LayerId {
        LayerId::Geo
    }

    async fn analyze(&self, input: &LayerInput) -> LayerResult<LayerFindings> {
        let origin = input.context.origin.as_deref().unwrap_or(UNKNOWN_ORIGIN);
        let signal = self.store.reputation(origin).await?;

        let (raw, flags) = score(&signal);
        let findings = flags
            .into_iter()
            .fold(LayerFindings::new(raw), |acc, flag| acc.with_flag(flag));

        Ok(findings.with_details(json!({
            "origin": origin,
            "location": signal.location,
            "cluster_count": signal.cluster_count,
            "blacklisted": signal.blacklisted,
        })))
    }
}
