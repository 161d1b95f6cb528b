//! Engine configuration.
//!
//! Layer budgets (max score, fallback score, timeout) are configuration, not
//! behavior: every value has a default here and can be overridden from a TOML
//! file or the environment without touching code.
//!
//! ```toml
//! global_deadline_ms = 5000
//! max_concurrent_pipelines = 8
//!
//! [layers.vision]
//! fallback_score = 10
//! timeout_ms = 4000
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::LayerId;

/// Upper bound for the sum of all layer maxima.
pub const MAX_TOTAL_SCORE: f64 = 100.0;

/// Environment variable overriding `global_deadline_ms`.
pub const ENV_DEADLINE_MS: &str = "TRUSTSCORE_DEADLINE_MS";
/// Environment variable overriding `demo`.
pub const ENV_DEMO: &str = "TRUSTSCORE_DEMO";

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid value {value:?} for {var}")]
    Env { var: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// The three numbers every layer declares.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerPolicy {
    /// Maximum contribution to the total score.
    pub max_score: f64,
    /// Score applied on timeout, failure or dependency skip.
    pub fallback_score: f64,
    /// Per-layer time budget.
    pub timeout_ms: u64,
}

impl LayerPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Clamp a raw score into `[0, max_score]`.
    pub fn clamp(&self, raw: f64) -> f64 {
        raw.clamp(0.0, self.max_score)
    }

    /// Built-in policy for a layer.
    pub fn default_for(layer: LayerId) -> Self {
        let (max_score, fallback_score, timeout_ms) = match layer {
            LayerId::Exif => (20.0, 0.0, 1_000),
            LayerId::Ela => (20.0, 0.0, 1_000),
            LayerId::Vision => (20.0, 10.0, 4_000),
            LayerId::CrossReference => (20.0, 0.0, 2_000),
            LayerId::Ledger => (10.0, 0.0, 3_000),
            LayerId::Geo => (10.0, 10.0, 1_000),
        };
        Self {
            max_score,
            fallback_score,
            timeout_ms,
        }
    }
}

/// Partial override of a [`LayerPolicy`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Resolved policies for every layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerPolicies(BTreeMap<LayerId, LayerPolicy>);

impl LayerPolicies {
    /// Policy for `layer`, falling back to the built-in default.
    pub fn get(&self, layer: LayerId) -> LayerPolicy {
        self.0
            .get(&layer)
            .copied()
            .unwrap_or_else(|| LayerPolicy::default_for(layer))
    }

    pub fn set(&mut self, layer: LayerId, policy: LayerPolicy) {
        self.0.insert(layer, policy);
    }

    pub fn iter(&self) -> impl Iterator<Item = (LayerId, LayerPolicy)> + '_ {
        self.0.iter().map(|(id, policy)| (*id, *policy))
    }
}

impl Default for LayerPolicies {
    fn default() -> Self {
        Self(
            LayerId::ALL
                .into_iter()
                .map(|id| (id, LayerPolicy::default_for(id)))
                .collect(),
        )
    }
}

/// Remote AI-vision endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionEndpoint {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Wall-clock bound for a whole pipeline run.
    pub global_deadline_ms: u64,
    /// Pipelines allowed to run at once across fingerprints.
    pub max_concurrent_pipelines: usize,
    /// Freshness window for cached reports.
    pub cache_ttl_secs: u64,
    /// Scope the idempotency key by requester account.
    pub isolate_by_requester: bool,
    /// Completed verification ids remembered as closed for subscriptions.
    pub closed_id_retention: usize,
    /// Largest accepted image.
    pub max_image_bytes: u64,
    /// Time allowed for persisting a finished report.
    pub store_timeout_ms: u64,
    /// Use canned collaborator responses instead of remote services.
    pub demo: bool,
    /// Directory for persisted reports; in-memory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vision: Option<VisionEndpoint>,
    pub layers: BTreeMap<LayerId, LayerOverride>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            global_deadline_ms: 5_000,
            max_concurrent_pipelines: 8,
            cache_ttl_secs: 3_600,
            isolate_by_requester: false,
            closed_id_retention: 4_096,
            max_image_bytes: 10 * 1024 * 1024,
            store_timeout_ms: 2_000,
            demo: false,
            report_dir: None,
            vision: None,
            layers: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Apply `TRUSTSCORE_*` environment overrides.
    pub fn apply_env_overrides(self) -> ConfigResult<Self> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(mut self, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_DEADLINE_MS) {
            self.global_deadline_ms = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_DEADLINE_MS.to_string(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(ENV_DEMO) {
            self.demo = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::Env {
                        var: ENV_DEMO.to_string(),
                        value,
                    })
                }
            };
        }
        self.validate()?;
        Ok(self)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.global_deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "global_deadline_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_pipelines == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_pipelines must be at least 1".to_string(),
            ));
        }
        if self.max_image_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_image_bytes must be greater than zero".to_string(),
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "store_timeout_ms must be greater than zero".to_string(),
            ));
        }
        // Late subscribers are told apart from unknown ids by this window.
        if self.closed_id_retention == 0 {
            return Err(ConfigError::Invalid(
                "closed_id_retention must be at least 1".to_string(),
            ));
        }

        let policies = self.policies();
        let mut total_max = 0.0;
        for (layer, policy) in policies.iter() {
            if !policy.max_score.is_finite() || policy.max_score < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "layer {layer}: max_score must be a non-negative number"
                )));
            }
            if !(0.0..=policy.max_score).contains(&policy.fallback_score) {
                return Err(ConfigError::Invalid(format!(
                    "layer {layer}: fallback_score {} outside [0, {}]",
                    policy.fallback_score, policy.max_score
                )));
            }
            if policy.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "layer {layer}: timeout_ms must be greater than zero"
                )));
            }
            total_max += policy.max_score;
        }
        if total_max > MAX_TOTAL_SCORE {
            return Err(ConfigError::Invalid(format!(
                "layer max scores sum to {total_max}, limit is {MAX_TOTAL_SCORE}"
            )));
        }
        Ok(())
    }

    /// Defaults merged with the `[layers.*]` overrides.
    pub fn policies(&self) -> LayerPolicies {
        let mut policies = LayerPolicies::default();
        for (layer, patch) in &self.layers {
            let mut policy = policies.get(*layer);
            if let Some(max_score) = patch.max_score {
                policy.max_score = max_score;
            }
            if let Some(fallback_score) = patch.fallback_score {
                policy.fallback_score = fallback_score;
            }
            if let Some(timeout_ms) = patch.timeout_ms {
                policy.timeout_ms = timeout_ms;
            }
            policies.set(*layer, policy);
        }
        policies
    }

    pub fn global_deadline(&self) -> Duration {
        Duration::from_millis(self.global_deadline_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
