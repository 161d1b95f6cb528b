//! Aggregator: clamps per-layer scores, sums them and maps the total to a
//! verdict.
//!
//! [`Aggregator::aggregate`] is a pure function of the outcome list. The
//! total is always recomputed from the outcomes, never carried over.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{LayerPolicies, MAX_TOTAL_SCORE};
use crate::domain::{
    Fingerprint, LayerId, LayerOutcome, OutcomeKind, Verdict, VerificationId, VerificationReport,
};

/// Scoring result for one outcome set.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreSummary {
    pub total_score: f64,
    pub verdict: Verdict,
    pub degraded: bool,
    /// One normalized outcome per declared layer, in declaration order.
    pub layers: Vec<LayerOutcome>,
}

/// Identity and timing of the request a report belongs to.
#[derive(Debug, Clone)]
pub struct ReportMeta {
    pub verification_id: VerificationId,
    pub fingerprint: Fingerprint,
    pub scope: Option<String>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    policies: LayerPolicies,
    layers: Vec<LayerId>,
}

impl Aggregator {
    /// `layers` is the declared layer set, in report order.
    pub fn new(policies: LayerPolicies, layers: Vec<LayerId>) -> Self {
        Self { policies, layers }
    }

    pub fn layers(&self) -> &[LayerId] {
        &self.layers
    }

    /// Score an outcome list.
    ///
    /// Every declared layer contributes `clamp(score, 0, max)`. A declared
    /// layer with no outcome contributes its fallback score; outcomes for
    /// undeclared layers are ignored. If a layer appears twice the first
    /// outcome wins.
    pub fn aggregate(&self, outcomes: &[LayerOutcome]) -> ScoreSummary {
        let mut layers = Vec::with_capacity(self.layers.len());
        let mut sum = 0.0;

        for id in &self.layers {
            let policy = self.policies.get(*id);
            let mut outcome = match outcomes.iter().find(|o| o.layer == *id) {
                Some(outcome) => outcome.clone(),
                None => LayerOutcome::fallback(
                    *id,
                    OutcomeKind::Failed,
                    policy.fallback_score,
                    Duration::ZERO,
                    "no outcome recorded",
                ),
            };
            outcome.score = if outcome.score.is_finite() {
                policy.clamp(outcome.score)
            } else {
                policy.clamp(policy.fallback_score)
            };
            sum += outcome.score;
            layers.push(outcome);
        }

        let total_score = sum.clamp(0.0, MAX_TOTAL_SCORE);
        ScoreSummary {
            total_score,
            verdict: Verdict::from_score(total_score),
            degraded: layers.iter().any(|o| !o.is_completed()),
            layers,
        }
    }

    /// Build the final report for a finished run.
    pub fn compose(
        &self,
        meta: ReportMeta,
        outcomes: &[LayerOutcome],
        elapsed: Duration,
    ) -> VerificationReport {
        let summary = self.aggregate(outcomes);
        VerificationReport {
            verification_id: meta.verification_id,
            fingerprint: meta.fingerprint,
            scope: meta.scope,
            total_score: summary.total_score,
            verdict: summary.verdict,
            layers: summary.layers,
            elapsed_ms: elapsed.as_millis() as u64,
            requested_at: meta.requested_at,
            completed_at: Utc::now(),
            degraded: summary.degraded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> Aggregator {
        Aggregator::new(LayerPolicies::default(), LayerId::ALL.to_vec())
    }

    fn completed(layer: LayerId, score: f64) -> LayerOutcome {
        LayerOutcome::completed(
            layer,
            score,
            vec![],
            serde_json::Value::Null,
            Duration::ZERO,
        )
    }

    fn all_completed(scores: [f64; 6]) -> Vec<LayerOutcome> {
        LayerId::ALL
            .into_iter()
            .zip(scores)
            .map(|(id, s)| completed(id, s))
            .collect()
    }

    #[test]
    fn test_all_layers_complete_verified() {
        let summary = aggregator().aggregate(&all_completed([18.0, 16.0, 19.0, 18.0, 10.0, 6.0]));
        assert_eq!(summary.total_score, 87.0);
        assert_eq!(summary.verdict, Verdict::Verified);
        assert!(!summary.degraded);
    }

    #[test]
    fn test_aggregate_is_pure() {
        let outcomes = all_completed([3.0, 7.5, 12.25, 0.0, 10.0, 9.0]);
        let a = aggregator().aggregate(&outcomes);
        let b = aggregator().aggregate(&outcomes);
        assert_eq!(a, b);
    }

    #[test]
    fn test_scores_are_clamped_per_layer() {
        let summary = aggregator().aggregate(&all_completed([-10.0, 50.0, 20.0, 20.0, 99.0, 10.0]));
        assert_eq!(summary.layers[0].score, 0.0);
        assert_eq!(summary.layers[1].score, 20.0);
        assert_eq!(summary.layers[4].score, 10.0);
        assert_eq!(summary.total_score, 80.0);
    }

    #[test]
    fn test_missing_layer_uses_fallback_and_degrades() {
        let outcomes: Vec<LayerOutcome> = all_completed([20.0; 6])
            .into_iter()
            .filter(|o| o.layer != LayerId::Vision)
            .collect();
        let summary = aggregator().aggregate(&outcomes);
        let vision = &summary.layers[2];
        assert_eq!(vision.layer, LayerId::Vision);
        assert_eq!(vision.kind, OutcomeKind::Failed);
        assert_eq!(vision.score, 10.0);
        assert!(summary.degraded);
    }

    #[test]
    fn test_verdict_boundaries_through_totals() {
        let cases: [(f64, Verdict); 4] = [
            (79.0, Verdict::Suspicious),
            (80.0, Verdict::Verified),
            (39.0, Verdict::Fraud),
            (40.0, Verdict::Suspicious),
        ];
        for (total, expected) in cases {
            // Fill layers front to back up to each maximum.
            let exif = total.min(20.0);
            let ela = (total - exif).min(20.0);
            let vision = (total - exif - ela).min(20.0);
            let xref = (total - exif - ela - vision).min(20.0);
            let rest = total - exif - ela - vision - xref;
            let scores = [exif, ela, vision, xref, rest.min(10.0), (rest - 10.0).max(0.0)];
            let summary = aggregator().aggregate(&all_completed(scores));
            assert_eq!(summary.total_score, total);
            assert_eq!(summary.verdict, expected, "total {total}");
        }
    }

    #[test]
    fn test_fallback_only_report_sums_fallbacks() {
        let policies = LayerPolicies::default();
        let outcomes: Vec<LayerOutcome> = LayerId::ALL
            .into_iter()
            .map(|id| {
                LayerOutcome::fallback(
                    id,
                    OutcomeKind::TimedOut,
                    policies.get(id).fallback_score,
                    Duration::from_secs(1),
                    "slow",
                )
            })
            .collect();
        let summary = aggregator().aggregate(&outcomes);
        assert_eq!(summary.total_score, 20.0);
        assert!(summary.degraded);
        assert_eq!(summary.verdict, Verdict::Fraud);
    }

    #[test]
    fn test_compose_carries_meta() {
        let id = VerificationId::new();
        let report = aggregator().compose(
            ReportMeta {
                verification_id: id,
                fingerprint: Fingerprint::of_bytes(b"doc"),
                scope: Some("acct".into()),
                requested_at: Utc::now(),
            },
            &all_completed([10.0; 6]),
            Duration::from_millis(42),
        );
        assert_eq!(report.verification_id, id);
        assert_eq!(report.scope.as_deref(), Some("acct"));
        assert_eq!(report.elapsed_ms, 42);
        assert_eq!(report.total_score, 60.0);
        assert_eq!(report.verdict, Verdict::Suspicious);
    }
}
