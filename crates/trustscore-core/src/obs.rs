//! Structured observability hooks for the verification lifecycle.
//!
//! This module provides:
//! - A verification-scoped span via [`VerificationSpan`]
//! - Emission functions for lifecycle events: start, layer finish, finish,
//!   cache hit, in-flight attach and store failure
//!
//! Events are emitted at `info!` level; filter them with `RUST_LOG`.

use tracing::{info, warn, Instrument, Span};

use crate::domain::{Fingerprint, LayerId, OutcomeKind, Verdict, VerificationId};

/// Span tagging everything a pipeline run logs with its verification id.
///
/// The span is attached to the run's future with [`VerificationSpan::instrument`]
/// rather than entered, so it follows the future across worker threads.
///
/// ```ignore
/// let span = VerificationSpan::new(&id, &fingerprint);
/// tokio::spawn(span.instrument(run_pipeline(..)));
/// ```
#[derive(Debug, Clone)]
pub struct VerificationSpan {
    span: Span,
}

impl VerificationSpan {
    pub fn new(verification_id: &VerificationId, fingerprint: &Fingerprint) -> Self {
        let span = tracing::info_span!(
            "trustscore.verification",
            verification_id = %verification_id,
            fingerprint = %fingerprint.short(),
        );
        Self { span }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Run `fut` inside this span.
    pub fn instrument<F: std::future::Future>(&self, fut: F) -> tracing::instrument::Instrumented<F> {
        fut.instrument(self.span.clone())
    }
}

/// Emit event: a pipeline run started.
pub fn emit_verification_started(verification_id: &VerificationId, fingerprint: &Fingerprint) {
    info!(
        event = "verification.started",
        verification_id = %verification_id,
        fingerprint = %fingerprint.short(),
    );
}

/// Emit event: one layer reached a terminal state.
pub fn emit_layer_finished(
    verification_id: &VerificationId,
    layer: LayerId,
    outcome: OutcomeKind,
    score: f64,
    elapsed_ms: u64,
) {
    info!(
        event = "layer.finished",
        verification_id = %verification_id,
        layer = %layer,
        outcome = %outcome,
        score = score,
        elapsed_ms = elapsed_ms,
    );
}

/// Emit event: a pipeline run produced its report.
pub fn emit_verification_finished(
    verification_id: &VerificationId,
    total_score: f64,
    verdict: Verdict,
    degraded: bool,
    elapsed_ms: u64,
) {
    info!(
        event = "verification.finished",
        verification_id = %verification_id,
        total_score = total_score,
        verdict = %verdict,
        degraded = degraded,
        elapsed_ms = elapsed_ms,
    );
}

/// Emit event: a request was answered from a cached report.
pub fn emit_cache_hit(verification_id: &VerificationId, fingerprint: &Fingerprint) {
    info!(
        event = "cache.hit",
        verification_id = %verification_id,
        fingerprint = %fingerprint.short(),
    );
}

/// Emit event: a request attached to an in-flight run.
pub fn emit_inflight_attached(verification_id: &VerificationId, fingerprint: &Fingerprint) {
    info!(
        event = "inflight.attached",
        verification_id = %verification_id,
        fingerprint = %fingerprint.short(),
    );
}

/// Emit event: persisting a report failed (warning level).
pub fn emit_store_error(verification_id: &VerificationId, error: &dyn std::fmt::Display) {
    warn!(event = "store.error", verification_id = %verification_id, error = %error);
}
