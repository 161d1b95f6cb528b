//! Execution scheduler: drives the layer DAG to completion under a global
//! deadline.
//!
//! Every ready layer is launched concurrently into a `FuturesUnordered`.
//! Each launch is wrapped in the layer's own timeout and a panic guard, so a
//! layer future always resolves to exactly one [`LayerOutcome`]. The driver
//! loop waits for the next outcome or the global deadline, whichever comes
//! first. On a terminal transition the progress event goes out before the
//! ready set is re-evaluated.
//!
//! A layer only ever sees upstream output through [`LayerInput::upstream`],
//! filled from the outcomes of its declared dependencies.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::broadcast::ProgressPublisher;
use crate::config::{LayerPolicies, LayerPolicy};
use crate::domain::{LayerId, LayerOutcome, OutcomeKind};
use crate::graph::{DependencyGraph, GraphResult};
use crate::layer::{Layer, LayerFindings, LayerInput, LayerRegistry};
use crate::metrics::METRICS;
use crate::obs;

/// Flag added when a raw score fell outside `[0, max]`.
pub const SCORE_CLAMPED_FLAG: &str = "score_clamped";

pub struct Scheduler {
    registry: LayerRegistry,
    graph: DependencyGraph,
    policies: LayerPolicies,
    global_deadline: Duration,
}

/// Book-keeping for one run.
#[derive(Default)]
struct RunState {
    outcomes: BTreeMap<LayerId, LayerOutcome>,
    started: BTreeMap<LayerId, Instant>,
}

impl RunState {
    fn terminal(&self) -> BTreeSet<LayerId> {
        self.outcomes.keys().copied().collect()
    }

    fn record(&mut self, outcome: LayerOutcome, progress: &ProgressPublisher) {
        obs::emit_layer_finished(
            &progress.verification_id(),
            outcome.layer,
            outcome.kind,
            outcome.score,
            outcome.elapsed_ms,
        );
        if !outcome.is_completed() {
            METRICS.inc_layers_degraded();
        }
        progress.layer_finished(&outcome);
        self.outcomes.insert(outcome.layer, outcome);
    }
}

impl Scheduler {
    /// Build a scheduler. Fails if the registry's declared dependencies do
    /// not form a DAG over registered layers.
    pub fn new(
        registry: LayerRegistry,
        policies: LayerPolicies,
        global_deadline: Duration,
    ) -> GraphResult<Self> {
        let graph = registry.graph()?;
        Ok(Self {
            registry,
            graph,
            policies,
            global_deadline,
        })
    }

    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn policies(&self) -> &LayerPolicies {
        &self.policies
    }

    pub fn global_deadline(&self) -> Duration {
        self.global_deadline
    }

    /// Run every registered layer once and return one outcome per layer, in
    /// declaration order. Never fails: errors, panics, timeouts and the
    /// global deadline all become fallback outcomes.
    #[instrument(skip_all, fields(verification_id = %progress.verification_id(), fingerprint = %input.fingerprint.short()))]
    pub async fn run(&self, input: &LayerInput, progress: &ProgressPublisher) -> Vec<LayerOutcome> {
        let deadline = tokio::time::sleep(self.global_deadline);
        tokio::pin!(deadline);

        let mut state = RunState::default();
        let mut running: FuturesUnordered<BoxFuture<'static, LayerOutcome>> =
            FuturesUnordered::new();
        let mut deadline_hit = false;

        loop {
            self.dispatch(input, &mut state, &mut running, progress);
            if running.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Some(outcome) = running.next() => state.record(outcome, progress),
                _ = &mut deadline => {
                    deadline_hit = true;
                    break;
                }
            }
        }

        // Dropping the futures cancels whatever is still in flight.
        drop(running);
        if deadline_hit {
            warn!(
                deadline_ms = self.global_deadline.as_millis() as u64,
                pending = self.registry.len() - state.outcomes.len(),
                "global deadline reached"
            );
        }
        self.force_remaining(&mut state, progress);

        let mut outcomes = state.outcomes;
        self.registry
            .ids()
            .into_iter()
            .filter_map(|id| outcomes.remove(&id))
            .collect()
    }

    /// Launch every ready, unstarted layer. Layers whose dependency did not
    /// complete are skipped instead, which can make further layers ready, so
    /// this repeats until nothing changes.
    fn dispatch(
        &self,
        input: &LayerInput,
        state: &mut RunState,
        running: &mut FuturesUnordered<BoxFuture<'static, LayerOutcome>>,
        progress: &ProgressPublisher,
    ) {
        loop {
            let ready: Vec<LayerId> = self
                .graph
                .ready_set(&state.terminal())
                .into_iter()
                .filter(|id| !state.started.contains_key(id))
                .collect();

            let mut terminal_changed = false;
            for id in ready {
                let policy = self.policies.get(id);

                if let Some(dependency) = self.graph.failed_dependency(id, &state.outcomes) {
                    debug!(layer = %id, %dependency, "skipping layer, dependency did not complete");
                    let outcome = LayerOutcome::fallback(
                        id,
                        OutcomeKind::SkippedDependencyFailed,
                        policy.fallback_score,
                        Duration::ZERO,
                        format!("dependency {dependency} did not complete"),
                    );
                    state.record(outcome, progress);
                    terminal_changed = true;
                    continue;
                }

                let Some(layer) = self.registry.get(id) else {
                    state.record(
                        LayerOutcome::fallback(
                            id,
                            OutcomeKind::Failed,
                            policy.fallback_score,
                            Duration::ZERO,
                            "layer not registered",
                        ),
                        progress,
                    );
                    terminal_changed = true;
                    continue;
                };

                let mut layer_input = input.clone();
                for dependency in self.graph.dependencies_of(id).unwrap_or_default() {
                    if let Some(upstream) = state.outcomes.get(&dependency) {
                        layer_input = layer_input.with_upstream(dependency, upstream.details.clone());
                    }
                }

                state.started.insert(id, Instant::now());
                progress.layer_started(id);
                running.push(launch(layer, policy, layer_input));
            }

            if !terminal_changed {
                break;
            }
        }
    }

    /// After the loop: running layers become `timed_out`, unstarted layers
    /// `skipped_dependency_failed`.
    fn force_remaining(&self, state: &mut RunState, progress: &ProgressPublisher) {
        for id in self.registry.ids() {
            if state.outcomes.contains_key(&id) {
                continue;
            }
            let policy = self.policies.get(id);
            let outcome = match state.started.get(&id) {
                Some(started) => LayerOutcome::fallback(
                    id,
                    OutcomeKind::TimedOut,
                    policy.fallback_score,
                    started.elapsed(),
                    "global deadline reached while running",
                ),
                None => LayerOutcome::fallback(
                    id,
                    OutcomeKind::SkippedDependencyFailed,
                    policy.fallback_score,
                    Duration::ZERO,
                    "global deadline reached before start",
                ),
            };
            state.record(outcome, progress);
        }
    }
}

/// One layer execution: timeout, panic guard and outcome conversion.
fn launch(
    layer: Arc<dyn Layer>,
    policy: LayerPolicy,
    input: LayerInput,
) -> BoxFuture<'static, LayerOutcome> {
    async move {
        let id = layer.id();
        let started = Instant::now();
        let analysis = AssertUnwindSafe(layer.analyze(&input)).catch_unwind();
        let result = tokio::time::timeout(policy.timeout(), analysis).await;
        let elapsed = started.elapsed();

        match result {
            Ok(Ok(Ok(findings))) => completed(id, &policy, findings, elapsed),
            Ok(Ok(Err(err))) => {
                warn!(layer = %id, error = %err, "layer failed");
                LayerOutcome::fallback(
                    id,
                    OutcomeKind::Failed,
                    policy.fallback_score,
                    elapsed,
                    err.to_string(),
                )
            }
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                warn!(layer = %id, panic = %message, "layer panicked");
                LayerOutcome::fallback(
                    id,
                    OutcomeKind::Failed,
                    policy.fallback_score,
                    elapsed,
                    format!("layer panicked: {message}"),
                )
            }
            Err(_) => {
                warn!(layer = %id, timeout_ms = policy.timeout_ms, "layer timed out");
                LayerOutcome::fallback(
                    id,
                    OutcomeKind::TimedOut,
                    policy.fallback_score,
                    elapsed,
                    format!("exceeded {}ms layer timeout", policy.timeout_ms),
                )
            }
        }
    }
    .boxed()
}

/// Clamp a finished analysis into an outcome. A non-finite score cannot be
/// clamped meaningfully and counts as a failure.
fn completed(
    id: LayerId,
    policy: &LayerPolicy,
    findings: LayerFindings,
    elapsed: Duration,
) -> LayerOutcome {
    if !findings.score.is_finite() {
        warn!(layer = %id, score = findings.score, "layer returned non-finite score");
        return LayerOutcome::fallback(
            id,
            OutcomeKind::Failed,
            policy.fallback_score,
            elapsed,
            format!("non-finite score {}", findings.score),
        );
    }

    let clamped = policy.clamp(findings.score);
    let mut flags = findings.flags;
    if clamped != findings.score {
        debug!(layer = %id, raw = findings.score, clamped, "score clamped");
        flags.push(SCORE_CLAMPED_FLAG.to_string());
    }
    LayerOutcome::completed(id, clamped, flags, findings.details, elapsed)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
