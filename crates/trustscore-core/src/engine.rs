//! Verification engine: the public entry point.
//!
//! `VerificationEngine` ties together the idempotency guard, the layer
//! scheduler, the aggregator, the progress broadcaster and the report store.
//! A submission resolves in one of three ways:
//!
//! - `cached`: a fresh report exists for the fingerprint key
//! - `attached`: a run for the key is already in flight
//! - `started`: a new pipeline run was spawned
//!
//! Every disposition hands back a [`ReportHandle`] that resolves to the same
//! final report.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::aggregator::{Aggregator, ReportMeta};
use crate::broadcast::{ProgressBroadcaster, ProgressPublisher, Subscription};
use crate::config::EngineConfig;
use crate::domain::{
    Fingerprint, FingerprintKey, Result, SourceError, VerificationId, VerificationReport,
    VerificationRequest,
};
use crate::guard::{Claim, ClaimTicket, GuardStatus, IdempotencyGuard, ReportWaiter};
use crate::layer::{LayerInput, LayerRegistry};
use crate::metrics::METRICS;
use crate::obs::{self, VerificationSpan};
use crate::scheduler::Scheduler;
use crate::services::ImageSource;
use crate::store::ReportStore;

/// How a submission was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Cached,
    Attached,
    Started,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Disposition::Cached => "cached",
            Disposition::Attached => "attached",
            Disposition::Started => "started",
        };
        f.write_str(s)
    }
}

/// Resolves to the final report of a submission.
pub enum ReportHandle {
    Ready(Arc<VerificationReport>),
    Pending(ReportWaiter),
}

impl ReportHandle {
    /// Wait for the report. Fails only if the run was abandoned.
    pub async fn wait(self) -> Result<Arc<VerificationReport>> {
        match self {
            ReportHandle::Ready(report) => Ok(report),
            ReportHandle::Pending(waiter) => waiter.wait().await,
        }
    }
}

impl std::fmt::Debug for ReportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportHandle::Ready(report) => write!(f, "Ready({})", report.verification_id),
            ReportHandle::Pending(waiter) => write!(f, "Pending({})", waiter.verification_id()),
        }
    }
}

/// What [`VerificationEngine::submit`] hands back.
#[derive(Debug)]
pub struct Submission {
    pub verification_id: VerificationId,
    pub disposition: Disposition,
    pub handle: ReportHandle,
    /// Live progress for `attached` and `started` submissions. `None` for
    /// cached reports, or if the run finished before the subscription was
    /// made.
    pub progress: Option<Subscription>,
}

/// Answer to a poll by verification id.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationStatus {
    InProgress { verification_id: VerificationId },
    Completed(Arc<VerificationReport>),
}

/// Answer to [`VerificationEngine::watch`].
#[derive(Debug)]
pub enum Watch {
    /// The run is in flight; events arrive on the subscription.
    Live(Subscription),
    /// The run already finished.
    Finished(Arc<VerificationReport>),
}

struct EngineInner {
    config: EngineConfig,
    scheduler: Scheduler,
    aggregator: Aggregator,
    guard: Arc<IdempotencyGuard>,
    broadcaster: Arc<ProgressBroadcaster>,
    source: Arc<dyn ImageSource>,
    store: Arc<dyn ReportStore>,
    permits: Semaphore,
}

/// Orchestrates verifications. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct VerificationEngine {
    inner: Arc<EngineInner>,
}

impl VerificationEngine {
    /// Build an engine. Fails on invalid configuration or a layer registry
    /// whose dependencies do not form a DAG.
    pub fn new(
        config: EngineConfig,
        registry: LayerRegistry,
        source: Arc<dyn ImageSource>,
        store: Arc<dyn ReportStore>,
    ) -> Result<Self> {
        config.validate()?;
        let policies = config.policies();
        let aggregator = Aggregator::new(policies.clone(), registry.ids());
        let scheduler = Scheduler::new(registry, policies, config.global_deadline())?;

        let inner = EngineInner {
            guard: Arc::new(IdempotencyGuard::new(config.cache_ttl())),
            broadcaster: Arc::new(ProgressBroadcaster::new(config.closed_id_retention)),
            permits: Semaphore::new(config.max_concurrent_pipelines),
            scheduler,
            aggregator,
            source,
            store,
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Submit a document for verification.
    ///
    /// Input problems (unreadable, empty or oversized image, fingerprint
    /// mismatch) are returned as errors and no pipeline starts. Everything
    /// that goes wrong after that is absorbed into the report.
    #[instrument(skip_all, fields(fingerprint = %request.fingerprint().short()))]
    pub async fn submit(&self, request: VerificationRequest) -> Result<Submission> {
        let inner = &self.inner;
        let key = request.key(inner.config.isolate_by_requester);

        if let Some(report) = inner.guard.lookup(&key) {
            return Ok(cached(report));
        }
        if let Some(report) = self.load_fresh_from_store(&key).await {
            return Ok(cached(report));
        }

        let image = inner.source.load(request.image()).await?;
        let actual = Fingerprint::of_bytes(&image);
        if actual != *request.fingerprint() {
            return Err(SourceError::FingerprintMismatch {
                expected: request.fingerprint().clone(),
                actual,
            }
            .into());
        }

        match inner.guard.claim(&key) {
            Claim::Cached(report) => Ok(cached(report)),
            Claim::Attached { id, waiter } => {
                METRICS.inc_inflight_attaches();
                obs::emit_inflight_attached(&id, request.fingerprint());
                Ok(Submission {
                    verification_id: id,
                    disposition: Disposition::Attached,
                    handle: ReportHandle::Pending(waiter),
                    progress: inner.broadcaster.subscribe(id).ok(),
                })
            }
            Claim::Started { id, waiter, ticket } => {
                let progress = inner.broadcaster.subscribe(id).ok();
                let input = LayerInput::new(
                    request.fingerprint().clone(),
                    image,
                    request.context().clone(),
                );
                let meta = ReportMeta {
                    verification_id: id,
                    fingerprint: request.fingerprint().clone(),
                    scope: key.scope.clone(),
                    requested_at: request.created_at(),
                };
                let span = VerificationSpan::new(&id, request.fingerprint());
                tokio::spawn(span.instrument(run_pipeline(
                    Arc::clone(inner),
                    ticket,
                    input,
                    meta,
                )));

                Ok(Submission {
                    verification_id: id,
                    disposition: Disposition::Started,
                    handle: ReportHandle::Pending(waiter),
                    progress,
                })
            }
        }
    }

    /// Submit and wait for the final report.
    pub async fn verify(&self, request: VerificationRequest) -> Result<Arc<VerificationReport>> {
        self.submit(request).await?.handle.wait().await
    }

    /// Poll a verification by id.
    pub async fn status(&self, id: VerificationId) -> Option<VerificationStatus> {
        match self.inner.guard.status(id) {
            Some(GuardStatus::InProgress) => {
                return Some(VerificationStatus::InProgress {
                    verification_id: id,
                })
            }
            Some(GuardStatus::Completed(report)) => return Some(VerificationStatus::Completed(report)),
            None => {}
        }

        match self.stored_report(id).await {
            Ok(report) => report.map(|r| VerificationStatus::Completed(Arc::new(r))),
            Err(e) => {
                warn!(verification_id = %id, error = %e, "report lookup failed");
                None
            }
        }
    }

    /// Fetch a persisted report by id.
    pub async fn stored_report(&self, id: VerificationId) -> Result<Option<VerificationReport>> {
        Ok(self.inner.store.get(&id).await?)
    }

    /// Observe a verification. Late joiners to a finished run get the
    /// report instead of a stream. `None` for unknown ids.
    pub async fn watch(&self, id: VerificationId) -> Option<Watch> {
        match self.status(id).await? {
            VerificationStatus::Completed(report) => Some(Watch::Finished(report)),
            VerificationStatus::InProgress { .. } => {
                match self.inner.broadcaster.subscribe(id) {
                    Ok(subscription) => Some(Watch::Live(subscription)),
                    // Finished between the status check and the subscribe.
                    Err(_) => match self.status(id).await? {
                        VerificationStatus::Completed(report) => Some(Watch::Finished(report)),
                        VerificationStatus::InProgress { .. } => None,
                    },
                }
            }
        }
    }

    /// Drop cached reports older than the cache TTL.
    pub fn purge_expired(&self) -> usize {
        let purged = self.inner.guard.purge_expired();
        if purged > 0 {
            debug!(purged, "expired reports purged from cache");
        }
        purged
    }

    /// Number of pipeline runs currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.guard.in_flight()
    }

    async fn load_fresh_from_store(&self, key: &FingerprintKey) -> Option<Arc<VerificationReport>> {
        let inner = &self.inner;
        let report = match inner.store.latest_for(key).await {
            Ok(report) => report?,
            Err(e) => {
                warn!(key = %key, error = %e, "report store lookup failed");
                return None;
            }
        };

        // A completion time in the future counts as brand new.
        let age = (Utc::now() - report.completed_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age > inner.config.cache_ttl() {
            return None;
        }

        let report = Arc::new(report);
        inner.guard.seed(key, Arc::clone(&report), age);
        Some(report)
    }
}

impl std::fmt::Debug for VerificationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationEngine")
            .field("guard", &self.inner.guard)
            .field("broadcaster", &self.inner.broadcaster)
            .field("available_permits", &self.inner.permits.available_permits())
            .finish()
    }
}

fn cached(report: Arc<VerificationReport>) -> Submission {
    METRICS.inc_cache_hits();
    obs::emit_cache_hit(&report.verification_id, &report.fingerprint);
    Submission {
        verification_id: report.verification_id,
        disposition: Disposition::Cached,
        handle: ReportHandle::Ready(report),
        progress: None,
    }
}

/// One pipeline run, from the permit wait to the report write.
///
/// The report reaches waiters and subscribers before it is persisted, so a
/// slow or broken store never holds back delivery.
async fn run_pipeline(
    inner: Arc<EngineInner>,
    ticket: ClaimTicket,
    input: LayerInput,
    meta: ReportMeta,
) {
    let id = ticket.verification_id();
    // Dropped without `completed`, the publisher closes the topic.
    let publisher = ProgressPublisher::new(Arc::clone(&inner.broadcaster), id);
    let permit = match inner.permits.acquire().await {
        Ok(permit) => permit,
        Err(e) => {
            // Dropping the ticket releases every waiter.
            warn!(verification_id = %id, error = %e, "pipeline permits closed");
            return;
        }
    };

    let started = Instant::now();
    METRICS.inc_pipelines_started();
    obs::emit_verification_started(&id, &input.fingerprint);
    publisher.started(&input.fingerprint);

    let outcomes = inner.scheduler.run(&input, &publisher).await;
    let report = Arc::new(inner.aggregator.compose(meta, &outcomes, started.elapsed()));

    // Cache first so anyone who misses the completion event finds the report.
    ticket.complete(Arc::clone(&report));
    publisher.completed(Arc::clone(&report));
    obs::emit_verification_finished(
        &id,
        report.total_score,
        report.verdict,
        report.degraded,
        report.elapsed_ms,
    );
    drop(permit);

    persist(inner.store.as_ref(), &report, inner.config.store_timeout()).await;
}

/// Best-effort write of a finished report. Failures, panics and timeouts are
/// logged and dropped.
async fn persist(store: &dyn ReportStore, report: &VerificationReport, limit: Duration) {
    let id = report.verification_id;
    let put = AssertUnwindSafe(store.put(report)).catch_unwind();
    match tokio::time::timeout(limit, put).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => obs::emit_store_error(&id, &e),
        Ok(Err(_)) => obs::emit_store_error(&id, &"report store panicked"),
        Err(_) => {
            let message = format!("report store timed out after {}ms", limit.as_millis());
            obs::emit_store_error(&id, &message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ImageRef, ProgressEventKind, RequesterContext, Verdict, VerifyError};
    use crate::fakes::{scoring_registry, standard_registry, Script};
    use crate::services::FsImageSource;
    use crate::store::{MemoryReportStore, StoreResult};
    use async_trait::async_trait;
    use futures::StreamExt;

    /// Store whose writes never finish.
    struct StallingStore;

    #[async_trait]
    impl ReportStore for StallingStore {
        async fn put(&self, _report: &VerificationReport) -> StoreResult<()> {
            futures::future::pending().await
        }

        async fn get(&self, _id: &VerificationId) -> StoreResult<Option<VerificationReport>> {
            Ok(None)
        }

        async fn latest_for(&self, _key: &FingerprintKey) -> StoreResult<Option<VerificationReport>> {
            Ok(None)
        }
    }

    /// Store whose writes panic.
    struct PanickingStore;

    #[async_trait]
    impl ReportStore for PanickingStore {
        async fn put(&self, _report: &VerificationReport) -> StoreResult<()> {
            panic!("disk on fire")
        }

        async fn get(&self, _id: &VerificationId) -> StoreResult<Option<VerificationReport>> {
            Ok(None)
        }

        async fn latest_for(&self, _key: &FingerprintKey) -> StoreResult<Option<VerificationReport>> {
            Ok(None)
        }
    }

    fn engine_with(registry: LayerRegistry, store: Arc<dyn ReportStore>) -> VerificationEngine {
        let config = EngineConfig::default();
        let source = Arc::new(FsImageSource::new(config.max_image_bytes));
        VerificationEngine::new(config, registry, source, store).unwrap()
    }

    fn request(doc: &[u8]) -> VerificationRequest {
        VerificationRequest::from_bytes(doc.to_vec(), RequesterContext::default())
    }

    #[tokio::test]
    async fn test_submit_runs_pipeline_and_caches() {
        let (registry, handles) = scoring_registry([18.0, 16.0, 19.0, 18.0, 10.0, 6.0]);
        let engine = engine_with(registry, Arc::new(MemoryReportStore::new()));

        let first = engine.submit(request(b"diploma")).await.unwrap();
        assert_eq!(first.disposition, Disposition::Started);
        let report = first.handle.wait().await.unwrap();
        assert_eq!(report.total_score, 87.0);
        assert_eq!(report.verdict, Verdict::Verified);

        let second = engine.submit(request(b"diploma")).await.unwrap();
        assert_eq!(second.disposition, Disposition::Cached);
        assert_eq!(second.verification_id, first.verification_id);
        assert!(second.progress.is_none());
        assert!(handles.iter().all(|h| h.calls() == 1));
    }

    #[tokio::test]
    async fn test_started_submission_streams_until_completed() {
        let (registry, _) = scoring_registry([1.0; 6]);
        let engine = engine_with(registry, Arc::new(MemoryReportStore::new()));

        let submission = engine.submit(request(b"doc")).await.unwrap();
        let events: Vec<_> = submission.progress.unwrap().collect().await;
        assert!(matches!(events[0].kind, ProgressEventKind::Started { .. }));
        assert!(events.last().unwrap().is_terminal());
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn test_empty_image_is_input_error() {
        let (registry, handles) = scoring_registry([1.0; 6]);
        let engine = engine_with(registry, Arc::new(MemoryReportStore::new()));

        let err = engine.submit(request(b"")).await.unwrap_err();
        assert!(matches!(err, VerifyError::Input(SourceError::Empty(_))));
        assert_eq!(handles[0].calls(), 0);
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_location_fingerprint_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scan.jpg"), b"actual bytes").unwrap();
        let config = EngineConfig::default();
        let source = Arc::new(FsImageSource::new(config.max_image_bytes).with_root(dir.path()));
        let (registry, _) = scoring_registry([1.0; 6]);
        let engine =
            VerificationEngine::new(config, registry, source, Arc::new(MemoryReportStore::new()))
                .unwrap();

        let req = VerificationRequest::from_location(
            Fingerprint::of_bytes(b"claimed bytes"),
            "scan.jpg",
            RequesterContext::default(),
        );
        assert!(matches!(req.image(), ImageRef::Location(_)));
        let err = engine.submit(req).await.unwrap_err();
        assert!(matches!(
            err,
            VerifyError::Input(SourceError::FingerprintMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_status_and_watch_follow_lifecycle() {
        let (registry, _) = standard_registry([
            Script::Delay(Duration::from_millis(50), 5.0),
            Script::Score(5.0),
            Script::Score(5.0),
            Script::Score(5.0),
            Script::Score(5.0),
            Script::Score(5.0),
        ]);
        let engine = engine_with(registry, Arc::new(MemoryReportStore::new()));
        let submission = engine.submit(request(b"doc")).await.unwrap();
        let id = submission.verification_id;

        assert_eq!(
            engine.status(id).await,
            Some(VerificationStatus::InProgress { verification_id: id })
        );
        let live = match engine.watch(id).await {
            Some(Watch::Live(sub)) => sub,
            other => panic!("expected live watch, got {other:?}"),
        };
        let events: Vec<_> = live.collect().await;
        assert!(events.last().unwrap().is_terminal());

        let report = submission.handle.wait().await.unwrap();
        assert_eq!(engine.status(id).await, Some(VerificationStatus::Completed(report.clone())));
        assert!(matches!(engine.watch(id).await, Some(Watch::Finished(r)) if r == report));
        assert!(engine.status(VerificationId::new()).await.is_none());
        assert!(engine.watch(VerificationId::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_fresh_store_report_is_served_without_running() {
        let store = Arc::new(MemoryReportStore::new());
        let (registry, _) = scoring_registry([2.0; 6]);
        let first = engine_with(registry, store.clone());
        let report = first.verify(request(b"doc")).await.unwrap();
        // Persisting trails delivery.
        while store.get(&report.verification_id).await.unwrap().is_none() {
            tokio::task::yield_now().await;
        }

        // A second engine over the same store, as after a restart.
        let (registry, handles) = scoring_registry([9.0; 6]);
        let second = engine_with(registry, store);
        let submission = second.submit(request(b"doc")).await.unwrap();
        assert_eq!(submission.disposition, Disposition::Cached);
        assert_eq!(submission.handle.wait().await.unwrap(), report);
        assert!(handles.iter().all(|h| h.calls() == 0));
        assert!(matches!(
            second.status(report.verification_id).await,
            Some(VerificationStatus::Completed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_does_not_hold_back_report() {
        let config = EngineConfig {
            global_deadline_ms: 500,
            ..EngineConfig::default()
        };
        let source = Arc::new(FsImageSource::new(config.max_image_bytes));
        let (registry, handles) = scoring_registry([3.0; 6]);
        let engine =
            VerificationEngine::new(config, registry, source, Arc::new(StallingStore)).unwrap();

        let start = Instant::now();
        let report = tokio::time::timeout(Duration::from_secs(60), engine.verify(request(b"doc")))
            .await
            .expect("report delivered despite stalled store")
            .unwrap();
        assert!(start.elapsed() <= Duration::from_millis(510));
        assert_eq!(report.total_score, 18.0);
        assert_eq!(engine.in_flight(), 0);
        // The write is still pending but holds no permit.
        assert_eq!(engine.inner.permits.available_permits(), 8);

        let again = engine.submit(request(b"doc")).await.unwrap();
        assert_eq!(again.disposition, Disposition::Cached);
        assert!(handles.iter().all(|h| h.calls() == 1));
    }

    #[tokio::test]
    async fn test_panicking_store_still_delivers_report() {
        let (registry, _) = scoring_registry([4.0; 6]);
        let engine = engine_with(registry, Arc::new(PanickingStore));

        let submission = engine.submit(request(b"doc")).await.unwrap();
        let events: Vec<_> = tokio::time::timeout(
            Duration::from_secs(5),
            submission.progress.unwrap().collect::<Vec<_>>(),
        )
        .await
        .expect("progress stream ended");
        assert!(events.last().unwrap().is_terminal());

        let report = submission.handle.wait().await.unwrap();
        assert_eq!(report.total_score, 24.0);
        assert_eq!(
            engine.status(report.verification_id).await,
            Some(VerificationStatus::Completed(report))
        );
    }

    #[tokio::test]
    async fn test_abandoned_run_ends_progress_stream() {
        let (registry, handles) = scoring_registry([1.0; 6]);
        let engine = engine_with(registry, Arc::new(MemoryReportStore::new()));
        engine.inner.permits.close();

        let submission = engine.submit(request(b"doc")).await.unwrap();
        let id = submission.verification_id;
        let events: Vec<_> = tokio::time::timeout(
            Duration::from_secs(5),
            submission.progress.unwrap().collect::<Vec<_>>(),
        )
        .await
        .expect("progress stream ended");
        assert!(events.is_empty());

        let err = submission.handle.wait().await.unwrap_err();
        assert!(matches!(err, VerifyError::Abandoned(got) if got == id));
        assert_eq!(engine.in_flight(), 0);
        assert!(engine.watch(id).await.is_none());
        assert!(handles.iter().all(|h| h.calls() == 0));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.max_concurrent_pipelines = 0;
        let (registry, _) = scoring_registry([1.0; 6]);
        let source = Arc::new(FsImageSource::new(config.max_image_bytes));
        let err = VerificationEngine::new(config, registry, source, Arc::new(MemoryReportStore::new()))
            .unwrap_err();
        assert!(matches!(err, VerifyError::Config(_)));
    }
}
