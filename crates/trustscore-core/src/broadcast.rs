//! Progress broadcaster: publish/subscribe keyed by verification id.
//!
//! Each subscriber owns an unbounded channel, so publishing never waits on a
//! slow observer. Delivery happens under the topic lock: a concurrent
//! `subscribe` either sees every later event or finds the id closed.
//! After the `completed` event the topic is removed, its senders dropped
//! (ending every stream) and the id remembered as closed. A publisher dropped
//! before `completed` closes its topic the same way, without a final event.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::domain::{
    Fingerprint, LayerId, LayerOutcome, ProgressEvent, ProgressEventKind, VerificationId,
    VerificationReport,
};

/// Errors returned by [`ProgressBroadcaster::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    /// The verification already published its `completed` event. Fetch the
    /// report from the cache instead.
    #[error("verification {0} has already completed")]
    Closed(VerificationId),
}

#[derive(Default)]
struct Topics {
    next_subscriber: u64,
    open: HashMap<VerificationId, HashMap<u64, mpsc::UnboundedSender<ProgressEvent>>>,
    closed: HashSet<VerificationId>,
    closed_order: VecDeque<VerificationId>,
}

impl Topics {
    fn close(&mut self, id: VerificationId, retention: usize) {
        self.open.remove(&id);
        if self.closed.insert(id) {
            self.closed_order.push_back(id);
        }
        while self.closed_order.len() > retention {
            if let Some(evicted) = self.closed_order.pop_front() {
                self.closed.remove(&evicted);
            }
        }
    }
}

pub struct ProgressBroadcaster {
    topics: Mutex<Topics>,
    /// How many closed ids are remembered to reject late subscribers.
    retention: usize,
}

impl ProgressBroadcaster {
    pub fn new(closed_id_retention: usize) -> Self {
        Self {
            topics: Mutex::default(),
            retention: closed_id_retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Topics> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a new observer to `id`.
    pub fn subscribe(self: &Arc<Self>, id: VerificationId) -> Result<Subscription, SubscribeError> {
        let mut topics = self.lock();
        if topics.closed.contains(&id) {
            return Err(SubscribeError::Closed(id));
        }
        let subscriber = topics.next_subscriber;
        topics.next_subscriber += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        topics.open.entry(id).or_default().insert(subscriber, tx);
        debug!(verification_id = %id, subscriber, "progress subscriber attached");

        Ok(Subscription {
            verification_id: id,
            subscriber,
            rx,
            broadcaster: Arc::downgrade(self),
        })
    }

    /// Deliver `event` to every current subscriber of its verification.
    ///
    /// Returns the number of subscribers reached. Zero subscribers is not an
    /// error. Subscribers whose receiver is gone are dropped.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        let id = event.verification_id;
        let mut topics = self.lock();
        if topics.closed.contains(&id) {
            trace!(verification_id = %id, kind = event.kind_name(), "publish after close ignored");
            return 0;
        }

        let terminal = event.is_terminal();
        let delivered = match topics.open.get_mut(&id) {
            Some(subscribers) => {
                subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
                subscribers.len()
            }
            None => 0,
        };
        trace!(verification_id = %id, kind = event.kind_name(), seq = event.seq, delivered, "progress published");

        if terminal {
            topics.close(id, self.retention);
        }
        delivered
    }

    /// Close `id` without a `completed` event. Every open stream for it ends.
    ///
    /// Returns the number of subscribers cut off.
    pub fn abandon(&self, id: VerificationId) -> usize {
        let mut topics = self.lock();
        if topics.closed.contains(&id) {
            return 0;
        }
        let dropped = topics.open.get(&id).map_or(0, HashMap::len);
        topics.close(id, self.retention);
        dropped
    }

    pub fn is_closed(&self, id: VerificationId) -> bool {
        self.lock().closed.contains(&id)
    }

    pub fn subscriber_count(&self, id: VerificationId) -> usize {
        self.lock().open.get(&id).map_or(0, HashMap::len)
    }

    /// Number of ids with at least one live subscriber.
    pub fn open_topics(&self) -> usize {
        self.lock().open.len()
    }

    fn unsubscribe(&self, id: VerificationId, subscriber: u64) {
        let mut topics = self.lock();
        if let Some(subscribers) = topics.open.get_mut(&id) {
            subscribers.remove(&subscriber);
            if subscribers.is_empty() {
                topics.open.remove(&id);
            }
        }
    }
}

impl std::fmt::Debug for ProgressBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.lock();
        f.debug_struct("ProgressBroadcaster")
            .field("open", &topics.open.len())
            .field("closed", &topics.closed.len())
            .finish()
    }
}

/// A live event stream for one verification. Ends after `completed`.
///
/// Dropping the subscription detaches it from the broadcaster.
pub struct Subscription {
    verification_id: VerificationId,
    subscriber: u64,
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    broadcaster: Weak<ProgressBroadcaster>,
}

impl Subscription {
    pub fn verification_id(&self) -> VerificationId {
        self.verification_id
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.unsubscribe(self.verification_id, self.subscriber);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("verification_id", &self.verification_id)
            .field("subscriber", &self.subscriber)
            .finish()
    }
}

/// Publishing side for one verification; stamps events with a sequence
/// number. Dropping it before `completed` abandons the topic.
pub struct ProgressPublisher {
    broadcaster: Arc<ProgressBroadcaster>,
    verification_id: VerificationId,
    seq: AtomicU64,
    finished: AtomicBool,
}

impl ProgressPublisher {
    pub fn new(broadcaster: Arc<ProgressBroadcaster>, verification_id: VerificationId) -> Self {
        Self {
            broadcaster,
            verification_id,
            seq: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }
    }

    /// A publisher attached to a private broadcaster nobody listens to.
    pub fn detached(verification_id: VerificationId) -> Self {
        Self::new(Arc::new(ProgressBroadcaster::new(0)), verification_id)
    }

    pub fn verification_id(&self) -> VerificationId {
        self.verification_id
    }

    fn emit(&self, kind: ProgressEventKind) -> usize {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.broadcaster
            .publish(ProgressEvent::new(self.verification_id, seq, kind))
    }

    pub fn started(&self, fingerprint: &Fingerprint) -> usize {
        self.emit(ProgressEventKind::Started {
            fingerprint: fingerprint.clone(),
        })
    }

    pub fn layer_started(&self, layer: LayerId) -> usize {
        self.emit(ProgressEventKind::LayerStarted { layer })
    }

    /// `layer_completed` for a normal outcome, `degraded_layer` otherwise.
    pub fn layer_finished(&self, outcome: &LayerOutcome) -> usize {
        let kind = if outcome.is_completed() {
            ProgressEventKind::LayerCompleted {
                layer: outcome.layer,
                score: outcome.score,
                elapsed_ms: outcome.elapsed_ms,
            }
        } else {
            ProgressEventKind::DegradedLayer {
                layer: outcome.layer,
                outcome: outcome.kind,
                score: outcome.score,
            }
        };
        self.emit(kind)
    }

    pub fn completed(&self, report: Arc<VerificationReport>) -> usize {
        self.finished.store(true, Ordering::Relaxed);
        self.emit(ProgressEventKind::Completed { report })
    }
}

impl Drop for ProgressPublisher {
    fn drop(&mut self) {
        if self.finished.load(Ordering::Relaxed) {
            return;
        }
        let dropped = self.broadcaster.abandon(self.verification_id);
        if dropped > 0 {
            warn!(
                verification_id = %self.verification_id,
                subscribers = dropped,
                "progress topic abandoned before completion"
            );
        }
    }
}
