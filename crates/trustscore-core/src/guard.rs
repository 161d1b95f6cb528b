//! Idempotency guard and result cache.
//!
//! One map keyed by [`FingerprintKey`] holds either an in-flight marker or a
//! finished report. [`IdempotencyGuard::claim`] is the atomic check-and-set:
//! under a single lock it returns the cached report, attaches to the
//! in-flight run, or registers a new run. This guarantees at most one
//! concurrent pipeline per key.
//!
//! Waiters observe completion through a `watch` channel owned by the
//! in-flight entry. A [`ClaimTicket`] dropped without completing clears the
//! marker, which closes the channel and releases every waiter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{FingerprintKey, VerificationId, VerificationReport, VerifyError};

type ReportSlot = Option<Arc<VerificationReport>>;

enum Entry {
    InFlight {
        id: VerificationId,
        tx: watch::Sender<ReportSlot>,
    },
    Ready {
        report: Arc<VerificationReport>,
        stored_at: Instant,
    },
}

#[derive(Default)]
struct GuardState {
    entries: HashMap<FingerprintKey, Entry>,
    ids: HashMap<VerificationId, FingerprintKey>,
}

/// Result of [`IdempotencyGuard::claim`].
pub enum Claim {
    /// A fresh report exists for the key.
    Cached(Arc<VerificationReport>),
    /// A run for the key is in flight; wait on it.
    Attached {
        id: VerificationId,
        waiter: ReportWaiter,
    },
    /// The caller owns a new run and must complete the ticket.
    Started {
        id: VerificationId,
        waiter: ReportWaiter,
        ticket: ClaimTicket,
    },
}

/// Where a verification id currently stands in the guard.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardStatus {
    InProgress,
    Completed(Arc<VerificationReport>),
}

pub struct IdempotencyGuard {
    state: Mutex<GuardState>,
    ttl: Duration,
}

impl IdempotencyGuard {
    /// `ttl` is the freshness window for cached reports.
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::default(),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fresh(&self, stored_at: Instant) -> bool {
        stored_at.elapsed() <= self.ttl
    }

    /// Fresh cached report for `key`, if any.
    pub fn lookup(&self, key: &FingerprintKey) -> Option<Arc<VerificationReport>> {
        match self.lock().entries.get(key) {
            Some(Entry::Ready { report, stored_at }) if self.is_fresh(*stored_at) => {
                Some(Arc::clone(report))
            }
            _ => None,
        }
    }

    /// Atomically resolve `key` to a cached report, an in-flight run, or a
    /// newly registered run.
    pub fn claim(self: &Arc<Self>, key: &FingerprintKey) -> Claim {
        let mut guard = self.lock();
        let state = &mut *guard;

        match state.entries.get(key) {
            Some(Entry::Ready { report, stored_at }) if self.is_fresh(*stored_at) => {
                return Claim::Cached(Arc::clone(report));
            }
            Some(Entry::InFlight { id, tx }) => {
                return Claim::Attached {
                    id: *id,
                    waiter: ReportWaiter {
                        id: *id,
                        rx: tx.subscribe(),
                    },
                };
            }
            Some(Entry::Ready { report, .. }) => {
                debug!(key = %key, verification_id = %report.verification_id, "cached report expired");
                state.ids.remove(&report.verification_id);
            }
            None => {}
        }

        let id = VerificationId::new();
        let (tx, rx) = watch::channel(None);
        state.entries.insert(key.clone(), Entry::InFlight { id, tx });
        state.ids.insert(id, key.clone());

        Claim::Started {
            id,
            waiter: ReportWaiter { id, rx },
            ticket: ClaimTicket {
                guard: Arc::clone(self),
                key: key.clone(),
                id,
                done: false,
            },
        }
    }

    /// Insert a finished report for `key` unless a run is in flight. `age`
    /// is how long ago the report was produced and counts against the
    /// freshness window.
    ///
    /// Used to warm the cache from durable storage.
    pub fn seed(&self, key: &FingerprintKey, report: Arc<VerificationReport>, age: Duration) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if matches!(state.entries.get(key), Some(Entry::InFlight { .. })) {
            return;
        }
        if let Some(Entry::Ready { report: old, .. }) = state.entries.get(key) {
            state.ids.remove(&old.verification_id);
        }
        state.ids.insert(report.verification_id, key.clone());
        state.entries.insert(
            key.clone(),
            Entry::Ready {
                report,
                stored_at: Instant::now().checked_sub(age).unwrap_or_else(Instant::now),
            },
        );
    }

    /// Status of a verification id known to the guard.
    pub fn status(&self, id: VerificationId) -> Option<GuardStatus> {
        let state = self.lock();
        let key = state.ids.get(&id)?;
        match state.entries.get(key)? {
            Entry::InFlight { id: current, .. } if *current == id => Some(GuardStatus::InProgress),
            Entry::Ready { report, .. } if report.verification_id == id => {
                Some(GuardStatus::Completed(Arc::clone(report)))
            }
            _ => None,
        }
    }

    /// Drop cached reports older than the freshness window. Returns how many
    /// were removed. In-flight entries are never purged.
    pub fn purge_expired(&self) -> usize {
        let mut state = self.lock();
        let expired: Vec<(FingerprintKey, VerificationId)> = state
            .entries
            .iter()
            .filter_map(|(key, entry)| match entry {
                Entry::Ready { report, stored_at } if !self.is_fresh(*stored_at) => {
                    Some((key.clone(), report.verification_id))
                }
                _ => None,
            })
            .collect();

        for (key, id) in &expired {
            state.entries.remove(key);
            state.ids.remove(id);
        }
        expired.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| matches!(e, Entry::InFlight { .. }))
            .count()
    }

    pub fn cached(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| matches!(e, Entry::Ready { .. }))
            .count()
    }

    fn finish(&self, key: &FingerprintKey, id: VerificationId, report: Arc<VerificationReport>) {
        let mut state = self.lock();
        let owned = matches!(
            state.entries.get(key),
            Some(Entry::InFlight { id: current, .. }) if *current == id
        );
        if !owned {
            warn!(key = %key, verification_id = %id, "completed run no longer owns its key");
            return;
        }
        if let Some(Entry::InFlight { tx, .. }) = state.entries.insert(
            key.clone(),
            Entry::Ready {
                report: Arc::clone(&report),
                stored_at: Instant::now(),
            },
        ) {
            tx.send_replace(Some(report));
        }
    }

    fn abandon(&self, key: &FingerprintKey, id: VerificationId) {
        let mut state = self.lock();
        if matches!(
            state.entries.get(key),
            Some(Entry::InFlight { id: current, .. }) if *current == id
        ) {
            state.entries.remove(key);
            state.ids.remove(&id);
            warn!(key = %key, verification_id = %id, "in-flight run abandoned");
        }
    }
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("in_flight", &self.in_flight())
            .field("cached", &self.cached())
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Ownership of one in-flight run. Complete it with the final report;
/// dropping it uncompleted clears the in-flight marker.
pub struct ClaimTicket {
    guard: Arc<IdempotencyGuard>,
    key: FingerprintKey,
    id: VerificationId,
    done: bool,
}

impl ClaimTicket {
    pub fn verification_id(&self) -> VerificationId {
        self.id
    }

    pub fn key(&self) -> &FingerprintKey {
        &self.key
    }

    /// Cache the report, wake every waiter and clear the in-flight marker.
    pub fn complete(mut self, report: Arc<VerificationReport>) {
        self.guard.finish(&self.key, self.id, report);
        self.done = true;
    }
}

impl Drop for ClaimTicket {
    fn drop(&mut self) {
        if !self.done {
            self.guard.abandon(&self.key, self.id);
        }
    }
}

/// Resolves to the report of one in-flight run.
pub struct ReportWaiter {
    id: VerificationId,
    rx: watch::Receiver<ReportSlot>,
}

impl ReportWaiter {
    pub fn verification_id(&self) -> VerificationId {
        self.id
    }

    /// Wait for the run to finish. Fails only if the run was abandoned.
    pub async fn wait(mut self) -> Result<Arc<VerificationReport>, VerifyError> {
        let id = self.id;
        let slot = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| VerifyError::Abandoned(id))?;
        slot.clone().ok_or(VerifyError::Abandoned(id))
    }
}
