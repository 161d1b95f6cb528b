//! In-process report store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{key_of, ReportStore, StoreResult};
use crate::domain::{FingerprintKey, VerificationId, VerificationReport};

#[derive(Default)]
struct Inner {
    by_id: HashMap<VerificationId, VerificationReport>,
    latest: HashMap<FingerprintKey, VerificationId>,
}

/// Reports held in memory for the lifetime of the process.
#[derive(Default)]
pub struct MemoryReportStore {
    inner: Mutex<Inner>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn put(&self, report: &VerificationReport) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.latest.insert(key_of(report), report.verification_id);
        inner.by_id.insert(report.verification_id, report.clone());
        Ok(())
    }

    async fn get(&self, id: &VerificationId) -> StoreResult<Option<VerificationReport>> {
        Ok(self.lock().by_id.get(id).cloned())
    }

    async fn latest_for(&self, key: &FingerprintKey) -> StoreResult<Option<VerificationReport>> {
        let inner = self.lock();
        Ok(inner
            .latest
            .get(key)
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Fingerprint, Verdict};

    fn report(doc: &[u8], scope: Option<&str>) -> VerificationReport {
        VerificationReport {
            verification_id: VerificationId::new(),
            fingerprint: Fingerprint::of_bytes(doc),
            scope: scope.map(str::to_string),
            total_score: 55.0,
            verdict: Verdict::Suspicious,
            layers: vec![],
            elapsed_ms: 3,
            requested_at: chrono::Utc::now(),
            completed_at: chrono::Utc::now(),
            degraded: true,
        }
    }

    #[tokio::test]
    async fn test_put_get_and_latest() {
        let store = MemoryReportStore::new();
        let first = report(b"doc", None);
        let second = report(b"doc", None);
        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&first.verification_id).await.unwrap(), Some(first));
        let latest = store.latest_for(&key_of(&second)).await.unwrap().unwrap();
        assert_eq!(latest.verification_id, second.verification_id);
    }

    #[tokio::test]
    async fn test_latest_respects_scope() {
        let store = MemoryReportStore::new();
        let scoped = report(b"doc", Some("acct-1"));
        store.put(&scoped).await.unwrap();

        let unscoped_key = FingerprintKey {
            fingerprint: scoped.fingerprint.clone(),
            scope: None,
        };
        assert!(store.latest_for(&unscoped_key).await.unwrap().is_none());
        assert!(store.latest_for(&key_of(&scoped)).await.unwrap().is_some());
        assert!(store.get(&VerificationId::new()).await.unwrap().is_none());
    }
}
