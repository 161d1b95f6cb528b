use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use super::{key_of, ReportStore, StoreError, StoreResult};
use crate::domain::{FingerprintKey, VerificationId, VerificationReport};

/// Filesystem-backed report store.
///
/// Layout:
/// - `<root>/reports/<verification id>.json`
/// - `<root>/latest/<first 2 hex chars>/<remaining hex chars>[.<hex scope>].json`
///
/// Every file is written to a temp file in its target directory and renamed
/// into place, so readers never observe a partial document.
#[derive(Debug, Clone)]
pub struct FsReportStore {
    reports_dir: PathBuf,
    latest_dir: PathBuf,
}

impl FsReportStore {
    /// Create a store rooted at `root`, creating its directories if needed.
    pub fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let reports_dir = root.as_ref().join("reports");
        let latest_dir = root.as_ref().join("latest");
        fs::create_dir_all(&reports_dir)?;
        fs::create_dir_all(&latest_dir)?;
        Ok(Self {
            reports_dir,
            latest_dir,
        })
    }

    fn report_path(&self, id: &VerificationId) -> PathBuf {
        self.reports_dir.join(format!("{id}.json"))
    }

    fn latest_path(&self, key: &FingerprintKey) -> PathBuf {
        let hex = key.fingerprint.as_str();
        let name = match &key.scope {
            Some(scope) => format!("{}.{}.json", &hex[2..], hex::encode(scope)),
            None => format!("{}.json", &hex[2..]),
        };
        self.latest_dir.join(&hex[..2]).join(name)
    }

    async fn blocking<T, F>(f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> StoreResult<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn read_report(path: &Path) -> StoreResult<Option<VerificationReport>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ReportStore for FsReportStore {
    async fn put(&self, report: &VerificationReport) -> StoreResult<()> {
        let data = serde_json::to_vec_pretty(report)?;
        let report_path = self.report_path(&report.verification_id);
        let latest_path = self.latest_path(&key_of(report));

        Self::blocking(move || {
            write_atomic(&report_path, &data)?;
            write_atomic(&latest_path, &data)
        })
        .await
    }

    async fn get(&self, id: &VerificationId) -> StoreResult<Option<VerificationReport>> {
        let path = self.report_path(id);
        Self::blocking(move || read_report(&path)).await
    }

    async fn latest_for(&self, key: &FingerprintKey) -> StoreResult<Option<VerificationReport>> {
        let path = self.latest_path(key);
        Self::blocking(move || read_report(&path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Fingerprint, LayerId, LayerOutcome, Verdict};
    use std::time::Duration;

    fn make_store() -> (tempfile::TempDir, FsReportStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsReportStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn report(doc: &[u8], scope: Option<&str>) -> VerificationReport {
        VerificationReport {
            verification_id: VerificationId::new(),
            fingerprint: Fingerprint::of_bytes(doc),
            scope: scope.map(str::to_string),
            total_score: 18.0,
            verdict: Verdict::Fraud,
            layers: vec![LayerOutcome::completed(
                LayerId::Exif,
                18.0,
                vec!["exif_missing".into()],
                serde_json::Value::Null,
                Duration::from_millis(5),
            )],
            elapsed_ms: 5,
            requested_at: chrono::Utc::now(),
            completed_at: chrono::Utc::now(),
            degraded: false,
        }
    }

    #[tokio::test]
    async fn report_persists_across_store_instances() {
        let (dir, store) = make_store();
        let r = report(b"doc", None);
        store.put(&r).await.unwrap();

        let reopened = FsReportStore::new(dir.path()).unwrap();
        assert_eq!(reopened.get(&r.verification_id).await.unwrap(), Some(r.clone()));
        assert_eq!(reopened.latest_for(&key_of(&r)).await.unwrap(), Some(r));
    }

    #[tokio::test]
    async fn latest_is_sharded_by_fingerprint() {
        let (dir, store) = make_store();
        let r = report(b"doc", None);
        store.put(&r).await.unwrap();

        let hex = r.fingerprint.as_str();
        let shard = dir.path().join("latest").join(&hex[..2]);
        let entries: Vec<_> = fs::read_dir(shard).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn latest_is_replaced_by_newer_report() {
        let (_dir, store) = make_store();
        let first = report(b"doc", None);
        let second = report(b"doc", None);
        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        let latest = store.latest_for(&key_of(&first)).await.unwrap().unwrap();
        assert_eq!(latest.verification_id, second.verification_id);
        assert!(store.get(&first.verification_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn scoped_reports_are_filed_separately() {
        let (_dir, store) = make_store();
        let scoped = report(b"doc", Some("acct/../x"));
        store.put(&scoped).await.unwrap();

        let unscoped = FingerprintKey {
            fingerprint: scoped.fingerprint.clone(),
            scope: None,
        };
        assert!(store.latest_for(&unscoped).await.unwrap().is_none());
        assert!(store.latest_for(&key_of(&scoped)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_report_is_none() {
        let (_dir, store) = make_store();
        assert!(store.get(&VerificationId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_document_is_serialization_error() {
        let (dir, store) = make_store();
        let id = VerificationId::new();
        fs::write(dir.path().join("reports").join(format!("{id}.json")), b"{not json").unwrap();
        assert!(matches!(
            store.get(&id).await,
            Err(StoreError::Serialization(_))
        ));
    }
}
