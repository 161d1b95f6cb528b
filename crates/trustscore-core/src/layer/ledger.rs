//! Ledger layer: is the content hash anchored in the registry?

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{Layer, LayerFindings, LayerInput, LayerResult};
use crate::domain::LayerId;
use crate::services::LedgerService;

/// Score for an anchored, unrevoked document.
pub const RECORDED_SCORE: f64 = 10.0;
/// Raw score for a revoked document; clamps to zero.
pub const REVOKED_SCORE: f64 = -10.0;

pub struct LedgerLayer {
    service: Arc<dyn LedgerService>,
}

impl LedgerLayer {
    pub fn new(service: Arc<dyn LedgerService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Layer for LedgerLayer {
    fn id(&self) -> LayerId {
        LayerId::Ledger
    }

    async fn analyze(&self, input: &LayerInput) -> LayerResult<LayerFindings> {
        let record = self.service.lookup(&input.fingerprint).await?;

        let findings = if !record.recorded {
            LayerFindings::new(0.0).with_flag("not_recorded")
        } else if record.revoked {
            LayerFindings::new(REVOKED_SCORE).with_flag("revoked")
        } else {
            LayerFindings::new(RECORDED_SCORE)
        };

        Ok(findings.with_details(json!({
            "recorded": record.recorded,
            "revoked": record.revoked,
            "transaction_ref": record.transaction_ref,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Fingerprint, RequesterContext};
    use crate::layer::LayerError;
    use crate::services::memory::MemoryLedger;
    use crate::services::LedgerRecord;

    fn input(bytes: &[u8]) -> LayerInput {
        LayerInput::new(
            Fingerprint::of_bytes(bytes),
            Arc::from(bytes.to_vec()),
            RequesterContext::default(),
        )
    }

    #[tokio::test]
    async fn test_recorded_not_recorded_and_revoked() {
        let ledger = MemoryLedger::new();
        ledger.record(Fingerprint::of_bytes(b"good"), "0xabc");
        ledger.insert(
            Fingerprint::of_bytes(b"bad"),
            LedgerRecord {
                recorded: true,
                revoked: true,
                transaction_ref: None,
            },
        );
        let layer = LedgerLayer::new(Arc::new(ledger));

        let good = layer.analyze(&input(b"good")).await.unwrap();
        assert_eq!(good.score, RECORDED_SCORE);
        assert_eq!(good.details["transaction_ref"], "0xabc");

        let unknown = layer.analyze(&input(b"unknown")).await.unwrap();
        assert_eq!(unknown.score, 0.0);
        assert_eq!(unknown.flags, vec!["not_recorded"]);

        let bad = layer.analyze(&input(b"bad")).await.unwrap();
        assert_eq!(bad.score, REVOKED_SCORE);
        assert_eq!(bad.flags, vec!["revoked"]);
    }

    #[tokio::test]
    async fn test_unavailable_ledger_propagates() {
        let layer = LedgerLayer::new(Arc::new(MemoryLedger::unavailable()));
        assert!(matches!(
            layer.analyze(&input(b"x")).await,
            Err(LayerError::Unavailable { .. })
        ));
    }
}
