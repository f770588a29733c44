//! In-memory audit ledger.
//!
//! Each chain sits behind its own mutex, so appends for one entity are
//! serialized while appends for different entities proceed in parallel.

use crate::chain::{ledger_now, seal, GENESIS_HASH};
use crate::model::{AuditAppend, AuditEntry, EntityKey};
use crate::traits::AuditLedger;
use crate::{LedgerError, LedgerResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};

type Chain = Arc<Mutex<Vec<AuditEntry>>>;

/// In-memory hash-chained ledger for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryAuditLedger {
    chains: DashMap<EntityKey, Chain>,
}

impl InMemoryAuditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct chains held
    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    fn chain(&self, entity: &EntityKey) -> Option<Chain> {
        self.chains.get(entity).map(|c| Arc::clone(c.value()))
    }

    /// Direct mutable access to a stored chain. Only tamper-detection tests
    /// need this; the ledger API itself never rewrites entries.
    #[doc(hidden)]
    pub fn tamper<F>(&self, entity: &EntityKey, f: F) -> LedgerResult<()>
    where
        F: FnOnce(&mut Vec<AuditEntry>),
    {
        let chain = self
            .chain(entity)
            .ok_or_else(|| LedgerError::Backend(format!("no chain for {}", entity)))?;
        let mut entries = chain
            .lock()
            .map_err(|_| LedgerError::Backend("audit chain lock poisoned".to_string()))?;
        f(&mut entries);
        Ok(())
    }
}

#[async_trait]
impl AuditLedger for InMemoryAuditLedger {
    async fn append(&self, append: AuditAppend) -> LedgerResult<AuditEntry> {
        // Clone the Arc out so the map shard is not held while the chain is locked.
        let chain = Arc::clone(self.chains.entry(append.entity.clone()).or_default().value());
        let mut entries = chain
            .lock()
            .map_err(|_| LedgerError::Backend("audit chain lock poisoned".to_string()))?;

        let seq = entries.len() as u64 + 1;
        let prev_hash = entries
            .last()
            .map(|e| e.hash.as_str())
            .unwrap_or(GENESIS_HASH);
        let entry = seal(&append, seq, prev_hash, ledger_now())?;

        tracing::debug!(
            entity = %append.entity,
            seq = entry.seq,
            action = %entry.action_type,
            "Audit entry appended"
        );

        entries.push(entry.clone());
        Ok(entry)
    }

    async fn history(&self, entity: &EntityKey) -> LedgerResult<Vec<AuditEntry>> {
        let Some(chain) = self.chain(entity) else {
            return Ok(Vec::new());
        };
        let entries = chain
            .lock()
            .map_err(|_| LedgerError::Backend("audit chain lock poisoned".to_string()))?;
        Ok(entries.clone())
    }

    async fn head(&self, entity: &EntityKey) -> LedgerResult<Option<AuditEntry>> {
        let Some(chain) = self.chain(entity) else {
            return Ok(None);
        };
        let entries = chain
            .lock()
            .map_err(|_| LedgerError::Backend("audit chain lock poisoned".to_string()))?;
        Ok(entries.last().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActionType;

    fn key() -> EntityKey {
        EntityKey::new("budget", "BUD-1")
    }

    #[tokio::test]
    async fn append_assigns_sequence_and_links() {
        let ledger = InMemoryAuditLedger::new();
        let first = ledger
            .append(AuditAppend::new(key(), ActionType::Create, "alice").steps(None, Some("draft")))
            .await
            .unwrap();
        let second = ledger
            .append(
                AuditAppend::new(key(), ActionType::Transition, "alice")
                    .steps(Some("draft"), Some("review"))
                    .with_outcome("submit"),
            )
            .await
            .unwrap();

        assert_eq!(first.seq, 1);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.seq, 2);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(ledger.head(&key()).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn chains_are_independent_per_entity() {
        let ledger = InMemoryAuditLedger::new();
        let other = EntityKey::new("budget", "BUD-2");
        ledger
            .append(AuditAppend::new(key(), ActionType::Create, "alice"))
            .await
            .unwrap();
        let entry = ledger
            .append(AuditAppend::new(other.clone(), ActionType::Create, "bob"))
            .await
            .unwrap();

        assert_eq!(entry.seq, 1);
        assert_eq!(entry.prev_hash, GENESIS_HASH);
        assert_eq!(ledger.chain_count(), 2);
    }

    #[tokio::test]
    async fn unknown_entity_has_empty_history() {
        let ledger = InMemoryAuditLedger::new();
        assert!(ledger.history(&key()).await.unwrap().is_empty());
        assert!(ledger.head(&key()).await.unwrap().is_none());
        assert!(ledger.verify_chain(&key()).await.unwrap().is_intact());
    }

    #[tokio::test]
    async fn tampering_is_detected() {
        let ledger = InMemoryAuditLedger::new();
        for actor in ["a", "b", "c"] {
            ledger
                .append(AuditAppend::new(key(), ActionType::Transition, actor))
                .await
                .unwrap();
        }
        ledger
            .tamper(&key(), |entries| entries[1].actor_id = "eve".into())
            .unwrap();

        let verification = ledger.verify_chain(&key()).await.unwrap();
        assert_eq!(verification.first_bad_seq, Some(2));
    }

    #[tokio::test]
    async fn correction_of_future_entry_is_rejected() {
        let ledger = InMemoryAuditLedger::new();
        ledger
            .append(AuditAppend::new(key(), ActionType::Create, "alice"))
            .await
            .unwrap();

        let err = ledger
            .append(AuditAppend::new(key(), ActionType::Correction, "alice").correcting(5))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::InvalidCorrection { seq: 5, head: 1 });

        let fixed = ledger
            .append(AuditAppend::new(key(), ActionType::Correction, "alice").correcting(1))
            .await
            .unwrap();
        assert_eq!(fixed.corrects_seq, Some(1));
        assert_eq!(ledger.history(&key()).await.unwrap().len(), 2);
    }
}
