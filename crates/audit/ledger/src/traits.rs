use crate::model::{AuditAppend, AuditEntry, ChainVerification, EntityKey};
use crate::LedgerResult;
use async_trait::async_trait;

/// Append-only, hash-chained audit storage keyed per entity.
///
/// Implementations serialize appends per [`EntityKey`]; appends for
/// different entities must not block each other.
#[async_trait]
pub trait AuditLedger: Send + Sync {
    /// Seal and store the next entry of the entity's chain.
    async fn append(&self, append: AuditAppend) -> LedgerResult<AuditEntry>;

    /// Entries of one chain in sequence order.
    async fn history(&self, entity: &EntityKey) -> LedgerResult<Vec<AuditEntry>>;

    /// The latest entry of one chain, if any.
    async fn head(&self, entity: &EntityKey) -> LedgerResult<Option<AuditEntry>>;

    /// Recompute the chain from genesis.
    async fn verify_chain(&self, entity: &EntityKey) -> LedgerResult<ChainVerification> {
        let entries = self.history(entity).await?;
        crate::chain::verify_entries(&entries)
    }
}
