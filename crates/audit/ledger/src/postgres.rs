//! PostgreSQL audit ledger.
//!
//! Appends run in a transaction that first takes a transaction-scoped
//! advisory lock derived from the entity key. Appends for one entity are
//! therefore serialized across processes, while other entities are
//! unaffected. The `(entity_type, entity_id, seq)` primary key backs this up.

use crate::chain::{ledger_now, seal, GENESIS_HASH};
use crate::model::{ActionType, AuditAppend, AuditEntry, EntityKey};
use crate::traits::AuditLedger;
use crate::{LedgerError, LedgerResult};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Acquire, Row};

const SELECT_COLUMNS: &str = "seq, entity_type, entity_id, action_type, from_step, to_step, \
     actor_id, outcome, note, payload_digest, corrects_seq, ts, prev_hash, hash";

/// PostgreSQL-backed ledger.
#[derive(Clone)]
pub struct PostgresAuditLedger {
    pool: PgPool,
}

impl PostgresAuditLedger {
    /// Connect to PostgreSQL and initialize the ledger table.
    pub async fn connect(database_url: &str) -> LedgerResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| LedgerError::Backend(format!("failed to connect postgres: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Create the ledger from an existing pool.
    pub async fn from_pool(pool: PgPool) -> LedgerResult<Self> {
        let ledger = Self { pool };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> LedgerResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS audit_entries (
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                seq BIGINT NOT NULL,
                action_type TEXT NOT NULL,
                from_step TEXT,
                to_step TEXT,
                actor_id TEXT NOT NULL,
                outcome TEXT,
                note TEXT,
                payload_digest TEXT NOT NULL,
                corrects_seq BIGINT,
                ts TIMESTAMPTZ NOT NULL,
                prev_hash TEXT NOT NULL,
                hash TEXT NOT NULL,
                PRIMARY KEY (entity_type, entity_id, seq)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS audit_entries_actor_idx
                ON audit_entries (actor_id, ts)
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| LedgerError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuditLedger for PostgresAuditLedger {
    async fn append(&self, append: AuditAppend) -> LedgerResult<AuditEntry> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError::Backend(e.to_string()))?;
        let conn = tx
            .acquire()
            .await
            .map_err(|e| LedgerError::Backend(e.to_string()))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(append.entity.to_string())
            .execute(&mut *conn)
            .await
            .map_err(|e| LedgerError::Backend(e.to_string()))?;

        let last = sqlx::query(
            r#"
            SELECT seq, hash FROM audit_entries
             WHERE entity_type = $1 AND entity_id = $2
             ORDER BY seq DESC
             LIMIT 1
            "#,
        )
        .bind(&append.entity.entity_type)
        .bind(&append.entity.entity_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| LedgerError::Backend(e.to_string()))?;

        let (seq, prev_hash) = match last {
            Some(row) => {
                let seq: i64 = row
                    .try_get("seq")
                    .map_err(|e| LedgerError::Backend(e.to_string()))?;
                let hash: String = row
                    .try_get("hash")
                    .map_err(|e| LedgerError::Backend(e.to_string()))?;
                (seq as u64 + 1, hash)
            }
            None => (1, GENESIS_HASH.to_string()),
        };

        let entry = seal(&append, seq, &prev_hash, ledger_now())?;

        sqlx::query(
            r#"
            INSERT INTO audit_entries
                (entity_type, entity_id, seq, action_type, from_step, to_step, actor_id,
                 outcome, note, payload_digest, corrects_seq, ts, prev_hash, hash)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(to_i64(entry.seq)?)
        .bind(entry.action_type.as_str())
        .bind(&entry.from_step)
        .bind(&entry.to_step)
        .bind(&entry.actor_id)
        .bind(&entry.outcome)
        .bind(&entry.note)
        .bind(&entry.payload_digest)
        .bind(entry.corrects_seq.map(to_i64).transpose()?)
        .bind(entry.timestamp)
        .bind(&entry.prev_hash)
        .bind(&entry.hash)
        .execute(&mut *conn)
        .await
        .map_err(|e| LedgerError::Backend(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| LedgerError::Backend(e.to_string()))?;

        tracing::debug!(entity = %append.entity, seq = entry.seq, "Audit entry appended");
        Ok(entry)
    }

    async fn history(&self, entity: &EntityKey) -> LedgerResult<Vec<AuditEntry>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM audit_entries \
             WHERE entity_type = $1 AND entity_id = $2 ORDER BY seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(&entity.entity_type)
            .bind(&entity.entity_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LedgerError::Backend(e.to_string()))?;

        rows.into_iter().map(row_to_entry).collect()
    }

    async fn head(&self, entity: &EntityKey) -> LedgerResult<Option<AuditEntry>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM audit_entries \
             WHERE entity_type = $1 AND entity_id = $2 ORDER BY seq DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(&entity.entity_type)
            .bind(&entity.entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::Backend(e.to_string()))?;

        row.map(row_to_entry).transpose()
    }
}

fn row_to_entry(row: PgRow) -> LedgerResult<AuditEntry> {
    let get_err = |e: sqlx::Error| LedgerError::Backend(e.to_string());

    let seq: i64 = row.try_get("seq").map_err(get_err)?;
    let action_type: String = row.try_get("action_type").map_err(get_err)?;
    let corrects_seq: Option<i64> = row.try_get("corrects_seq").map_err(get_err)?;

    Ok(AuditEntry {
        seq: seq as u64,
        entity_type: row.try_get("entity_type").map_err(get_err)?,
        entity_id: row.try_get("entity_id").map_err(get_err)?,
        action_type: action_type.parse::<ActionType>()?,
        from_step: row.try_get("from_step").map_err(get_err)?,
        to_step: row.try_get("to_step").map_err(get_err)?,
        actor_id: row.try_get("actor_id").map_err(get_err)?,
        outcome: row.try_get("outcome").map_err(get_err)?,
        note: row.try_get("note").map_err(get_err)?,
        payload_digest: row.try_get("payload_digest").map_err(get_err)?,
        corrects_seq: corrects_seq.map(|s| s as u64),
        timestamp: row.try_get("ts").map_err(get_err)?,
        prev_hash: row.try_get("prev_hash").map_err(get_err)?,
        hash: row.try_get("hash").map_err(get_err)?,
    })
}

fn to_i64(value: u64) -> LedgerResult<i64> {
    i64::try_from(value).map_err(|_| LedgerError::Backend("sequence value too large".to_string()))
}
