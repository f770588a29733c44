//! Hash chaining and verification.
//!
//! `hash = blake3(prev_hash ‖ canonical(entry without hash))`. The canonical
//! form is the JSON serialization of [`CanonicalEntry`], whose field order is
//! fixed by its declaration. `serde_json::Value` objects serialize with sorted
//! keys, so payload digests are stable too.

use crate::model::{AuditAppend, AuditEntry, ChainVerification};
use crate::{LedgerError, LedgerResult};
use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;

/// `prev_hash` of the first entry in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Serialize)]
struct CanonicalEntry<'a> {
    seq: u64,
    entity_type: &'a str,
    entity_id: &'a str,
    action_type: &'a str,
    from_step: Option<&'a str>,
    to_step: Option<&'a str>,
    actor_id: &'a str,
    outcome: Option<&'a str>,
    note: Option<&'a str>,
    payload_digest: &'a str,
    corrects_seq: Option<u64>,
    timestamp: &'a DateTime<Utc>,
    prev_hash: &'a str,
}

impl<'a> From<&'a AuditEntry> for CanonicalEntry<'a> {
    fn from(entry: &'a AuditEntry) -> Self {
        Self {
            seq: entry.seq,
            entity_type: &entry.entity_type,
            entity_id: &entry.entity_id,
            action_type: entry.action_type.as_str(),
            from_step: entry.from_step.as_deref(),
            to_step: entry.to_step.as_deref(),
            actor_id: &entry.actor_id,
            outcome: entry.outcome.as_deref(),
            note: entry.note.as_deref(),
            payload_digest: &entry.payload_digest,
            corrects_seq: entry.corrects_seq,
            timestamp: &entry.timestamp,
            prev_hash: &entry.prev_hash,
        }
    }
}

/// Recompute the hash an entry should carry, from its own `prev_hash`.
pub fn compute_entry_hash(entry: &AuditEntry) -> LedgerResult<String> {
    let canonical = serde_json::to_vec(&CanonicalEntry::from(entry))
        .map_err(|e| LedgerError::Serialization(e.to_string()))?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(entry.prev_hash.as_bytes());
    hasher.update(&canonical);
    Ok(hasher.finalize().to_hex().to_string())
}

/// Digest of the old/new values a change carried. Raw values are never stored.
pub fn payload_digest(append: &AuditAppend) -> LedgerResult<String> {
    let payload = serde_json::json!({
        "old": append.old_value,
        "new": append.new_value,
    });
    let bytes =
        serde_json::to_vec(&payload).map_err(|e| LedgerError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Entry timestamps keep microsecond precision so they survive storage
/// backends (PostgreSQL `TIMESTAMPTZ`) without changing the hash input.
pub fn ledger_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Build the next entry of a chain from an append request.
///
/// `seq` and `prev_hash` describe the chain head as seen under the caller's
/// per-entity serialization.
pub fn seal(
    append: &AuditAppend,
    seq: u64,
    prev_hash: &str,
    timestamp: DateTime<Utc>,
) -> LedgerResult<AuditEntry> {
    if let Some(corrects) = append.corrects_seq {
        if corrects == 0 || corrects >= seq {
            return Err(LedgerError::InvalidCorrection {
                seq: corrects,
                head: seq - 1,
            });
        }
    }

    let mut entry = AuditEntry {
        seq,
        entity_type: append.entity.entity_type.clone(),
        entity_id: append.entity.entity_id.clone(),
        action_type: append.action,
        from_step: append.from_step.clone(),
        to_step: append.to_step.clone(),
        actor_id: append.actor_id.clone(),
        outcome: append.outcome.clone(),
        note: append.note.clone(),
        payload_digest: payload_digest(append)?,
        corrects_seq: append.corrects_seq,
        timestamp,
        prev_hash: prev_hash.to_string(),
        hash: String::new(),
    };
    entry.hash = compute_entry_hash(&entry)?;
    Ok(entry)
}

/// Recompute a chain from genesis and report the first entry that does not
/// verify: wrong position, broken link to its predecessor, or a stored hash
/// that differs from the recomputed one.
pub fn verify_entries(entries: &[AuditEntry]) -> LedgerResult<ChainVerification> {
    let mut prev_hash: &str = GENESIS_HASH;

    for (index, entry) in entries.iter().enumerate() {
        let expected_seq = index as u64 + 1;
        let intact = entry.seq == expected_seq
            && entry.prev_hash == prev_hash
            && compute_entry_hash(entry)? == entry.hash;

        if !intact {
            return Ok(ChainVerification {
                entries: entries.len(),
                first_bad_seq: Some(expected_seq),
            });
        }
        prev_hash = entry.hash.as_str();
    }

    Ok(ChainVerification {
        entries: entries.len(),
        first_bad_seq: None,
    })
}
