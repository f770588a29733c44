use crate::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Key of one audit chain: the tracked business entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// What kind of state change an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    Create,
    Transition,
    Approve,
    Reject,
    Cancel,
    ServiceFailure,
    Resume,
    Correction,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Transition => "Transition",
            Self::Approve => "Approve",
            Self::Reject => "Reject",
            Self::Cancel => "Cancel",
            Self::ServiceFailure => "ServiceFailure",
            Self::Resume => "Resume",
            Self::Correction => "Correction",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Create" => Ok(Self::Create),
            "Transition" => Ok(Self::Transition),
            "Approve" => Ok(Self::Approve),
            "Reject" => Ok(Self::Reject),
            "Cancel" => Ok(Self::Cancel),
            "ServiceFailure" => Ok(Self::ServiceFailure),
            "Resume" => Ok(Self::Resume),
            "Correction" => Ok(Self::Correction),
            other => Err(LedgerError::Serialization(format!(
                "unknown action type '{}'",
                other
            ))),
        }
    }
}

/// Audit append payload. Sequence, timestamp, digests and hashes are
/// assigned by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditAppend {
    pub entity: EntityKey,
    pub action: ActionType,
    pub from_step: Option<String>,
    pub to_step: Option<String>,
    pub actor_id: String,
    pub outcome: Option<String>,
    pub note: Option<String>,
    /// State before the change; only its digest is stored
    #[serde(default)]
    pub old_value: Value,
    /// State after the change; only its digest is stored
    #[serde(default)]
    pub new_value: Value,
    /// Sequence number of the entry this one corrects
    pub corrects_seq: Option<u64>,
}

impl AuditAppend {
    pub fn new(entity: EntityKey, action: ActionType, actor_id: impl Into<String>) -> Self {
        Self {
            entity,
            action,
            from_step: None,
            to_step: None,
            actor_id: actor_id.into(),
            outcome: None,
            note: None,
            old_value: Value::Null,
            new_value: Value::Null,
            corrects_seq: None,
        }
    }

    pub fn steps(mut self, from: Option<&str>, to: Option<&str>) -> Self {
        self.from_step = from.map(str::to_string);
        self.to_step = to.map(str::to_string);
        self
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note;
        self
    }

    pub fn with_values(mut self, old_value: Value, new_value: Value) -> Self {
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }

    /// Mark this append as a correction of entry `seq`
    pub fn correcting(mut self, seq: u64) -> Self {
        self.corrects_seq = Some(seq);
        self
    }
}

/// Persistent, immutable, hash-chained audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// 1-based position in the entity's chain
    pub seq: u64,
    pub entity_type: String,
    pub entity_id: String,
    pub action_type: ActionType,
    pub from_step: Option<String>,
    pub to_step: Option<String>,
    pub actor_id: String,
    pub outcome: Option<String>,
    pub note: Option<String>,
    pub payload_digest: String,
    pub corrects_seq: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    pub fn entity(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }
}

/// Result of recomputing a chain from genesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    /// Number of entries examined
    pub entries: usize,
    /// First sequence number whose stored hash does not verify
    pub first_bad_seq: Option<u64>,
}

impl ChainVerification {
    pub fn is_intact(&self) -> bool {
        self.first_bad_seq.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_type_round_trips_through_text() {
        for action in [
            ActionType::Create,
            ActionType::Transition,
            ActionType::Approve,
            ActionType::Reject,
            ActionType::Cancel,
            ActionType::ServiceFailure,
            ActionType::Resume,
            ActionType::Correction,
        ] {
            assert_eq!(action.as_str().parse::<ActionType>().unwrap(), action);
        }
        assert!("Delete".parse::<ActionType>().is_err());
    }

    #[test]
    fn entity_key_display() {
        assert_eq!(
            EntityKey::new("budget", "BUD2024000123").to_string(),
            "budget/BUD2024000123"
        );
    }
}
