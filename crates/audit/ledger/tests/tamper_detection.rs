//! Property tests: altering any field of any stored entry is reported at
//! exactly that entry's sequence number.

use audit_ledger::{ActionType, AuditAppend, AuditEntry, AuditLedger, EntityKey, InMemoryAuditLedger};
use proptest::prelude::*;
use proptest::sample::Index;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn arb_action() -> impl Strategy<Value = ActionType> {
    prop_oneof![
        Just(ActionType::Transition),
        Just(ActionType::Approve),
        Just(ActionType::Reject),
        Just(ActionType::ServiceFailure),
    ]
}

fn arb_append() -> impl Strategy<Value = (ActionType, String, String, Option<String>)> {
    (
        arb_action(),
        "[a-z]{3,10}",
        "[a-z_]{3,12}",
        proptest::option::of("[a-z ]{0,30}"),
    )
}

/// Change one field of `entry`, chosen by `field`, to a value guaranteed to differ.
fn mutate(entry: &mut AuditEntry, field: usize) {
    match field {
        0 => entry.seq += 100,
        1 => entry.entity_id.push('x'),
        2 => {
            entry.action_type = if entry.action_type == ActionType::Cancel {
                ActionType::Create
            } else {
                ActionType::Cancel
            }
        }
        3 => entry.from_step = Some(format!("{}-moved", entry.from_step.clone().unwrap_or_default())),
        4 => entry.to_step = Some(format!("{}-moved", entry.to_step.clone().unwrap_or_default())),
        5 => entry.actor_id.push_str("-impostor"),
        6 => entry.outcome = Some(format!("{}!", entry.outcome.clone().unwrap_or_default())),
        7 => entry.note = Some(format!("{} (edited)", entry.note.clone().unwrap_or_default())),
        8 => entry.payload_digest = blake3::hash(b"forged").to_hex().to_string(),
        9 => entry.corrects_seq = Some(entry.corrects_seq.unwrap_or(0) + 1),
        10 => entry.timestamp += chrono::Duration::seconds(1),
        11 => entry.prev_hash = blake3::hash(entry.prev_hash.as_bytes()).to_hex().to_string(),
        _ => entry.hash = blake3::hash(entry.hash.as_bytes()).to_hex().to_string(),
    }
}

const FIELD_COUNT: usize = 13;

async fn build_chain(
    ledger: &InMemoryAuditLedger,
    key: &EntityKey,
    appends: &[(ActionType, String, String, Option<String>)],
) {
    ledger
        .append(AuditAppend::new(key.clone(), ActionType::Create, "initiator").steps(None, Some("start")))
        .await
        .unwrap();
    for (action, actor, step, note) in appends {
        ledger
            .append(
                AuditAppend::new(key.clone(), *action, actor.clone())
                    .steps(Some("start"), Some(step))
                    .with_outcome("submit")
                    .with_note(note.clone()),
            )
            .await
            .unwrap();
    }
}

// ---------------------------------------------------------------------------
// Property Tests
// ---------------------------------------------------------------------------

proptest! {
    /// An untouched chain always verifies.
    #[test]
    fn untouched_chain_is_intact(appends in prop::collection::vec(arb_append(), 0..12)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = InMemoryAuditLedger::new();
            let key = EntityKey::new("invoice", "INV-1");
            build_chain(&ledger, &key, &appends).await;

            let verification = ledger.verify_chain(&key).await.unwrap();
            assert!(verification.is_intact());
            assert_eq!(verification.entries, appends.len() + 1);
        });
    }

    /// Mutating any single field of entry k reports k as the first bad entry.
    #[test]
    fn mutated_entry_is_located(
        appends in prop::collection::vec(arb_append(), 1..12),
        victim in any::<Index>(),
        field in 0..FIELD_COUNT,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = InMemoryAuditLedger::new();
            let key = EntityKey::new("invoice", "INV-1");
            build_chain(&ledger, &key, &appends).await;

            let index = victim.index(appends.len() + 1);
            ledger
                .tamper(&key, |entries| mutate(&mut entries[index], field))
                .unwrap();

            let verification = ledger.verify_chain(&key).await.unwrap();
            assert_eq!(verification.first_bad_seq, Some(index as u64 + 1));
        });
    }

    /// Removing an entry from the middle is detected at the gap.
    #[test]
    fn deleted_entry_is_located(
        appends in prop::collection::vec(arb_append(), 2..12),
        victim in any::<Index>(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = InMemoryAuditLedger::new();
            let key = EntityKey::new("invoice", "INV-1");
            build_chain(&ledger, &key, &appends).await;

            // Never the last entry: truncating the tail leaves a valid prefix.
            let index = victim.index(appends.len());
            ledger.tamper(&key, |entries| { entries.remove(index); }).unwrap();

            let verification = ledger.verify_chain(&key).await.unwrap();
            assert_eq!(verification.first_bad_seq, Some(index as u64 + 1));
        });
    }
}
