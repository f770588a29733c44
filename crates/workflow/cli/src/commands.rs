use audit_ledger::{ChainVerification, EntityKey};
use std::path::PathBuf;
use std::process::ExitCode;
use workflow_engine::config::{load_definition_file, open_storage};
use workflow_engine::{DefinitionRegistry, EngineConfig};

/// Outcome of `wfctl validate`: one line per definition or failing file.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub lines: Vec<String>,
    pub failures: usize,
}

impl ValidationReport {
    pub fn exit_code(&self) -> ExitCode {
        if self.failures == 0 {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

/// Register every definition in `files` into a scratch registry.
///
/// A file is accepted or rejected as a whole: definitions from a file that
/// fails never reach the registry later files are checked against. The
/// first violation in each file is reported.
pub fn validate(files: &[PathBuf]) -> ValidationReport {
    let mut registry = DefinitionRegistry::new();
    let mut report = ValidationReport::default();

    for path in files {
        let mut staged = registry.clone();
        let result = load_definition_file(path).and_then(|definitions| {
            definitions
                .into_iter()
                .map(|d| staged.register(d))
                .collect::<Result<Vec<_>, _>>()
        });

        match result {
            Ok(registered) => {
                registry = staged;
                for definition in registered {
                    report.lines.push(format!(
                        "ok     {}: {} v{} ({} steps, reachable {})",
                        path.display(),
                        definition.name,
                        definition.version,
                        definition.step_count(),
                        definition.reachable_steps().len(),
                    ));
                }
            }
            Err(e) => {
                report.failures += 1;
                report.lines.push(format!("error  {}: {e}", path.display()));
            }
        }
    }
    report
}

async fn verify_entity(
    config: &EngineConfig,
    entity_type: &str,
    entity_id: &str,
) -> anyhow::Result<ChainVerification> {
    let (_, _, ledger) = open_storage(&config.storage).await?;
    Ok(ledger
        .verify_chain(&EntityKey::new(entity_type, entity_id))
        .await?)
}

pub async fn verify(config: &EngineConfig, entity_type: &str, entity_id: &str) -> anyhow::Result<ExitCode> {
    let verification = verify_entity(config, entity_type, entity_id).await?;

    println!("{}", serde_json::to_string_pretty(&verification)?);
    match verification.first_bad_seq {
        None => Ok(ExitCode::SUCCESS),
        Some(seq) => {
            tracing::error!(entity_type, entity_id, first_bad_seq = seq, "Audit chain broken");
            Ok(ExitCode::FAILURE)
        }
    }
}

pub async fn history(config: &EngineConfig, entity_type: &str, entity_id: &str) -> anyhow::Result<ExitCode> {
    let (_, _, ledger) = open_storage(&config.storage).await?;
    let entries = ledger
        .history(&EntityKey::new(entity_type, entity_id))
        .await?;

    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(ExitCode::SUCCESS)
}
