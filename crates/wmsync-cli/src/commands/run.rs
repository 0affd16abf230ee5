use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use wmsync_engine::{
    AlertDispatcher, ConnectionPool, Connector, DataValidator, OrchestratorError, PgConnector,
    ProcessPipelineLauncher, SyncOrchestrator, TargetKeyLookup,
};
use wmsync_types::run::SyncRun;
use wmsync_types::state::EntityName;
use wmsync_types::wire::SyncMode;

use super::{load_config, open_state_blocking};

/// Execute the `run` command: wire collaborators from config and run one sync.
pub async fn execute(config_path: &Path, mode: SyncMode, entities: &[String]) -> Result<()> {
    let config = load_config(config_path)?;
    let entities: Vec<EntityName> = entities.iter().map(EntityName::new).collect();

    tracing::info!(
        mode = mode.as_str(),
        entities = entities.len(),
        target_schema = %config.target.schema,
        state_backend = ?config.state.backend,
        "Config validated"
    );

    let state = open_state_blocking(config.state.clone()).await?;
    let alerts = Arc::new(AlertDispatcher::from_config(&config.alerts)?);
    let connector: Arc<dyn Connector> = Arc::new(PgConnector::new(
        config.target.connection.clone(),
        config.target.schema.clone(),
    ));
    let pool = ConnectionPool::new(
        Arc::clone(&connector),
        config.pool.clone(),
        Some(Arc::clone(&alerts)),
    );
    let validator = Arc::new(DataValidator::new(config.validation.clone())?);
    let check_references = !validator.referenced_entities().is_empty();
    let launcher = Arc::new(ProcessPipelineLauncher::new(config.pipeline.clone()));

    let mut orchestrator = SyncOrchestrator::new(
        validator,
        pool,
        Arc::clone(&alerts),
        Arc::clone(&state.bookmarks),
        launcher,
    );
    if let Some(ledger) = &state.ledger {
        orchestrator = orchestrator.with_ledger(Arc::clone(ledger));
    }
    if check_references {
        orchestrator = orchestrator.with_reference_lookup(Arc::new(TargetKeyLookup::new(connector)));
    }

    let outcome = orchestrator.run(mode, &entities, &config).await;

    let reports = alerts.flush().await;
    let undelivered = reports.iter().filter(|r| !r.suppressed && !r.is_delivered()).count();
    if undelivered > 0 {
        tracing::warn!(undelivered, "Some follow-up alerts were not delivered");
    }
    drop(orchestrator);
    state.close().await;

    match outcome {
        Ok(run) => {
            print_summary(&run);
            Ok(())
        }
        Err(OrchestratorError::RunFailed { run }) => {
            print_summary(&run);
            let reason = run
                .failure
                .as_ref()
                .map_or_else(|| "unknown failure".to_string(), |f| format!("{}: {}", f.kind, f.message));
            anyhow::bail!("Sync run {} failed: {reason}", run.run_id)
        }
        Err(err) => Err(err.into()),
    }
}

fn print_summary(run: &SyncRun) {
    println!("Sync run {} {}.", run.run_id, run.status);
    println!("  Mode:               {}", run.mode);
    println!("  Correlation id:     {}", run.correlation_id);
    println!("  Records processed:  {}", run.records_processed);
    println!("  Records rejected:   {}", run.records_rejected);
    println!("  Rejection ratio:    {:.4}", run.rejection_ratio());
    println!("  Batches committed:  {}", run.batches_committed);
    #[allow(clippy::cast_precision_loss)]
    let secs = run.duration().num_milliseconds() as f64 / 1000.0;
    println!("  Duration:           {secs:.2}s");
    if let Some(failure) = &run.failure {
        println!("  Failure:            {} ({})", failure.kind, failure.message);
    }
    if run.bookmarks.is_empty() {
        println!("  Bookmarks:          (none advanced)");
    } else {
        println!("  Bookmarks:");
        for (entity, bookmark) in &run.bookmarks {
            println!("    {entity:18} {}", bookmark.replication_key_value);
        }
    }
}
