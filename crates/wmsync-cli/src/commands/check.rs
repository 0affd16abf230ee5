use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use wmsync_engine::{AlertDispatcher, ConnectionPool, DataValidator, PgConnector};

use super::{load_config, open_state_blocking};

/// Execute the `check` command: validate config, then ping the target
/// database and the state backend once.
pub async fn execute(config_path: &Path) -> Result<()> {
    // 1. Parse and validate
    let config = load_config(config_path)?;
    println!("Config structure:  OK");

    // 2. Collaborators that only need the config
    let _ = DataValidator::new(config.validation.clone())?;
    let alerts = AlertDispatcher::from_config(&config.alerts)?;
    println!("Validation rules:  OK");
    for severity in wmsync_types::alert::Severity::ALL {
        println!("  {severity:9} -> {}", alerts.route(severity).join(", "));
    }

    // 3. Target database
    let connector = Arc::new(PgConnector::new(
        config.target.connection.clone(),
        config.target.schema.clone(),
    ));
    let pool = ConnectionPool::new(connector, config.pool.clone(), None);
    let target_ok = match pool.lease(config.pool.lease_timeout()).await {
        Ok(mut lease) => match lease.ping().await {
            Ok(()) => {
                println!("Target database:   OK");
                true
            }
            Err(err) => {
                println!("Target database:   FAILED");
                println!("  {err}");
                false
            }
        },
        Err(err) => {
            println!("Target database:   FAILED");
            println!("  {err}");
            false
        }
    };
    drop(pool);

    // 4. State backend
    let state_ok = match open_state_blocking(config.state.clone()).await {
        Ok(state) => {
            let bookmarks = Arc::clone(&state.bookmarks);
            let listed = tokio::task::spawn_blocking(move || bookmarks.list_bookmarks()).await?;
            state.close().await;
            match listed {
                Ok(list) => {
                    println!("State backend:     OK ({} bookmarks)", list.len());
                    true
                }
                Err(err) => {
                    println!("State backend:     FAILED");
                    println!("  {err}");
                    false
                }
            }
        }
        Err(err) => {
            println!("State backend:     FAILED");
            println!("  {err:#}");
            false
        }
    };

    if target_ok && state_ok {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}
