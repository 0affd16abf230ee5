use std::path::Path;

use anyhow::Result;
use wmsync_types::state::EntityName;

use super::{load_config, open_state};

/// Execute the `reset` command: forget one entity's bookmark so the next
/// run starts from the initial cursor.
pub async fn execute(config_path: &Path, entity: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let state_config = config.state.clone();
    let entity = EntityName::new(entity);
    let target = entity.clone();

    let deleted = tokio::task::spawn_blocking(move || -> Result<bool> {
        let state = open_state(&state_config)?;
        Ok(state.bookmarks.delete_bookmark(&target)?)
    })
    .await??;

    if deleted {
        tracing::info!(entity = %entity, "Bookmark deleted");
        println!("Bookmark for '{entity}' deleted.");
    } else {
        println!("No bookmark stored for '{entity}'.");
    }
    Ok(())
}
