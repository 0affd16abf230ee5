use std::path::Path;

use anyhow::Result;

use super::{load_config, open_state};

/// Execute the `bookmarks` command: print every stored bookmark.
pub async fn execute(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let state_config = config.state.clone();

    let bookmarks = tokio::task::spawn_blocking(move || -> Result<_> {
        let state = open_state(&state_config)?;
        Ok(state.bookmarks.list_bookmarks()?)
    })
    .await??;

    if bookmarks.is_empty() {
        println!("No bookmarks stored.");
        return Ok(());
    }
    println!("{:20} {:32} UPDATED", "ENTITY", "VALUE");
    for bookmark in bookmarks {
        println!(
            "{:20} {:32} {}",
            bookmark.entity.as_str(),
            bookmark.replication_key_value.to_string(),
            bookmark.updated_at.to_rfc3339()
        );
    }
    Ok(())
}
