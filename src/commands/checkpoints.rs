//! Checkpoint inspection handlers.

use anyhow::{Context, Result};
use chrono::NaiveDate;

use marketcap_core::CheckpointManager;

use crate::app_config::Settings;

pub fn run_checkpoints_list_command(settings: &Settings) -> Result<()> {
    let manager = CheckpointManager::new(&settings.checkpoint_dir);
    let keys = manager.list().context("Failed to list checkpoints")?;
    if keys.is_empty() {
        println!("no checkpoints in {}", manager.dir().display());
        return Ok(());
    }

    for key in keys {
        match manager.restore(&key) {
            Ok(Some(cp)) => println!(
                "{key}  last_page={}  coins={}  api_calls={}  saved={}",
                cp.last_page, cp.total_coins_collected, cp.api_calls_used, cp.checkpoint_time
            ),
            Ok(None) => {}
            Err(err) => println!("{key}  unreadable: {err}"),
        }
    }
    Ok(())
}

pub fn run_checkpoints_delete_command(settings: &Settings, date: NaiveDate) -> Result<()> {
    let manager = CheckpointManager::new(&settings.checkpoint_dir);
    let key = date.format("%Y-%m-%d").to_string();
    if manager
        .delete(&key)
        .with_context(|| format!("Failed to delete checkpoint for {key}"))?
    {
        println!("deleted checkpoint for {key}");
    } else {
        println!("no checkpoint for {key}");
    }
    Ok(())
}
