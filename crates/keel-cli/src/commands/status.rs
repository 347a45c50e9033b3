use keel_core::models::OfflineStatus;
use keel_core::util::format_timestamp_ms;

use crate::commands::common::{load_settings, open_store, print_json, Paths};
use crate::error::CliError;

pub async fn run_status(as_json: bool, paths: &Paths) -> Result<(), CliError> {
    let store = open_store(&load_settings(paths)?)?;
    let status = store.offline_status(false, false).await?;

    if as_json {
        return print_json(&status);
    }
    for line in format_status_lines(&status) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_status_lines(status: &OfflineStatus) -> Vec<String> {
    let mut lines = vec![
        format!("Pending changes:      {}", status.pending_count),
        format!("Failed changes:       {}", status.failed_count),
        format!("Needs attention:      {}", status.needs_attention_count),
        format!("Unresolved conflicts: {}", status.unresolved_conflicts),
    ];
    if let Some(oldest) = status.oldest_pending_at {
        lines.push(format!("Oldest unsynced:      {}", format_timestamp_ms(oldest)));
    }
    lines
}
