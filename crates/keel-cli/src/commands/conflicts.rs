use keel_core::models::Resolution;

use crate::cli::ResolveSide;
use crate::commands::common::{
    format_sync_conflict_lines, load_settings, open_store, print_json, sync_conflict_to_item,
    Paths, SyncConflictItem,
};
use crate::error::CliError;

pub async fn run_conflicts(
    all: bool,
    limit: usize,
    as_json: bool,
    paths: &Paths,
) -> Result<(), CliError> {
    let store = open_store(&load_settings(paths)?)?;
    let conflicts = if all {
        store.list_conflicts(limit).await?
    } else {
        let mut unresolved = store.list_unresolved_conflicts().await?;
        unresolved.truncate(limit);
        unresolved
    };

    if as_json {
        let json_items = conflicts
            .iter()
            .map(sync_conflict_to_item)
            .collect::<Vec<SyncConflictItem>>();
        return print_json(&json_items);
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }
    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_resolve(id: i64, side: ResolveSide, paths: &Paths) -> Result<(), CliError> {
    let store = open_store(&load_settings(paths)?)?;
    let Some(existing) = store.get_conflict(id).await? else {
        return Err(CliError::ConflictNotFound(id));
    };
    if existing.is_resolved() {
        println!(
            "Conflict #{} is already resolved ({})",
            existing.id,
            existing.resolution.as_str()
        );
        return Ok(());
    }

    let resolution = match side {
        ResolveSide::Local => Resolution::UseLocal,
        ResolveSide::Remote => Resolution::UseRemote,
    };
    let (conflict, requeued) = store.resolve_conflict(id, resolution).await?;
    match requeued {
        Some(change) => println!(
            "Conflict #{} resolved with the local version; change {} queued for the next sync",
            conflict.id, change.id
        ),
        None => println!(
            "Conflict #{} resolved with the remote version",
            conflict.id
        ),
    }
    Ok(())
}
