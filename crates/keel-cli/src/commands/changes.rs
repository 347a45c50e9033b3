use keel_core::models::SyncState;
use keel_core::util::unix_millis_now;

use crate::cli::ChangeStateArg;
use crate::commands::common::{
    change_to_item, format_change_lines, load_settings, open_store, parse_change_id, print_json,
    ChangeListItem, Paths,
};
use crate::error::CliError;

impl From<ChangeStateArg> for SyncState {
    fn from(value: ChangeStateArg) -> Self {
        match value {
            ChangeStateArg::Pending => Self::Pending,
            ChangeStateArg::Syncing => Self::Syncing,
            ChangeStateArg::Synced => Self::Synced,
            ChangeStateArg::Failed => Self::Failed,
        }
    }
}

pub async fn run_changes(
    state: ChangeStateArg,
    limit: usize,
    as_json: bool,
    paths: &Paths,
) -> Result<(), CliError> {
    let store = open_store(&load_settings(paths)?)?;
    let changes = store.list_changes(state.into(), limit).await?;

    if as_json {
        let now = unix_millis_now();
        let items = changes
            .iter()
            .map(|change| change_to_item(change, now))
            .collect::<Vec<ChangeListItem>>();
        return print_json(&items);
    }
    if changes.is_empty() {
        println!("No {} changes.", SyncState::from(state).as_str());
        return Ok(());
    }
    for line in format_change_lines(&changes) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_retry(id: &str, paths: &Paths) -> Result<(), CliError> {
    let id = parse_change_id(id)?;
    let store = open_store(&load_settings(paths)?)?;
    store.retry_change(&id).await?;
    println!("Change {id} queued for retry");
    Ok(())
}

pub async fn run_discard(id: &str, paths: &Paths) -> Result<(), CliError> {
    let id = parse_change_id(id)?;
    let store = open_store(&load_settings(paths)?)?;
    store.discard_change(&id).await?;
    println!("Change {id} discarded");
    Ok(())
}

pub async fn run_gc(paths: &Paths) -> Result<(), CliError> {
    let settings = load_settings(paths)?;
    let store = open_store(&settings)?;
    let purged = store.purge_synced(settings.synced_retention()).await?;
    println!("Purged {purged} synced change(s)");
    Ok(())
}
