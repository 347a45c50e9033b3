use std::sync::Arc;

use keel_core::sync::{OrchestratorConfig, SyncOrchestrator, SyncResult};
use keel_core::util::format_timestamp_ms;

use crate::commands::common::{connect_remote, load_settings, open_store, print_json, Paths};
use crate::error::CliError;

pub async fn run_sync(as_json: bool, paths: &Paths) -> Result<(), CliError> {
    let settings = load_settings(paths)?;
    let store = open_store(&settings)?;
    let remote = Arc::new(connect_remote(&settings)?);

    let orchestrator = SyncOrchestrator::new(store, remote, OrchestratorConfig::from(&settings));
    let result = orchestrator.start().await?;
    orchestrator.shutdown().await;

    if as_json {
        return print_json(&result);
    }
    for line in format_sync_result(&result) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_sync_result(result: &SyncResult) -> Vec<String> {
    if let Some(reason) = &result.skipped {
        return vec![format!("Sync skipped: {reason}")];
    }

    let mut lines = Vec::new();
    for report in &result.reports {
        if report.pushed + report.failed + report.conflicts + report.pulled + report.deferred == 0 {
            continue;
        }
        lines.push(format!(
            "{:<22} pushed={} pulled={} failed={} conflicts={} waiting={}",
            report.entity_type.as_str(),
            report.pushed,
            report.pulled,
            report.failed,
            report.conflicts,
            report.deferred
        ));
    }
    for failure in &result.failures {
        lines.push(format!(
            "failed  {} {}: {}",
            failure.entity_type,
            failure
                .entity_id
                .map_or_else(|| "(pull)".to_string(), |id| id.to_string()),
            failure.message
        ));
    }
    for conflict in &result.conflicts {
        lines.push(format!(
            "conflict #{}  {} {}  (run `keel resolve {} --use local|remote`)",
            conflict.id, conflict.entity_type, conflict.entity_id, conflict.id
        ));
    }
    if result.auth_required {
        lines.push(format!(
            "Authentication required: set {} and sync again",
            keel_core::config::API_TOKEN_ENV
        ));
    }

    let summary = result.aborted.as_ref().map_or_else(
        || {
            format!(
                "Sync completed at {}: {} pushed, {} pulled",
                format_timestamp_ms(result.finished_at),
                result.pushed(),
                result.pulled()
            )
        },
        |reason| format!("Sync aborted: {reason}"),
    );
    lines.push(summary);
    lines
}
