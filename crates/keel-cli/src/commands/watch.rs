use std::sync::Arc;
use std::time::Duration;

use keel_core::sync::{
    OrchestratorConfig, RealtimeChannel, RealtimeSource, RemoteEndpoint, SseRealtimeSource,
    SyncOrchestrator,
};

use crate::commands::common::{connect_remote, load_settings, open_store, Paths};
use crate::commands::sync::format_sync_result;
use crate::error::CliError;

pub async fn run_watch(
    interval_secs: Option<u64>,
    no_realtime: bool,
    paths: &Paths,
) -> Result<(), CliError> {
    let settings = load_settings(paths)?;
    let store = open_store(&settings)?;
    let remote = connect_remote(&settings)?;

    let realtime_source: Option<Arc<dyn RealtimeSource>> = (!no_realtime).then(|| {
        Arc::new(SseRealtimeSource::new(
            remote.clone(),
            settings.realtime_path.clone(),
        )) as Arc<dyn RealtimeSource>
    });
    let remote: Arc<dyn RemoteEndpoint> = Arc::new(remote);
    if let Err(error) = remote.health_check().await {
        tracing::warn!("Sync server not reachable yet: {}", error);
    }

    let orchestrator =
        SyncOrchestrator::new(store, remote, OrchestratorConfig::from(&settings));
    let first = orchestrator.start().await?;
    for line in format_sync_result(&first) {
        println!("{line}");
    }

    let interval = match interval_secs {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => settings.sync_interval(),
    };
    if let Some(interval) = interval {
        orchestrator.schedule_periodic_sync(interval);
    }

    let channel = realtime_source.map(|source| {
        RealtimeChannel::spawn(
            source,
            orchestrator.clone(),
            settings.realtime_max_reconnect(),
        )
    });

    println!("Watching for changes; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    if let Some(channel) = channel {
        channel.stop();
    }
    orchestrator.shutdown().await;
    println!("Stopped");
    Ok(())
}
