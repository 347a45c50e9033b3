//! Server-push listener that turns change notifications into sync triggers.
//!
//! Notifications are never applied directly; each one only asks the
//! orchestrator for a pass, and bursts collapse into a single pending trigger.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::backoff::ReconnectBackoff;
use super::orchestrator::SyncOrchestrator;
use super::remote::{HttpRemote, RemoteError, RemoteResult};

const RECONNECT_BASE: Duration = Duration::from_millis(500);

/// Best-effort decoding of a server notification. Only used for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub changed_at: Option<i64>,
}

impl ChangeNotification {
    /// Decode a `data:` payload; unknown shapes still count as a notification.
    pub fn parse(data: &str) -> Self {
        serde_json::from_str(data).unwrap_or_default()
    }
}

pub type NotificationStream = BoxStream<'static, RemoteResult<ChangeNotification>>;

/// A connectable stream of change notifications
#[async_trait]
pub trait RealtimeSource: Send + Sync {
    async fn connect(&self) -> RemoteResult<NotificationStream>;
}

/// Incremental parser for `text/event-stream` bodies.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    /// Feed a chunk; returns the `data` of every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = find_event_end(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let block = String::from_utf8_lossy(&block[..end]);
            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect();
            if !data.is_empty() {
                events.push(data.join("\n"));
            }
        }
        events
    }
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\n\n")
}

/// Server-sent events endpoint on the sync server
#[derive(Debug, Clone)]
pub struct SseRealtimeSource {
    remote: HttpRemote,
    path: String,
}

impl SseRealtimeSource {
    pub fn new(remote: HttpRemote, path: impl Into<String>) -> Self {
        Self {
            remote,
            path: path.into(),
        }
    }
}

#[async_trait]
impl RealtimeSource for SseRealtimeSource {
    async fn connect(&self) -> RemoteResult<NotificationStream> {
        let response = self.remote.open_event_stream(&self.path).await?;

        let notifications = response
            .bytes_stream()
            .scan(SseParser::default(), |parser, chunk| {
                let items: Vec<RemoteResult<ChangeNotification>> = match chunk {
                    Ok(bytes) => parser
                        .push(&bytes)
                        .iter()
                        .map(|data| Ok(ChangeNotification::parse(data)))
                        .collect(),
                    Err(error) => vec![Err(RemoteError::from(error))],
                };
                futures::future::ready(Some(stream::iter(items)))
            })
            .flatten()
            .boxed();
        Ok(notifications)
    }
}

/// Long-lived listener that keeps a realtime connection open and triggers
/// syncs on notifications.
///
/// Losing the connection only means falling back to periodic sync until the
/// reconnect succeeds.
pub struct RealtimeChannel {
    listener: JoinHandle<()>,
    worker: JoinHandle<()>,
    connected: watch::Receiver<bool>,
}

impl RealtimeChannel {
    pub fn spawn(
        source: Arc<dyn RealtimeSource>,
        orchestrator: SyncOrchestrator,
        max_reconnect_delay: Duration,
    ) -> Self {
        Self::spawn_with_backoff(
            source,
            orchestrator,
            ReconnectBackoff::new(RECONNECT_BASE, max_reconnect_delay),
        )
    }

    pub fn spawn_with_backoff(
        source: Arc<dyn RealtimeSource>,
        orchestrator: SyncOrchestrator,
        mut backoff: ReconnectBackoff,
    ) -> Self {
        // Capacity 1: a trigger queued behind a running pass absorbs the rest
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);
        let (connected_tx, connected) = watch::channel(false);

        let worker = tokio::spawn(async move {
            while trigger_rx.recv().await.is_some() {
                orchestrator.sync_all().await;
            }
        });

        let listener = tokio::spawn(async move {
            loop {
                match source.connect().await {
                    Ok(mut notifications) => {
                        tracing::info!("Realtime channel connected");
                        backoff.reset();
                        connected_tx.send_replace(true);
                        while let Some(item) = notifications.next().await {
                            match item {
                                Ok(notification) => {
                                    tracing::debug!(
                                        "Change notification for {} {}",
                                        notification.entity_type.as_deref().unwrap_or("?"),
                                        notification.entity_id.as_deref().unwrap_or("?")
                                    );
                                    // Full means a pass is already queued
                                    let _ = trigger_tx.try_send(());
                                }
                                Err(error) => {
                                    tracing::warn!("Realtime stream error: {}", error);
                                    break;
                                }
                            }
                        }
                        connected_tx.send_replace(false);
                    }
                    Err(error) => {
                        tracing::warn!("Realtime connect failed: {}", error);
                    }
                }

                let delay = backoff.next_delay();
                tracing::debug!(
                    "Reconnecting realtime channel in {} ms (attempt {})",
                    delay.as_millis(),
                    backoff.attempts()
                );
                tokio::time::sleep(delay).await;
            }
        });

        Self {
            listener,
            worker,
            connected,
        }
    }

    pub fn is_connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    pub fn stop(&self) {
        self.listener.abort();
        self.worker.abort();
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeKind, EntityId, EntityType};
    use crate::services::DatabaseService;
    use crate::sync::orchestrator::OrchestratorConfig;
    use crate::sync::testing::{MemoryRemote, ScriptedRealtime};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parser_handles_split_frames_and_comments() {
        let mut parser = SseParser::default();
        assert!(parser.push(b": keepalive\n\ndata: {\"entityType\"").is_empty());
        let events = parser.push(b":\"trip\"}\r\n\r\ndata: a\ndata: b\n\n");
        assert_eq!(events, vec![r#"{"entityType":"trip"}"#.to_string(), "a\nb".to_string()]);
    }

    #[test]
    fn notification_parse_is_lenient() {
        let parsed = ChangeNotification::parse(r#"{"entityType":"boat","changedAt":7}"#);
        assert_eq!(parsed.entity_type.as_deref(), Some("boat"));
        assert_eq!(parsed.changed_at, Some(7));
        assert_eq!(ChangeNotification::parse("ping"), ChangeNotification::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn notifications_trigger_sync_after_reconnect() {
        let store = DatabaseService::open_in_memory().unwrap().with_device_id("device-a");
        let remote = Arc::new(MemoryRemote::new());
        let orchestrator =
            SyncOrchestrator::new(store.clone(), remote.clone(), OrchestratorConfig::default());

        let id = EntityId::new();
        store
            .apply_local_change(EntityType::Boat, id, ChangeKind::Create, json!({ "name": "B1" }))
            .await
            .unwrap();

        let source = Arc::new(ScriptedRealtime::failing_first(2));
        let channel = RealtimeChannel::spawn_with_backoff(
            source.clone(),
            orchestrator,
            ReconnectBackoff::new(Duration::from_millis(5), Duration::from_millis(20)),
        );

        let mut connected = channel.is_connected();
        tokio::time::timeout(Duration::from_secs(5), connected.wait_for(|up| *up))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(source.connect_attempts(), 3);

        source.notify(r#"{"entityType":"boat"}"#);
        tokio::time::timeout(Duration::from_secs(5), async {
            while remote.entity(EntityType::Boat, &id).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 0);
        channel.stop();
    }
}
