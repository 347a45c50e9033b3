//! Sync orchestrator: runs full passes over every entity type in dependency
//! order and publishes state for observers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::conflict::{ConflictDetector, TieBreakPolicy};
use super::handler::{PullResult, PushResult, SyncFailure, SyncHandler};
use super::remote::{AuthEvent, RemoteEndpoint};
use crate::config::SyncSettings;
use crate::models::{
    EntityType, OfflineStatus, OrchestratorState, Resolution, SyncConflict, SyncPhase,
    SyncProgress,
};
use crate::services::DatabaseService;
use crate::util::unix_millis_now;
use crate::Result;

type SharedPass = Shared<BoxFuture<'static, SyncResult>>;

/// Tunables of the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub tie_break: TieBreakPolicy,
    pub push_concurrency: usize,
    /// `Synced` change records older than this are purged after each pass
    pub synced_retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tie_break: TieBreakPolicy::default(),
            push_concurrency: 4,
            synced_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl From<&SyncSettings> for OrchestratorConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            tie_break: settings.tie_break,
            push_concurrency: settings.push_concurrency,
            synced_retention: settings.synced_retention(),
        }
    }
}

/// Outcome of one handler within a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerReport {
    pub entity_type: EntityType,
    pub pushed: usize,
    pub failed: usize,
    pub superseded: usize,
    pub deferred: usize,
    pub conflicts: usize,
    pub pulled: usize,
    pub pull_deferred: usize,
    pub skipped_echoes: usize,
}

impl HandlerReport {
    fn new(entity_type: EntityType, push: &PushResult, pull: &PullResult) -> Self {
        Self {
            entity_type,
            pushed: push.pushed,
            failed: push.failed,
            superseded: push.superseded,
            deferred: push.deferred,
            conflicts: push.conflicts.len(),
            pulled: pull.applied,
            pull_deferred: pull.deferred,
            skipped_echoes: pull.skipped,
        }
    }
}

/// Outcome of a full sync pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncResult {
    pub started_at: i64,
    pub finished_at: i64,
    pub reports: Vec<HandlerReport>,
    pub conflicts: Vec<SyncConflict>,
    pub failures: Vec<SyncFailure>,
    pub auth_required: bool,
    /// Why the pass did not run at all
    pub skipped: Option<String>,
    /// Store error that stopped the pass
    pub aborted: Option<String>,
}

impl SyncResult {
    fn started(started_at: i64) -> Self {
        Self {
            started_at,
            ..Self::default()
        }
    }

    fn skipped(reason: &str) -> Self {
        let now = unix_millis_now();
        Self {
            started_at: now,
            finished_at: now,
            skipped: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn pushed(&self) -> usize {
        self.reports.iter().map(|report| report.pushed).sum()
    }

    pub fn pulled(&self) -> usize {
        self.reports.iter().map(|report| report.pulled).sum()
    }

    /// Whether the pass ran to completion with nothing left to report
    pub fn is_clean(&self) -> bool {
        self.skipped.is_none()
            && self.aborted.is_none()
            && !self.auth_required
            && self.conflicts.is_empty()
            && self.failures.is_empty()
    }
}

struct Inner {
    store: DatabaseService,
    remote: Arc<dyn RemoteEndpoint>,
    handlers: Vec<SyncHandler>,
    config: OrchestratorConfig,
    online: AtomicBool,
    auth_required: AtomicBool,
    in_flight: Mutex<Option<SharedPass>>,
    periodic: Mutex<Option<JoinHandle<()>>>,
    auth_listener: Mutex<Option<JoinHandle<()>>>,
    state: watch::Sender<OrchestratorState>,
    syncing: watch::Sender<bool>,
    progress: watch::Sender<SyncProgress>,
    conflicts: watch::Sender<Vec<SyncConflict>>,
    status: watch::Sender<OfflineStatus>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for slot in [&self.periodic, &self.auth_listener] {
            if let Some(handle) = lock(slot).take() {
                handle.abort();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Coordinates full sync passes across all entity handlers.
///
/// Cheap to clone; clones share the same state. At most one pass runs at a
/// time and concurrent triggers join it.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(
        store: DatabaseService,
        remote: Arc<dyn RemoteEndpoint>,
        config: OrchestratorConfig,
    ) -> Self {
        let detector = ConflictDetector::new(
            config.tie_break,
            store.device_id().map(ToString::to_string),
        );
        let handlers = EntityType::SYNC_ORDER
            .into_iter()
            .map(|entity_type| {
                SyncHandler::new(
                    entity_type,
                    store.clone(),
                    Arc::clone(&remote),
                    detector.clone(),
                    config.push_concurrency,
                )
            })
            .collect();

        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                handlers,
                config,
                online: AtomicBool::new(true),
                auth_required: AtomicBool::new(false),
                in_flight: Mutex::new(None),
                periodic: Mutex::new(None),
                auth_listener: Mutex::new(None),
                state: watch::channel(OrchestratorState::Idle).0,
                syncing: watch::channel(false).0,
                progress: watch::channel(SyncProgress::finished("Not synced yet")).0,
                conflicts: watch::channel(Vec::new()).0,
                status: watch::channel(OfflineStatus::default()).0,
            }),
        }
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn store(&self) -> &DatabaseService {
        &self.inner.store
    }

    /// Recover from a previous crash, start listening for credential events
    /// and run the first pass.
    pub async fn start(&self) -> Result<SyncResult> {
        let recovered = self.inner.store.recover_in_flight().await?;
        if recovered > 0 {
            tracing::info!("Returned {recovered} interrupted change(s) to the queue");
        }
        self.listen_for_auth_events();
        self.refresh_observables().await?;
        Ok(self.sync_all().await)
    }

    /// Run a full pass, or join the one already running.
    ///
    /// The pass runs on its own task, so dropping the returned future never
    /// interrupts it.
    pub async fn sync_all(&self) -> SyncResult {
        let pass = {
            let mut in_flight = lock(&self.inner.in_flight);
            if let Some(pass) = in_flight.as_ref() {
                tracing::debug!("Sync already running; joining it");
                pass.clone()
            } else {
                let this = self.clone();
                let task = tokio::spawn(async move { this.run_pass().await });
                let pass = async move {
                    task.await.unwrap_or_else(|error| SyncResult {
                        aborted: Some(format!("sync task failed: {error}")),
                        ..SyncResult::default()
                    })
                }
                .boxed()
                .shared();
                *in_flight = Some(pass.clone());
                pass
            }
        };
        pass.await
    }

    async fn run_pass(&self) -> SyncResult {
        let result = if !self.is_online() {
            tracing::debug!("Offline; skipping sync");
            SyncResult::skipped("offline")
        } else if self.inner.auth_required.load(Ordering::SeqCst) {
            tracing::debug!("Waiting for re-authentication; skipping sync");
            SyncResult::skipped("authentication required")
        } else {
            self.run_handlers().await
        };

        if let Err(error) = self.refresh_observables().await {
            tracing::warn!("Failed to refresh sync status: {}", error);
        }
        let has_conflicts = !self.inner.conflicts.borrow().is_empty();
        self.inner.state.send_replace(if has_conflicts {
            OrchestratorState::IdleWithConflicts
        } else {
            OrchestratorState::Idle
        });
        self.inner.syncing.send_replace(false);

        lock(&self.inner.in_flight).take();
        result
    }

    async fn run_handlers(&self) -> SyncResult {
        let started_at = unix_millis_now();
        let mut result = SyncResult::started(started_at);
        tracing::info!("Sync pass started");
        self.inner.state.send_replace(OrchestratorState::Syncing);
        self.inner.syncing.send_replace(true);
        self.inner.progress.send_replace(SyncProgress::starting());

        if let Err(error) = self.run_handlers_inner(started_at, &mut result).await {
            tracing::error!("Sync pass aborted: {}", error);
            result.aborted = Some(error.to_string());
        }

        match self
            .inner
            .store
            .purge_synced(self.inner.config.synced_retention)
            .await
        {
            Ok(0) => {}
            Ok(purged) => tracing::debug!("Purged {purged} synced change(s)"),
            Err(error) => tracing::warn!("Failed to purge synced changes: {}", error),
        }

        result.finished_at = unix_millis_now();
        let message = if let Some(reason) = &result.aborted {
            format!("Sync aborted: {reason}")
        } else if result.auth_required {
            "Sync paused: authentication required".to_string()
        } else {
            format!(
                "Sync finished: {} pushed, {} pulled, {} conflict(s), {} failure(s)",
                result.pushed(),
                result.pulled(),
                result.conflicts.len(),
                result.failures.len()
            )
        };
        tracing::info!("{message} in {} ms", result.finished_at - started_at);
        self.inner.progress.send_replace(SyncProgress::finished(message));
        result
    }

    async fn run_handlers_inner(&self, started_at: i64, result: &mut SyncResult) -> Result<()> {
        let total = self.inner.handlers.len();
        for (index, handler) in self.inner.handlers.iter().enumerate() {
            let entity_type = handler.entity_type();
            self.publish_phase(SyncPhase::Pushing(entity_type), index, total);
            let push = handler.push_pending(started_at).await?;
            result.failures.extend(push.failures.iter().cloned());
            result.conflicts.extend(push.conflicts.iter().cloned());
            if push.auth_required {
                self.halt_for_auth(result);
                result
                    .reports
                    .push(HandlerReport::new(entity_type, &push, &PullResult::default()));
                return Ok(());
            }

            self.publish_phase(SyncPhase::Pulling(entity_type), index, total);
            let pull = handler.pull_remote_changes().await?;
            result.failures.extend(pull.failure.iter().cloned());
            result
                .reports
                .push(HandlerReport::new(entity_type, &push, &pull));
            if pull.auth_required {
                self.halt_for_auth(result);
                return Ok(());
            }

            self.inner
                .progress
                .send_replace(SyncProgress::handler_completed(entity_type, index + 1, total));
        }
        Ok(())
    }

    fn publish_phase(&self, phase: SyncPhase, completed: usize, total: usize) {
        let message = match phase {
            SyncPhase::Pushing(entity_type) => format!("Pushing {entity_type}"),
            SyncPhase::Pulling(entity_type) => format!("Pulling {entity_type}"),
            SyncPhase::Starting => "Starting sync".to_string(),
            SyncPhase::Finished => "Sync finished".to_string(),
        };
        let percentage = u8::try_from(completed * 100 / total.max(1)).unwrap_or(100);
        self.inner.progress.send_replace(SyncProgress {
            phase,
            percentage,
            message,
        });
    }

    fn halt_for_auth(&self, result: &mut SyncResult) {
        tracing::warn!("Server requires re-authentication; pausing sync");
        self.inner.auth_required.store(true, Ordering::SeqCst);
        result.auth_required = true;
    }

    /// Record the caller's decision for a conflict.
    ///
    /// With `use_local` the local version is queued for the next pass;
    /// otherwise the remote version replaces it locally.
    pub async fn resolve_sync_conflict(
        &self,
        conflict_id: i64,
        use_local: bool,
    ) -> Result<SyncConflict> {
        let resolution = if use_local {
            Resolution::UseLocal
        } else {
            Resolution::UseRemote
        };
        let (conflict, requeued) = self
            .inner
            .store
            .resolve_conflict(conflict_id, resolution)
            .await?;
        if let Some(change) = requeued {
            tracing::debug!("Queued change {} to push the local version", change.id);
        }
        self.refresh_observables().await?;
        if !*self.inner.syncing.borrow() && self.inner.conflicts.borrow().is_empty() {
            self.inner.state.send_replace(OrchestratorState::Idle);
        }
        Ok(conflict)
    }

    /// Run `sync_all` every `interval`, replacing any previous schedule.
    pub fn schedule_periodic_sync(&self, interval: Duration) {
        let weak = self.downgrade();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orchestrator) = Self::upgrade(&weak) else {
                    break;
                };
                orchestrator.sync_all().await;
            }
        });

        if let Some(previous) = lock(&self.inner.periodic).replace(handle) {
            previous.abort();
        }
        tracing::info!("Periodic sync every {} s", interval.as_secs());
    }

    pub fn cancel_periodic_sync(&self) {
        if let Some(handle) = lock(&self.inner.periodic).take() {
            handle.abort();
            tracing::info!("Periodic sync cancelled");
        }
    }

    pub fn has_periodic_sync(&self) -> bool {
        lock(&self.inner.periodic)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Connectivity input. Coming back online triggers a pass.
    pub fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        self.inner
            .status
            .send_modify(|status| status.is_offline = !online);
        if online && !was_online {
            tracing::info!("Back online; syncing");
            let this = self.clone();
            tokio::spawn(async move {
                this.sync_all().await;
            });
        } else if !online && was_online {
            tracing::info!("Offline; changes will queue locally");
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn auth_required(&self) -> bool {
        self.inner.auth_required.load(Ordering::SeqCst)
    }

    /// React to credential events from the transport.
    fn listen_for_auth_events(&self) {
        let Some(mut events) = self.inner.remote.auth_events() else {
            return;
        };
        let weak = self.downgrade();
        let handle = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(orchestrator) = Self::upgrade(&weak) else {
                    break;
                };
                orchestrator.handle_auth_event(event).await;
            }
        });

        if let Some(previous) = lock(&self.inner.auth_listener).replace(handle) {
            previous.abort();
        }
    }

    async fn handle_auth_event(&self, event: AuthEvent) {
        match event {
            AuthEvent::TokenExpired => {
                self.inner.auth_required.store(true, Ordering::SeqCst);
                self.inner
                    .status
                    .send_modify(|status| status.auth_required = true);
            }
            AuthEvent::TokenRefreshed => {
                let was_required = self.inner.auth_required.swap(false, Ordering::SeqCst);
                self.inner
                    .status
                    .send_modify(|status| status.auth_required = false);
                if was_required {
                    tracing::info!("Credentials refreshed; resuming sync");
                    self.sync_all().await;
                }
            }
        }
    }

    /// Stop background tasks and wait for a running pass to finish.
    pub async fn shutdown(&self) {
        self.cancel_periodic_sync();
        if let Some(handle) = lock(&self.inner.auth_listener).take() {
            handle.abort();
        }
        let running = lock(&self.inner.in_flight).clone();
        if let Some(pass) = running {
            pass.await;
        }
        tracing::info!("Sync orchestrator stopped");
    }

    /// Reload conflicts and offline status from the store.
    pub async fn refresh_observables(&self) -> Result<()> {
        let conflicts = self.inner.store.list_unresolved_conflicts().await?;
        let status = self
            .inner
            .store
            .offline_status(!self.is_online(), self.auth_required())
            .await?;
        self.inner.conflicts.send_replace(conflicts);
        self.inner.status.send_replace(status);
        Ok(())
    }

    pub fn state(&self) -> watch::Receiver<OrchestratorState> {
        self.inner.state.subscribe()
    }

    pub fn is_syncing(&self) -> watch::Receiver<bool> {
        self.inner.syncing.subscribe()
    }

    pub fn sync_progress(&self) -> watch::Receiver<SyncProgress> {
        self.inner.progress.subscribe()
    }

    pub fn sync_conflicts(&self) -> watch::Receiver<Vec<SyncConflict>> {
        self.inner.conflicts.subscribe()
    }

    pub fn offline_status(&self) -> watch::Receiver<OfflineStatus> {
        self.inner.status.subscribe()
    }
}
