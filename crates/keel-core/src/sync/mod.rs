//! Offline-first sync engine: handlers, orchestration and realtime triggers.

pub mod backoff;
mod conflict;
mod handler;
mod orchestrator;
mod realtime;
mod remote;

#[cfg(test)]
pub(crate) mod testing;

pub use conflict::{ConflictDecision, ConflictDetector, TieBreakPolicy};
pub use handler::{
    PullResult, PushResult, SyncFailure, SyncHandler, CLOCK_SKEW_ALLOWANCE_MS,
};
pub use orchestrator::{HandlerReport, OrchestratorConfig, SyncOrchestrator, SyncResult};
pub use realtime::{
    ChangeNotification, NotificationStream, RealtimeChannel, RealtimeSource, SseParser,
    SseRealtimeSource,
};
pub use remote::{
    AuthEvent, HttpRemote, RemoteEndpoint, RemoteEntity, RemoteError, RemoteResult,
    LOCAL_RETRY_AFTER,
};
