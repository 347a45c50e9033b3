pub mod changes;
pub mod common;
pub mod config;
pub mod conflicts;
pub mod health;
pub mod record;
pub mod show;
pub mod status;
pub mod sync;
pub mod watch;
