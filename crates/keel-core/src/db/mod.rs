//! Database layer for Keel

mod change_log;
mod connection;
mod conflict_repository;
mod entity_repository;
mod migrations;

pub use change_log::{ChangeLog, SqliteChangeLog};
pub use connection::Database;
pub use conflict_repository::{ConflictRepository, SqliteConflictRepository};
pub use entity_repository::{EntityRepository, SqliteEntityRepository};
