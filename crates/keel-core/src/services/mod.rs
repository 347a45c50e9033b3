//! Shared async services over the local store.

mod database;

pub use database::{DatabaseService, PulledBatch};
