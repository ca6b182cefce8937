//! Backup execution engine: change detection against stored snapshots,
//! verified transfer to local, network and FTP destinations, scheduling
//! and an append-only run log.

pub mod engine;
pub mod models;
pub mod repo;
pub mod service;
pub mod utils;

pub use engine::{Engine, RunHandle};
pub use models::config::{setup_config, EngineConfig};
pub use models::error::{BackupError, Result};
