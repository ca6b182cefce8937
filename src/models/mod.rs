pub mod config;
pub mod config_validator;
pub mod destination;
pub mod error;
pub mod events;
pub mod run_record;
pub mod schedule;
pub mod snapshot;
pub mod task;
