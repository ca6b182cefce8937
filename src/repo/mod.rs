pub mod log_repo;
pub mod snapshot_repo;
pub mod sqlite;
pub mod task_repo;

pub use sqlite::Database;
