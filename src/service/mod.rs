pub mod change_detector;
pub mod coordinator;
pub mod hash;
pub mod matcher;
pub mod registry;
pub mod scheduler;
pub mod transfer;
