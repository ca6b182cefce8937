pub mod directory;
pub mod format;
