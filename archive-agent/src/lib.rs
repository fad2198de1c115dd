//! Archive Agent Library
//!
//! Periodically packs configured directory trees into timestamped zip
//! archives, drops an archive identical to its predecessor and keeps a fixed
//! number of archives per job.

pub mod archive;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod runner;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, JobConfig};
pub use runner::{BackupRunner, InFlight};
pub use utils::errors::ArchiveError;
pub type Result<T> = std::result::Result<T, ArchiveError>;
