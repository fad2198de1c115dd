//! Archive containers and the per-job archive sets they belong to.

pub mod backup_set;
pub mod builder;

pub use backup_set::{ArchiveFile, BackupSet};
pub use builder::{ArchiveBuilder, BuildStats};
