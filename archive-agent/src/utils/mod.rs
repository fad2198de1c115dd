//! Utility modules for the archive agent.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{ArchiveError, Result};
