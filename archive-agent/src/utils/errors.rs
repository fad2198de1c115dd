//! Custom error types for the archive agent.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ignore file error: {0}")]
    IgnoreFile(String),

    #[error("Traversal error at {path}: {source}")]
    Traversal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive write error for {path}: {source}")]
    ArchiveWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checksum error for {path}: {source}")]
    Checksum {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete {path}: {source}")]
    Deletion {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive build cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    pub(crate) fn traversal(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Traversal { path: path.into(), source }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ArchiveWrite { path: path.into(), source }
    }

    /// Whether the remaining jobs of the current pass must be skipped.
    ///
    /// Build, traversal and checksum failures only abort their own job.
    /// A failed deletion leaves the output directory in a state the next
    /// job's retention cannot reason about, so it stops the pass.
    pub fn is_fatal_to_pass(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::IgnoreFile(_) | Self::Deletion { .. } | Self::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_fatality() {
        let deletion = ArchiveError::Deletion {
            path: PathBuf::from("/out/docs@1.zip"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(deletion.is_fatal_to_pass());
        assert!(ArchiveError::Cancelled.is_fatal_to_pass());

        let traversal = ArchiveError::traversal(
            "/src/gone.txt",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(!traversal.is_fatal_to_pass());

        let checksum = ArchiveError::Checksum {
            path: PathBuf::from("/out/docs@2.zip"),
            source: std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
        };
        assert!(!checksum.is_fatal_to_pass());
    }

    #[test]
    fn test_display_includes_path() {
        let err = ArchiveError::write(
            "/readonly/docs@5.zip",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(err.to_string().contains("/readonly/docs@5.zip"));
    }
}
