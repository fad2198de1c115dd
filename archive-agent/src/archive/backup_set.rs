//! The archives of one job in the output directory, oldest first.
//!
//! Archives are named `<family>@<unix seconds>.zip`. The timestamp is the only
//! ordering key; it is compared as an integer so that names keep sorting
//! correctly when the timestamp gains a digit.

use crate::utils::errors::{ArchiveError, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const ARCHIVE_EXTENSION: &str = ".zip";

/// An archive file on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    pub path: PathBuf,
    pub file_name: String,
    pub timestamp: i64,
    pub size: u64,
}

#[derive(Debug)]
pub struct BackupSet {
    family: String,
    archives: Vec<ArchiveFile>,
}

impl BackupSet {
    /// List the archives of `family` in `dir`, ascending by timestamp.
    ///
    /// Names that start with `family@` but do not carry an integer timestamp
    /// are not archives of this job and are left alone.
    pub fn load(dir: &Path, family: &str) -> Result<Self> {
        let prefix = format!("{}@", family);
        let mut archives = Vec::new();

        let read_dir = fs::read_dir(dir).map_err(|e| ArchiveError::traversal(dir, e))?;
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|e| ArchiveError::traversal(dir, e))?;
            let file_name = dir_entry.file_name().to_string_lossy().into_owned();
            if !file_name.starts_with(&prefix) {
                continue;
            }

            let Some(timestamp) = parse_timestamp(&file_name, family) else {
                warn!(file = %file_name, "Ignoring file that does not look like an archive of this job");
                continue;
            };

            let metadata = dir_entry
                .metadata()
                .map_err(|e| ArchiveError::traversal(dir_entry.path(), e))?;
            if !metadata.is_file() {
                continue;
            }

            archives.push(ArchiveFile {
                path: dir_entry.path(),
                file_name,
                timestamp,
                size: metadata.len(),
            });
        }

        archives.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });

        Ok(Self {
            family: family.to_string(),
            archives,
        })
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn archives(&self) -> &[ArchiveFile] {
        &self.archives
    }

    pub fn len(&self) -> usize {
        self.archives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }

    pub fn newest(&self) -> Option<&ArchiveFile> {
        self.archives.last()
    }

    /// Whether the newest archive has the same checksum as the one before it.
    /// `None` when there are fewer than two archives to compare.
    pub fn newest_matches_previous(&self) -> Result<Option<bool>> {
        let count = self.archives.len();
        if count < 2 {
            return Ok(None);
        }

        let newest = &self.archives[count - 1];
        let previous = &self.archives[count - 2];

        let new_hash = checksum(&newest.path)?;
        debug!(archive = %newest.file_name, crc32 = %format_args!("{:08x}", new_hash), "New archive checksum");
        let old_hash = checksum(&previous.path)?;
        debug!(archive = %previous.file_name, crc32 = %format_args!("{:08x}", old_hash), "Previous archive checksum");

        Ok(Some(new_hash == old_hash))
    }

    /// Delete the newest archive if its checksum equals the one before it.
    ///
    /// Only the immediate predecessor is compared. With fewer than two
    /// archives there is nothing to compare and nothing happens. Returns the
    /// deleted archive, if any.
    pub fn dedup_newest(&mut self) -> Result<Option<ArchiveFile>> {
        match self.newest_matches_previous()? {
            None => {
                debug!(family = %self.family, "Fewer than two archives, skipping duplicate check");
                return Ok(None);
            }
            Some(false) => return Ok(None),
            Some(true) => {}
        }

        let Some(newest) = self.archives.pop() else {
            return Ok(None);
        };
        info!(archive = %newest.file_name, "Same checksum as previous archive, deleting");
        if let Err(e) = delete_archive(&newest.path) {
            self.archives.push(newest);
            return Err(e);
        }
        Ok(Some(newest))
    }

    /// Archives that eviction with `retain_count` would delete, oldest first.
    /// Empty when `retain_count` is 0 (unlimited) or not exceeded.
    pub fn plan_eviction(&self, retain_count: usize) -> &[ArchiveFile] {
        if retain_count == 0 {
            return &[];
        }
        let excess = self.archives.len().saturating_sub(retain_count);
        &self.archives[..excess]
    }

    /// Delete everything but the newest `retain_count` archives.
    ///
    /// Stops at the first failed deletion; archives deleted before that stay
    /// deleted and are no longer listed.
    pub fn evict(&mut self, retain_count: usize) -> Result<Vec<ArchiveFile>> {
        let excess = self.plan_eviction(retain_count).len();
        if excess == 0 {
            if retain_count != 0 {
                debug!(family = %self.family, count = self.archives.len(), retain_count, "Nothing to evict");
            }
            return Ok(Vec::new());
        }

        let mut evicted = Vec::with_capacity(excess);
        for _ in 0..excess {
            delete_archive(&self.archives[0].path)?;
            let removed = self.archives.remove(0);
            info!(archive = %removed.file_name, "Evicted archive");
            evicted.push(removed);
        }
        Ok(evicted)
    }
}

/// Extract the timestamp from `<family>@<digits>.zip`.
pub fn parse_timestamp(file_name: &str, family: &str) -> Option<i64> {
    let digits = file_name
        .strip_prefix(family)?
        .strip_prefix('@')?
        .strip_suffix(ARCHIVE_EXTENSION)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// CRC-32 over the whole file.
pub fn checksum(path: &Path) -> Result<u32> {
    let to_err = |source: io::Error| ArchiveError::Checksum {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = BufReader::new(File::open(path).map_err(to_err)?);
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(to_err(e)),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

fn delete_archive(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(|source| ArchiveError::Deletion {
        path: path.to_path_buf(),
        source,
    })
}
