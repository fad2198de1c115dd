//! Writes a walked tree into a single zip container.
//!
//! File records are deflated, directory records are stored with a trailing
//! slash and no content. The builder can be closed more than once and closed
//! after a failed build; removing a partial file is left to the caller.

use crate::fs::walker::ArchiveEntry;
use crate::utils::errors::{ArchiveError, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Counters for one build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub files: usize,
    pub directories: usize,
    /// Uncompressed bytes copied from the source tree
    pub bytes_read: u64,
    /// Size of the finished container on disk
    pub archive_size: u64,
}

impl BuildStats {
    pub fn entries(&self) -> usize {
        self.files + self.directories
    }
}

pub struct ArchiveBuilder {
    path: PathBuf,
    writer: Option<ZipWriter<BufWriter<File>>>,
    stats: BuildStats,
}

impl ArchiveBuilder {
    /// Open a new container at `target + ".zip"`.
    ///
    /// Fails if the path cannot be written or already exists: an archive is
    /// never overwritten.
    pub fn create(target: &Path) -> Result<Self> {
        let mut name = OsString::from(target.as_os_str());
        name.push(".zip");
        let path = PathBuf::from(name);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| ArchiveError::write(&path, e))?;

        debug!(archive = %path.display(), "Opened archive for writing");
        Ok(Self {
            path,
            writer: Some(ZipWriter::new(BufWriter::new(file))),
            stats: BuildStats::default(),
        })
    }

    /// Path of the container being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Write every entry of `entries`, stopping at the first error or when
    /// `cancel` fires.
    pub fn add_all<I>(&mut self, entries: I, cancel: &CancellationToken) -> Result<()>
    where
        I: IntoIterator<Item = Result<ArchiveEntry>>,
    {
        for entry in entries {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            self.add_entry(entry?)?;
        }
        Ok(())
    }

    /// Write one record. The entry's content handle is dropped before this
    /// returns, whether or not the write succeeded.
    pub fn add_entry(&mut self, mut entry: ArchiveEntry) -> Result<()> {
        let path = self.path.clone();
        let writer = self.writer.as_mut().ok_or_else(|| {
            ArchiveError::write(&path, io::Error::other("archive is already closed"))
        })?;

        let method = if entry.is_dir {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        let mut options = SimpleFileOptions::default()
            .compression_method(method)
            .last_modified_time(zip_time(entry.modified))
            .large_file(entry.size >= u64::from(u32::MAX));
        if let Some(mode) = entry.permissions {
            options = options.unix_permissions(mode & 0o7777);
        }

        if entry.is_dir {
            writer
                .add_directory(format!("{}/", entry.relative_name), options)
                .map_err(|e| ArchiveError::write(&path, zip_io(e)))?;
            self.stats.directories += 1;
            return Ok(());
        }

        writer
            .start_file(entry.relative_name.as_str(), options)
            .map_err(|e| ArchiveError::write(&path, zip_io(e)))?;

        if let Some(mut content) = entry.content.take() {
            let copied = copy_content(&mut content, writer, &entry.source_path, &path)?;
            self.stats.bytes_read += copied;
        }
        self.stats.files += 1;
        Ok(())
    }

    /// Finish the container: central directory, flush, sync.
    ///
    /// A second call returns the stats of the first without touching the file.
    pub fn close(&mut self) -> Result<BuildStats> {
        if let Some(writer) = self.writer.take() {
            let mut inner = writer
                .finish()
                .map_err(|e| ArchiveError::write(&self.path, zip_io(e)))?;
            inner.flush().map_err(|e| ArchiveError::write(&self.path, e))?;
            inner
                .get_ref()
                .sync_all()
                .map_err(|e| ArchiveError::write(&self.path, e))?;
            self.stats.archive_size = fs::metadata(&self.path)
                .map_err(|e| ArchiveError::write(&self.path, e))?
                .len();
        }
        Ok(self.stats.clone())
    }

    /// Close whatever was written and delete the partial container.
    pub fn abort(&mut self) -> Result<()> {
        if let Err(e) = self.close() {
            warn!(archive = %self.path.display(), error = %e, "Failed to finalize partial archive");
        }
        remove_partial(&self.path)
    }
}

/// Delete a partial archive. A file that is already gone is not an error.
pub fn remove_partial(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(archive = %path.display(), "Removed partial archive");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ArchiveError::Deletion {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Copy a file's content into the current record, keeping read failures
/// (source side) apart from write failures (archive side).
fn copy_content<W: Write>(
    reader: &mut File,
    writer: &mut W,
    source: &Path,
    archive: &Path,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ArchiveError::traversal(source, e)),
        };
        writer
            .write_all(&buf[..n])
            .map_err(|e| ArchiveError::write(archive, e))?;
        total += n as u64;
    }
}

fn zip_io(err: zip::result::ZipError) -> io::Error {
    match err {
        zip::result::ZipError::Io(e) => e,
        other => io::Error::other(other),
    }
}

/// Record timestamp in UTC. The container cannot represent dates before 1980;
/// those fall back to its epoch.
fn zip_time(modified: Option<SystemTime>) -> zip::DateTime {
    let Some(modified) = modified else {
        return zip::DateTime::default();
    };
    let dt: DateTime<Utc> = modified.into();
    let (Ok(year), Ok(month), Ok(day), Ok(hour), Ok(minute), Ok(second)) = (
        u16::try_from(dt.year()),
        u8::try_from(dt.month()),
        u8::try_from(dt.day()),
        u8::try_from(dt.hour()),
        u8::try_from(dt.minute()),
        u8::try_from(dt.second()),
    ) else {
        return zip::DateTime::default();
    };
    zip::DateTime::from_date_and_time(year, month, day, hour, minute, second).unwrap_or_default()
}
