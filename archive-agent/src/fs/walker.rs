//! Directory traversal producing archive entries.
//!
//! Entries come out depth-first in pre-order: a directory is yielded before
//! its children, and an excluded directory is never descended into. Children
//! are visited in file-name order so that an unchanged tree produces the same
//! entry sequence on every pass.

use crate::fs::matcher::PathMatcher;
use crate::utils::errors::{ArchiveError, Result};
use std::fs::{self, File, Metadata};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// One record to be written to the archive.
#[derive(Debug)]
pub struct ArchiveEntry {
    /// Slash-separated record name, no leading slash
    pub relative_name: String,

    /// Is this a directory?
    pub is_dir: bool,

    /// Full path on disk
    pub source_path: PathBuf,

    /// Last modification time, if the platform reports one
    pub modified: Option<SystemTime>,

    /// File size in bytes (0 for directories)
    pub size: u64,

    /// Unix mode bits
    pub permissions: Option<u32>,

    /// Open handle on the file content. `None` for directories. Dropped by
    /// the consumer once the content has been copied.
    pub content: Option<File>,
}

/// Lazy, iterative walk over a source tree.
pub struct TreeWalker<'a> {
    root: PathBuf,
    root_name: Option<String>,
    matcher: &'a PathMatcher,
    inner: walkdir::IntoIter,
}

impl<'a> TreeWalker<'a> {
    /// Walk `root`, consulting `matcher` for every entry.
    ///
    /// With `include_root_folder`, every record name starts with the root
    /// folder's own name (`docs/a.txt`); otherwise contents sit at the
    /// archive root (`a.txt`).
    pub fn new(root: &Path, include_root_folder: bool, matcher: &'a PathMatcher) -> Result<Self> {
        let meta = fs::metadata(root).map_err(|e| ArchiveError::traversal(root, e))?;
        if !meta.is_dir() {
            return Err(ArchiveError::traversal(
                root,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "source is not a directory"),
            ));
        }

        let root_name = if include_root_folder {
            Some(folder_name(root)?)
        } else {
            None
        };

        let inner = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        Ok(Self {
            root: root.to_path_buf(),
            root_name,
            matcher,
            inner,
        })
    }

    fn archive_name(&self, relative: &str) -> String {
        match &self.root_name {
            Some(name) => format!("{}/{}", name, relative),
            None => relative.to_string(),
        }
    }

    fn open_entry(&self, entry: &DirEntry, metadata: Metadata, relative: &str) -> Result<ArchiveEntry> {
        let is_dir = metadata.is_dir();
        let content = if is_dir {
            None
        } else {
            // A file that vanished since listing must fail the run; an archive
            // silently missing it would look complete.
            Some(File::open(entry.path()).map_err(|e| ArchiveError::traversal(entry.path(), e))?)
        };

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = None;

        Ok(ArchiveEntry {
            relative_name: self.archive_name(relative),
            is_dir,
            source_path: entry.path().to_path_buf(),
            modified: metadata.modified().ok(),
            size: if is_dir { 0 } else { metadata.len() },
            permissions,
            content,
        })
    }
}

impl Iterator for TreeWalker<'_> {
    type Item = Result<ArchiveEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.root.clone());
                    return Some(Err(ArchiveError::traversal(path, err.into())));
                }
            };

            let metadata = match resolve_metadata(&entry) {
                Ok(Some(metadata)) => metadata,
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            };

            let relative = relative_name(&self.root, entry.path());
            if self.matcher.is_excluded(entry.path(), &relative, metadata.is_dir()) {
                debug!(entry = %relative, "Excluded from archive");
                if entry.file_type().is_dir() {
                    self.inner.skip_current_dir();
                }
                continue;
            }

            return Some(self.open_entry(&entry, metadata, &relative));
        }
    }
}

/// Metadata for an entry, following a symlink one level to its target.
/// Returns None for entries that are not archived: links to directories,
/// dangling links, and anything that is neither a regular file nor a
/// directory (FIFOs, sockets, device nodes).
fn resolve_metadata(entry: &DirEntry) -> Result<Option<Metadata>> {
    let metadata = if entry.path_is_symlink() {
        match fs::metadata(entry.path()) {
            Ok(resolved) if resolved.is_dir() => {
                debug!(path = %entry.path().display(), "Skipping symlink to directory");
                return Ok(None);
            }
            Ok(resolved) => resolved,
            Err(_) => {
                debug!(path = %entry.path().display(), "Skipping broken symlink");
                return Ok(None);
            }
        }
    } else {
        entry
            .metadata()
            .map_err(|e| ArchiveError::traversal(entry.path(), e.into()))?
    };

    // Opening a FIFO blocks until a writer shows up
    if !metadata.is_dir() && !metadata.is_file() {
        debug!(path = %entry.path().display(), "Skipping special file");
        return Ok(None);
    }
    Ok(Some(metadata))
}

/// Slash-separated path of `path` below `root`.
fn relative_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn folder_name(root: &Path) -> Result<String> {
    if let Some(name) = root.file_name() {
        return Ok(name.to_string_lossy().into_owned());
    }
    // `.` or `..` have no file name of their own
    let canonical = fs::canonicalize(root).map_err(|e| ArchiveError::traversal(root, e))?;
    Ok(canonical
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(root: &Path, include_root: bool, matcher: &PathMatcher) -> Result<Vec<String>> {
        TreeWalker::new(root, include_root, matcher)?
            .map(|entry| entry.map(|e| e.relative_name))
            .collect()
    }

    #[test]
    fn test_walk_empty_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        assert!(names(temp_dir.path(), false, &PathMatcher::None)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_pre_order() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("b/c"))?;
        fs::write(temp_dir.path().join("a.txt"), b"a")?;
        fs::write(temp_dir.path().join("b/c/d.txt"), b"d")?;
        fs::write(temp_dir.path().join("b/e.txt"), b"e")?;

        let found = names(temp_dir.path(), false, &PathMatcher::None)?;
        assert_eq!(found, vec!["a.txt", "b", "b/c", "b/c/d.txt", "b/e.txt"]);
        Ok(())
    }

    #[test]
    fn test_root_folder_prefix() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("docs");
        fs::create_dir_all(root.join("b"))?;
        fs::write(root.join("a.txt"), b"a")?;
        fs::write(root.join("b/.gitkeep"), b"")?;

        let found = names(&root, true, &PathMatcher::None)?;
        assert_eq!(found, vec!["docs/a.txt", "docs/b", "docs/b/.gitkeep"]);
        Ok(())
    }

    #[test]
    fn test_files_carry_content_and_dirs_do_not() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("sub"))?;
        fs::write(temp_dir.path().join("sub/file.txt"), b"12345")?;

        let entries: Vec<ArchiveEntry> =
            TreeWalker::new(temp_dir.path(), false, &PathMatcher::None)?.collect::<Result<_>>()?;
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dir);
        assert!(entries[0].content.is_none());
        assert!(!entries[1].is_dir);
        assert!(entries[1].content.is_some());
        assert_eq!(entries[1].size, 5);
        Ok(())
    }

    #[test]
    fn test_excluded_directory_is_not_descended() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("node_modules/pkg"))?;
        fs::write(temp_dir.path().join("node_modules/pkg/index.js"), b"x")?;
        fs::write(temp_dir.path().join("app.js"), b"y")?;

        let matcher = PathMatcher::from_exceptions(&["node_modules".to_string()]);
        let found = names(temp_dir.path(), false, &matcher)?;
        assert_eq!(found, vec!["app.js"]);
        Ok(())
    }

    #[test]
    fn test_ignore_file_negation_reincludes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::write(root.join(".gitignore"), "*.log\n!important.log\nbuild/\n")?;
        fs::write(root.join("debug.log"), b"x")?;
        fs::write(root.join("important.log"), b"y")?;
        fs::create_dir(root.join("build"))?;
        fs::write(root.join("build/out.bin"), b"z")?;

        let matcher = PathMatcher::from_ignore_file(root, &root.join(".gitignore"))?;
        let found = names(root, false, &matcher)?;
        assert_eq!(found, vec![".gitignore", "important.log"]);
        Ok(())
    }

    #[test]
    fn test_missing_root_is_traversal_error() {
        let result = TreeWalker::new(Path::new("/nonexistent/source"), true, &PathMatcher::None);
        assert!(matches!(result, Err(ArchiveError::Traversal { .. })));
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("src");
        fs::create_dir_all(root.join("dir"))?;
        fs::write(root.join("real.txt"), b"content")?;
        std::os::unix::fs::symlink(root.join("real.txt"), root.join("link.txt"))?;
        std::os::unix::fs::symlink(root.join("dir"), root.join("dirlink"))?;
        std::os::unix::fs::symlink(root.join("missing"), root.join("dangling"))?;

        let entries: Vec<ArchiveEntry> =
            TreeWalker::new(&root, false, &PathMatcher::None)?.collect::<Result<_>>()?;
        let found: Vec<&str> = entries.iter().map(|e| e.relative_name.as_str()).collect();
        assert_eq!(found, vec!["dir", "link.txt", "real.txt"]);
        assert_eq!(entries[1].size, 7);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_special_files_are_skipped() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::write(root.join("a.txt"), b"a")?;

        let status = std::process::Command::new("mkfifo")
            .arg(root.join("pipe"))
            .status()?;
        assert!(status.success());
        let _listener = std::os::unix::net::UnixListener::bind(root.join("sock"))?;

        let found = names(root, false, &PathMatcher::None)?;
        assert_eq!(found, vec!["a.txt"]);
        Ok(())
    }

    #[test]
    fn test_file_vanished_after_listing_fails() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::write(root.join("a.txt"), b"a")?;
        fs::write(root.join("b.txt"), b"b")?;

        let mut walker = TreeWalker::new(root, false, &PathMatcher::None)?;
        // The sorted walk reads the whole directory before yielding its first child
        let first = walker.next().transpose()?.map(|e| e.relative_name);
        assert_eq!(first.as_deref(), Some("a.txt"));

        fs::remove_file(root.join("b.txt"))?;
        assert!(matches!(
            walker.next(),
            Some(Err(ArchiveError::Traversal { .. }))
        ));
        Ok(())
    }

    #[test]
    fn test_nested_ignore_files_are_not_consulted() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir(root.join("sub"))?;
        fs::write(root.join(".gitignore"), "*.log\n")?;
        fs::write(root.join("sub/.gitignore"), "*.txt\n")?;
        fs::write(root.join("sub/x.txt"), b"x")?;
        fs::write(root.join("sub/y.log"), b"y")?;

        let matcher = PathMatcher::from_ignore_file(root, &root.join(".gitignore"))?;
        let found = names(root, false, &matcher)?;
        assert_eq!(found, vec![".gitignore", "sub", "sub/.gitignore", "sub/x.txt"]);
        Ok(())
    }
}
