//! Exclusion rules for archive entries.
//!
//! A job either lists exceptions explicitly or defers to the ignore file at
//! the root of its tree. Exactly one of the two applies per job.

use crate::config::JobConfig;
use crate::utils::errors::{ArchiveError, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

#[derive(Debug, Clone)]
pub enum PathMatcher {
    /// Nothing is excluded
    None,

    /// Entry is excluded when its name equals an exception, or its
    /// root-relative path equals one or lies beneath it.
    Exceptions(Vec<String>),

    /// Rules from a single ignore file at the tree root, loaded once.
    IgnoreFile(Gitignore),
}

impl PathMatcher {
    /// Build the matcher for a job. Ignore files are read here, so a missing
    /// or malformed file fails before anything is written.
    pub fn for_job(job: &JobConfig) -> Result<Self> {
        match &job.ignore_file {
            Some(path) => Self::from_ignore_file(&job.source_path, path),
            None => Ok(Self::from_exceptions(&job.exceptions)),
        }
    }

    pub fn from_exceptions(exceptions: &[String]) -> Self {
        let normalized: Vec<String> = exceptions
            .iter()
            .map(|e| e.trim_start_matches("./").trim_end_matches('/').to_string())
            .filter(|e| !e.is_empty())
            .collect();

        if normalized.is_empty() {
            PathMatcher::None
        } else {
            PathMatcher::Exceptions(normalized)
        }
    }

    /// Parse `ignore_file` with `root` as the directory patterns are anchored to.
    pub fn from_ignore_file(root: &Path, ignore_file: &Path) -> Result<Self> {
        if !ignore_file.is_file() {
            return Err(ArchiveError::IgnoreFile(format!(
                "{} does not exist or is not a file",
                ignore_file.display()
            )));
        }

        let mut builder = GitignoreBuilder::new(root);
        if let Some(err) = builder.add(ignore_file) {
            return Err(ArchiveError::IgnoreFile(format!(
                "{}: {}",
                ignore_file.display(),
                err
            )));
        }
        let gitignore = builder
            .build()
            .map_err(|e| ArchiveError::IgnoreFile(format!("{}: {}", ignore_file.display(), e)))?;

        tracing::debug!(
            file = %ignore_file.display(),
            rules = gitignore.num_ignores() + gitignore.num_whitelists(),
            "Loaded ignore rules"
        );
        Ok(PathMatcher::IgnoreFile(gitignore))
    }

    /// Whether an entry must be left out of the archive.
    ///
    /// `full_path` is the entry on disk, `relative` its slash-separated path
    /// below the tree root (without the root folder name).
    pub fn is_excluded(&self, full_path: &Path, relative: &str, is_dir: bool) -> bool {
        match self {
            PathMatcher::None => false,
            PathMatcher::Exceptions(exceptions) => {
                let name = relative.rsplit('/').next().unwrap_or(relative);
                exceptions
                    .iter()
                    .any(|e| name == e || is_under(relative, e))
            }
            PathMatcher::IgnoreFile(gitignore) => gitignore.matched(full_path, is_dir).is_ignore(),
        }
    }
}

/// `relative` is `prefix` itself or a path below it, compared on whole segments.
fn is_under(relative: &str, prefix: &str) -> bool {
    relative
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn exceptions(list: &[&str]) -> PathMatcher {
        PathMatcher::from_exceptions(&list.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_empty_exceptions_match_nothing() {
        let matcher = exceptions(&[]);
        assert!(matches!(matcher, PathMatcher::None));
        assert!(!matcher.is_excluded(Path::new("/src/a.txt"), "a.txt", false));
    }

    #[test]
    fn test_exception_name_matches_at_any_depth() {
        let matcher = exceptions(&["node_modules"]);
        assert!(matcher.is_excluded(Path::new("/s/node_modules"), "node_modules", true));
        assert!(matcher.is_excluded(
            Path::new("/s/web/node_modules"),
            "web/node_modules",
            true
        ));
        assert!(!matcher.is_excluded(Path::new("/s/web/app.js"), "web/app.js", false));
    }

    #[test]
    fn test_exception_relative_prefix() {
        let matcher = exceptions(&["data/cache/", "tmp"]);
        assert!(matcher.is_excluded(Path::new("/s/data/cache"), "data/cache", true));
        assert!(matcher.is_excluded(Path::new("/s/data/cache/x"), "data/cache/x", false));
        assert!(!matcher.is_excluded(Path::new("/s/data/keep"), "data/keep", false));
        // Whole segments only: `data/cache` does not cover `data/cache_keep`
        assert!(!matcher.is_excluded(
            Path::new("/s/data/cache_keep/x"),
            "data/cache_keep/x",
            false
        ));
        assert!(!matcher.is_excluded(Path::new("/s/tmp.old"), "tmp.old", false));
        assert!(matcher.is_excluded(Path::new("/s/tmp/a"), "tmp/a", false));
        // Nested paths only match on name, not on an inner prefix
        assert!(!matcher.is_excluded(Path::new("/s/a/tmpfile"), "a/tmpfile", false));
    }

    #[test]
    fn test_ignore_file_rules() -> std::io::Result<()> {
        let root = TempDir::new()?;
        let ignore = root.path().join(".gitignore");
        fs::write(&ignore, "# build output\n\n*.log\ntarget/\n!keep.log\n")?;

        let matcher = PathMatcher::from_ignore_file(root.path(), &ignore)
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        let p = |rel: &str| root.path().join(rel);
        assert!(matcher.is_excluded(&p("debug.log"), "debug.log", false));
        assert!(matcher.is_excluded(&p("sub/trace.log"), "sub/trace.log", false));
        assert!(!matcher.is_excluded(&p("keep.log"), "keep.log", false));
        assert!(matcher.is_excluded(&p("target"), "target", true));
        // Directory-only pattern does not hit a file with the same name
        assert!(!matcher.is_excluded(&p("target"), "target", false));
        assert!(!matcher.is_excluded(&p("src/main.rs"), "src/main.rs", false));
        Ok(())
    }

    #[test]
    fn test_missing_ignore_file_fails() {
        let root = TempDir::new().unwrap();
        let err = PathMatcher::from_ignore_file(root.path(), &root.path().join(".gitignore"))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::IgnoreFile(_)));
    }

    #[test]
    fn test_for_job_selects_mode() -> std::io::Result<()> {
        let root = TempDir::new()?;
        fs::write(root.path().join(".gitignore"), "*.tmp\n")?;

        let mut job = JobConfig::new("job", root.path());
        job.exceptions = vec!["a".into()];
        assert!(matches!(
            PathMatcher::for_job(&job),
            Ok(PathMatcher::Exceptions(_))
        ));

        job.ignore_file = Some(root.path().join(".gitignore"));
        assert!(matches!(
            PathMatcher::for_job(&job),
            Ok(PathMatcher::IgnoreFile(_))
        ));
        Ok(())
    }
}
