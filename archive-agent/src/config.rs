//! Configuration management for the archive agent.
//!
//! Loads the job list from a TOML file, or from JSON when the file has a
//! `.json` extension so existing `config.json` files keep working.

use crate::utils::errors::{ArchiveError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_IGNORE_FILE: &str = ".gitignore";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Output prefix. Archives are written to `<path><name>@<ts>.zip`
    pub path: String,

    /// Run a single pass and exit
    #[serde(default, rename = "runonce")]
    pub run_once: bool,

    /// Seconds between pass starts
    #[serde(default = "default_interval")]
    pub interval: u64,

    #[serde(default)]
    pub log: LogConfig,

    /// Archived trees, processed in order
    #[serde(default)]
    pub files: Vec<JobEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One job as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEntry {
    /// Archive family name, used as filename prefix
    pub name: String,

    /// Source tree to archive
    pub path: PathBuf,

    /// Names or relative path prefixes to leave out
    #[serde(default, rename = "except")]
    pub exceptions: Vec<String>,

    /// Use the root ignore file instead of `except`. Absent means
    /// "use it if the tree has one".
    #[serde(default)]
    pub ignore_file: Option<bool>,

    #[serde(default = "default_ignore_file_name")]
    pub ignore_file_name: String,

    /// Put the source folder name in front of every record name
    #[serde(default = "default_true")]
    pub include_root_folder: bool,

    #[serde(default, rename = "skipCRCCheck")]
    pub skip_crc_check: bool,

    /// Archives to retain, 0 = unlimited
    #[serde(default)]
    pub keep_last_files: usize,
}

/// Resolved, immutable settings for one job during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub name: String,
    pub source_path: PathBuf,
    pub exceptions: Vec<String>,
    /// Ignore file to read when ignore-file mode is on
    pub ignore_file: Option<PathBuf>,
    pub include_root_folder: bool,
    pub skip_dedup_check: bool,
    pub retain_count: usize,
}

impl JobConfig {
    /// Minimal job with exception-list mode and no retention.
    pub fn new(name: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source_path: source_path.into(),
            exceptions: Vec::new(),
            ignore_file: None,
            include_root_folder: true,
            skip_dedup_check: false,
            retain_count: 0,
        }
    }
}

fn default_interval() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ignore_file_name() -> String {
    DEFAULT_IGNORE_FILE.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML or JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ArchiveError::Config(format!("unable to read {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let mut config: Config = if is_json {
            serde_json::from_str(&content)
                .map_err(|e| ArchiveError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            toml::from_str(&content)
                .map_err(|e| ArchiveError::Config(format!("{}: {}", path.display(), e)))?
        };

        config.normalize_output_path();
        config.validate()?;
        Ok(config)
    }

    /// Directory that holds the archives
    pub fn output_dir(&self) -> PathBuf {
        split_output_prefix(&self.path).0
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(ArchiveError::Config("`path` must not be empty".into()));
        }
        if self.files.is_empty() {
            return Err(ArchiveError::Config("no jobs configured under `files`".into()));
        }
        if !self.run_once && self.interval == 0 {
            return Err(ArchiveError::Config(
                "`interval` must be positive unless `runonce` is set".into(),
            ));
        }

        let mut seen = HashSet::new();
        for job in &self.files {
            if job.name.is_empty() {
                return Err(ArchiveError::Config("job name must not be empty".into()));
            }
            if job.name.contains(['@', '/', '\\']) {
                return Err(ArchiveError::Config(format!(
                    "job name {:?} must not contain '@' or path separators",
                    job.name
                )));
            }
            if !seen.insert(job.name.as_str()) {
                return Err(ArchiveError::Config(format!("duplicate job name {:?}", job.name)));
            }
        }

        Ok(())
    }

    /// Resolve the configured entries into per-job settings.
    pub fn resolve_jobs(&self) -> Vec<JobConfig> {
        self.files.iter().map(JobEntry::resolve).collect()
    }

    fn normalize_output_path(&mut self) {
        let has_separator =
            self.path.ends_with('/') || self.path.ends_with(std::path::MAIN_SEPARATOR);
        if !has_separator && Path::new(&self.path).is_dir() {
            self.path.push(std::path::MAIN_SEPARATOR);
        }
    }
}

impl JobEntry {
    fn resolve(&self) -> JobConfig {
        let candidate = self.path.join(&self.ignore_file_name);
        let ignore_file = match self.ignore_file {
            Some(true) => Some(candidate),
            Some(false) => None,
            None if candidate.is_file() => Some(candidate),
            None => None,
        };

        JobConfig {
            name: self.name.clone(),
            source_path: self.path.clone(),
            exceptions: self.exceptions.clone(),
            ignore_file,
            include_root_folder: self.include_root_folder,
            skip_dedup_check: self.skip_crc_check,
            retain_count: self.keep_last_files,
        }
    }
}

/// Split an output prefix such as `/backups/` or `/backups/host-` into the
/// directory holding the archives and the text every archive name starts with.
pub fn split_output_prefix(prefix: &str) -> (PathBuf, String) {
    if prefix.ends_with('/') || prefix.ends_with(std::path::MAIN_SEPARATOR) {
        return (PathBuf::from(prefix), String::new());
    }
    let path = Path::new(prefix);
    let file_part = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    (dir, file_part)
}
