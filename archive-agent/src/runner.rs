//! One backup pass: for every job, build the archive, then apply the
//! duplicate check and retention to that job's archive set.
//!
//! Jobs run strictly one after another. A job that fails to build is
//! reported and the next job still runs; failures that leave the output
//! directory in an unknown state (a failed deletion) end the pass.

use crate::archive::backup_set::{ArchiveFile, BackupSet};
use crate::archive::builder::{ArchiveBuilder, BuildStats};
use crate::config::{split_output_prefix, Config, JobConfig};
use crate::fs::matcher::PathMatcher;
use crate::fs::walker::TreeWalker;
use crate::utils::errors::{ArchiveError, Result};
use crate::utils::format::{format_bytes, format_duration};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Source of the timestamp embedded in archive names
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Handle on the archive currently being written.
///
/// Shared with the shutdown path: it can request cancellation and remove
/// an archive that was left behind unfinished.
#[derive(Clone, Default)]
pub struct InFlight {
    current: Arc<Mutex<Option<PathBuf>>>,
    cancel: CancellationToken,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the archive being built right now, if any
    pub fn current(&self) -> Option<PathBuf> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ask the running build to stop at the next entry; no further jobs start.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Delete the in-progress archive, if one is still recorded.
    pub fn discard_current(&self) -> Result<Option<PathBuf>> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(path) = current.take() else {
            return Ok(None);
        };
        if let Err(e) = crate::archive::builder::remove_partial(&path) {
            *current = Some(path);
            return Err(e);
        }
        Ok(Some(path))
    }

    fn set(&self, path: Option<PathBuf>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = path;
    }

    fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// What one successful job did
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: String,
    /// Archive written by this pass
    pub archive: PathBuf,
    pub stats: BuildStats,
    pub elapsed: Duration,
    /// The new archive matched its predecessor and was deleted
    pub duplicate: bool,
    pub evicted: Vec<ArchiveFile>,
    /// Archives of the job left on disk
    pub retained: usize,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub job: String,
    pub result: Result<JobReport>,
}

#[derive(Debug)]
pub struct PassReport {
    pub outcomes: Vec<JobOutcome>,
    pub elapsed: Duration,
    /// The pass stopped before all jobs ran
    pub aborted: bool,
    /// Jobs that did not run because the pass stopped early
    pub skipped: Vec<String>,
}

impl PassReport {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }
}

/// Current state of a job's archive set, without changing anything
#[derive(Debug, Clone)]
pub struct SetEvaluation {
    pub job: String,
    pub archives: Vec<ArchiveFile>,
    /// Archives retention would delete now
    pub would_evict: Vec<ArchiveFile>,
    /// Newest and previous archive share a checksum. `None` if the check is
    /// disabled for the job or there are fewer than two archives.
    pub newest_is_duplicate: Option<bool>,
}

pub struct BackupRunner {
    output_prefix: String,
    jobs: Vec<JobConfig>,
    clock: Arc<dyn Clock>,
    in_flight: InFlight,
}

impl BackupRunner {
    /// `output_prefix` is prepended verbatim to `<name>@<ts>.zip`.
    pub fn new(output_prefix: impl Into<String>, jobs: Vec<JobConfig>) -> Self {
        Self {
            output_prefix: output_prefix.into(),
            jobs,
            clock: Arc::new(SystemClock),
            in_flight: InFlight::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.path.clone(), config.resolve_jobs())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn in_flight(&self) -> InFlight {
        self.in_flight.clone()
    }

    pub fn jobs(&self) -> &[JobConfig] {
        &self.jobs
    }

    /// Build every job's matcher. Ignore files are read here, once per
    /// pass, so a broken one stops the pass before any archive is written.
    pub fn prepare_matchers(&self) -> Result<Vec<PathMatcher>> {
        self.jobs.iter().map(PathMatcher::for_job).collect()
    }

    /// Run every job once.
    ///
    /// Returns `Err` only when the pass could not start; per-job failures
    /// are reported in the outcomes.
    pub fn run_pass(&self) -> Result<PassReport> {
        let matchers = self.prepare_matchers()?;
        Ok(self.run_jobs(&matchers, |job, matcher| self.run_job(job, matcher)))
    }

    /// Run `run` for each job in order, stopping at cancellation or at the
    /// first error that is fatal to the pass.
    fn run_jobs<F>(&self, matchers: &[PathMatcher], mut run: F) -> PassReport
    where
        F: FnMut(&JobConfig, &PathMatcher) -> Result<JobReport>,
    {
        let start = Instant::now();
        let mut outcomes = Vec::with_capacity(self.jobs.len());
        let mut aborted = false;

        for (job, matcher) in self.jobs.iter().zip(matchers) {
            if self.in_flight.is_cancelled() {
                aborted = true;
                break;
            }

            let result = run(job, matcher);
            let fatal = match &result {
                Ok(report) => {
                    log_report(report);
                    false
                }
                Err(e) => {
                    error!(job = %job.name, error = %e, "Backup failed");
                    e.is_fatal_to_pass()
                }
            };

            outcomes.push(JobOutcome {
                job: job.name.clone(),
                result,
            });

            if fatal {
                aborted = true;
                break;
            }
        }

        let skipped: Vec<String> = self.jobs[outcomes.len()..]
            .iter()
            .map(|job| job.name.clone())
            .collect();
        if !skipped.is_empty() {
            warn!(skipped = %skipped.join(", "), "Pass stopped early, remaining jobs skipped");
        }

        let elapsed = start.elapsed();
        info!(elapsed = %format_duration(elapsed), jobs = outcomes.len(), "Pass finished");

        PassReport {
            outcomes,
            elapsed,
            aborted,
            skipped,
        }
    }

    /// Build one archive, then deduplicate and evict within the job's set.
    pub fn run_job(&self, job: &JobConfig, matcher: &PathMatcher) -> Result<JobReport> {
        let start = Instant::now();
        let (archive, stats) = self.build_archive(job, matcher)?;
        let elapsed = start.elapsed();

        let set = self.backup_set(job)?;
        post_process(job, archive, stats, elapsed, set)
    }

    /// List a job's archives.
    pub fn backup_set(&self, job: &JobConfig) -> Result<BackupSet> {
        let (dir, file_prefix) = split_output_prefix(&self.output_prefix);
        BackupSet::load(&dir, &format!("{}{}", file_prefix, job.name))
    }

    /// Report each job's archives and what the post-processing would do to
    /// them right now.
    pub fn evaluate(&self) -> Vec<(String, Result<SetEvaluation>)> {
        self.jobs
            .iter()
            .map(|job| (job.name.clone(), self.evaluate_job(job)))
            .collect()
    }

    fn evaluate_job(&self, job: &JobConfig) -> Result<SetEvaluation> {
        let set = self.backup_set(job)?;
        let newest_is_duplicate = if job.skip_dedup_check {
            None
        } else {
            set.newest_matches_previous()?
        };
        Ok(SetEvaluation {
            job: job.name.clone(),
            would_evict: set.plan_eviction(job.retain_count).to_vec(),
            archives: set.archives().to_vec(),
            newest_is_duplicate,
        })
    }

    fn build_archive(&self, job: &JobConfig, matcher: &PathMatcher) -> Result<(PathBuf, BuildStats)> {
        let stem = PathBuf::from(format!(
            "{}{}@{}",
            self.output_prefix,
            job.name,
            self.clock.now_unix()
        ));

        let mut builder = ArchiveBuilder::create(&stem)?;
        let archive = builder.path().to_path_buf();
        self.in_flight.set(Some(archive.clone()));
        info!(job = %job.name, archive = %archive.display(), "Archiving {}", job.source_path.display());

        let result = TreeWalker::new(&job.source_path, job.include_root_folder, matcher)
            .and_then(|walker| builder.add_all(walker, self.in_flight.token()))
            .and_then(|()| builder.close());

        match result {
            Ok(stats) => {
                self.in_flight.set(None);
                Ok((archive, stats))
            }
            Err(e) => {
                discard_partial(&mut builder, &self.in_flight);
                Err(e)
            }
        }
    }
}

/// Duplicate check and retention for a freshly built `archive`, whose
/// family listing is `set`. A failure here never touches `archive` itself
/// unless it was found to be a duplicate.
fn post_process(
    job: &JobConfig,
    archive: PathBuf,
    stats: BuildStats,
    elapsed: Duration,
    mut set: BackupSet,
) -> Result<JobReport> {
    let is_newest = set.newest().map(|a| a.path.as_path()) == Some(archive.as_path());

    let duplicate = if job.skip_dedup_check {
        false
    } else if !is_newest {
        // The comparison would be between two older archives
        warn!(
            job = %job.name,
            archive = %archive.display(),
            "New archive is not the newest of its set, skipping duplicate check; system clock went backwards?"
        );
        false
    } else {
        set.dedup_newest()?.is_some()
    };

    let evicted = set.evict(job.retain_count)?;

    Ok(JobReport {
        job: job.name.clone(),
        archive,
        stats,
        elapsed,
        duplicate,
        evicted,
        retained: set.len(),
    })
}

/// Remove a failed build's file. If that fails the path stays recorded in
/// `in_flight` so shutdown can try again.
fn discard_partial(builder: &mut ArchiveBuilder, in_flight: &InFlight) {
    match builder.abort() {
        Ok(()) => in_flight.set(None),
        Err(e) => error!(archive = %builder.path().display(), error = %e, "Failed to remove partial archive"),
    }
}

fn log_report(report: &JobReport) {
    let name = file_name(&report.archive);
    if report.duplicate {
        info!(
            job = %report.job,
            archive = %name,
            elapsed = %format_duration(report.elapsed),
            retained = report.retained,
            "Unchanged since previous archive"
        );
    } else {
        info!(
            job = %report.job,
            archive = %name,
            entries = report.stats.entries(),
            size = %format_bytes(report.stats.archive_size),
            source = %format_bytes(report.stats.bytes_read),
            elapsed = %format_duration(report.elapsed),
            retained = report.retained,
            "Successfully archived"
        );
    }
    if !report.evicted.is_empty() {
        info!(job = %report.job, count = report.evicted.len(), "Evicted old archives");
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
