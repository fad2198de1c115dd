//! Fixed-interval pass loop.
//!
//! Each pass runs on the blocking pool and is awaited before the next tick
//! is considered, so two passes never overlap. A late pass delays the
//! schedule instead of triggering a burst of catch-up passes.

use crate::runner::{BackupRunner, PassReport};
use crate::utils::errors::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// How long shutdown waits for the running build to notice cancellation
const PASS_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Single pass finished
    Completed,
    /// Shutdown while idle between passes
    Shutdown,
    /// Shutdown while a pass was running; its archive was discarded
    Interrupted,
}

pub struct Scheduler {
    runner: Arc<BackupRunner>,
    period: Duration,
}

impl Scheduler {
    pub fn new(runner: Arc<BackupRunner>, period: Duration) -> Self {
        Self { runner, period }
    }

    /// Run passes until shutdown. With `run_once`, returns after the first.
    ///
    /// A pass that cannot start (for example an ignore file that went
    /// missing) is logged and retried on the next tick; only a single-pass
    /// run returns the error.
    pub async fn run(&self, run_once: bool, mut shutdown: broadcast::Receiver<()>) -> Result<Exit> {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => return Ok(Exit::Shutdown),
            }

            let mut pass = self.spawn_pass();
            let report = tokio::select! {
                joined = &mut pass => joined,
                _ = shutdown.recv() => {
                    self.stop_running_pass(pass).await;
                    return Ok(Exit::Interrupted);
                }
            };

            match report {
                Ok(Ok(report)) => summarize(&report),
                Ok(Err(e)) if run_once => return Err(e),
                Ok(Err(e)) => error!(error = %e, "Backup pass could not start"),
                Err(e) => error!("Backup pass panicked: {}", e),
            }

            if run_once {
                return Ok(Exit::Completed);
            }
        }
    }

    fn spawn_pass(&self) -> JoinHandle<Result<PassReport>> {
        let runner = Arc::clone(&self.runner);
        tokio::task::spawn_blocking(move || runner.run_pass())
    }

    /// Cancel the running build, wait for it to unwind and remove any archive
    /// it left behind.
    async fn stop_running_pass(&self, pass: JoinHandle<Result<PassReport>>) {
        let in_flight = self.runner.in_flight();
        in_flight.cancel();

        if tokio::time::timeout(PASS_STOP_TIMEOUT, pass).await.is_err() {
            warn!("Backup pass did not stop within {:?}", PASS_STOP_TIMEOUT);
        }

        match in_flight.discard_current() {
            Ok(Some(path)) => info!(archive = %path.display(), "Deleted incomplete archive"),
            Ok(None) => {}
            Err(e) => error!(error = %e, "Failed to delete incomplete archive"),
        }
    }
}

fn summarize(report: &PassReport) {
    let failed = report.failed();
    if failed > 0 || report.aborted {
        warn!(
            failed,
            completed = report.outcomes.len() - failed,
            skipped = report.skipped.len(),
            aborted = report.aborted,
            "Pass finished with failures"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use std::fs;
    use tempfile::TempDir;

    fn runner(temp: &TempDir) -> std::io::Result<Arc<BackupRunner>> {
        let source = temp.path().join("src");
        let out = temp.path().join("out");
        fs::create_dir_all(&source)?;
        fs::create_dir_all(&out)?;
        fs::write(source.join("file.txt"), b"data")?;
        Ok(Arc::new(BackupRunner::new(
            format!("{}/", out.display()),
            vec![JobConfig::new("src", source)],
        )))
    }

    #[tokio::test]
    async fn test_run_once_completes() -> Result<()> {
        let temp = TempDir::new()?;
        let scheduler = Scheduler::new(runner(&temp)?, Duration::from_secs(3600));
        let (_tx, rx) = broadcast::channel(1);

        assert_eq!(scheduler.run(true, rx).await?, Exit::Completed);
        assert_eq!(fs::read_dir(temp.path().join("out"))?.count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_pass_that_cannot_start_keeps_daemon_running() -> Result<()> {
        let temp = TempDir::new()?;
        let source = temp.path().join("src");
        let out = temp.path().join("out");
        fs::create_dir_all(&source)?;
        fs::create_dir_all(&out)?;
        let mut job = JobConfig::new("src", &source);
        job.ignore_file = Some(source.join(".gitignore"));
        let runner = Arc::new(BackupRunner::new(format!("{}/", out.display()), vec![job]));

        let once = Scheduler::new(Arc::clone(&runner), Duration::from_millis(50));
        let (_tx, rx) = broadcast::channel(1);
        assert!(matches!(
            once.run(true, rx).await,
            Err(crate::ArchiveError::IgnoreFile(_))
        ));

        let scheduler = Scheduler::new(runner, Duration::from_millis(50));
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { scheduler.run(false, rx).await });
        // Several ticks fail to start a pass before shutdown arrives
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_finished());
        tx.send(()).ok();

        let exit = handle
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;
        assert!(matches!(exit, Exit::Shutdown | Exit::Interrupted));
        assert_eq!(fs::read_dir(&out)?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_while_idle() -> Result<()> {
        let temp = TempDir::new()?;
        let scheduler = Scheduler::new(runner(&temp)?, Duration::from_secs(3600));
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move { scheduler.run(false, rx).await });
        // Let the first pass finish, then stop during the wait for the next tick
        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(()).ok();

        let exit = handle
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;
        assert_eq!(exit, Exit::Shutdown);
        assert_eq!(fs::read_dir(temp.path().join("out"))?.count(), 1);
        Ok(())
    }
}
