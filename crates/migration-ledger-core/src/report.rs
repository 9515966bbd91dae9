use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{
    ErrorTypeCount, FileAggregate, LedgerConfig, LedgerError, LedgerReader, MigrationRun,
    RunStatus,
};

pub const RECENT_FINISHED_RUNS: usize = 3;
pub const TOP_ERROR_TYPES: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    NotStarted,
    BackupRunning,
    BackupComplete,
    FullMigration,
}

impl MigrationPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::BackupRunning => "backup_running",
            Self::BackupComplete => "backup_complete",
            Self::FullMigration => "full_migration",
        }
    }

    fn derive(files: &FileAggregate, has_running: bool) -> Self {
        if files.fully_migrated_count > 0 {
            Self::FullMigration
        } else if has_running {
            Self::BackupRunning
        } else if files.total_files > 0 {
            Self::BackupComplete
        } else {
            Self::NotStarted
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupProgress {
    pub backed_up: u64,
    pub expected_total: u64,
    /// `None` when no expected total is configured.
    pub percent: Option<f64>,
}

impl BackupProgress {
    #[allow(clippy::cast_precision_loss)]
    fn new(backed_up: u64, expected_total: u64) -> Self {
        let percent =
            (expected_total > 0).then(|| backed_up as f64 / expected_total as f64 * 100.0);
        Self { backed_up, expected_total, percent }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunningRun {
    #[serde(flatten)]
    pub run: MigrationRun,
    pub elapsed_seconds: i64,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinishedRun {
    #[serde(flatten)]
    pub run: MigrationRun,
    pub duration_seconds: Option<i64>,
}

/// Point-in-time snapshot rendered by the status tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub phase: MigrationPhase,
    pub files: FileAggregate,
    pub progress: BackupProgress,
    pub running: Vec<RunningRun>,
    pub recent_finished: Vec<FinishedRun>,
    pub top_errors: Vec<ErrorTypeCount>,
}

impl StatusReport {
    #[must_use]
    pub fn stale_runs(&self) -> impl Iterator<Item = &RunningRun> {
        self.running.iter().filter(|entry| entry.stale)
    }
}

/// A running run is stale once it has been running for longer than `threshold`.
#[must_use]
pub fn is_stale(run: &MigrationRun, now: OffsetDateTime, threshold: Duration) -> bool {
    run.status == RunStatus::Running && run.elapsed(now) > threshold
}

impl RunningRun {
    pub(crate) fn observe(run: MigrationRun, now: OffsetDateTime, threshold: Duration) -> Self {
        let stale = is_stale(&run, now, threshold);
        let elapsed_seconds = run.elapsed(now).whole_seconds();
        Self { run, elapsed_seconds, stale }
    }
}

/// Compose a [`StatusReport`] from the ledger without mutating it.
///
/// An empty store yields a report in [`MigrationPhase::NotStarted`].
///
/// # Errors
/// Propagates any read failure from `reader`.
pub fn build_status_report<R>(
    reader: &R,
    config: &LedgerConfig,
    now: OffsetDateTime,
) -> Result<StatusReport, LedgerError>
where
    R: LedgerReader + ?Sized,
{
    let files = reader.aggregate()?;

    let running = reader
        .list_runs(&[RunStatus::Running], None)?
        .into_iter()
        .map(|run| RunningRun::observe(run, now, config.stale_after))
        .collect::<Vec<_>>();

    let recent_finished = reader
        .list_runs(&RunStatus::TERMINAL, Some(RECENT_FINISHED_RUNS))?
        .into_iter()
        .map(|run| {
            let duration_seconds = run.duration().map(Duration::whole_seconds);
            FinishedRun { run, duration_seconds }
        })
        .collect::<Vec<_>>();

    let top_errors = reader.top_error_types(TOP_ERROR_TYPES)?;

    Ok(StatusReport {
        generated_at: now,
        phase: MigrationPhase::derive(&files, !running.is_empty()),
        progress: BackupProgress::new(files.total_files, config.expected_total),
        files,
        running,
        recent_finished,
        top_errors,
    })
}
