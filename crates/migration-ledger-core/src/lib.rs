use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime, UtcOffset};

mod report;
mod review;

pub use report::{
    build_status_report, is_stale, BackupProgress, FinishedRun, MigrationPhase, RunningRun,
    StatusReport, RECENT_FINISHED_RUNS, TOP_ERROR_TYPES,
};
pub use review::{Confirmation, ReconcileOutcome, StaleRunReview};

pub const DEFAULT_DB_PATH: &str = "migration_tracking.db";

/// Record count of the source CRM at the time the migration was planned.
pub const DEFAULT_EXPECTED_TOTAL: u64 = 1_344_438;

pub const DEFAULT_STALE_AFTER: Duration = Duration::hours(2);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("storage unavailable at {path}: {message}")]
    Storage { path: String, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{service} request failed: {message}")]
    Remote { service: RemoteService, message: String },
}

impl LedgerError {
    #[must_use]
    pub fn storage(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage { path: path.into(), message: message.into() }
    }

    /// Stable classification string, suitable as the `error_type` of a logged failure.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Storage { .. } => "StorageError",
            Self::NotFound(_) => "NotFoundError",
            Self::InvalidState(_) => "InvalidStateError",
            Self::Validation(_) => "ValidationError",
            Self::Remote { .. } => "RemoteError",
        }
    }
}

/// External collaborators a migration driver talks to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RemoteService {
    Crm,
    ObjectStorage,
    DocumentProxy,
}

impl RemoteService {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crm => "crm",
            Self::ObjectStorage => "object_storage",
            Self::DocumentProxy => "document_proxy",
        }
    }
}

impl Display for RemoteService {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RunId(pub i64);

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Backup,
    FullMigration,
    Incremental,
}

impl RunType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::FullMigration => "full_migration",
            Self::Incremental => "incremental",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "backup" => Some(Self::Backup),
            "full_migration" => Some(Self::FullMigration),
            "incremental" => Some(Self::Incremental),
            _ => None,
        }
    }
}

impl Display for RunType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub const TERMINAL: [Self; 2] = [Self::Completed, Self::Failed];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Reject `running` as the target of an end-of-run transition.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidState`] when `self` is not terminal.
    pub fn ensure_terminal(self) -> Result<Self, LedgerError> {
        if self.is_terminal() {
            Ok(self)
        } else {
            Err(LedgerError::InvalidState(format!(
                "a run can only end as completed or failed, not {}",
                self.as_str()
            )))
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt of the external migration driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationRun {
    pub id: RunId,
    pub run_type: RunType,
    pub status: RunStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub total_files_processed: u64,
    pub successful_files: u64,
    pub failed_files: u64,
    pub error_message: Option<String>,
}

impl MigrationRun {
    /// Wall-clock time since start for a running run, or start-to-end for a finished one.
    #[must_use]
    pub fn elapsed(&self, now: OffsetDateTime) -> Duration {
        self.end_time.unwrap_or(now) - self.start_time
    }

    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.end_time.map(|end| end - self.start_time)
    }

    /// Check that the end timestamp is present exactly when the run is terminal.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidState`] when the status and end timestamp disagree.
    pub fn validate(&self) -> Result<(), LedgerError> {
        match (self.status.is_terminal(), self.end_time.is_some()) {
            (true, true) | (false, false) => Ok(()),
            (true, false) => Err(LedgerError::InvalidState(format!(
                "run {} is {} but has no end_time",
                self.id, self.status
            ))),
            (false, true) => Err(LedgerError::InvalidState(format!(
                "run {} is running but has an end_time",
                self.id
            ))),
        }
    }
}

/// Counter increments applied to a run in one atomic update.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressDelta {
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
}

impl ProgressDelta {
    #[must_use]
    pub fn new(processed: u64, successful: u64, failed: u64) -> Self {
        Self { processed, successful, failed }
    }

    #[must_use]
    pub fn success() -> Self {
        Self::new(1, 1, 0)
    }

    #[must_use]
    pub fn failure() -> Self {
        Self::new(1, 0, 1)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processed == 0 && self.successful == 0 && self.failed == 0
    }
}

/// A file that was just copied into the new object store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileBackup {
    pub file_id: String,
    pub account_id: String,
    pub account_name: Option<String>,
    pub file_name: Option<String>,
    pub object_key: Option<String>,
    pub size_bytes: u64,
    pub content_sha256: Option<String>,
}

impl FileBackup {
    #[must_use]
    pub fn new(file_id: impl Into<String>, account_id: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            file_id: file_id.into(),
            account_id: account_id.into(),
            account_name: None,
            file_name: None,
            object_key: None,
            size_bytes,
            content_sha256: None,
        }
    }

    #[must_use]
    pub fn with_account_name(mut self, account_name: impl Into<String>) -> Self {
        self.account_name = Some(account_name.into());
        self
    }

    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    #[must_use]
    pub fn with_object_key(mut self, object_key: impl Into<String>) -> Self {
        self.object_key = Some(object_key.into());
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: &[u8]) -> Self {
        self.content_sha256 = Some(content_sha256(content));
        self
    }

    /// # Errors
    /// Returns [`LedgerError::Validation`] when an identifier is blank.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.file_id.trim().is_empty() {
            return Err(LedgerError::Validation("file_id MUST be non-empty".to_string()));
        }
        if self.account_id.trim().is_empty() {
            return Err(LedgerError::Validation(format!(
                "account_id MUST be non-empty for file {}",
                self.file_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BackupOutcome {
    Inserted,
    Refreshed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMigrationRecord {
    pub file_id: String,
    pub account_id: String,
    pub account_name: Option<String>,
    pub file_name: Option<String>,
    pub object_key: Option<String>,
    pub size_bytes: u64,
    pub content_sha256: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub backup_timestamp: OffsetDateTime,
    pub fully_migrated: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Single-pass summary of the file record store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileAggregate {
    pub total_files: u64,
    pub backup_only_count: u64,
    pub fully_migrated_count: u64,
    pub total_bytes: u64,
    pub distinct_account_count: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub earliest_backup: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub latest_backup: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountSummary {
    pub account_id: String,
    pub account_name: Option<String>,
    pub file_count: u64,
    pub total_bytes: u64,
    pub fully_migrated_count: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub latest_backup: Option<OffsetDateTime>,
}

/// Failure details handed to the error log by a driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMigrationError {
    pub error_type: String,
    pub file_id: Option<String>,
    pub message: String,
    pub source_url: Option<String>,
}

impl NewMigrationError {
    #[must_use]
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            file_id: None,
            message: message.into(),
            source_url: None,
        }
    }

    /// Classify a ledger or collaborator failure by its [`LedgerError::kind`].
    #[must_use]
    pub fn from_error(error: &LedgerError) -> Self {
        Self::new(error.kind(), error.to_string())
    }

    #[must_use]
    pub fn for_file(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }

    #[must_use]
    pub fn with_source_url(mut self, source_url: impl Into<String>) -> Self {
        self.source_url = Some(source_url.into());
        self
    }

    /// # Errors
    /// Returns [`LedgerError::Validation`] when the error type is blank.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.error_type.trim().is_empty() {
            return Err(LedgerError::Validation("error_type MUST be non-empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationError {
    pub id: i64,
    pub run_id: RunId,
    pub error_type: String,
    pub file_id: Option<String>,
    pub message: String,
    pub source_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorTypeCount {
    pub error_type: String,
    pub count: u64,
}

/// Process-wide settings, fixed for the lifetime of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub db_path: PathBuf,
    pub expected_total: u64,
    pub stale_after: Duration,
    /// Offset applied to offset-less timestamps written by earlier tooling in local time.
    pub legacy_offset: UtcOffset,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            expected_total: DEFAULT_EXPECTED_TOTAL,
            stale_after: DEFAULT_STALE_AFTER,
            legacy_offset: UtcOffset::UTC,
        }
    }
}

impl LedgerConfig {
    #[must_use]
    pub fn with_db_path(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.db_path = db_path.into();
        self
    }

    #[must_use]
    pub fn with_expected_total(mut self, expected_total: u64) -> Self {
        self.expected_total = expected_total;
        self
    }

    #[must_use]
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    #[must_use]
    pub fn with_legacy_offset(mut self, legacy_offset: UtcOffset) -> Self {
        self.legacy_offset = legacy_offset;
        self
    }

    /// # Errors
    /// Returns [`LedgerError::Validation`] when the stale threshold is not positive.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if !self.stale_after.is_positive() {
            return Err(LedgerError::Validation(format!(
                "stale threshold must be positive, got {}",
                self.stale_after
            )));
        }
        Ok(())
    }
}

/// Read-only view over the run ledger, file records and error log.
pub trait LedgerReader {
    /// Runs whose status is in `statuses` (all runs when empty), newest start first.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the store cannot be read.
    fn list_runs(
        &self,
        statuses: &[RunStatus],
        limit: Option<usize>,
    ) -> Result<Vec<MigrationRun>, LedgerError>;

    /// # Errors
    /// Returns [`LedgerError::Storage`] when the store cannot be read.
    fn aggregate(&self) -> Result<FileAggregate, LedgerError>;

    /// Error types by descending count, ties in lexical order.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the store cannot be read.
    fn top_error_types(&self, limit: usize) -> Result<Vec<ErrorTypeCount>, LedgerError>;
}

/// Lifecycle writes for [`MigrationRun`]s.
pub trait RunLedger {
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the run cannot be persisted.
    fn begin_run_at(
        &mut self,
        run_type: RunType,
        config_snapshot: Option<&serde_json::Value>,
        at: OffsetDateTime,
    ) -> Result<RunId, LedgerError>;

    /// # Errors
    /// Returns [`LedgerError::Storage`] when the run cannot be persisted.
    fn begin_run(
        &mut self,
        run_type: RunType,
        config_snapshot: Option<&serde_json::Value>,
    ) -> Result<RunId, LedgerError> {
        self.begin_run_at(run_type, config_snapshot, OffsetDateTime::now_utc())
    }

    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown run and
    /// [`LedgerError::InvalidState`] when the run has already ended.
    fn record_progress(&mut self, run_id: RunId, delta: ProgressDelta) -> Result<(), LedgerError>;

    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown run and
    /// [`LedgerError::InvalidState`] when the run is not running or `status` is not terminal.
    fn end_run_at(
        &mut self,
        run_id: RunId,
        status: RunStatus,
        error_message: Option<&str>,
        at: OffsetDateTime,
    ) -> Result<(), LedgerError>;

    /// # Errors
    /// Same as [`RunLedger::end_run_at`].
    fn end_run(
        &mut self,
        run_id: RunId,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<(), LedgerError> {
        self.end_run_at(run_id, status, error_message, OffsetDateTime::now_utc())
    }

    /// End every run in `run_ids` with one shared timestamp, all or nothing.
    ///
    /// # Errors
    /// Same as [`RunLedger::end_run_at`] for the first offending run; nothing is written.
    fn end_runs_at(
        &mut self,
        run_ids: &[RunId],
        status: RunStatus,
        at: OffsetDateTime,
    ) -> Result<(), LedgerError>;
}

pub trait FileRecordStore {
    /// # Errors
    /// Returns [`LedgerError::Validation`] for blank identifiers and
    /// [`LedgerError::Storage`] when the upsert fails.
    fn record_backup(
        &mut self,
        backup: &FileBackup,
        at: OffsetDateTime,
    ) -> Result<BackupOutcome, LedgerError>;

    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the file was never backed up.
    fn mark_fully_migrated(&mut self, file_id: &str, at: OffsetDateTime)
        -> Result<(), LedgerError>;
}

pub trait ErrorLog {
    /// Append one immutable failure entry and return its row id.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] for an unknown run and
    /// [`LedgerError::Storage`] when the append fails.
    fn record_error(
        &mut self,
        run_id: RunId,
        error: &NewMigrationError,
        at: OffsetDateTime,
    ) -> Result<i64, LedgerError>;
}

#[must_use]
pub fn content_sha256(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}
