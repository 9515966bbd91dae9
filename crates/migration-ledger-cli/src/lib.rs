use std::fs;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use migration_ledger_core::{
    build_status_report, AccountSummary, Confirmation, LedgerConfig, LedgerError, LedgerReader,
    MigrationError, ReconcileOutcome, RunLedger, StaleRunReview, StatusReport, DEFAULT_DB_PATH,
    DEFAULT_EXPECTED_TOTAL,
};
use migration_ledger_store_sqlite::{AccessMode, IntegrityReport, SqliteLedger};
use serde::Serialize;
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod render;

pub use render::{format_bytes, format_count, format_duration, format_instant, render_status};

pub const STATUS_CONTRACT_VERSION: &str = "status.v1";

/// Store location and reporting thresholds shared by both tools.
#[derive(Debug, Clone, Args)]
pub struct LedgerArgs {
    /// Path to the migration tracking database.
    #[arg(long, env = "MIGRATION_LEDGER_DB", default_value = DEFAULT_DB_PATH)]
    pub db: PathBuf,

    /// Known record count of the source system, used for the progress percentage.
    #[arg(long, env = "MIGRATION_EXPECTED_TOTAL", default_value_t = DEFAULT_EXPECTED_TOTAL)]
    pub expected_total: u64,

    /// Hours after which a running run is reported as stale.
    #[arg(long, env = "MIGRATION_STALE_AFTER_HOURS", default_value_t = 2)]
    pub stale_after_hours: u32,
}

impl LedgerArgs {
    /// # Errors
    /// Returns [`LedgerError::Validation`] for a zero stale threshold.
    pub fn config(&self) -> Result<LedgerConfig, LedgerError> {
        let config = LedgerConfig::default()
            .with_db_path(self.db.clone())
            .with_expected_total(self.expected_total)
            .with_stale_after(Duration::hours(i64::from(self.stale_after_hours)));
        config.validate()?;
        Ok(config)
    }
}

/// Logs go to stderr so stdout carries only the report.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Local UTC offset used for offset-less timestamps in older stores.
///
/// Resolve this before any thread starts; the lookup fails in a multi-threaded process.
#[must_use]
pub fn local_offset() -> UtcOffset {
    UtcOffset::current_local_offset().unwrap_or_else(|err| {
        warn!(%err, "local UTC offset unavailable; reading offset-less timestamps as UTC");
        UtcOffset::UTC
    })
}

/// # Errors
/// Fails when the store at `config.db_path` is missing or lacks the ledger tables.
pub fn open_ledger(config: &LedgerConfig, mode: AccessMode) -> Result<SqliteLedger> {
    let ledger = SqliteLedger::open_existing(&config.db_path, mode)
        .context("failed to open migration database")?;
    Ok(ledger.with_legacy_offset(config.legacy_offset))
}

/// Prefixed one-line diagnostic for an unrecoverable tool failure.
#[must_use]
pub fn diagnostic(err: &anyhow::Error) -> String {
    let prefix = match err.downcast_ref::<LedgerError>() {
        Some(LedgerError::Storage { .. }) => "error[storage]",
        Some(LedgerError::NotFound(_)) => "error[not-found]",
        Some(LedgerError::InvalidState(_)) => "error[invalid-state]",
        Some(LedgerError::Validation(_)) => "error[validation]",
        Some(LedgerError::Remote { .. }) => "error[remote]",
        None => "error",
    };
    format!("{prefix}: {err:#}")
}

#[must_use]
pub fn exit_code(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", diagnostic(&err));
            ExitCode::from(1)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusOptions {
    pub accounts: Option<usize>,
    pub recent_errors: Option<usize>,
    pub integrity_check: bool,
}

/// Everything the status tool prints, in one serializable value.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub contract_version: &'static str,
    pub db_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_size_bytes: Option<u64>,
    pub stale_after_seconds: i64,
    #[serde(flatten)]
    pub report: StatusReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accounts: Option<Vec<AccountSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_errors: Option<Vec<MigrationError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityReport>,
}

/// Read the store and assemble the status view. Performs no writes.
///
/// # Errors
/// Propagates any [`LedgerError`] raised while reading the store.
pub fn collect_status(
    ledger: &SqliteLedger,
    config: &LedgerConfig,
    options: &StatusOptions,
    now: OffsetDateTime,
) -> Result<StatusView, LedgerError> {
    let report = build_status_report(ledger, config, now)?;
    let accounts = options.accounts.map(|limit| ledger.account_breakdown(limit)).transpose()?;
    let recent_errors = options.recent_errors.map(|limit| ledger.recent_errors(limit)).transpose()?;
    let integrity = options.integrity_check.then(|| ledger.integrity_check()).transpose()?;

    Ok(StatusView {
        contract_version: STATUS_CONTRACT_VERSION,
        db_path: ledger.path().to_string(),
        db_size_bytes: fs::metadata(ledger.path()).ok().map(|metadata| metadata.len()),
        stale_after_seconds: config.stale_after.whole_seconds(),
        report,
        accounts,
        recent_errors,
        integrity,
    })
}

/// # Errors
/// Fails when the view cannot be serialized or written.
pub fn emit_json(view: &StatusView, out: &mut impl Write) -> Result<()> {
    let body = serde_json::to_string_pretty(view).context("failed to serialize status report")?;
    writeln!(out, "{body}").context("failed to write status report")?;
    Ok(())
}

/// Interactive stale-run review: list running runs, ask once, apply the answer.
///
/// End of input counts as a rejection. Abort and confirmation both return `Ok`.
///
/// # Errors
/// Propagates ledger failures and I/O failures on `input` / `out`.
pub fn run_reconciler<L, R, W>(
    ledger: &mut L,
    config: &LedgerConfig,
    now: OffsetDateTime,
    input: &mut R,
    out: &mut W,
) -> Result<ReconcileOutcome>
where
    L: LedgerReader + RunLedger,
    R: BufRead,
    W: Write,
{
    let review = StaleRunReview::load(ledger, config, now)?;

    if review.is_clean() {
        writeln!(out, "✅ No stale running entries found - database is clean!")?;
        info!("reconciler found no running migration runs");
        return Ok(ReconcileOutcome::Clean);
    }

    writeln!(out, "Found {} running migration(s):", review.runs.len())?;
    writeln!(out)?;
    for (index, entry) in review.runs.iter().enumerate() {
        let run = &entry.run;
        writeln!(out, "Entry {}:", index + 1)?;
        writeln!(out, "  ID: {}", run.id)?;
        writeln!(out, "  Type: {}", run.run_type)?;
        writeln!(out, "  Start: {}", format_instant(run.start_time))?;
        writeln!(out, "  Running for: {}", format_duration(run.elapsed(now)))?;
        writeln!(out, "  Files Processed: {}", format_count(run.total_files_processed))?;
        writeln!(out, "  Successful: {}", format_count(run.successful_files))?;
        writeln!(out, "  Failed: {}", format_count(run.failed_files))?;
        if entry.stale {
            writeln!(out, "  ⚠️  Running longer than {}", format_duration(config.stale_after))?;
        }
        writeln!(out)?;
    }

    write!(out, "Mark these entries as 'completed'? (yes/no): ")?;
    out.flush()?;

    let mut answer = String::new();
    let read = input.read_line(&mut answer).context("failed to read confirmation")?;
    let confirmation =
        if read == 0 { Confirmation::Rejected } else { Confirmation::parse(&answer) };
    writeln!(out)?;

    let ended_at = OffsetDateTime::now_utc();
    let outcome = review.apply(ledger, confirmation, ended_at)?;
    match &outcome {
        ReconcileOutcome::Aborted { pending } => {
            warn!(pending, "operator rejected stale-run reconciliation; no changes made");
            writeln!(out, "❌ Aborted - no changes made")?;
        }
        ReconcileOutcome::Completed { run_ids, .. } => {
            info!(count = run_ids.len(), ?run_ids, "operator marked stale runs completed");
            writeln!(out, "✅ Marked {} migration(s) as completed", run_ids.len())?;
        }
        ReconcileOutcome::Clean => {}
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::Path;

    use anyhow::anyhow;
    use migration_ledger_core::{MigrationPhase, ProgressDelta, RunStatus, RunType};

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_760_000_000)
    }

    fn memory_ledger() -> Result<SqliteLedger> {
        let mut ledger = SqliteLedger::open(Path::new(":memory:"))?;
        ledger.migrate()?;
        Ok(ledger)
    }

    #[test]
    fn diagnostics_distinguish_error_kinds() {
        let storage = anyhow::Error::new(LedgerError::storage("/tmp/x.db", "locked"))
            .context("failed to open ledger");
        assert!(diagnostic(&storage).starts_with("error[storage]: failed to open ledger"));
        assert!(diagnostic(&storage).contains("/tmp/x.db"));

        let not_found = anyhow::Error::new(LedgerError::NotFound("migration run 9".to_string()));
        assert!(diagnostic(&not_found).starts_with("error[not-found]"));

        let invalid = anyhow::Error::new(LedgerError::InvalidState("ended".to_string()));
        assert!(diagnostic(&invalid).starts_with("error[invalid-state]"));

        assert!(diagnostic(&anyhow!("boom")).starts_with("error: boom"));
    }

    #[test]
    fn ledger_args_build_a_validated_config() -> Result<()> {
        let args = LedgerArgs {
            db: PathBuf::from("ledger.db"),
            expected_total: 10,
            stale_after_hours: 3,
        };
        let config = args.config()?;
        assert_eq!(config.db_path, PathBuf::from("ledger.db"));
        assert_eq!(config.stale_after, Duration::hours(3));

        let zero = LedgerArgs { stale_after_hours: 0, ..args };
        assert!(matches!(zero.config(), Err(LedgerError::Validation(_))));
        Ok(())
    }

    #[test]
    fn empty_store_reports_not_started() -> Result<()> {
        let ledger = memory_ledger()?;
        let view = collect_status(
            &ledger,
            &LedgerConfig::default(),
            &StatusOptions::default(),
            fixture_time(),
        )?;
        assert_eq!(view.report.phase, MigrationPhase::NotStarted);

        let mut text = Vec::new();
        render_status(&view, &mut text)?;
        let text = String::from_utf8(text)?;
        assert!(text.contains("not started"));
        assert!(text.contains("✅ No running migrations"));
        assert!(text.contains("No errors recorded"));
        assert_eq!(view.db_size_bytes, None);
        assert!(!text.contains("Database size:"));
        assert!(text.contains("Last updated:"));
        Ok(())
    }

    #[test]
    fn status_footer_shows_the_size_of_a_file_store() -> Result<()> {
        let path = std::env::temp_dir().join(format!("ledger-offset-{}.db", std::process::id()));
        let _ = fs::remove_file(&path);
        let mut ledger = SqliteLedger::open(&path)?;
        ledger.migrate()?;
        drop(ledger);

        let config = LedgerConfig::default().with_db_path(path.clone());
        let ledger = open_ledger(&config, AccessMode::QueryOnly)?;
        let view = collect_status(&ledger, &config, &StatusOptions::default(), fixture_time())?;
        assert!(view.db_size_bytes.is_some_and(|size| size > 0));

        let mut text = Vec::new();
        render_status(&view, &mut text)?;
        assert!(String::from_utf8(text)?.contains("Database size:"));

        drop(ledger);
        for suffix in ["", "-wal", "-shm"] {
            let _ = fs::remove_file(format!("{}{suffix}", path.display()));
        }
        Ok(())
    }

    #[test]
    fn json_view_omits_unrequested_sections() -> Result<()> {
        let ledger = memory_ledger()?;
        let view = collect_status(
            &ledger,
            &LedgerConfig::default(),
            &StatusOptions { accounts: Some(5), ..StatusOptions::default() },
            fixture_time(),
        )?;

        let mut out = Vec::new();
        emit_json(&view, &mut out)?;
        let value: serde_json::Value = serde_json::from_slice(&out)?;
        assert_eq!(value["contract_version"], STATUS_CONTRACT_VERSION);
        assert_eq!(value["phase"], "not_started");
        assert!(value["accounts"].as_array().is_some_and(Vec::is_empty));
        assert!(value.get("recent_errors").is_none());
        assert!(value.get("integrity").is_none());
        Ok(())
    }

    #[test]
    fn reconciler_rejection_and_end_of_input_write_nothing() -> Result<()> {
        let mut ledger = memory_ledger()?;
        let run_id = ledger.begin_run_at(RunType::Backup, None, fixture_time())?;
        let now = fixture_time() + Duration::hours(3);

        for answer in ["no\n", ""] {
            let mut out = Vec::new();
            let outcome = run_reconciler(
                &mut ledger,
                &LedgerConfig::default(),
                now,
                &mut Cursor::new(answer),
                &mut out,
            )?;
            assert_eq!(outcome, ReconcileOutcome::Aborted { pending: 1 });
            assert!(String::from_utf8(out)?.contains("Aborted - no changes made"));
        }

        let run = ledger.get_run(run_id)?.ok_or_else(|| anyhow!("run missing"))?;
        assert_eq!(run.status, RunStatus::Running);
        Ok(())
    }

    #[test]
    fn reconciler_confirmation_completes_every_running_run() -> Result<()> {
        let mut ledger = memory_ledger()?;
        let first = ledger.begin_run_at(RunType::Backup, None, fixture_time())?;
        ledger.record_progress(first, ProgressDelta::new(1_500, 1_499, 1))?;
        let second = ledger.begin_run_at(RunType::FullMigration, None, fixture_time())?;

        let mut out = Vec::new();
        let outcome = run_reconciler(
            &mut ledger,
            &LedgerConfig::default(),
            fixture_time() + Duration::hours(5),
            &mut Cursor::new("Y\n"),
            &mut out,
        )?;
        let text = String::from_utf8(out)?;
        assert!(text.contains("Files Processed: 1,500"));
        assert!(text.contains("Marked 2 migration(s) as completed"));

        let ReconcileOutcome::Completed { run_ids, ended_at } = outcome else {
            return Err(anyhow!("expected completion, got {outcome:?}"));
        };
        assert_eq!(run_ids, vec![second, first]);
        for run_id in run_ids {
            let run = ledger.get_run(run_id)?.ok_or_else(|| anyhow!("run missing"))?;
            assert_eq!(run.status, RunStatus::Completed);
            assert_eq!(run.end_time, Some(ended_at));
        }
        Ok(())
    }

    #[test]
    fn reconciler_reports_clean_store() -> Result<()> {
        let mut ledger = memory_ledger()?;
        let mut out = Vec::new();
        let outcome = run_reconciler(
            &mut ledger,
            &LedgerConfig::default(),
            fixture_time(),
            &mut Cursor::new("yes\n"),
            &mut out,
        )?;
        assert_eq!(outcome, ReconcileOutcome::Clean);
        assert!(String::from_utf8(out)?.contains("database is clean"));
        Ok(())
    }
}
