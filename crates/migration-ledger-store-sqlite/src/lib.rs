use std::fmt::Display;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use migration_ledger_core::{
    AccountSummary, BackupOutcome, ErrorLog, ErrorTypeCount, FileAggregate, FileBackup,
    FileMigrationRecord, FileRecordStore, LedgerError, LedgerReader, MigrationError, MigrationRun,
    NewMigrationError, ProgressDelta, RunId, RunLedger, RunStatus, RunType,
};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, LedgerError>;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS migration_runs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_type TEXT NOT NULL CHECK (run_type IN ('backup','full_migration','incremental')),
  status TEXT NOT NULL DEFAULT 'running' CHECK (status IN ('running','completed','failed')),
  start_time TEXT NOT NULL,
  end_time TEXT,
  total_files_processed INTEGER NOT NULL DEFAULT 0 CHECK (total_files_processed >= 0),
  successful_files INTEGER NOT NULL DEFAULT 0 CHECK (successful_files >= 0),
  failed_files INTEGER NOT NULL DEFAULT 0 CHECK (failed_files >= 0),
  error_message TEXT,
  config_snapshot TEXT,
  CHECK ((status = 'running') = (end_time IS NULL))
);

CREATE TABLE IF NOT EXISTS file_migrations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  doclist_entry_id TEXT NOT NULL UNIQUE,
  account_id TEXT NOT NULL,
  account_name TEXT,
  file_name TEXT,
  object_key TEXT,
  file_size_bytes INTEGER NOT NULL DEFAULT 0 CHECK (file_size_bytes >= 0),
  file_hash TEXT,
  backup_timestamp TEXT NOT NULL,
  salesforce_updated INTEGER NOT NULL DEFAULT 0 CHECK (salesforce_updated IN (0, 1)),
  created_date TEXT NOT NULL,
  updated_date TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS migration_errors (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id INTEGER NOT NULL,
  doclist_entry_id TEXT,
  error_type TEXT NOT NULL,
  error_message TEXT NOT NULL,
  original_url TEXT,
  timestamp TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES migration_runs(id)
);

CREATE INDEX IF NOT EXISTS idx_run_status ON migration_runs(status);
CREATE INDEX IF NOT EXISTS idx_run_start_time ON migration_runs(start_time);
CREATE INDEX IF NOT EXISTS idx_account_id ON file_migrations(account_id);
CREATE INDEX IF NOT EXISTS idx_backup_timestamp ON file_migrations(backup_timestamp);
CREATE INDEX IF NOT EXISTS idx_salesforce_updated ON file_migrations(salesforce_updated);
CREATE INDEX IF NOT EXISTS idx_error_run_id ON migration_errors(run_id);
CREATE INDEX IF NOT EXISTS idx_error_type ON migration_errors(error_type);
";

const MIGRATION_002_SQL: &str = r"
CREATE TRIGGER IF NOT EXISTS migration_errors_immutable
BEFORE UPDATE ON migration_errors
BEGIN
  SELECT RAISE(ABORT, 'migration_errors rows are immutable');
END;

CREATE INDEX IF NOT EXISTS idx_run_status ON migration_runs(status);
CREATE INDEX IF NOT EXISTS idx_error_run_id ON migration_errors(run_id);
CREATE INDEX IF NOT EXISTS idx_error_type ON migration_errors(error_type);
";

/// Columns every tool relies on, including in stores created by earlier tooling.
const REQUIRED_COLUMNS: [(&str, &[&str]); 3] = [
    (
        "migration_runs",
        &[
            "id",
            "run_type",
            "status",
            "start_time",
            "end_time",
            "total_files_processed",
            "successful_files",
            "failed_files",
            "error_message",
        ],
    ),
    (
        "file_migrations",
        &[
            "doclist_entry_id",
            "account_id",
            "file_size_bytes",
            "backup_timestamp",
            "salesforce_updated",
        ],
    ),
    (
        "migration_errors",
        &["run_id", "doclist_entry_id", "error_type", "error_message", "timestamp"],
    ),
];

const RUN_COLUMNS: &str = "id, run_type, COALESCE(status, 'running'), start_time, end_time,
    COALESCE(total_files_processed, 0), COALESCE(successful_files, 0),
    COALESCE(failed_files, 0), error_message";

const FILE_COLUMNS: &str = "doclist_entry_id, account_id, account_name, file_name, object_key,
    COALESCE(file_size_bytes, 0), file_hash, backup_timestamp, salesforce_updated, updated_date";

const ERROR_COLUMNS: &str =
    "id, run_id, error_type, doclist_entry_id, error_message, original_url, timestamp";

/// How a tool intends to use an existing store.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AccessMode {
    ReadWrite,
    /// Reads only; SQLite rejects every write on the handle.
    QueryOnly,
}

/// The local durable store behind the run ledger, file records and error log.
pub struct SqliteLedger {
    conn: Connection,
    path: String,
    legacy_offset: UtcOffset,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: usize,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataExport {
    #[serde(with = "time::serde::rfc3339")]
    pub exported_at: OffsetDateTime,
    pub schema_version: i64,
    pub files_summary: FileAggregate,
    pub runs: Vec<MigrationRun>,
    pub files: Vec<FileMigrationRecord>,
    pub errors: Vec<MigrationError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportSummary {
    pub path: String,
    pub runs: usize,
    pub files: usize,
    pub errors: usize,
}

trait StorageContext<T> {
    fn storage(self, path: &str, action: &str) -> Result<T>;
}

impl<T> StorageContext<T> for rusqlite::Result<T> {
    fn storage(self, path: &str, action: &str) -> Result<T> {
        self.map_err(|err| LedgerError::storage(path, format!("failed to {action}: {err}")))
    }
}

impl SqliteLedger {
    /// Open (creating if needed) a ledger database and configure runtime pragmas.
    ///
    /// Call [`SqliteLedger::migrate`] before writing to a new file.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the database cannot be opened or configured.
    pub fn open(path: &Path) -> Result<Self> {
        let display = path.display().to_string();
        let conn = Connection::open(path).storage(&display, "open sqlite database")?;
        let ledger = Self { conn, path: display, legacy_offset: UtcOffset::UTC };
        ledger.configure(AccessMode::ReadWrite)?;
        Ok(ledger)
    }

    /// Open a ledger database that must already exist; never creates a file.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the file is missing, cannot be opened,
    /// or does not carry the ledger tables.
    pub fn open_existing(path: &Path, mode: AccessMode) -> Result<Self> {
        let display = path.display().to_string();
        if !path.is_file() {
            return Err(LedgerError::storage(display, "migration database not found"));
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn =
            Connection::open_with_flags(path, flags).storage(&display, "open sqlite database")?;
        let ledger = Self { conn, path: display, legacy_offset: UtcOffset::UTC };
        ledger.configure(mode)?;
        ledger.verify_schema()?;
        Ok(ledger)
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read offset-less timestamps as wall-clock time at `offset` instead of UTC.
    #[must_use]
    pub fn with_legacy_offset(mut self, offset: UtcOffset) -> Self {
        self.legacy_offset = offset;
        self
    }

    fn configure(&self, mode: AccessMode) -> Result<()> {
        let pragmas = match mode {
            AccessMode::ReadWrite => {
                "PRAGMA busy_timeout = 5000;
                 PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;"
            }
            AccessMode::QueryOnly => {
                "PRAGMA busy_timeout = 5000;
                 PRAGMA query_only = ON;"
            }
        };
        self.conn.execute_batch(pragmas).storage(&self.path, "configure sqlite pragmas")
    }

    /// Check that the ledger tables exist with every column the tools read.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] naming the first missing table or column.
    pub fn verify_schema(&self) -> Result<()> {
        for (table, columns) in REQUIRED_COLUMNS {
            if !table_exists(&self.conn, &self.path, table)? {
                return Err(LedgerError::storage(
                    &self.path,
                    format!("database schema is invalid: missing table {table}"),
                ));
            }
            for column in columns {
                if !table_has_column(&self.conn, &self.path, table, column)? {
                    return Err(LedgerError::storage(
                        &self.path,
                        format!("database schema is invalid: {table} has no column {column}"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Report current and target schema versions without writing.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let recorded = if table_exists(&self.conn, &self.path, "schema_migrations")? {
            current_schema_version(&self.conn, &self.path)?
        } else {
            0
        };

        let (current_version, inferred_from_legacy) =
            if recorded == 0 && table_exists(&self.conn, &self.path, "migration_runs")? {
                (1, true)
            } else {
                (recorded, false)
            };

        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .storage(&self.path, "apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn, &self.path)?;
        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn, &self.path)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(LedgerError::storage(
                &self.path,
                format!("unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"),
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, &self.path, "migration_runs")? {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .storage(&self.path, "apply migration v1")?;
            record_schema_version(&self.conn, &self.path, 1)?;
            info!(path = %self.path, "created migration ledger schema");
            return Ok(1);
        }

        // Tables written by the earlier tooling carry no migration records.
        self.verify_schema()?;
        record_schema_version(&self.conn, &self.path, 1)?;
        warn!(path = %self.path, "adopted legacy migration ledger as schema version 1");
        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let needs_object_key =
            !table_has_column(&self.conn, &self.path, "file_migrations", "object_key")?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage(&self.path, "start migration v2 transaction")?;

        if needs_object_key {
            tx.execute_batch("ALTER TABLE file_migrations ADD COLUMN object_key TEXT;")
                .storage(&self.path, "add file_migrations.object_key")?;
        }
        tx.execute_batch(MIGRATION_002_SQL).storage(&self.path, "apply migration v2")?;
        record_schema_version(&tx, &self.path, 2)?;
        tx.commit().storage(&self.path, "commit migration v2")?;

        info!(path = %self.path, version = 2, "applied migration ledger schema migration");
        Ok(())
    }

    /// Look up one run by id.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the row cannot be read or decoded.
    pub fn get_run(&self, run_id: RunId) -> Result<Option<MigrationRun>> {
        let query = format!("SELECT {RUN_COLUMNS} FROM migration_runs WHERE id = ?1");
        let raw = self
            .conn
            .query_row(&query, params![run_id.0], RawRun::from_row)
            .optional()
            .storage(&self.path, "read migration run")?;
        raw.map(|raw| raw.decode(&self.path, self.legacy_offset)).transpose()
    }

    /// Start time of the most recent completed run of any of `run_types`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the query fails.
    pub fn last_completed_start(&self, run_types: &[RunType]) -> Result<Option<OffsetDateTime>> {
        if run_types.is_empty() {
            return Ok(None);
        }

        let placeholders = placeholders(1, run_types.len());
        let query = format!(
            "SELECT start_time FROM migration_runs
             WHERE status = 'completed' AND run_type IN ({placeholders})
             ORDER BY start_time DESC, id DESC
             LIMIT 1"
        );
        let raw: Option<String> = self
            .conn
            .query_row(
                &query,
                params_from_iter(run_types.iter().map(|run_type| run_type.as_str())),
                |row| row.get(0),
            )
            .optional()
            .storage(&self.path, "read last completed run")?;

        raw.map(|value| decode_timestamp(&self.path, self.legacy_offset, "start_time", &value)).transpose()
    }

    /// Look up one file record by its stable identifier.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the row cannot be read or decoded.
    pub fn get_file(&self, file_id: &str) -> Result<Option<FileMigrationRecord>> {
        let query = format!("SELECT {FILE_COLUMNS} FROM file_migrations WHERE doclist_entry_id = ?1");
        let raw = self
            .conn
            .query_row(&query, params![file_id], RawFile::from_row)
            .optional()
            .storage(&self.path, "read file record")?;
        raw.map(|raw| raw.decode(&self.path, self.legacy_offset)).transpose()
    }

    /// Backup-only files whose source reference still points at the old location.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the query fails.
    pub fn files_pending_reference_update(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<FileMigrationRecord>> {
        let query = format!(
            "SELECT {FILE_COLUMNS} FROM file_migrations
             WHERE salesforce_updated = 0
             ORDER BY account_id ASC, backup_timestamp ASC
             LIMIT ?1"
        );
        self.query_files(&query, params![sql_limit(limit)])
    }

    /// Identifiers of files backed up strictly after `after`, oldest first.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the query fails.
    pub fn file_ids_backed_up_after(&self, after: OffsetDateTime) -> Result<Vec<String>> {
        let after = format_timestamp(after)?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT doclist_entry_id FROM file_migrations
                 WHERE backup_timestamp > ?1
                 ORDER BY backup_timestamp ASC, doclist_entry_id ASC",
            )
            .storage(&self.path, "prepare backed-up file query")?;
        let rows = stmt
            .query_map(params![after], |row| row.get::<_, String>(0))
            .storage(&self.path, "query backed-up files")?;
        rows.collect::<rusqlite::Result<Vec<_>>>().storage(&self.path, "read backed-up files")
    }

    /// Per-account totals, largest accounts first.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the query fails or a row cannot be decoded.
    pub fn account_breakdown(&self, limit: usize) -> Result<Vec<AccountSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT account_id, MAX(account_name), COUNT(*),
                        COALESCE(SUM(file_size_bytes), 0),
                        COALESCE(SUM(CASE WHEN salesforce_updated = 1 THEN 1 ELSE 0 END), 0),
                        MAX(backup_timestamp)
                 FROM file_migrations
                 GROUP BY account_id
                 ORDER BY COUNT(*) DESC, account_id ASC
                 LIMIT ?1",
            )
            .storage(&self.path, "prepare account breakdown")?;
        let rows = stmt
            .query_map(params![sql_limit(Some(limit))], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .storage(&self.path, "query account breakdown")?;

        let mut accounts = Vec::new();
        for row in rows {
            let (account_id, account_name, files, bytes, migrated, latest) =
                row.storage(&self.path, "read account breakdown row")?;
            accounts.push(AccountSummary {
                account_id,
                account_name,
                file_count: decode_count(&self.path, "file_count", files)?,
                total_bytes: decode_count(&self.path, "file_size_bytes", bytes)?,
                fully_migrated_count: decode_count(&self.path, "salesforce_updated", migrated)?,
                latest_backup: latest
                    .map(|value| decode_timestamp(&self.path, self.legacy_offset, "backup_timestamp", &value))
                    .transpose()?,
            });
        }
        Ok(accounts)
    }

    /// Most recent errors across all runs, newest first.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the query fails.
    pub fn recent_errors(&self, limit: usize) -> Result<Vec<MigrationError>> {
        let query = format!(
            "SELECT {ERROR_COLUMNS} FROM migration_errors
             WHERE run_id IS NOT NULL
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1"
        );
        self.query_errors(&query, params![sql_limit(Some(limit))])
    }

    /// All errors logged against one run, in the order they were written.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the query fails.
    pub fn errors_for_run(&self, run_id: RunId) -> Result<Vec<MigrationError>> {
        let query = format!(
            "SELECT {ERROR_COLUMNS} FROM migration_errors WHERE run_id = ?1 ORDER BY id ASC"
        );
        self.query_errors(&query, params![run_id.0])
    }

    /// Write every run, file record and error to one JSON document.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when reading the store or writing `out_file` fails.
    pub fn export_metadata(&self, out_file: &Path) -> Result<ExportSummary> {
        let out_display = out_file.display().to_string();
        let io_error =
            |err: std::io::Error| LedgerError::storage(&out_display, format!("export failed: {err}"));

        let export = MetadataExport {
            exported_at: OffsetDateTime::now_utc(),
            schema_version: self.schema_status()?.current_version,
            files_summary: self.aggregate()?,
            runs: self.list_runs(&[], None)?,
            files: self.query_files(
                &format!("SELECT {FILE_COLUMNS} FROM file_migrations ORDER BY backup_timestamp ASC"),
                [],
            )?,
            errors: self.query_errors(
                &format!("SELECT {ERROR_COLUMNS} FROM migration_errors WHERE run_id IS NOT NULL ORDER BY id ASC"),
                [],
            )?,
        };

        if let Some(parent) = out_file.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let mut writer = BufWriter::new(File::create(out_file).map_err(io_error)?);
        serde_json::to_writer_pretty(&mut writer, &export).map_err(|err| {
            LedgerError::storage(&out_display, format!("failed to serialize export: {err}"))
        })?;
        writer.flush().map_err(io_error)?;

        info!(path = %out_display, runs = export.runs.len(), files = export.files.len(), "exported migration metadata");
        Ok(ExportSummary {
            path: out_display.clone(),
            runs: export.runs.len(),
            files: export.files.len(),
            errors: export.errors.len(),
        })
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when any probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .storage(&self.path, "run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .storage(&self.path, "prepare PRAGMA foreign_key_check")?;
        let mut rows = stmt.query([]).storage(&self.path, "run PRAGMA foreign_key_check")?;
        let mut foreign_key_violations = 0_usize;
        while rows.next().storage(&self.path, "read foreign key violations")?.is_some() {
            foreign_key_violations += 1;
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status: self.schema_status()?,
        })
    }

    fn query_files<P: rusqlite::Params>(
        &self,
        query: &str,
        params: P,
    ) -> Result<Vec<FileMigrationRecord>> {
        let mut stmt = self.conn.prepare(query).storage(&self.path, "prepare file query")?;
        let rows =
            stmt.query_map(params, RawFile::from_row).storage(&self.path, "query file records")?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row.storage(&self.path, "read file record")?.decode(&self.path, self.legacy_offset)?);
        }
        Ok(files)
    }

    fn query_errors<P: rusqlite::Params>(
        &self,
        query: &str,
        params: P,
    ) -> Result<Vec<MigrationError>> {
        let mut stmt = self.conn.prepare(query).storage(&self.path, "prepare error query")?;
        let rows =
            stmt.query_map(params, RawError::from_row).storage(&self.path, "query error log")?;
        let mut errors = Vec::new();
        for row in rows {
            errors.push(row.storage(&self.path, "read error log row")?.decode(&self.path, self.legacy_offset)?);
        }
        Ok(errors)
    }
}

impl LedgerReader for SqliteLedger {
    fn list_runs(&self, statuses: &[RunStatus], limit: Option<usize>) -> Result<Vec<MigrationRun>> {
        let mut values = statuses
            .iter()
            .map(|status| Value::Text(status.as_str().to_string()))
            .collect::<Vec<_>>();
        let filter = if statuses.is_empty() {
            String::new()
        } else {
            format!("WHERE status IN ({})", placeholders(1, statuses.len()))
        };
        values.push(Value::Integer(sql_limit(limit)));

        let query = format!(
            "SELECT {RUN_COLUMNS} FROM migration_runs {filter}
             ORDER BY start_time DESC, id DESC
             LIMIT ?{}",
            values.len()
        );
        let mut stmt = self.conn.prepare(&query).storage(&self.path, "prepare run query")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), RawRun::from_row)
            .storage(&self.path, "query migration runs")?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.storage(&self.path, "read migration run")?.decode(&self.path, self.legacy_offset)?);
        }
        Ok(runs)
    }

    fn aggregate(&self) -> Result<FileAggregate> {
        // One statement, so the counts come from a single read snapshot.
        let (total, backup_only, migrated, bytes, accounts, earliest, latest) = self
            .conn
            .query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN salesforce_updated = 0 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN salesforce_updated = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(file_size_bytes), 0),
                    COUNT(DISTINCT account_id),
                    MIN(backup_timestamp),
                    MAX(backup_timestamp)
                 FROM file_migrations",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .storage(&self.path, "aggregate file records")?;

        Ok(FileAggregate {
            total_files: decode_count(&self.path, "total_files", total)?,
            backup_only_count: decode_count(&self.path, "backup_only", backup_only)?,
            fully_migrated_count: decode_count(&self.path, "fully_migrated", migrated)?,
            total_bytes: decode_count(&self.path, "file_size_bytes", bytes)?,
            distinct_account_count: decode_count(&self.path, "account_id", accounts)?,
            earliest_backup: earliest
                .map(|value| decode_timestamp(&self.path, self.legacy_offset, "backup_timestamp", &value))
                .transpose()?,
            latest_backup: latest
                .map(|value| decode_timestamp(&self.path, self.legacy_offset, "backup_timestamp", &value))
                .transpose()?,
        })
    }

    fn top_error_types(&self, limit: usize) -> Result<Vec<ErrorTypeCount>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT error_type, COUNT(*) AS occurrences
                 FROM migration_errors
                 GROUP BY error_type
                 ORDER BY occurrences DESC, error_type ASC
                 LIMIT ?1",
            )
            .storage(&self.path, "prepare error summary")?;
        let rows = stmt
            .query_map(params![sql_limit(Some(limit))], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .storage(&self.path, "query error summary")?;

        let mut counts = Vec::new();
        for row in rows {
            let (error_type, count) = row.storage(&self.path, "read error summary row")?;
            counts.push(ErrorTypeCount {
                error_type,
                count: decode_count(&self.path, "error count", count)?,
            });
        }
        Ok(counts)
    }
}

impl RunLedger for SqliteLedger {
    fn begin_run_at(
        &mut self,
        run_type: RunType,
        config_snapshot: Option<&serde_json::Value>,
        at: OffsetDateTime,
    ) -> Result<RunId> {
        let start_time = format_timestamp(at)?;
        let snapshot = config_snapshot
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| {
                LedgerError::Validation(format!("config snapshot is not serializable: {err}"))
            })?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage(&self.path, "start transaction")?;
        tx.execute(
            "INSERT INTO migration_runs(
                run_type, status, start_time, total_files_processed,
                successful_files, failed_files, config_snapshot
            ) VALUES (?1, 'running', ?2, 0, 0, 0, ?3)",
            params![run_type.as_str(), start_time, snapshot],
        )
        .storage(&self.path, "insert migration run")?;
        let run_id = RunId(tx.last_insert_rowid());
        tx.commit().storage(&self.path, "commit migration run")?;

        info!(%run_id, %run_type, "migration run started");
        Ok(run_id)
    }

    fn record_progress(&mut self, run_id: RunId, delta: ProgressDelta) -> Result<()> {
        let processed = encode_count("processed", delta.processed)?;
        let successful = encode_count("successful", delta.successful)?;
        let failed = encode_count("failed", delta.failed)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage(&self.path, "start transaction")?;
        let status = run_status(&tx, &self.path, run_id)?;
        if status.is_terminal() {
            return Err(LedgerError::InvalidState(format!(
                "migration run {run_id} already ended as {status}; progress is closed"
            )));
        }
        if delta.is_empty() {
            return Ok(());
        }

        let (current_processed, current_successful, current_failed) = tx
            .query_row(
                "SELECT COALESCE(total_files_processed, 0), COALESCE(successful_files, 0),
                        COALESCE(failed_files, 0)
                 FROM migration_runs WHERE id = ?1",
                params![run_id.0],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
            )
            .storage(&self.path, "read run counters")?;
        // SQLite stores an overflowing integer sum as REAL.
        let total_processed =
            checked_sum(run_id, "total_files_processed", current_processed, processed)?;
        let total_successful =
            checked_sum(run_id, "successful_files", current_successful, successful)?;
        let total_failed = checked_sum(run_id, "failed_files", current_failed, failed)?;

        tx.execute(
            "UPDATE migration_runs
             SET total_files_processed = ?1, successful_files = ?2, failed_files = ?3
             WHERE id = ?4",
            params![total_processed, total_successful, total_failed, run_id.0],
        )
        .storage(&self.path, "update run counters")?;
        tx.commit().storage(&self.path, "commit run counters")?;

        debug!(%run_id, processed, successful, failed, "recorded run progress");
        Ok(())
    }

    fn end_run_at(
        &mut self,
        run_id: RunId,
        status: RunStatus,
        error_message: Option<&str>,
        at: OffsetDateTime,
    ) -> Result<()> {
        let status = status.ensure_terminal()?;
        let end_time = format_timestamp(at)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage(&self.path, "start transaction")?;
        end_one(&tx, &self.path, run_id, status, error_message, &end_time)?;
        tx.commit().storage(&self.path, "commit run end")?;

        info!(%run_id, %status, "migration run ended");
        Ok(())
    }

    fn end_runs_at(&mut self, run_ids: &[RunId], status: RunStatus, at: OffsetDateTime) -> Result<()> {
        let status = status.ensure_terminal()?;
        if run_ids.is_empty() {
            return Ok(());
        }
        let end_time = format_timestamp(at)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage(&self.path, "start transaction")?;
        for run_id in run_ids {
            end_one(&tx, &self.path, *run_id, status, None, &end_time)?;
        }
        tx.commit().storage(&self.path, "commit batch run end")?;

        info!(count = run_ids.len(), %status, end_time = %end_time, "migration runs ended in batch");
        Ok(())
    }
}

impl FileRecordStore for SqliteLedger {
    fn record_backup(&mut self, backup: &FileBackup, at: OffsetDateTime) -> Result<BackupOutcome> {
        backup.validate()?;
        let size_bytes = encode_count("size_bytes", backup.size_bytes)?;
        let backup_timestamp = format_timestamp(at)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage(&self.path, "start transaction")?;
        let exists = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM file_migrations WHERE doclist_entry_id = ?1)",
                params![backup.file_id],
                |row| row.get::<_, i64>(0),
            )
            .storage(&self.path, "check file record")?
            == 1;

        let outcome = if exists {
            // salesforce_updated is left as is; a re-backup never downgrades.
            tx.execute(
                "UPDATE file_migrations
                 SET account_id = ?1,
                     account_name = COALESCE(?2, account_name),
                     file_name = COALESCE(?3, file_name),
                     object_key = COALESCE(?4, object_key),
                     file_size_bytes = ?5,
                     file_hash = COALESCE(?6, file_hash),
                     backup_timestamp = ?7,
                     updated_date = ?7
                 WHERE doclist_entry_id = ?8",
                params![
                    backup.account_id,
                    backup.account_name,
                    backup.file_name,
                    backup.object_key,
                    size_bytes,
                    backup.content_sha256,
                    backup_timestamp,
                    backup.file_id,
                ],
            )
            .storage(&self.path, "refresh file record")?;
            BackupOutcome::Refreshed
        } else {
            tx.execute(
                "INSERT INTO file_migrations(
                    doclist_entry_id, account_id, account_name, file_name, object_key,
                    file_size_bytes, file_hash, backup_timestamp, salesforce_updated,
                    created_date, updated_date
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?8, ?8)",
                params![
                    backup.file_id,
                    backup.account_id,
                    backup.account_name,
                    backup.file_name,
                    backup.object_key,
                    size_bytes,
                    backup.content_sha256,
                    backup_timestamp,
                ],
            )
            .storage(&self.path, "insert file record")?;
            BackupOutcome::Inserted
        };
        tx.commit().storage(&self.path, "commit file record")?;

        debug!(file_id = %backup.file_id, ?outcome, "recorded file backup");
        Ok(outcome)
    }

    fn mark_fully_migrated(&mut self, file_id: &str, at: OffsetDateTime) -> Result<()> {
        let updated_date = format_timestamp(at)?;
        let changed = self
            .conn
            .execute(
                "UPDATE file_migrations
                 SET salesforce_updated = 1, updated_date = ?1
                 WHERE doclist_entry_id = ?2",
                params![updated_date, file_id],
            )
            .storage(&self.path, "mark file fully migrated")?;

        if changed == 0 {
            return Err(LedgerError::NotFound(format!(
                "no backup record for file {file_id}; back it up before repointing its reference"
            )));
        }

        debug!(file_id, "marked file fully migrated");
        Ok(())
    }
}

impl ErrorLog for SqliteLedger {
    fn record_error(
        &mut self,
        run_id: RunId,
        error: &NewMigrationError,
        at: OffsetDateTime,
    ) -> Result<i64> {
        error.validate()?;
        let timestamp = format_timestamp(at)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage(&self.path, "start transaction")?;
        run_status(&tx, &self.path, run_id)?;
        tx.execute(
            "INSERT INTO migration_errors(
                run_id, doclist_entry_id, error_type, error_message, original_url, timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id.0,
                error.file_id,
                error.error_type,
                error.message,
                error.source_url,
                timestamp,
            ],
        )
        .storage(&self.path, "append migration error")?;
        let id = tx.last_insert_rowid();
        tx.commit().storage(&self.path, "commit migration error")?;

        debug!(%run_id, error_type = %error.error_type, "recorded migration error");
        Ok(id)
    }
}

struct RawRun {
    id: i64,
    run_type: String,
    status: String,
    start_time: String,
    end_time: Option<String>,
    total_files_processed: i64,
    successful_files: i64,
    failed_files: i64,
    error_message: Option<String>,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_type: row.get(1)?,
            status: row.get(2)?,
            start_time: row.get(3)?,
            end_time: row.get(4)?,
            total_files_processed: row.get(5)?,
            successful_files: row.get(6)?,
            failed_files: row.get(7)?,
            error_message: row.get(8)?,
        })
    }

    fn decode(self, path: &str, legacy_offset: UtcOffset) -> Result<MigrationRun> {
        Ok(MigrationRun {
            id: RunId(self.id),
            run_type: RunType::parse(&self.run_type)
                .ok_or_else(|| corrupt(path, format!("unknown run_type {}", self.run_type)))?,
            status: RunStatus::parse(&self.status)
                .ok_or_else(|| corrupt(path, format!("unknown status {}", self.status)))?,
            start_time: decode_timestamp(path, legacy_offset, "start_time", &self.start_time)?,
            end_time: self
                .end_time
                .map(|value| decode_timestamp(path, legacy_offset, "end_time", &value))
                .transpose()?,
            total_files_processed: decode_count(
                path,
                "total_files_processed",
                self.total_files_processed,
            )?,
            successful_files: decode_count(path, "successful_files", self.successful_files)?,
            failed_files: decode_count(path, "failed_files", self.failed_files)?,
            error_message: self.error_message,
        })
    }
}

struct RawFile {
    file_id: String,
    account_id: String,
    account_name: Option<String>,
    file_name: Option<String>,
    object_key: Option<String>,
    size_bytes: i64,
    content_sha256: Option<String>,
    backup_timestamp: String,
    salesforce_updated: i64,
    updated_at: String,
}

impl RawFile {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            file_id: row.get(0)?,
            account_id: row.get(1)?,
            account_name: row.get(2)?,
            file_name: row.get(3)?,
            object_key: row.get(4)?,
            size_bytes: row.get(5)?,
            content_sha256: row.get(6)?,
            backup_timestamp: row.get(7)?,
            salesforce_updated: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn decode(self, path: &str, legacy_offset: UtcOffset) -> Result<FileMigrationRecord> {
        Ok(FileMigrationRecord {
            size_bytes: decode_count(path, "file_size_bytes", self.size_bytes)?,
            backup_timestamp: decode_timestamp(path, legacy_offset, "backup_timestamp", &self.backup_timestamp)?,
            fully_migrated: match self.salesforce_updated {
                0 => false,
                1 => true,
                other => return Err(corrupt(path, format!("salesforce_updated = {other}"))),
            },
            updated_at: decode_timestamp(path, legacy_offset, "updated_date", &self.updated_at)?,
            file_id: self.file_id,
            account_id: self.account_id,
            account_name: self.account_name,
            file_name: self.file_name,
            object_key: self.object_key,
            content_sha256: self.content_sha256,
        })
    }
}

struct RawError {
    id: i64,
    run_id: i64,
    error_type: String,
    file_id: Option<String>,
    message: String,
    source_url: Option<String>,
    timestamp: String,
}

impl RawError {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            error_type: row.get(2)?,
            file_id: row.get(3)?,
            message: row.get(4)?,
            source_url: row.get(5)?,
            timestamp: row.get(6)?,
        })
    }

    fn decode(self, path: &str, legacy_offset: UtcOffset) -> Result<MigrationError> {
        Ok(MigrationError {
            id: self.id,
            run_id: RunId(self.run_id),
            timestamp: decode_timestamp(path, legacy_offset, "timestamp", &self.timestamp)?,
            error_type: self.error_type,
            file_id: self.file_id,
            message: self.message,
            source_url: self.source_url,
        })
    }
}

fn run_status(conn: &Connection, path: &str, run_id: RunId) -> Result<RunStatus> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT COALESCE(status, 'running') FROM migration_runs WHERE id = ?1",
            params![run_id.0],
            |row| row.get(0),
        )
        .optional()
        .storage(path, "read run status")?;

    let raw = raw.ok_or_else(|| LedgerError::NotFound(format!("migration run {run_id}")))?;
    RunStatus::parse(&raw).ok_or_else(|| corrupt(path, format!("unknown status {raw}")))
}

fn end_one(
    conn: &Connection,
    path: &str,
    run_id: RunId,
    status: RunStatus,
    error_message: Option<&str>,
    end_time: &str,
) -> Result<()> {
    let current = run_status(conn, path, run_id)?;
    if current.is_terminal() {
        return Err(LedgerError::InvalidState(format!(
            "migration run {run_id} already ended as {current}"
        )));
    }

    conn.execute(
        "UPDATE migration_runs
         SET status = ?1, end_time = ?2, error_message = COALESCE(?3, error_message)
         WHERE id = ?4 AND COALESCE(status, 'running') = 'running'",
        params![status.as_str(), end_time, error_message, run_id.0],
    )
    .storage(path, "end migration run")?;
    Ok(())
}

fn table_exists(conn: &Connection, path: &str, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .storage(path, &format!("check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, path: &str, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, path, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .storage(path, &format!("inspect table_info for {table}"))?;
    let mut rows = stmt.query([]).storage(path, &format!("inspect table_info for {table}"))?;

    while let Some(row) = rows.next().storage(path, "read table_info row")? {
        let name: String = row.get(1).storage(path, "read table_info column name")?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection, path: &str) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .storage(path, "read current schema version")
}

fn record_schema_version(conn: &Connection, path: &str, version: i64) -> Result<()> {
    let now = format_timestamp(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .storage(path, &format!("record migration version {version}"))?;
    Ok(())
}

fn placeholders(first: usize, count: usize) -> String {
    (first..first + count).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ")
}

/// SQLite treats a negative LIMIT as unbounded.
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX))
}

fn corrupt(path: &str, detail: impl Display) -> LedgerError {
    LedgerError::storage(path, format!("corrupt ledger row: {detail}"))
}

fn encode_count(field: &str, value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| LedgerError::Validation(format!("{field} = {value} exceeds the storable range")))
}

fn checked_sum(run_id: RunId, field: &str, current: i64, delta: i64) -> Result<i64> {
    current.checked_add(delta).ok_or_else(|| {
        LedgerError::Validation(format!(
            "migration run {run_id}: {field} = {current} + {delta} exceeds the storable range"
        ))
    })
}

fn decode_count(path: &str, column: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| corrupt(path, format!("{column} = {value} is negative")))
}

/// Fixed-width UTC form, so that lexical order in SQL matches chronological order.
fn format_timestamp(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .map_err(|err| LedgerError::Validation(format!("failed to format timestamp: {err}")))
}

/// RFC 3339, or the offset-less wall-clock form earlier tooling wrote, read at `legacy_offset`.
fn parse_timestamp(raw: &str, legacy_offset: UtcOffset) -> Option<OffsetDateTime> {
    if let Ok(value) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(value);
    }

    PrimitiveDateTime::parse(
        raw,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"),
    )
    .ok()
    .map(|value| value.assume_offset(legacy_offset).to_offset(UtcOffset::UTC))
}

fn decode_timestamp(
    path: &str,
    legacy_offset: UtcOffset,
    column: &str,
    raw: &str,
) -> Result<OffsetDateTime> {
    parse_timestamp(raw, legacy_offset)
        .ok_or_else(|| corrupt(path, format!("{column} = {raw:?} is not ISO-8601")))
}
