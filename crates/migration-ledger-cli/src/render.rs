use std::io::{self, Write};

use migration_ledger_core::{MigrationPhase, RunStatus};
use time::macros::format_description;
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::StatusView;

const RULE_WIDTH: usize = 70;

#[must_use]
pub fn format_count(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    grouped
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} PB")
}

/// `2h 5m 3s`; negative spans render as zero.
#[must_use]
pub fn format_duration(span: Duration) -> String {
    let total = span.whole_seconds().max(0);
    format!("{}h {}m {}s", total / 3600, (total % 3600) / 60, total % 60)
}

#[must_use]
pub fn format_instant(value: OffsetDateTime) -> String {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second] UTC"))
        .unwrap_or_else(|_| value.to_string())
}

fn phase_label(phase: MigrationPhase) -> &'static str {
    match phase {
        MigrationPhase::NotStarted => "not started",
        MigrationPhase::BackupRunning => "backup running",
        MigrationPhase::BackupComplete => "backup complete",
        MigrationPhase::FullMigration => "full migration in progress",
    }
}

fn section(out: &mut impl Write, title: &str) -> io::Result<()> {
    writeln!(out, "{title}")?;
    writeln!(out, "{}", "-".repeat(RULE_WIDTH))
}

fn optional_instant(value: Option<OffsetDateTime>) -> String {
    value.map_or_else(|| "never".to_string(), format_instant)
}

/// Human-readable status report.
///
/// # Errors
/// Returns any I/O error from `out`.
pub fn render_status(view: &StatusView, out: &mut impl Write) -> io::Result<()> {
    let report = &view.report;
    let files = &report.files;

    writeln!(out, "{}", "=".repeat(RULE_WIDTH))?;
    writeln!(out, "MIGRATION STATUS CHECK")?;
    writeln!(out, "{}", "=".repeat(RULE_WIDTH))?;
    writeln!(out, "Database:  {}", view.db_path)?;
    writeln!(out, "Generated: {}", format_instant(report.generated_at))?;
    writeln!(out, "Phase:     {}", phase_label(report.phase))?;
    writeln!(out)?;

    if report.phase == MigrationPhase::NotStarted {
        writeln!(out, "Migration not started: no runs or files recorded yet.")?;
        writeln!(out)?;
    }

    section(out, "📊 FILE STATISTICS:")?;
    writeln!(out, "Total Files Tracked:      {}", format_count(files.total_files))?;
    writeln!(out, "Backup Only (Phase 1):    {}", format_count(files.backup_only_count))?;
    writeln!(out, "Fully Migrated (Phase 2): {}", format_count(files.fully_migrated_count))?;
    writeln!(out, "Unique Accounts:          {}", format_count(files.distinct_account_count))?;
    writeln!(out, "Total Data Size:          {}", format_bytes(files.total_bytes))?;
    writeln!(out, "First Backup:             {}", optional_instant(files.earliest_backup))?;
    writeln!(out, "Last Backup:              {}", optional_instant(files.latest_backup))?;
    writeln!(out)?;

    writeln!(out, "📈 BACKUP PROGRESS:")?;
    match report.progress.percent {
        Some(percent) => writeln!(
            out,
            "   {percent:.1}% complete ({} / {})",
            format_count(report.progress.backed_up),
            format_count(report.progress.expected_total)
        )?,
        None => writeln!(
            out,
            "   {} files backed up (no expected total configured)",
            format_count(report.progress.backed_up)
        )?,
    }
    writeln!(out)?;

    section(out, "🔄 MIGRATION RUNS:")?;
    if report.running.is_empty() {
        writeln!(out, "✅ No running migrations")?;
    } else {
        writeln!(out, "⚠️  Found {} migration(s) with 'running' status:", report.running.len())?;
        writeln!(out)?;
        for entry in &report.running {
            let run = &entry.run;
            writeln!(out, "   Run ID: {}", run.id)?;
            writeln!(out, "   Type: {}", run.run_type)?;
            writeln!(out, "   Started: {}", format_instant(run.start_time))?;
            writeln!(
                out,
                "   Running for: {}",
                format_duration(Duration::seconds(entry.elapsed_seconds))
            )?;
            if entry.stale {
                writeln!(out, "   ⚠️  WARNING: This looks like a stale entry!")?;
            }
            writeln!(out, "   Files Processed: {}", format_count(run.total_files_processed))?;
            writeln!(out, "   Successful: {}", format_count(run.successful_files))?;
            writeln!(out, "   Failed: {}", format_count(run.failed_files))?;
            writeln!(out)?;
        }
        if report.stale_runs().next().is_some() {
            writeln!(out, "💡 TIP: Run 'fix-stale-runs' to review and close stale entries")?;
        }
    }
    writeln!(out)?;

    section(out, "📋 RECENT FINISHED RUNS:")?;
    if report.recent_finished.is_empty() {
        writeln!(out, "No finished runs yet")?;
    }
    for entry in &report.recent_finished {
        let run = &entry.run;
        let marker = if run.status == RunStatus::Completed { "✅" } else { "❌" };
        writeln!(out, "{marker} {} - {} (run {})", run.run_type, run.status, run.id)?;
        writeln!(out, "   Started: {}", format_instant(run.start_time))?;
        writeln!(out, "   Ended: {}", optional_instant(run.end_time))?;
        if let Some(seconds) = entry.duration_seconds {
            writeln!(out, "   Duration: {}", format_duration(Duration::seconds(seconds)))?;
        }
        writeln!(
            out,
            "   Files: {} processed, {} successful, {} failed",
            format_count(run.total_files_processed),
            format_count(run.successful_files),
            format_count(run.failed_files)
        )?;
        if let Some(message) = &run.error_message {
            writeln!(out, "   Error: {message}")?;
        }
    }
    writeln!(out)?;

    section(out, "❌ TOP ERROR TYPES:")?;
    if report.top_errors.is_empty() {
        writeln!(out, "✅ No errors recorded")?;
    }
    for entry in &report.top_errors {
        writeln!(out, "   {:<30} {}", entry.error_type, format_count(entry.count))?;
    }
    writeln!(out)?;

    if let Some(accounts) = &view.accounts {
        section(out, &format!("TOP {} ACCOUNTS BY FILE COUNT:", accounts.len()))?;
        if accounts.is_empty() {
            writeln!(out, "No account data found.")?;
        }
        for account in accounts {
            let name = account.account_name.as_deref().unwrap_or(&account.account_id);
            writeln!(
                out,
                "   {:<30} {:>10} files {:>10}  {} migrated  last {}",
                truncate(name, 30),
                format_count(account.file_count),
                format_bytes(account.total_bytes),
                format_count(account.fully_migrated_count),
                optional_instant(account.latest_backup)
            )?;
        }
        writeln!(out)?;
    }

    if let Some(errors) = &view.recent_errors {
        section(out, &format!("RECENT ERRORS (last {}):", errors.len()))?;
        if errors.is_empty() {
            writeln!(out, "✅ No recent errors found")?;
        }
        for error in errors {
            writeln!(out, "Time: {}", format_instant(error.timestamp))?;
            writeln!(out, "Run: {}", error.run_id)?;
            writeln!(out, "Type: {}", error.error_type)?;
            writeln!(out, "File: {}", error.file_id.as_deref().unwrap_or("N/A"))?;
            writeln!(out, "Message: {}", error.message)?;
            writeln!(out)?;
        }
    }

    if let Some(integrity) = &view.integrity {
        section(out, "🩺 INTEGRITY CHECK:")?;
        writeln!(out, "quick_check: {}", integrity.quick_check_message)?;
        writeln!(out, "foreign key violations: {}", integrity.foreign_key_violations)?;
        writeln!(
            out,
            "schema version: {} (target {})",
            integrity.schema_status.current_version, integrity.schema_status.target_version
        )?;
        writeln!(out)?;
    }

    writeln!(out, "{}", "=".repeat(RULE_WIDTH))?;
    if let Some(size) = view.db_size_bytes {
        writeln!(out, "Database size: {}", format_bytes(size))?;
    }
    writeln!(out, "Last updated: {}", format_instant(report.generated_at))?;
    writeln!(out, "{}", "=".repeat(RULE_WIDTH))?;

    Ok(())
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
