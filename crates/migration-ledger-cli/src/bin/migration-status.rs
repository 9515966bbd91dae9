use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use migration_ledger_cli::{
    collect_status, emit_json, exit_code, init_tracing, local_offset, open_ledger, render_status,
    LedgerArgs, StatusOptions,
};
use migration_ledger_store_sqlite::AccessMode;
use time::{OffsetDateTime, UtcOffset};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "migration-status")]
#[command(about = "Report migration progress recorded in the local tracking database")]
struct Cli {
    #[command(flatten)]
    ledger: LedgerArgs,

    /// Print the report as JSON instead of text.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Include the N largest accounts by file count.
    #[arg(long, value_name = "N")]
    accounts: Option<usize>,

    /// Include the N most recent errors.
    #[arg(long, value_name = "N")]
    recent_errors: Option<usize>,

    /// Run SQLite quick_check and foreign key checks as part of the report.
    #[arg(long, default_value_t = false)]
    integrity_check: bool,

    /// Also write every run, file record and error to FILE as JSON.
    #[arg(long, value_name = "FILE")]
    export: Option<PathBuf>,
}

fn main() -> ExitCode {
    init_tracing();
    let legacy_offset = local_offset();
    exit_code(run(&Cli::parse(), legacy_offset))
}

fn run(cli: &Cli, legacy_offset: UtcOffset) -> Result<()> {
    let config = cli.ledger.config()?.with_legacy_offset(legacy_offset);
    let ledger = open_ledger(&config, AccessMode::QueryOnly)?;
    debug!(path = %ledger.path(), "opened migration database for reporting");

    let options = StatusOptions {
        accounts: cli.accounts,
        recent_errors: cli.recent_errors,
        integrity_check: cli.integrity_check,
    };
    let view = collect_status(&ledger, &config, &options, OffsetDateTime::now_utc())?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if cli.json {
        emit_json(&view, &mut out)?;
    } else {
        render_status(&view, &mut out).context("failed to write status report")?;
    }

    if let Some(path) = &cli.export {
        let summary = ledger.export_metadata(path)?;
        if !cli.json {
            writeln!(
                out,
                "📦 Exported {} runs, {} files, {} errors to {}",
                summary.runs, summary.files, summary.errors, summary.path
            )?;
        }
    }

    out.flush()?;
    Ok(())
}
