use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use migration_ledger_cli::{
    exit_code, init_tracing, local_offset, open_ledger, run_reconciler, LedgerArgs,
};
use migration_ledger_store_sqlite::AccessMode;
use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Parser)]
#[command(name = "fix-stale-runs")]
#[command(about = "Review runs left in 'running' state and mark them completed after confirmation")]
struct Cli {
    #[command(flatten)]
    ledger: LedgerArgs,
}

fn main() -> ExitCode {
    init_tracing();
    let legacy_offset = local_offset();
    exit_code(run(&Cli::parse(), legacy_offset))
}

fn run(cli: &Cli, legacy_offset: UtcOffset) -> Result<()> {
    let config = cli.ledger.config()?.with_legacy_offset(legacy_offset);
    let mut ledger = open_ledger(&config, AccessMode::ReadWrite)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{}", "=".repeat(60))?;
    writeln!(out, "Fix Stale Migration Entries")?;
    writeln!(out, "{}", "=".repeat(60))?;
    writeln!(out)?;

    let stdin = io::stdin();
    let mut input = stdin.lock();
    run_reconciler(&mut ledger, &config, OffsetDateTime::now_utc(), &mut input, &mut out)?;
    out.flush()?;
    Ok(())
}
