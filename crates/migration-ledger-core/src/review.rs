use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::report::RunningRun;
use crate::{LedgerConfig, LedgerError, LedgerReader, RunId, RunLedger, RunStatus};

/// Operator answer to the "mark these runs completed?" prompt.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Confirmation {
    Confirmed,
    Rejected,
}

impl Confirmation {
    /// Only an explicit `yes` or `y` confirms; every other answer rejects.
    #[must_use]
    pub fn parse(answer: &str) -> Self {
        match answer.trim().to_ascii_lowercase().as_str() {
            "yes" | "y" => Self::Confirmed,
            _ => Self::Rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Clean,
    Aborted {
        pending: usize,
    },
    Completed {
        run_ids: Vec<RunId>,
        #[serde(with = "time::serde::rfc3339")]
        ended_at: OffsetDateTime,
    },
}

/// Runs found in `running` state, captured for operator review before any write.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StaleRunReview {
    pub runs: Vec<RunningRun>,
    pub reviewed_at: OffsetDateTime,
}

impl StaleRunReview {
    /// # Errors
    /// Propagates read failures from `reader`.
    pub fn load<R>(
        reader: &R,
        config: &LedgerConfig,
        now: OffsetDateTime,
    ) -> Result<Self, LedgerError>
    where
        R: LedgerReader + ?Sized,
    {
        let runs = reader
            .list_runs(&[RunStatus::Running], None)?
            .into_iter()
            .map(|run| RunningRun::observe(run, now, config.stale_after))
            .collect();
        Ok(Self { runs, reviewed_at: now })
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.runs.is_empty()
    }

    #[must_use]
    pub fn run_ids(&self) -> Vec<RunId> {
        self.runs.iter().map(|entry| entry.run.id).collect()
    }

    /// Apply the operator's decision. A rejection performs zero writes; a
    /// confirmation ends every reviewed run as completed at `ended_at`.
    ///
    /// # Errors
    /// Propagates the ledger failure when the batch cannot be ended; in that
    /// case no run is changed.
    pub fn apply<L>(
        &self,
        ledger: &mut L,
        confirmation: Confirmation,
        ended_at: OffsetDateTime,
    ) -> Result<ReconcileOutcome, LedgerError>
    where
        L: RunLedger + ?Sized,
    {
        if self.is_clean() {
            return Ok(ReconcileOutcome::Clean);
        }

        match confirmation {
            Confirmation::Rejected => Ok(ReconcileOutcome::Aborted { pending: self.runs.len() }),
            Confirmation::Confirmed => {
                let run_ids = self.run_ids();
                ledger.end_runs_at(&run_ids, RunStatus::Completed, ended_at)?;
                Ok(ReconcileOutcome::Completed { run_ids, ended_at })
            }
        }
    }
}
