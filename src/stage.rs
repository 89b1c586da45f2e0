//! Resumable numbered pipeline stages.
//!
//! Stages run strictly sequentially in ascending index order. A requested
//! resume index (possibly negative, meaning "start before any data exists")
//! skips every stage below it; skipped stages are assumed to have left their
//! artifacts on disk from an earlier run. A stage body either completes or
//! the whole pipeline aborts — there is no partial-stage retry at this layer.

use serde::Serialize;

use crate::error::{PrepError, PrepResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Executed,
    Skipped,
}

/// One controller decision, for the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageOutcome {
    pub index: i32,
    pub label: String,
    pub status: StageStatus,
}

/// Drives numbered stage bodies in ascending order, honoring a resume index.
#[derive(Debug)]
pub struct StageController {
    resume_from: i32,
    last_index: Option<i32>,
    outcomes: Vec<StageOutcome>,
}

impl StageController {
    #[must_use]
    pub fn new(resume_from: i32) -> Self {
        Self {
            resume_from,
            last_index: None,
            outcomes: Vec::new(),
        }
    }

    /// Execute (or skip) the stage with the given index and label.
    ///
    /// Indices must be submitted in strictly ascending order; anything else
    /// is a programming error in the pipeline wiring. Errors from the body
    /// are wrapped in [`PrepError::StageAbort`] carrying the stage identity.
    pub fn run(
        &mut self,
        index: i32,
        label: &str,
        body: impl FnOnce() -> PrepResult<()>,
    ) -> PrepResult<()> {
        if let Some(last) = self.last_index
            && index <= last
        {
            return Err(PrepError::InvalidConfig(format!(
                "stage {index} ({label}) submitted after stage {last}; stages must ascend"
            )));
        }
        self.last_index = Some(index);

        if index < self.resume_from {
            tracing::info!(stage = index, label, "stage skipped (resume point {})", self.resume_from);
            self.outcomes.push(StageOutcome {
                index,
                label: label.to_owned(),
                status: StageStatus::Skipped,
            });
            return Ok(());
        }

        tracing::info!(stage = index, label, "stage started");
        body().map_err(|err| PrepError::stage_abort(index, label, err))?;
        tracing::info!(stage = index, label, "stage finished");
        self.outcomes.push(StageOutcome {
            index,
            label: label.to_owned(),
            status: StageStatus::Executed,
        });
        Ok(())
    }

    /// Decisions taken so far, in submission order.
    #[must_use]
    pub fn outcomes(&self) -> &[StageOutcome] {
        &self.outcomes
    }
}
