//! Run lifecycle recording, crash reconciliation and retention.
//!
//! Tracking is best effort. When the run-details table is not provisioned,
//! the catalog is mid-install, or the node is a replica, every operation here
//! succeeds without touching the store and returns a neutral value.

use std::sync::Arc;

use crate::errors::{CronError, Result};
use crate::models::{Identity, NewRun, Run, RunPatch, RunStatus, RESTART_FAILURE_MESSAGE};
use crate::privilege::as_owner;
use crate::probes::RunTracking;
use crate::storage::{MetadataStore, MetadataTx};

/// Run id handed out when tracking is disabled for a dispatch.
pub const UNTRACKED_RUN: i64 = 0;

pub struct RunTracker {
    store: Arc<dyn MetadataStore>,
    worker: Identity,
    retention: u64,
}

impl RunTracker {
    pub fn new(store: Arc<dyn MetadataStore>, worker: Identity, retention: u64) -> Self {
        Self {
            store,
            worker,
            retention,
        }
    }

    pub fn retention(&self) -> u64 {
        self.retention
    }

    /// Run a writing `op` as the catalog owner in its own write transaction,
    /// or return `disabled` when tracking is off.
    fn tracked<T>(
        &self,
        disabled: T,
        op: impl FnOnce(&mut dyn MetadataTx) -> Result<T>,
    ) -> Result<T> {
        run_as_owner(self.store.begin_write(&self.worker)?, disabled, op)
    }

    /// Read-only counterpart of [`RunTracker::tracked`].
    fn inspect<T>(
        &self,
        disabled: T,
        op: impl FnOnce(&mut dyn MetadataTx) -> Result<T>,
    ) -> Result<T> {
        run_as_owner(self.store.begin(&self.worker)?, disabled, op)
    }

    /// Allocate a run id for a dispatch of `job_id`. Returns
    /// [`UNTRACKED_RUN`] when tracking is disabled.
    pub fn begin_run(&self, job_id: i64) -> Result<i64> {
        let run_id = self.tracked(UNTRACKED_RUN, |tx| tx.next_run_id())?;
        tracing::debug!("Allocated run {} for job {}", run_id, job_id);
        Ok(run_id)
    }

    pub fn record_dispatch(&self, run: &NewRun) -> Result<()> {
        if run.run_id == UNTRACKED_RUN {
            return Ok(());
        }
        self.tracked((), |tx| tx.insert_run(run))
    }

    /// Write the fields set in `patch`. A status already terminal is kept.
    pub fn update_run(&self, run_id: i64, patch: &RunPatch) -> Result<()> {
        if patch.is_empty() {
            return Err(CronError::InvalidArgument(
                "a run update needs at least one field".to_string(),
            ));
        }
        if run_id == UNTRACKED_RUN {
            return Ok(());
        }
        let updated = self.tracked(None, |tx| tx.update_run(run_id, patch).map(Some))?;
        if updated == Some(0) {
            tracing::debug!(
                "Run {} not updated: missing or already in a terminal status",
                run_id
            );
        }
        Ok(())
    }

    /// Fail every run a previous process left starting or running.
    pub fn reconcile_after_restart(&self) -> Result<u64> {
        let failed = self.tracked(0, |tx| {
            tx.fail_runs(RunStatus::pending(), RESTART_FAILURE_MESSAGE)
        })?;
        if failed > 0 {
            tracing::info!("Marked {} interrupted run(s) as failed", failed);
        }
        Ok(failed)
    }

    /// Purge the oldest runs beyond the retention cap. Returns rows deleted.
    pub fn enforce_retention(&self) -> Result<u64> {
        let retention = self.retention;
        let purged = self.tracked(0, |tx| {
            if tx.count_runs()? <= retention {
                return Ok(0);
            }
            tx.purge_runs_beyond(retention)
        })?;
        if purged > 0 {
            tracing::info!("Purged {} run(s) beyond retention of {}", purged, retention);
        }
        Ok(purged)
    }

    /// The command recorded when a run was dispatched.
    pub fn run_command(&self, run_id: i64) -> Result<Option<String>> {
        self.inspect(None, |tx| Ok(tx.find_run(run_id)?.map(|run| run.command)))
    }

    pub fn find_run(&self, run_id: i64) -> Result<Option<Run>> {
        self.inspect(None, |tx| tx.find_run(run_id))
    }

    /// Most recent runs first, optionally for a single job.
    pub fn list_runs(&self, job_id: Option<i64>, limit: usize) -> Result<Vec<Run>> {
        self.inspect(Vec::new(), |tx| tx.list_runs(job_id, limit))
    }
}

fn run_as_owner<T>(
    mut tx: Box<dyn MetadataTx + '_>,
    disabled: T,
    op: impl FnOnce(&mut dyn MetadataTx) -> Result<T>,
) -> Result<T> {
    if tx.probe()?.run_tracking() == RunTracking::Disabled {
        return Ok(disabled);
    }
    let value = {
        let mut owner = as_owner(&mut *tx)?;
        op(&mut *owner)?
    };
    tx.commit()?;
    Ok(value)
}
