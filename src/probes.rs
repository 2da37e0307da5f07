//! Readiness probes consulted at the start of every catalog operation.

use crate::errors::{CronError, Result};

/// Snapshot of the install state, taken inside the operation's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtensionState {
    /// The install record exists and its script has finished.
    pub extension_loaded: bool,
    /// The node is a read-only replica.
    pub read_only: bool,
    pub jobs_table: bool,
    pub run_details_table: bool,
    pub job_ext_table: bool,
}

/// Whether run tracking is provisioned for the current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTracking {
    Enabled,
    Disabled,
}

impl ExtensionState {
    pub fn extension_loaded(&self) -> bool {
        self.extension_loaded
    }

    pub fn jobs_table_ready(&self) -> bool {
        self.extension_loaded && self.jobs_table
    }

    pub fn run_details_table_ready(&self) -> bool {
        self.extension_loaded && self.run_details_table
    }

    /// Whether the job table may be scanned. A replica reports an empty job
    /// set so that its scheduler stays idle.
    pub fn jobs_visible(&self) -> bool {
        self.jobs_table_ready() && !self.read_only
    }

    pub fn run_tracking(&self) -> RunTracking {
        if self.run_details_table_ready() && !self.read_only {
            RunTracking::Enabled
        } else {
            RunTracking::Disabled
        }
    }

    pub fn job_attributes_available(&self) -> bool {
        self.extension_loaded && self.job_ext_table
    }

    /// Fail with `NotReady` unless job definitions can be written.
    pub fn ensure_job_writes(&self) -> Result<()> {
        if !self.extension_loaded {
            return Err(CronError::NotReady(
                "cron extension is not loaded".to_string(),
            ));
        }
        if !self.jobs_table {
            return Err(CronError::NotReady("job table does not exist".to_string()));
        }
        if self.read_only {
            return Err(CronError::NotReady(
                "cannot modify jobs on a read-only replica".to_string(),
            ));
        }
        Ok(())
    }
}
