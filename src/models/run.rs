use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CronError;

/// Most recent run rows kept by retention enforcement.
pub const RUN_RETENTION_CAP: u64 = 100_000;

/// Message written to runs that were still pending when the server restarted.
pub const RESTART_FAILURE_MESSAGE: &str = "server restarted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Starting,
    Running,
    Sending,
    Connecting,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Sending => "sending",
            RunStatus::Connecting => "connecting",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    /// Statuses a restart leaves without an owning process.
    pub fn pending() -> &'static [RunStatus] {
        &[RunStatus::Starting, RunStatus::Running]
    }

    pub fn terminal() -> &'static [RunStatus] {
        &[RunStatus::Succeeded, RunStatus::Failed]
    }
}

impl FromStr for RunStatus {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(RunStatus::Starting),
            "running" => Ok(RunStatus::Running),
            "sending" => Ok(RunStatus::Sending),
            "connecting" => Ok(RunStatus::Connecting),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(CronError::InvalidArgument(format!("unknown run status: {}", s))),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: i64,
    pub job_id: i64,
    pub database: String,
    pub user_name: String,
    pub command: String,
    pub status: RunStatus,
    pub job_pid: Option<i32>,
    pub return_message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// The row written when a run is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    pub run_id: i64,
    pub job_id: i64,
    pub database: String,
    pub user_name: String,
    /// Snapshot of the job's command at dispatch time.
    pub command: String,
    pub status: RunStatus,
}

impl NewRun {
    pub fn new(
        run_id: i64,
        job_id: i64,
        database: impl Into<String>,
        user_name: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            job_id,
            database: database.into(),
            user_name: user_name.into(),
            command: command.into(),
            status: RunStatus::Starting,
        }
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }
}

/// A single column assignment carried by a [`RunPatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunField {
    JobPid(i32),
    Status(RunStatus),
    ReturnMessage(String),
    StartTime(DateTime<Utc>),
    EndTime(DateTime<Utc>),
}

/// Partial update of a run row. Only the fields that are set are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    pub job_pid: Option<i32>,
    pub status: Option<RunStatus>,
    pub return_message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl RunPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_pid(mut self, pid: i32) -> Self {
        self.job_pid = Some(pid);
        self
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn return_message(mut self, message: impl Into<String>) -> Self {
        self.return_message = Some(message.into());
        self
    }

    pub fn start_time(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn end_time(mut self, at: DateTime<Utc>) -> Self {
        self.end_time = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// The set fields, in a fixed column order.
    pub fn fields(&self) -> Vec<RunField> {
        let mut fields = Vec::new();
        if let Some(pid) = self.job_pid {
            fields.push(RunField::JobPid(pid));
        }
        if let Some(status) = self.status {
            fields.push(RunField::Status(status));
        }
        if let Some(ref message) = self.return_message {
            fields.push(RunField::ReturnMessage(message.clone()));
        }
        if let Some(at) = self.start_time {
            fields.push(RunField::StartTime(at));
        }
        if let Some(at) = self.end_time {
            fields.push(RunField::EndTime(at));
        }
        fields
    }
}
