use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::Job;

/// A job found due by the maintenance loop, handed to whatever executes it.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRequest {
    pub job: Job,
    /// Start of the minute the schedule matched.
    pub due_at: DateTime<Utc>,
}

impl DispatchRequest {
    pub fn new(job: Job, due_at: DateTime<Utc>) -> Self {
        Self { job, due_at }
    }

    pub fn job_id(&self) -> i64 {
        self.job.job_id
    }
}
