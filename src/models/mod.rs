pub mod config;
pub mod dispatch;
pub mod identity;
pub mod job;
pub mod run;

pub use config::{CatalogConfig, ReloadMode};
pub use dispatch::DispatchRequest;
pub use identity::Identity;
pub use job::{
    validate_schedule_request, CommandType, Job, JobAttributes, JobKey, JobMode, JobRecord,
    NewJobRecord, ScheduleRequest, TimezoneOffset,
};
pub use run::{
    NewRun, Run, RunField, RunPatch, RunStatus, RESTART_FAILURE_MESSAGE, RUN_RETENTION_CAP,
};
