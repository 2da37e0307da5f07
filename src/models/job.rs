use std::fmt;
use std::str::FromStr;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CronError;
use crate::models::Identity;
use crate::schedule::ParsedSchedule;

/// Longest command accepted for a native (shell) job.
pub const NATIVE_COMMAND_MAX_LEN: usize = 1024;

/// Timezone offset used when a caller does not pass one.
pub const DEFAULT_TIMEZONE: &str = "8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    Single,
    Timing,
    Asap,
    Next,
    Fixed,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Single => "single",
            JobMode::Timing => "timing",
            JobMode::Asap => "asap",
            JobMode::Next => "next",
            JobMode::Fixed => "fixed",
        }
    }
}

impl FromStr for JobMode {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(JobMode::Single),
            "timing" => Ok(JobMode::Timing),
            "asap" => Ok(JobMode::Asap),
            "next" => Ok(JobMode::Next),
            "fixed" => Ok(JobMode::Fixed),
            _ => Err(CronError::InvalidArgument(format!(
                "invalid mode: {}, the range is 'single', 'timing', 'asap', 'next' or 'fixed'",
                s
            ))),
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Sql,
    #[serde(alias = "linux")]
    Native,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Sql => "sql",
            CommandType::Native => "native",
        }
    }
}

impl FromStr for CommandType {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sql" => Ok(CommandType::Sql),
            "native" | "linux" => Ok(CommandType::Native),
            _ => Err(CronError::InvalidArgument(format!(
                "invalid command type: {}, the range is 'sql' or 'native'",
                s
            ))),
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whole-hour offset from UTC in which a job's schedule is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub struct TimezoneOffset(i8);

impl TimezoneOffset {
    pub const MIN: i8 = -12;
    pub const MAX: i8 = 12;

    pub fn hours(&self) -> i8 {
        self.0
    }

    pub fn fixed_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(i32::from(self.0) * 3600).unwrap_or_else(|| Utc.fix())
    }

    fn out_of_range(text: &str) -> CronError {
        CronError::InvalidArgument(format!(
            "invalid timezone: {}, the range is {} ~ {}",
            text,
            Self::MIN,
            Self::MAX
        ))
    }
}

impl Default for TimezoneOffset {
    fn default() -> Self {
        TimezoneOffset(8)
    }
}

impl TryFrom<i8> for TimezoneOffset {
    type Error = CronError;

    fn try_from(hours: i8) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&hours) {
            Ok(TimezoneOffset(hours))
        } else {
            Err(Self::out_of_range(&hours.to_string()))
        }
    }
}

impl From<TimezoneOffset> for i8 {
    fn from(offset: TimezoneOffset) -> Self {
        offset.0
    }
}

impl FromStr for TimezoneOffset {
    type Err = CronError;

    /// Accepts a signed integer literal: an optional leading `-` followed by
    /// ASCII digits only.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('-').unwrap_or(s);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Self::out_of_range(s));
        }
        let hours: i64 = s.parse().map_err(|_| Self::out_of_range(s))?;
        if hours < i64::from(Self::MIN) || hours > i64::from(Self::MAX) {
            return Err(Self::out_of_range(s));
        }
        Ok(TimezoneOffset(hours as i8))
    }
}

impl fmt::Display for TimezoneOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution policy and flavour stored beside a job in the auxiliary
/// attributes table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttributes {
    pub mode: JobMode,
    pub timezone: TimezoneOffset,
    pub command_type: CommandType,
}

impl Default for JobAttributes {
    fn default() -> Self {
        Self {
            mode: JobMode::Next,
            timezone: TimezoneOffset::default(),
            command_type: CommandType::Sql,
        }
    }
}

/// How a caller names the job it wants to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKey {
    Id(i64),
    Name(String),
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKey::Id(id) => write!(f, "job {}", id),
            JobKey::Name(name) => write!(f, "job '{}'", name),
        }
    }
}

/// Arguments to `JobRegistrar::schedule`, still in their textual form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub name: Option<String>,
    pub schedule: String,
    pub command: String,
    pub mode: String,
    pub timezone: String,
    pub command_type: String,
}

impl ScheduleRequest {
    pub fn new(schedule: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: None,
            schedule: schedule.into(),
            command: command.into(),
            mode: JobMode::Next.as_str().to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            command_type: CommandType::Sql.as_str().to_string(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn command_type(mut self, command_type: impl Into<String>) -> Self {
        self.command_type = command_type.into();
        self
    }
}

/// Validate the mode/timezone/command-type fields of a request and the
/// privilege rules attached to native commands.
///
/// The schedule text is checked separately by the injected parser.
pub fn validate_schedule_request(
    request: &ScheduleRequest,
    caller: &Identity,
) -> Result<JobAttributes, CronError> {
    let mode: JobMode = request.mode.parse()?;
    let timezone: TimezoneOffset = request.timezone.parse()?;
    let command_type: CommandType = request.command_type.parse()?;

    if command_type == CommandType::Native {
        if !caller.superuser {
            return Err(CronError::PermissionDenied(
                "native commands must be scheduled by a superuser".to_string(),
            ));
        }
        if request.command.len() > NATIVE_COMMAND_MAX_LEN {
            return Err(CronError::InvalidArgument(format!(
                "invalid native command length, the maximum length is {}",
                NATIVE_COMMAND_MAX_LEN
            )));
        }
    }

    if let Some(ref name) = request.name {
        if name.trim().is_empty() {
            return Err(CronError::InvalidArgument(
                "invalid job name: name cannot be empty".to_string(),
            ));
        }
    }

    Ok(JobAttributes {
        mode,
        timezone,
        command_type,
    })
}

/// Row shape written to the job table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJobRecord {
    pub job_name: Option<String>,
    pub schedule: String,
    pub command: String,
    pub node_name: String,
    pub node_port: i32,
    pub database: String,
    pub user_name: String,
}

/// Row shape read back from the job table, joined with its attributes when
/// the auxiliary table exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub job_id: i64,
    pub job_name: Option<String>,
    pub schedule: String,
    pub command: String,
    pub node_name: String,
    pub node_port: i32,
    pub database: String,
    pub user_name: String,
    pub active: bool,
    pub attributes: Option<JobAttributes>,
}

/// A job as mirrored by the job cache.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: i64,
    pub job_name: Option<String>,
    pub schedule_text: String,
    #[serde(skip)]
    pub schedule: ParsedSchedule,
    pub command: String,
    pub mode: JobMode,
    pub command_type: CommandType,
    pub timezone: TimezoneOffset,
    pub node_name: String,
    pub node_port: i32,
    pub database: String,
    pub user_name: String,
    pub active: bool,
    /// Identity the scheduling loop executes this job as.
    pub run_as: Identity,
}

impl Job {
    pub fn from_record(record: JobRecord, schedule: ParsedSchedule, run_as: Identity) -> Self {
        let attributes = record.attributes.unwrap_or_default();
        Self {
            job_id: record.job_id,
            job_name: record.job_name,
            schedule_text: record.schedule,
            schedule,
            command: record.command,
            mode: attributes.mode,
            command_type: attributes.command_type,
            timezone: attributes.timezone,
            node_name: record.node_name,
            node_port: record.node_port,
            database: record.database,
            user_name: record.user_name,
            active: record.active,
            run_as,
        }
    }
}
