use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use thiserror::Error;

use crate::errors::CronError;
use crate::models::TimezoneOffset;

#[derive(Debug, Error)]
#[error("invalid schedule: {text}: {reason}")]
pub struct ScheduleError {
    pub text: String,
    pub reason: String,
}

impl From<ScheduleError> for CronError {
    fn from(err: ScheduleError) -> Self {
        CronError::InvalidArgument(err.to_string())
    }
}

/// A schedule produced by the parser. `Never` is what a malformed stored
/// schedule degrades to.
#[derive(Clone, Default)]
pub enum ParsedSchedule {
    Cron(Arc<croner::Cron>),
    #[default]
    Never,
}

impl ParsedSchedule {
    pub fn never() -> Self {
        ParsedSchedule::Never
    }

    pub fn can_fire(&self) -> bool {
        matches!(self, ParsedSchedule::Cron(_))
    }
}

impl fmt::Debug for ParsedSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParsedSchedule::Cron(_) => f.write_str("ParsedSchedule::Cron"),
            ParsedSchedule::Never => f.write_str("ParsedSchedule::Never"),
        }
    }
}

/// The cron-expression parser/evaluator consumed by the catalog.
pub trait ScheduleParser: Send + Sync {
    fn parse(&self, text: &str) -> Result<ParsedSchedule, ScheduleError>;

    /// Whether `schedule` fires in the minute containing `now`, evaluated
    /// at the given offset.
    fn is_due(&self, schedule: &ParsedSchedule, offset: TimezoneOffset, now: DateTime<Utc>)
        -> bool;
}

/// Parser backed by `croner`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CronParser;

impl ScheduleParser for CronParser {
    fn parse(&self, text: &str) -> Result<ParsedSchedule, ScheduleError> {
        let cron = croner::Cron::from_str(text).map_err(|e| ScheduleError {
            text: text.to_string(),
            reason: e.to_string(),
        })?;
        Ok(ParsedSchedule::Cron(Arc::new(cron)))
    }

    fn is_due(
        &self,
        schedule: &ParsedSchedule,
        offset: TimezoneOffset,
        now: DateTime<Utc>,
    ) -> bool {
        let cron = match schedule {
            ParsedSchedule::Cron(cron) => cron,
            ParsedSchedule::Never => return false,
        };

        let local = now.with_timezone(&offset.fixed_offset());
        let minute = match local.with_second(0).and_then(|t| t.with_nanosecond(0)) {
            Some(minute) => minute,
            None => return false,
        };

        match cron.find_next_occurrence(&minute, true) {
            Ok(next) => next == minute,
            Err(e) => {
                tracing::debug!("Cron next occurrence error at {}: {}", minute, e);
                false
            }
        }
    }
}
