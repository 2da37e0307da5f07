use thiserror::Error;

/// Error taxonomy shared by every catalog operation.
#[derive(Debug, Error)]
pub enum CronError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Store failure: {0}")]
    StoreFailure(String),
}

pub type Result<T> = std::result::Result<T, CronError>;

impl From<rusqlite::Error> for CronError {
    fn from(err: rusqlite::Error) -> Self {
        CronError::StoreFailure(err.to_string())
    }
}
