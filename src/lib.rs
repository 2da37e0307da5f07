pub mod cache;
pub mod cli;
pub mod daemon;
pub mod errors;
pub mod invalidation;
pub mod models;
pub mod privilege;
pub mod probes;
pub mod registrar;
pub mod runs;
pub mod schedule;
pub mod storage;

pub use errors::{CronError, Result};
