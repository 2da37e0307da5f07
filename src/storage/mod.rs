pub mod schema;
pub mod sqlite;

use std::fmt;
use std::str::FromStr;

use crate::errors::{CronError, Result};
use crate::models::{
    Identity, JobAttributes, JobRecord, NewJobRecord, NewRun, Run, RunPatch, RunStatus,
};
use crate::probes::ExtensionState;

pub use sqlite::SqliteStore;

/// Identity of the job table as seen by invalidation notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableId(pub i64);

/// The metadata tables a privilege can be granted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogTable {
    Job,
    JobExt,
    RunDetails,
}

impl CatalogTable {
    pub fn name(&self) -> &'static str {
        match self {
            CatalogTable::Job => schema::JOB_TABLE,
            CatalogTable::JobExt => schema::JOB_EXT_TABLE,
            CatalogTable::RunDetails => schema::RUN_DETAILS_TABLE,
        }
    }
}

impl FromStr for CatalogTable {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            schema::JOB_TABLE => Ok(CatalogTable::Job),
            schema::JOB_EXT_TABLE => Ok(CatalogTable::JobExt),
            schema::RUN_DETAILS_TABLE => Ok(CatalogTable::RunDetails),
            _ => Err(CronError::InvalidArgument(format!(
                "invalid table: {}, the range is {}, {} or {}",
                s,
                schema::JOB_TABLE,
                schema::JOB_EXT_TABLE,
                schema::RUN_DETAILS_TABLE
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Select,
    Insert,
    Update,
    Delete,
}

impl Privilege {
    pub fn as_str(&self) -> &'static str {
        match self {
            Privilege::Select => "SELECT",
            Privilege::Insert => "INSERT",
            Privilege::Update => "UPDATE",
            Privilege::Delete => "DELETE",
        }
    }
}

impl FromStr for Privilege {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SELECT" => Ok(Privilege::Select),
            "INSERT" => Ok(Privilege::Insert),
            "UPDATE" => Ok(Privilege::Update),
            "DELETE" => Ok(Privilege::Delete),
            _ => Err(CronError::InvalidArgument(format!(
                "invalid privilege: {}, the range is SELECT, INSERT, UPDATE or DELETE",
                s
            ))),
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lookup predicate for a single job row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobLookup {
    Id(i64),
    Name { name: String, user_name: String },
}

/// Transactional access to the persistent job/run tables.
///
/// Every catalog operation calls `begin` once, runs its statements on the
/// returned transaction and commits before returning. Dropping a transaction
/// without committing rolls it back.
pub trait MetadataStore: Send + Sync {
    fn begin(&self, identity: &Identity) -> Result<Box<dyn MetadataTx + '_>>;

    /// Open a transaction that holds the write lock from its first statement.
    /// Every operation that writes starts here, so concurrent writers queue
    /// on the lock instead of failing when a read lock cannot be upgraded.
    fn begin_write(&self, identity: &Identity) -> Result<Box<dyn MetadataTx + '_>>;
}

/// One open transaction with a fresh snapshot.
///
/// Writes are authorized against the transaction's *effective* identity,
/// which `set_identity` may switch (see `privilege::Elevated`).
pub trait MetadataTx {
    fn identity(&self) -> &Identity;

    /// Switch the effective identity, returning the previous one.
    fn set_identity(&mut self, identity: Identity) -> Identity;

    fn probe(&mut self) -> Result<ExtensionState>;

    /// The identity that owns the catalog tables.
    fn extension_owner(&mut self) -> Result<Identity>;

    /// Resolve a stored user name to an identity, including its superuser flag.
    fn role(&mut self, user_name: &str) -> Result<Identity>;

    fn jobs_table_id(&mut self) -> Result<Option<TableId>>;

    /// Counter bumped by every committed change to the job definitions or
    /// the install record, whichever connection made it. `None` before
    /// install.
    fn change_token(&mut self) -> Result<Option<i64>>;

    fn has_table_privilege(
        &mut self,
        user: &Identity,
        table: CatalogTable,
        privilege: Privilege,
    ) -> Result<bool>;

    /// Insert a job. A named job is upserted on (name, user): schedule and
    /// command are replaced and the existing id is returned.
    fn upsert_job(&mut self, job: &NewJobRecord) -> Result<i64>;
    fn find_job(&mut self, lookup: &JobLookup) -> Result<Option<JobRecord>>;
    fn scan_jobs(&mut self) -> Result<Vec<JobRecord>>;
    fn delete_job(&mut self, job_id: i64) -> Result<u64>;
    fn set_job_active(&mut self, job_id: i64, active: bool) -> Result<u64>;

    fn upsert_job_attributes(
        &mut self,
        job_id: i64,
        job_name: Option<&str>,
        user_name: &str,
        attributes: &JobAttributes,
    ) -> Result<()>;
    fn find_job_attributes(&mut self, job_id: i64) -> Result<Option<JobAttributes>>;
    fn delete_job_attributes(&mut self, job_id: i64) -> Result<u64>;

    fn next_run_id(&mut self) -> Result<i64>;
    fn insert_run(&mut self, run: &NewRun) -> Result<()>;
    /// Apply a partial update. A patch carrying a status never overwrites a
    /// terminal status.
    fn update_run(&mut self, run_id: i64, patch: &RunPatch) -> Result<u64>;
    fn fail_runs(&mut self, statuses: &[RunStatus], message: &str) -> Result<u64>;
    fn count_runs(&mut self) -> Result<u64>;
    /// Delete every run except the `keep` with the largest run ids.
    fn purge_runs_beyond(&mut self, keep: u64) -> Result<u64>;
    fn find_run(&mut self, run_id: i64) -> Result<Option<Run>>;
    fn list_runs(&mut self, job_id: Option<i64>, limit: usize) -> Result<Vec<Run>>;

    fn commit(self: Box<Self>) -> Result<()>;
}
