use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::errors::{CronError, Result};
use crate::models::{
    Identity, JobAttributes, JobRecord, NewJobRecord, NewRun, Run, RunField, RunPatch, RunStatus,
};
use crate::probes::ExtensionState;
use crate::storage::schema::{
    self, InstallOptions, InstallState, EXTENSION_NAME, GENERATION_TABLE, JOB_EXT_TABLE,
    JOB_GENERATION, JOB_ID_SEQUENCE, JOB_TABLE, RUN_DETAILS_TABLE, RUN_ID_SEQUENCE,
};
use crate::storage::{CatalogTable, JobLookup, MetadataStore, MetadataTx, Privilege, TableId};

/// SQLite-backed catalog store.
///
/// One connection per process, serialized by a mutex. Other processes may
/// open the same file; SQLite's locking isolates them.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    standby: bool,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let store = Self::from_connection(Connection::open(path)?, false)?;
        store.lock()?.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Ok(store)
    }

    /// Open a read-only replica: every statement that would write fails and
    /// the probes report the node as read-only.
    pub fn open_standby(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "query_only", true)?;
        Self::from_connection(conn, true)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, false)
    }

    fn from_connection(conn: Connection, standby: bool) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
            standby,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CronError::StoreFailure("connection lock poisoned".to_string()))
    }

    /// Install the catalog objects, owned by `owner`.
    pub fn install(&self, owner: &str, options: InstallOptions) -> Result<()> {
        let conn = self.lock()?;
        schema::install(&conn, owner, options)
    }

    pub fn set_install_state(&self, state: InstallState) -> Result<()> {
        let conn = self.lock()?;
        schema::set_install_state(&conn, state)
    }

    pub fn create_role(&self, name: &str, superuser: bool) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO cron_role (name, superuser) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET superuser = excluded.superuser",
            params![name, superuser],
        )?;
        Ok(())
    }

    pub fn grant(&self, grantee: &str, table: CatalogTable, privilege: Privilege) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO cron_grant (grantee, table_name, privilege) VALUES (?1, ?2, ?3)
             ON CONFLICT DO NOTHING",
            params![grantee, table.name(), privilege.as_str()],
        )?;
        Ok(())
    }

    /// Run `f` directly on the connection, outside any catalog transaction.
    /// This is the path out-of-band writers take.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }
}

impl SqliteStore {
    fn start(&self, identity: &Identity, statement: &str) -> Result<Box<dyn MetadataTx + '_>> {
        let conn = self.lock()?;
        conn.execute_batch(statement)?;
        Ok(Box::new(SqliteTx {
            conn,
            identity: identity.clone(),
            finished: false,
        }))
    }
}

impl MetadataStore for SqliteStore {
    fn begin(&self, identity: &Identity) -> Result<Box<dyn MetadataTx + '_>> {
        self.start(identity, "BEGIN")
    }

    fn begin_write(&self, identity: &Identity) -> Result<Box<dyn MetadataTx + '_>> {
        // A query_only connection refuses the write lock. Its writes are
        // turned away by the read-only state check instead.
        if self.standby {
            return self.start(identity, "BEGIN");
        }
        self.start(identity, "BEGIN IMMEDIATE")
    }
}

struct SqliteTx<'a> {
    conn: MutexGuard<'a, Connection>,
    identity: Identity,
    finished: bool,
}

impl Drop for SqliteTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!("Failed to roll back catalog transaction: {}", e);
            }
        }
    }
}

/// Raw job row before the attribute columns are interpreted.
struct RawJob {
    record: JobRecord,
    mode: Option<String>,
    timezone: Option<String>,
    command_type: Option<String>,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            record: JobRecord {
                job_id: row.get(0)?,
                schedule: row.get(1)?,
                command: row.get(2)?,
                node_name: row.get(3)?,
                node_port: row.get(4)?,
                database: row.get(5)?,
                user_name: row.get(6)?,
                active: row.get(7)?,
                job_name: row.get(8)?,
                attributes: None,
            },
            mode: row.get(9)?,
            timezone: row.get(10)?,
            command_type: row.get(11)?,
        })
    }

    /// Interpret the attribute columns. A malformed attribute record is
    /// logged and ignored so that it cannot hide the job itself.
    fn into_record(self) -> JobRecord {
        let mut record = self.record;
        if let (Some(mode), Some(timezone), Some(command_type)) =
            (self.mode, self.timezone, self.command_type)
        {
            match parse_attributes(&mode, &timezone, &command_type) {
                Ok(attributes) => record.attributes = Some(attributes),
                Err(e) => tracing::warn!(
                    "Ignoring malformed attributes for job {}: {}",
                    record.job_id,
                    e
                ),
            }
        }
        record
    }
}

fn parse_attributes(mode: &str, timezone: &str, command_type: &str) -> Result<JobAttributes> {
    Ok(JobAttributes {
        mode: mode.parse()?,
        timezone: timezone.parse()?,
        command_type: command_type.parse()?,
    })
}

/// Raw run row before the status and timestamps are interpreted.
struct RawRun {
    job_id: i64,
    run_id: i64,
    job_pid: Option<i32>,
    database: Option<String>,
    user_name: Option<String>,
    command: Option<String>,
    status: Option<String>,
    return_message: Option<String>,
    start_time: Option<i64>,
    end_time: Option<i64>,
}

const RUN_COLUMNS: &str = "jobid, runid, job_pid, database, username, command, status, \
                           return_message, start_time, end_time";

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            run_id: row.get(1)?,
            job_pid: row.get(2)?,
            database: row.get(3)?,
            user_name: row.get(4)?,
            command: row.get(5)?,
            status: row.get(6)?,
            return_message: row.get(7)?,
            start_time: row.get(8)?,
            end_time: row.get(9)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        let status_text = self.status.unwrap_or_default();
        let status = status_text.parse().map_err(|_| {
            CronError::StoreFailure(format!(
                "run {} has unknown status '{}'",
                self.run_id, status_text
            ))
        })?;
        Ok(Run {
            run_id: self.run_id,
            job_id: self.job_id,
            database: self.database.unwrap_or_default(),
            user_name: self.user_name.unwrap_or_default(),
            command: self.command.unwrap_or_default(),
            status,
            job_pid: self.job_pid,
            return_message: self.return_message,
            start_time: self.start_time.and_then(DateTime::<Utc>::from_timestamp_micros),
            end_time: self.end_time.and_then(DateTime::<Utc>::from_timestamp_micros),
        })
    }
}

/// Fixed column for each patchable run field.
fn run_field_column(field: &RunField) -> (&'static str, Value) {
    match field {
        RunField::JobPid(pid) => ("job_pid", Value::Integer(i64::from(*pid))),
        RunField::Status(status) => ("status", Value::Text(status.as_str().to_string())),
        RunField::ReturnMessage(message) => ("return_message", Value::Text(message.clone())),
        RunField::StartTime(at) => ("start_time", Value::Integer(at.timestamp_micros())),
        RunField::EndTime(at) => ("end_time", Value::Integer(at.timestamp_micros())),
    }
}

fn quoted_statuses(statuses: &[RunStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SqliteTx<'_> {
    fn table_exists(&self, table: &str) -> Result<bool> {
        schema::table_exists(&self.conn, table)
    }

    fn owner_name(&self) -> Result<Option<String>> {
        if !self.table_exists("cron_extension")? {
            return Ok(None);
        }
        let owner = self
            .conn
            .query_row(
                "SELECT owner FROM cron_extension WHERE name = ?1",
                params![EXTENSION_NAME],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    fn next_sequence(&self, name: &str) -> Result<i64> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "UPDATE cron_sequence SET value = value + 1 WHERE name = ?1 RETURNING value",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        value.ok_or_else(|| CronError::NotReady(format!("sequence {} does not exist", name)))
    }

    /// Fail unless the effective identity may perform `privilege` on `table`.
    fn authorize(&mut self, table: CatalogTable, privilege: Privilege) -> Result<()> {
        let identity = self.identity.clone();
        if self.has_table_privilege(&identity, table, privilege)? {
            return Ok(());
        }
        Err(CronError::PermissionDenied(format!(
            "permission denied for table {}: {} requires {}",
            table.name(),
            identity.name,
            privilege
        )))
    }

    fn job_select(&self) -> Result<String> {
        let attribute_columns = if self.table_exists(JOB_EXT_TABLE)? {
            "e.mode, e.timezone, e.commandtype FROM job j \
             LEFT JOIN job_ext e ON e.jobid = j.jobid AND e.username = j.username"
        } else {
            "NULL, NULL, NULL FROM job j"
        };
        Ok(format!(
            "SELECT j.jobid, j.schedule, j.command, j.nodename, j.nodeport, j.database, \
             j.username, j.active, j.jobname, {}",
            attribute_columns
        ))
    }
}

impl MetadataTx for SqliteTx<'_> {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn set_identity(&mut self, identity: Identity) -> Identity {
        std::mem::replace(&mut self.identity, identity)
    }

    fn probe(&mut self) -> Result<ExtensionState> {
        let read_only: i64 = self
            .conn
            .pragma_query_value(None, "query_only", |row| row.get(0))?;

        let extension_loaded = if self.table_exists("cron_extension")? {
            let state: Option<String> = self
                .conn
                .query_row(
                    "SELECT state FROM cron_extension WHERE name = ?1",
                    params![EXTENSION_NAME],
                    |row| row.get(0),
                )
                .optional()?;
            state.as_deref() == Some(InstallState::Ready.as_str())
        } else {
            false
        };

        Ok(ExtensionState {
            extension_loaded,
            read_only: read_only != 0,
            jobs_table: self.table_exists(JOB_TABLE)?,
            run_details_table: self.table_exists(RUN_DETAILS_TABLE)?,
            job_ext_table: self.table_exists(JOB_EXT_TABLE)?,
        })
    }

    fn extension_owner(&mut self) -> Result<Identity> {
        let owner = self
            .owner_name()?
            .ok_or_else(|| CronError::NotReady("cron extension not loaded".to_string()))?;
        self.role(&owner)
    }

    fn role(&mut self, user_name: &str) -> Result<Identity> {
        if !self.table_exists("cron_role")? {
            return Ok(Identity::user(user_name));
        }
        let superuser: Option<bool> = self
            .conn
            .query_row(
                "SELECT superuser FROM cron_role WHERE name = ?1",
                params![user_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(Identity {
            name: user_name.to_string(),
            superuser: superuser.unwrap_or(false),
        })
    }

    fn jobs_table_id(&mut self) -> Result<Option<TableId>> {
        let rootpage: Option<i64> = self
            .conn
            .query_row(
                "SELECT rootpage FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![JOB_TABLE],
                |row| row.get(0),
            )
            .optional()?;
        Ok(rootpage.map(TableId))
    }

    fn change_token(&mut self) -> Result<Option<i64>> {
        if !self.table_exists(GENERATION_TABLE)? {
            return Ok(None);
        }
        let value = self
            .conn
            .query_row(
                "SELECT value FROM cron_generation WHERE name = ?1",
                params![JOB_GENERATION],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn has_table_privilege(
        &mut self,
        user: &Identity,
        table: CatalogTable,
        privilege: Privilege,
    ) -> Result<bool> {
        if user.superuser || self.role(&user.name)?.superuser {
            return Ok(true);
        }
        if let Some(owner) = self.owner_name()? {
            if user.is_named(&owner) {
                return Ok(true);
            }
        }
        if !self.table_exists("cron_grant")? {
            return Ok(false);
        }
        let granted: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM cron_grant WHERE grantee = ?1 AND table_name = ?2 AND privilege = ?3",
                params![user.name, table.name(), privilege.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(granted.is_some())
    }

    fn upsert_job(&mut self, job: &NewJobRecord) -> Result<i64> {
        self.authorize(CatalogTable::Job, Privilege::Insert)?;
        if job.job_name.is_some() {
            self.authorize(CatalogTable::Job, Privilege::Update)?;
        }

        let job_id = self.next_sequence(JOB_ID_SEQUENCE)?;
        let returned: i64 = match job.job_name {
            Some(ref name) => self.conn.query_row(
                "INSERT INTO job (jobid, schedule, command, nodename, nodeport, database, username, jobname)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(jobname, username) DO UPDATE SET
                     schedule = excluded.schedule,
                     command = excluded.command
                 RETURNING jobid",
                params![
                    job_id,
                    job.schedule,
                    job.command,
                    job.node_name,
                    job.node_port,
                    job.database,
                    job.user_name,
                    name
                ],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "INSERT INTO job (jobid, schedule, command, nodename, nodeport, database, username)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 RETURNING jobid",
                params![
                    job_id,
                    job.schedule,
                    job.command,
                    job.node_name,
                    job.node_port,
                    job.database,
                    job.user_name
                ],
                |row| row.get(0),
            )?,
        };
        Ok(returned)
    }

    fn find_job(&mut self, lookup: &JobLookup) -> Result<Option<JobRecord>> {
        let select = self.job_select()?;
        let raw = match lookup {
            JobLookup::Id(job_id) => self
                .conn
                .query_row(
                    &format!("{} WHERE j.jobid = ?1", select),
                    params![job_id],
                    RawJob::from_row,
                )
                .optional()?,
            JobLookup::Name { name, user_name } => self
                .conn
                .query_row(
                    &format!("{} WHERE j.jobname = ?1 AND j.username = ?2", select),
                    params![name, user_name],
                    RawJob::from_row,
                )
                .optional()?,
        };
        Ok(raw.map(RawJob::into_record))
    }

    fn scan_jobs(&mut self) -> Result<Vec<JobRecord>> {
        let select = self.job_select()?;
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY j.jobid", select))?;
        let rows = stmt.query_map([], RawJob::from_row)?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(raw?.into_record());
        }
        Ok(records)
    }

    fn delete_job(&mut self, job_id: i64) -> Result<u64> {
        self.authorize(CatalogTable::Job, Privilege::Delete)?;
        let deleted = self
            .conn
            .execute("DELETE FROM job WHERE jobid = ?1", params![job_id])?;
        Ok(deleted as u64)
    }

    fn set_job_active(&mut self, job_id: i64, active: bool) -> Result<u64> {
        self.authorize(CatalogTable::Job, Privilege::Update)?;
        let updated = self.conn.execute(
            "UPDATE job SET active = ?1 WHERE jobid = ?2",
            params![active, job_id],
        )?;
        Ok(updated as u64)
    }

    fn upsert_job_attributes(
        &mut self,
        job_id: i64,
        job_name: Option<&str>,
        user_name: &str,
        attributes: &JobAttributes,
    ) -> Result<()> {
        if !self.table_exists(JOB_EXT_TABLE)? {
            return Ok(());
        }
        self.authorize(CatalogTable::JobExt, Privilege::Insert)?;
        self.conn.execute(
            "INSERT INTO job_ext (jobid, jobname, username, mode, timezone, commandtype)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(jobid, username) DO UPDATE SET
                 mode = excluded.mode,
                 timezone = excluded.timezone,
                 commandtype = excluded.commandtype",
            params![
                job_id,
                job_name,
                user_name,
                attributes.mode.as_str(),
                attributes.timezone.to_string(),
                attributes.command_type.as_str()
            ],
        )?;
        Ok(())
    }

    fn find_job_attributes(&mut self, job_id: i64) -> Result<Option<JobAttributes>> {
        if !self.table_exists(JOB_EXT_TABLE)? {
            return Ok(None);
        }
        let raw: Option<(String, String, String)> = self
            .conn
            .query_row(
                "SELECT mode, timezone, commandtype FROM job_ext WHERE jobid = ?1",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match raw {
            Some((mode, timezone, command_type)) => {
                Ok(Some(parse_attributes(&mode, &timezone, &command_type)?))
            }
            None => Ok(None),
        }
    }

    fn delete_job_attributes(&mut self, job_id: i64) -> Result<u64> {
        if !self.table_exists(JOB_EXT_TABLE)? {
            return Ok(0);
        }
        self.authorize(CatalogTable::JobExt, Privilege::Delete)?;
        let deleted = self
            .conn
            .execute("DELETE FROM job_ext WHERE jobid = ?1", params![job_id])?;
        Ok(deleted as u64)
    }

    fn next_run_id(&mut self) -> Result<i64> {
        self.authorize(CatalogTable::RunDetails, Privilege::Insert)?;
        self.next_sequence(RUN_ID_SEQUENCE)
    }

    fn insert_run(&mut self, run: &NewRun) -> Result<()> {
        self.authorize(CatalogTable::RunDetails, Privilege::Insert)?;
        self.conn.execute(
            "INSERT INTO job_run_details (jobid, runid, database, username, command, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.job_id,
                run.run_id,
                run.database,
                run.user_name,
                run.command,
                run.status.as_str()
            ],
        )?;
        Ok(())
    }

    fn update_run(&mut self, run_id: i64, patch: &RunPatch) -> Result<u64> {
        let fields = patch.fields();
        if fields.is_empty() {
            return Err(CronError::InvalidArgument(
                "a run update needs at least one field".to_string(),
            ));
        }
        self.authorize(CatalogTable::RunDetails, Privilege::Update)?;

        let mut assignments = Vec::with_capacity(fields.len());
        let mut values = Vec::with_capacity(fields.len() + 1);
        for (i, field) in fields.iter().enumerate() {
            let (column, value) = run_field_column(field);
            assignments.push(format!("{} = ?{}", column, i + 1));
            values.push(value);
        }
        values.push(Value::Integer(run_id));

        let mut sql = format!(
            "UPDATE job_run_details SET {} WHERE runid = ?{}",
            assignments.join(", "),
            values.len()
        );
        if patch.status.is_some() {
            sql.push_str(&format!(
                " AND (status IS NULL OR status NOT IN ({}))",
                quoted_statuses(RunStatus::terminal())
            ));
        }

        let updated = self.conn.execute(&sql, params_from_iter(values.iter()))?;
        Ok(updated as u64)
    }

    fn fail_runs(&mut self, statuses: &[RunStatus], message: &str) -> Result<u64> {
        if statuses.is_empty() {
            return Ok(0);
        }
        self.authorize(CatalogTable::RunDetails, Privilege::Update)?;
        let sql = format!(
            "UPDATE job_run_details SET status = ?1, return_message = ?2 WHERE status IN ({})",
            quoted_statuses(statuses)
        );
        let updated = self
            .conn
            .execute(&sql, params![RunStatus::Failed.as_str(), message])?;
        Ok(updated as u64)
    }

    fn count_runs(&mut self) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM job_run_details", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn purge_runs_beyond(&mut self, keep: u64) -> Result<u64> {
        self.authorize(CatalogTable::RunDetails, Privilege::Delete)?;
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);
        let deleted = self.conn.execute(
            "DELETE FROM job_run_details WHERE runid NOT IN (
                 SELECT runid FROM job_run_details ORDER BY runid DESC LIMIT ?1
             )",
            params![keep],
        )?;
        Ok(deleted as u64)
    }

    fn find_run(&mut self, run_id: i64) -> Result<Option<Run>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {} FROM job_run_details WHERE runid = ?1", RUN_COLUMNS),
                params![run_id],
                RawRun::from_row,
            )
            .optional()?;
        raw.map(RawRun::into_run).transpose()
    }

    fn list_runs(&mut self, job_id: Option<i64>, limit: usize) -> Result<Vec<Run>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let raws = match job_id {
            Some(job_id) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM job_run_details WHERE jobid = ?1 ORDER BY runid DESC LIMIT ?2",
                    RUN_COLUMNS
                ))?;
                let rows = stmt.query_map(params![job_id, limit], RawRun::from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM job_run_details ORDER BY runid DESC LIMIT ?1",
                    RUN_COLUMNS
                ))?;
                let rows = stmt.query_map(params![limit], RawRun::from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        raws.into_iter().map(RawRun::into_run).collect()
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobMode;

    fn owner() -> Identity {
        Identity::user("postgres")
    }

    fn installed() -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .install("postgres", InstallOptions::default())
            .expect("install");
        store
    }

    fn new_job(name: Option<&str>, user: &str) -> NewJobRecord {
        NewJobRecord {
            job_name: name.map(str::to_string),
            schedule: "*/5 * * * *".to_string(),
            command: "SELECT 1".to_string(),
            node_name: "localhost".to_string(),
            node_port: 5432,
            database: "postgres".to_string(),
            user_name: user.to_string(),
        }
    }

    #[test]
    fn test_probe_uninstalled_store() {
        let store = SqliteStore::open_in_memory().expect("open");
        let mut tx = store.begin(&owner()).expect("begin");
        let state = tx.probe().expect("probe");
        assert_eq!(state, ExtensionState::default());
    }

    #[test]
    fn test_probe_installed_store() {
        let store = installed();
        let mut tx = store.begin(&owner()).expect("begin");
        let state = tx.probe().expect("probe");
        assert!(state.extension_loaded);
        assert!(!state.read_only);
        assert!(state.jobs_table && state.run_details_table && state.job_ext_table);
    }

    #[test]
    fn test_probe_mid_upgrade_is_not_loaded() {
        let store = installed();
        store
            .set_install_state(InstallState::Upgrading)
            .expect("state");
        let mut tx = store.begin(&owner()).expect("begin");
        assert!(!tx.probe().expect("probe").extension_loaded);
    }

    #[test]
    fn test_upsert_named_job_reuses_id() {
        let store = installed();
        let mut tx = store.begin(&owner()).expect("begin");
        let first = tx.upsert_job(&new_job(Some("nightly"), "alice")).expect("insert");
        let mut changed = new_job(Some("nightly"), "alice");
        changed.schedule = "0 3 * * *".to_string();
        changed.command = "VACUUM".to_string();
        let second = tx.upsert_job(&changed).expect("upsert");
        assert_eq!(first, second);

        let jobs = tx.scan_jobs().expect("scan");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].schedule, "0 3 * * *");
        assert_eq!(jobs[0].command, "VACUUM");
        tx.commit().expect("commit");
    }

    #[test]
    fn test_same_name_different_users_are_distinct() {
        let store = installed();
        let mut tx = store.begin(&owner()).expect("begin");
        let a = tx.upsert_job(&new_job(Some("nightly"), "alice")).expect("a");
        let b = tx.upsert_job(&new_job(Some("nightly"), "bob")).expect("b");
        assert_ne!(a, b);
    }

    #[test]
    fn test_unnamed_jobs_always_insert() {
        let store = installed();
        let mut tx = store.begin(&owner()).expect("begin");
        let a = tx.upsert_job(&new_job(None, "alice")).expect("a");
        let b = tx.upsert_job(&new_job(None, "alice")).expect("b");
        assert!(b > a);
        assert_eq!(tx.scan_jobs().expect("scan").len(), 2);
    }

    #[test]
    fn test_plain_user_cannot_write_job_table() {
        let store = installed();
        let mut tx = store.begin(&Identity::user("alice")).expect("begin");
        match tx.upsert_job(&new_job(None, "alice")) {
            Err(CronError::PermissionDenied(msg)) => assert!(msg.contains("job")),
            other => panic!("Expected PermissionDenied, got: {:?}", other),
        }
    }

    #[test]
    fn test_grant_allows_write() {
        let store = installed();
        store
            .grant("alice", CatalogTable::Job, Privilege::Insert)
            .expect("grant");
        let mut tx = store.begin(&Identity::user("alice")).expect("begin");
        assert!(tx.upsert_job(&new_job(None, "alice")).is_ok());
    }

    #[test]
    fn test_rollback_on_drop() {
        let store = installed();
        {
            let mut tx = store.begin(&owner()).expect("begin");
            tx.upsert_job(&new_job(None, "alice")).expect("insert");
        }
        let mut tx = store.begin(&owner()).expect("begin");
        assert!(tx.scan_jobs().expect("scan").is_empty());
    }

    #[test]
    fn test_attributes_joined_into_scan() {
        let store = installed();
        let mut tx = store.begin(&owner()).expect("begin");
        let id = tx.upsert_job(&new_job(None, "alice")).expect("insert");
        let attrs = JobAttributes {
            mode: JobMode::Fixed,
            ..JobAttributes::default()
        };
        tx.upsert_job_attributes(id, None, "alice", &attrs)
            .expect("attrs");
        let jobs = tx.scan_jobs().expect("scan");
        assert_eq!(jobs[0].attributes, Some(attrs));
        assert_eq!(tx.find_job_attributes(id).expect("find"), Some(attrs));
    }

    #[test]
    fn test_attributes_tolerate_missing_table() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .install(
                "postgres",
                InstallOptions {
                    job_ext: false,
                    run_details: true,
                },
            )
            .expect("install");
        let mut tx = store.begin(&owner()).expect("begin");
        let id = tx.upsert_job(&new_job(None, "alice")).expect("insert");
        tx.upsert_job_attributes(id, None, "alice", &JobAttributes::default())
            .expect("tolerated");
        assert_eq!(tx.find_job_attributes(id).expect("find"), None);
        assert_eq!(tx.delete_job_attributes(id).expect("delete"), 0);
        assert_eq!(tx.scan_jobs().expect("scan")[0].attributes, None);
    }

    #[test]
    fn test_update_run_builds_partial_statement() {
        let store = installed();
        let mut tx = store.begin(&owner()).expect("begin");
        let run_id = tx.next_run_id().expect("run id");
        tx.insert_run(&NewRun::new(run_id, 1, "postgres", "alice", "SELECT 1"))
            .expect("insert");
        let started = DateTime::<Utc>::from_timestamp_micros(1_700_000_000_000_000).unwrap();
        tx.update_run(
            run_id,
            &RunPatch::new()
                .job_pid(99)
                .status(RunStatus::Running)
                .start_time(started),
        )
        .expect("update");
        let run = tx.find_run(run_id).expect("find").expect("present");
        assert_eq!(run.job_pid, Some(99));
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.start_time, Some(started));
        assert_eq!(run.return_message, None);
        assert_eq!(run.command, "SELECT 1");
    }

    #[test]
    fn test_update_run_rejects_empty_patch() {
        let store = installed();
        let mut tx = store.begin(&owner()).expect("begin");
        assert!(matches!(
            tx.update_run(1, &RunPatch::new()),
            Err(CronError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_terminal_status_not_overwritten() {
        let store = installed();
        let mut tx = store.begin(&owner()).expect("begin");
        let run_id = tx.next_run_id().expect("run id");
        tx.insert_run(&NewRun::new(run_id, 1, "postgres", "alice", "SELECT 1"))
            .expect("insert");
        tx.update_run(run_id, &RunPatch::new().status(RunStatus::Succeeded))
            .expect("succeed");
        let affected = tx
            .update_run(run_id, &RunPatch::new().status(RunStatus::Running))
            .expect("update");
        assert_eq!(affected, 0);
        // Fields other than status may still be written after completion.
        let affected = tx
            .update_run(run_id, &RunPatch::new().return_message("1 row"))
            .expect("update");
        assert_eq!(affected, 1);
        let run = tx.find_run(run_id).expect("find").expect("present");
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.return_message.as_deref(), Some("1 row"));
    }

    #[test]
    fn test_purge_runs_keeps_largest_ids() {
        let store = installed();
        let mut tx = store.begin(&owner()).expect("begin");
        for _ in 0..10 {
            let run_id = tx.next_run_id().expect("run id");
            tx.insert_run(&NewRun::new(run_id, 1, "postgres", "alice", "SELECT 1"))
                .expect("insert");
        }
        assert_eq!(tx.purge_runs_beyond(4).expect("purge"), 6);
        let ids: Vec<i64> = tx
            .list_runs(None, 100)
            .expect("list")
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec![10, 9, 8, 7]);
    }

    #[test]
    fn test_change_token_follows_commits() {
        let store = SqliteStore::open_in_memory().expect("open");
        {
            let mut tx = store.begin(&owner()).expect("begin");
            assert_eq!(tx.change_token().expect("token"), None);
        }
        store
            .install("postgres", InstallOptions::default())
            .expect("install");

        let before = {
            let mut tx = store.begin(&owner()).expect("begin");
            tx.change_token().expect("token").expect("installed")
        };
        let mut tx = store.begin_write(&owner()).expect("begin");
        tx.upsert_job(&new_job(None, "alice")).expect("insert");
        tx.commit().expect("commit");

        let mut tx = store.begin(&owner()).expect("begin");
        let after = tx.change_token().expect("token").expect("installed");
        assert!(after > before);
    }

    #[test]
    fn test_write_transactions_queue_across_connections() {
        let tmp = tempfile::TempDir::new().expect("create temp dir");
        let path = tmp.path().join("catalog.db");
        let first = SqliteStore::open(&path).expect("open first");
        first
            .install("postgres", InstallOptions::default())
            .expect("install");
        let second = SqliteStore::open(&path).expect("open second");

        let mut held = first.begin_write(&owner()).expect("begin first");
        held.upsert_job(&new_job(None, "alice")).expect("insert first");

        let waiter = std::thread::spawn(move || {
            let mut tx = second.begin_write(&owner())?;
            tx.upsert_job(&new_job(None, "bob"))?;
            tx.commit()
        });

        std::thread::sleep(Duration::from_millis(200));
        held.commit().expect("commit first");
        waiter
            .join()
            .expect("waiter thread")
            .expect("second writer waits for the lock");

        let mut tx = first.begin(&owner()).expect("begin");
        assert_eq!(tx.scan_jobs().expect("scan").len(), 2);
    }

    #[test]
    fn test_standby_write_transaction_reports_read_only() {
        let tmp = tempfile::TempDir::new().expect("create temp dir");
        let path = tmp.path().join("catalog.db");
        SqliteStore::open(&path)
            .expect("open primary")
            .install("postgres", InstallOptions::default())
            .expect("install");

        let standby = SqliteStore::open_standby(&path).expect("open standby");
        let mut tx = standby.begin_write(&owner()).expect("begin");
        let state = tx.probe().expect("probe");
        assert!(state.read_only);
        assert!(matches!(
            state.ensure_job_writes(),
            Err(CronError::NotReady(_))
        ));
    }

    #[test]
    fn test_jobs_table_identity_changes_on_recreate() {
        let store = installed();
        let before = {
            let mut tx = store.begin(&owner()).expect("begin");
            tx.jobs_table_id().expect("id").expect("present")
        };
        store
            .with_connection(|conn| {
                conn.execute_batch(
                    "CREATE TABLE filler (x INTEGER);
                     ALTER TABLE job RENAME TO job_old;
                     CREATE TABLE job (jobid INTEGER PRIMARY KEY, schedule TEXT NOT NULL,
                         command TEXT NOT NULL, nodename TEXT NOT NULL, nodeport INTEGER NOT NULL,
                         database TEXT NOT NULL, username TEXT NOT NULL,
                         active INTEGER NOT NULL DEFAULT 1, jobname TEXT,
                         CONSTRAINT jobname_username_uniq UNIQUE (jobname, username));",
                )?;
                Ok(())
            })
            .expect("recreate");
        let mut tx = store.begin(&owner()).expect("begin");
        let after = tx.jobs_table_id().expect("id").expect("present");
        assert_ne!(before, after);
    }
}
