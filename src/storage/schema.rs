//! Catalog schema and installation.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{CronError, Result};

pub const EXTENSION_NAME: &str = "cron_catalog";
pub const EXTENSION_VERSION: &str = "1.0";

pub const JOB_TABLE: &str = "job";
pub const JOB_EXT_TABLE: &str = "job_ext";
pub const RUN_DETAILS_TABLE: &str = "job_run_details";

pub const JOB_ID_SEQUENCE: &str = "jobid_seq";
pub const RUN_ID_SEQUENCE: &str = "runid_seq";

/// Table holding the change counter caches poll, and its single row.
pub const GENERATION_TABLE: &str = "cron_generation";
pub const JOB_GENERATION: &str = "job";

const CORE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cron_extension (
    name TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    version TEXT NOT NULL,
    state TEXT NOT NULL,
    CHECK (state IN ('installing', 'upgrading', 'ready'))
);

CREATE TABLE IF NOT EXISTS cron_role (
    name TEXT PRIMARY KEY COLLATE NOCASE,
    superuser INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS cron_grant (
    grantee TEXT NOT NULL COLLATE NOCASE,
    table_name TEXT NOT NULL,
    privilege TEXT NOT NULL,
    PRIMARY KEY (grantee, table_name, privilege),
    CHECK (privilege IN ('SELECT', 'INSERT', 'UPDATE', 'DELETE'))
);

CREATE TABLE IF NOT EXISTS cron_sequence (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS job (
    jobid INTEGER PRIMARY KEY,
    schedule TEXT NOT NULL,
    command TEXT NOT NULL,
    nodename TEXT NOT NULL DEFAULT 'localhost',
    nodeport INTEGER NOT NULL DEFAULT 5432,
    database TEXT NOT NULL,
    username TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    jobname TEXT,
    CONSTRAINT jobname_username_uniq UNIQUE (jobname, username)
);

CREATE TABLE IF NOT EXISTS cron_generation (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

INSERT OR IGNORE INTO cron_generation (name, value) VALUES ('job', 0);

CREATE TRIGGER IF NOT EXISTS cron_extension_changed AFTER UPDATE ON cron_extension
BEGIN
    UPDATE cron_generation SET value = value + 1 WHERE name = 'job';
END;

CREATE TRIGGER IF NOT EXISTS job_inserted AFTER INSERT ON job
BEGIN
    UPDATE cron_generation SET value = value + 1 WHERE name = 'job';
END;

CREATE TRIGGER IF NOT EXISTS job_updated AFTER UPDATE ON job
BEGIN
    UPDATE cron_generation SET value = value + 1 WHERE name = 'job';
END;

CREATE TRIGGER IF NOT EXISTS job_deleted AFTER DELETE ON job
BEGIN
    UPDATE cron_generation SET value = value + 1 WHERE name = 'job';
END;
"#;

const JOB_EXT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS job_ext (
    jobid INTEGER NOT NULL,
    jobname TEXT,
    username TEXT NOT NULL,
    mode TEXT NOT NULL,
    timezone TEXT NOT NULL,
    commandtype TEXT NOT NULL,
    CONSTRAINT jobid_username_uniq UNIQUE (jobid, username)
);

CREATE TRIGGER IF NOT EXISTS job_ext_inserted AFTER INSERT ON job_ext
BEGIN
    UPDATE cron_generation SET value = value + 1 WHERE name = 'job';
END;

CREATE TRIGGER IF NOT EXISTS job_ext_updated AFTER UPDATE ON job_ext
BEGIN
    UPDATE cron_generation SET value = value + 1 WHERE name = 'job';
END;

CREATE TRIGGER IF NOT EXISTS job_ext_deleted AFTER DELETE ON job_ext
BEGIN
    UPDATE cron_generation SET value = value + 1 WHERE name = 'job';
END;
"#;

const RUN_DETAILS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS job_run_details (
    jobid INTEGER,
    runid INTEGER PRIMARY KEY,
    job_pid INTEGER,
    database TEXT,
    username TEXT,
    command TEXT,
    status TEXT,
    return_message TEXT,
    start_time INTEGER,
    end_time INTEGER
);

CREATE INDEX IF NOT EXISTS idx_job_run_details_status ON job_run_details(status);
CREATE INDEX IF NOT EXISTS idx_job_run_details_jobid ON job_run_details(jobid);
"#;

/// Which versioned tables an install creates. Older schema versions lacked
/// the attribute and run-detail tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOptions {
    pub job_ext: bool,
    pub run_details: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            job_ext: true,
            run_details: true,
        }
    }
}

/// Lifecycle of the install record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    Installing,
    Upgrading,
    Ready,
}

impl InstallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallState::Installing => "installing",
            InstallState::Upgrading => "upgrading",
            InstallState::Ready => "ready",
        }
    }
}

/// Create the catalog objects owned by `owner` and mark the install ready.
///
/// The install record is written as `installing` first so a concurrent
/// reader sees the catalog as not loaded until every object exists.
pub fn install(conn: &Connection, owner: &str, options: InstallOptions) -> Result<()> {
    conn.execute_batch(CORE_SQL)?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT owner FROM cron_extension WHERE name = ?1",
            params![EXTENSION_NAME],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(existing_owner) = existing {
        if !existing_owner.eq_ignore_ascii_case(owner) {
            return Err(CronError::PermissionDenied(format!(
                "catalog is already installed and owned by {}",
                existing_owner
            )));
        }
    }

    conn.execute(
        "INSERT INTO cron_extension (name, owner, version, state) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name) DO UPDATE SET state = excluded.state",
        params![
            EXTENSION_NAME,
            owner,
            EXTENSION_VERSION,
            InstallState::Installing.as_str()
        ],
    )?;

    conn.execute(
        "INSERT INTO cron_role (name, superuser) VALUES (?1, 1) ON CONFLICT(name) DO NOTHING",
        params![owner],
    )?;

    for sequence in [JOB_ID_SEQUENCE, RUN_ID_SEQUENCE] {
        conn.execute(
            "INSERT INTO cron_sequence (name, value) VALUES (?1, 0) ON CONFLICT(name) DO NOTHING",
            params![sequence],
        )?;
    }

    if options.job_ext {
        conn.execute_batch(JOB_EXT_SQL)?;
    }
    if options.run_details {
        conn.execute_batch(RUN_DETAILS_SQL)?;
    }

    set_install_state(conn, InstallState::Ready)?;
    tracing::info!(
        "Installed {} {} (owner {})",
        EXTENSION_NAME,
        EXTENSION_VERSION,
        owner
    );
    Ok(())
}

pub fn set_install_state(conn: &Connection, state: InstallState) -> Result<()> {
    let updated = conn.execute(
        "UPDATE cron_extension SET state = ?1 WHERE name = ?2",
        params![state.as_str(), EXTENSION_NAME],
    )?;
    if updated == 0 {
        return Err(CronError::NotReady(format!(
            "{} is not installed",
            EXTENSION_NAME
        )));
    }
    Ok(())
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}
