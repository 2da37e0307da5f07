//! Validated create, upsert and delete of job definitions.

use std::sync::Arc;

use crate::errors::{CronError, Result};
use crate::invalidation::{ChangeNotice, InvalidationBus};
use crate::models::{
    validate_schedule_request, CatalogConfig, Identity, JobAttributes, JobKey, JobRecord,
    NewJobRecord, ScheduleRequest,
};
use crate::privilege::as_owner;
use crate::schedule::ScheduleParser;
use crate::storage::{CatalogTable, JobLookup, MetadataStore, MetadataTx, Privilege};

/// Execution context written into every new job row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTarget {
    pub node_name: String,
    pub node_port: i32,
    pub database: String,
}

impl Default for JobTarget {
    fn default() -> Self {
        Self {
            node_name: "localhost".to_string(),
            node_port: 5432,
            database: "postgres".to_string(),
        }
    }
}

impl From<&CatalogConfig> for JobTarget {
    fn from(config: &CatalogConfig) -> Self {
        Self {
            node_name: config.node_name.clone(),
            node_port: config.node_port,
            database: config.database_name.clone(),
        }
    }
}

pub struct JobRegistrar {
    store: Arc<dyn MetadataStore>,
    parser: Arc<dyn ScheduleParser>,
    bus: Arc<InvalidationBus>,
    target: JobTarget,
}

impl JobRegistrar {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        parser: Arc<dyn ScheduleParser>,
        bus: Arc<InvalidationBus>,
        target: JobTarget,
    ) -> Self {
        Self {
            store,
            parser,
            bus,
            target,
        }
    }

    /// Create a job owned by `caller`, or update the caller's job of the same
    /// name. Returns the job id.
    ///
    /// Arguments are validated before any transaction is opened. The row is
    /// written as the catalog owner so callers need no grants of their own.
    pub fn schedule(&self, caller: &Identity, request: &ScheduleRequest) -> Result<i64> {
        let attributes = validate_schedule_request(request, caller)?;
        self.parser.parse(&request.schedule)?;

        let mut tx = self.store.begin_write(caller)?;
        let state = tx.probe()?;
        state.ensure_job_writes()?;

        let record = NewJobRecord {
            job_name: request.name.clone(),
            schedule: request.schedule.clone(),
            command: request.command.clone(),
            node_name: self.target.node_name.clone(),
            node_port: self.target.node_port,
            database: self.target.database.clone(),
            user_name: caller.name.clone(),
        };

        let job_id = {
            let mut owner = as_owner(&mut *tx)?;
            let job_id = owner.upsert_job(&record)?;
            if state.job_attributes_available() {
                owner.upsert_job_attributes(
                    job_id,
                    request.name.as_deref(),
                    &caller.name,
                    &attributes,
                )?;
            }
            owner.set_job_active(job_id, true)?;
            job_id
        };

        let table = tx.jobs_table_id()?;
        tx.commit()?;
        self.bus.publish(ChangeNotice::table(table));

        tracing::info!(
            "Scheduled job {} ({}) for {}: {}",
            job_id,
            request.name.as_deref().unwrap_or("unnamed"),
            caller.name,
            request.schedule
        );
        Ok(job_id)
    }

    /// Delete a job by id, or by name among the caller's own jobs.
    pub fn unschedule(&self, caller: &Identity, key: &JobKey) -> Result<bool> {
        let mut tx = self.store.begin_write(caller)?;
        let state = tx.probe()?;
        state.ensure_job_writes()?;

        let record = locate(&mut *tx, caller, key)?;
        authorize(&mut *tx, caller, &record, Privilege::Delete)?;

        {
            let mut owner = as_owner(&mut *tx)?;
            owner.delete_job(record.job_id)?;
            if state.job_attributes_available() {
                owner.delete_job_attributes(record.job_id)?;
            }
        }

        let table = tx.jobs_table_id()?;
        tx.commit()?;
        self.bus
            .publish(ChangeNotice::removed(table, record.job_id));

        tracing::info!("Unscheduled job {} (by {})", record.job_id, caller.name);
        Ok(true)
    }

    /// Toggle whether the scheduler may fire a job. The row is kept either way.
    pub fn set_active(&self, caller: &Identity, key: &JobKey, active: bool) -> Result<bool> {
        let mut tx = self.store.begin_write(caller)?;
        tx.probe()?.ensure_job_writes()?;

        let record = locate(&mut *tx, caller, key)?;
        authorize(&mut *tx, caller, &record, Privilege::Update)?;

        let updated = {
            let mut owner = as_owner(&mut *tx)?;
            owner.set_job_active(record.job_id, active)?
        };

        let table = tx.jobs_table_id()?;
        tx.commit()?;
        self.bus.publish(ChangeNotice::table(table));

        tracing::info!(
            "Job {} {} by {}",
            record.job_id,
            if active { "activated" } else { "deactivated" },
            caller.name
        );
        Ok(updated > 0)
    }

    /// Stored mode, timezone and command type of a job, if recorded.
    pub fn attributes(&self, caller: &Identity, job_id: i64) -> Result<Option<JobAttributes>> {
        let mut tx = self.store.begin(caller)?;
        if !tx.probe()?.job_attributes_available() {
            return Ok(None);
        }
        let attributes = tx.find_job_attributes(job_id)?;
        tx.commit()?;
        Ok(attributes)
    }
}

fn locate(tx: &mut dyn MetadataTx, caller: &Identity, key: &JobKey) -> Result<JobRecord> {
    let lookup = match key {
        JobKey::Id(job_id) => JobLookup::Id(*job_id),
        JobKey::Name(name) => JobLookup::Name {
            name: name.clone(),
            user_name: caller.name.clone(),
        },
    };
    tx.find_job(&lookup)?
        .ok_or_else(|| CronError::NotFound(format!("could not find valid entry for {}", key)))
}

/// Owners may always act on their jobs; anyone else needs the table grant.
fn authorize(
    tx: &mut dyn MetadataTx,
    caller: &Identity,
    record: &JobRecord,
    privilege: Privilege,
) -> Result<()> {
    if caller.is_named(&record.user_name)
        || tx.has_table_privilege(caller, CatalogTable::Job, privilege)?
    {
        return Ok(());
    }
    Err(CronError::PermissionDenied(format!(
        "must be owner of job {}",
        record.job_id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::InvalidationListener;
    use crate::models::{CommandType, JobMode};
    use crate::schedule::CronParser;
    use crate::storage::schema::{InstallOptions, InstallState};
    use crate::storage::SqliteStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ChangeNotice>>,
    }

    impl InvalidationListener for Recorder {
        fn on_invalidate(&self, notice: &ChangeNotice) {
            self.seen.lock().unwrap().push(*notice);
        }
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        registrar: JobRegistrar,
        recorder: Arc<Recorder>,
    }

    fn fixture_with(options: InstallOptions) -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
        store.install("postgres", options).expect("install");
        let bus = Arc::new(InvalidationBus::new());
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(recorder.clone());
        let registrar = JobRegistrar::new(
            store.clone(),
            Arc::new(CronParser),
            bus,
            JobTarget::default(),
        );
        Fixture {
            store,
            registrar,
            recorder,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(InstallOptions::default())
    }

    fn alice() -> Identity {
        Identity::user("alice")
    }

    fn scan(store: &SqliteStore) -> Vec<JobRecord> {
        let mut tx = store.begin(&Identity::user("reader")).expect("begin");
        tx.scan_jobs().expect("scan")
    }

    #[test]
    fn test_schedule_as_unprivileged_user() {
        let f = fixture();
        let request = ScheduleRequest::new("*/5 * * * *", "SELECT 1").timezone("0");
        let job_id = f.registrar.schedule(&alice(), &request).expect("schedule");

        let jobs = scan(&f.store);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, job_id);
        assert_eq!(jobs[0].user_name, "alice");
        assert_eq!(jobs[0].database, "postgres");
        assert!(jobs[0].active);
        let attributes = jobs[0].attributes.expect("attributes");
        assert_eq!(attributes.mode, JobMode::Next);
        assert_eq!(attributes.timezone.hours(), 0);
        assert_eq!(attributes.command_type, CommandType::Sql);
        assert_eq!(f.recorder.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_named_schedule_upserts() {
        let f = fixture();
        let first = f
            .registrar
            .schedule(&alice(), &ScheduleRequest::new("* * * * *", "SELECT 1").named("x"))
            .expect("first");
        let second = f
            .registrar
            .schedule(
                &alice(),
                &ScheduleRequest::new("0 0 * * *", "SELECT 2")
                    .named("x")
                    .mode("fixed"),
            )
            .expect("second");
        assert_eq!(first, second);

        let jobs = scan(&f.store);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].schedule, "0 0 * * *");
        assert_eq!(jobs[0].command, "SELECT 2");
        assert_eq!(jobs[0].attributes.expect("attributes").mode, JobMode::Fixed);
    }

    #[test]
    fn test_schedule_reactivates_named_job() {
        let f = fixture();
        let request = ScheduleRequest::new("* * * * *", "SELECT 1").named("x");
        let job_id = f.registrar.schedule(&alice(), &request).expect("schedule");
        f.registrar
            .set_active(&alice(), &JobKey::Id(job_id), false)
            .expect("deactivate");
        assert!(!scan(&f.store)[0].active);
        f.registrar.schedule(&alice(), &request).expect("reschedule");
        assert!(scan(&f.store)[0].active);
    }

    #[test]
    fn test_malformed_schedule_creates_no_row() {
        let f = fixture();
        let err = f
            .registrar
            .schedule(&alice(), &ScheduleRequest::new("not a cron", "SELECT 1"))
            .unwrap_err();
        assert!(matches!(err, CronError::InvalidArgument(_)));
        assert!(scan(&f.store).is_empty());
        assert!(f.recorder.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_native_by_plain_user_denied() {
        let f = fixture();
        let request = ScheduleRequest::new("* * * * *", "echo hi").command_type("native");
        assert!(matches!(
            f.registrar.schedule(&alice(), &request),
            Err(CronError::PermissionDenied(_))
        ));
        assert!(scan(&f.store).is_empty());
    }

    #[test]
    fn test_schedule_before_install_is_not_ready() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
        let registrar = JobRegistrar::new(
            store,
            Arc::new(CronParser),
            Arc::new(InvalidationBus::new()),
            JobTarget::default(),
        );
        assert!(matches!(
            registrar.schedule(&alice(), &ScheduleRequest::new("* * * * *", "SELECT 1")),
            Err(CronError::NotReady(_))
        ));
    }

    #[test]
    fn test_schedule_mid_upgrade_is_not_ready() {
        let f = fixture();
        f.store
            .set_install_state(InstallState::Upgrading)
            .expect("state");
        assert!(matches!(
            f.registrar
                .schedule(&alice(), &ScheduleRequest::new("* * * * *", "SELECT 1")),
            Err(CronError::NotReady(_))
        ));
    }

    #[test]
    fn test_schedule_without_attribute_table() {
        let f = fixture_with(InstallOptions {
            job_ext: false,
            run_details: false,
        });
        let job_id = f
            .registrar
            .schedule(&alice(), &ScheduleRequest::new("* * * * *", "SELECT 1"))
            .expect("schedule");
        assert_eq!(f.registrar.attributes(&alice(), job_id).expect("attrs"), None);
        assert!(f
            .registrar
            .unschedule(&alice(), &JobKey::Id(job_id))
            .expect("unschedule"));
    }

    #[test]
    fn test_unschedule_by_owner_case_insensitive() {
        let f = fixture();
        let job_id = f
            .registrar
            .schedule(&alice(), &ScheduleRequest::new("* * * * *", "SELECT 1"))
            .expect("schedule");
        assert!(f
            .registrar
            .unschedule(&Identity::user("ALICE"), &JobKey::Id(job_id))
            .expect("unschedule"));
        assert!(scan(&f.store).is_empty());
        assert_eq!(f.registrar.attributes(&alice(), job_id).expect("attrs"), None);

        let seen = f.recorder.seen.lock().unwrap();
        assert_eq!(seen.last().and_then(|n| n.removed_job), Some(job_id));
    }

    #[test]
    fn test_unschedule_by_name_uses_callers_jobs() {
        let f = fixture();
        let request = ScheduleRequest::new("* * * * *", "SELECT 1").named("nightly");
        f.registrar.schedule(&alice(), &request).expect("alice");
        f.registrar
            .schedule(&Identity::user("bob"), &request)
            .expect("bob");

        f.registrar
            .unschedule(&Identity::user("bob"), &JobKey::Name("nightly".into()))
            .expect("unschedule");
        let jobs = scan(&f.store);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].user_name, "alice");
    }

    #[test]
    fn test_unschedule_missing_job() {
        let f = fixture();
        match f.registrar.unschedule(&alice(), &JobKey::Id(404)) {
            Err(CronError::NotFound(msg)) => assert!(msg.contains("404")),
            other => panic!("Expected NotFound, got: {:?}", other),
        }
        match f
            .registrar
            .unschedule(&alice(), &JobKey::Name("ghost".into()))
        {
            Err(CronError::NotFound(msg)) => assert!(msg.contains("ghost")),
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    #[test]
    fn test_unschedule_by_stranger_denied() {
        let f = fixture();
        let job_id = f
            .registrar
            .schedule(&alice(), &ScheduleRequest::new("* * * * *", "SELECT 1"))
            .expect("schedule");
        assert!(matches!(
            f.registrar
                .unschedule(&Identity::user("mallory"), &JobKey::Id(job_id)),
            Err(CronError::PermissionDenied(_))
        ));
        assert_eq!(scan(&f.store).len(), 1);
    }

    #[test]
    fn test_unschedule_by_grantee_and_superuser() {
        let f = fixture();
        let first = f
            .registrar
            .schedule(&alice(), &ScheduleRequest::new("* * * * *", "SELECT 1"))
            .expect("schedule");
        let second = f
            .registrar
            .schedule(&alice(), &ScheduleRequest::new("* * * * *", "SELECT 2"))
            .expect("schedule");

        f.store
            .grant("ops", CatalogTable::Job, Privilege::Delete)
            .expect("grant");
        assert!(f
            .registrar
            .unschedule(&Identity::user("ops"), &JobKey::Id(first))
            .expect("grantee"));
        assert!(f
            .registrar
            .unschedule(&Identity::superuser("root"), &JobKey::Id(second))
            .expect("superuser"));
        assert!(scan(&f.store).is_empty());
    }

    #[test]
    fn test_set_active_needs_update_grant() {
        let f = fixture();
        let job_id = f
            .registrar
            .schedule(&alice(), &ScheduleRequest::new("* * * * *", "SELECT 1"))
            .expect("schedule");
        assert!(matches!(
            f.registrar
                .set_active(&Identity::user("ops"), &JobKey::Id(job_id), false),
            Err(CronError::PermissionDenied(_))
        ));
        f.store
            .grant("ops", CatalogTable::Job, Privilege::Update)
            .expect("grant");
        assert!(f
            .registrar
            .set_active(&Identity::user("ops"), &JobKey::Id(job_id), false)
            .expect("deactivate"));
        assert!(!scan(&f.store)[0].active);
    }
}
