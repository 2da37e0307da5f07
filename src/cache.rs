//! In-process mirror of the job table.
//!
//! Readers call [`JobCache::ensure_fresh`] (or a read that does it for them)
//! and get a complete image of the job table as of the last reload. Writers
//! never touch the mirror. They publish a [`ChangeNotice`] and the cache
//! marks itself stale.
//!
//! Staleness is tracked with two counters. Every invalidation bumps `epoch`;
//! a reload records the epoch it started from in `loaded_epoch`. The mirror
//! is valid only while the two are equal, so an invalidation that lands in
//! the middle of a reload forces another one.
//!
//! Notices only reach caches in this process. Writes from other connections
//! are caught through the store's change counter: a valid mirror remembers
//! the counter it was loaded at and reloads once the store reports another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::errors::Result;
use crate::invalidation::{ChangeNotice, InvalidationListener};
use crate::models::{Identity, Job, ReloadMode};
use crate::schedule::{ParsedSchedule, ScheduleParser};
use crate::storage::{MetadataStore, TableId};

/// Table id value meaning "not resolved yet".
const UNRESOLVED: i64 = 0;

/// Change token value meaning "store not installed at last reload".
const NO_TOKEN: i64 = i64::MIN;

pub struct JobCache {
    store: Arc<dyn MetadataStore>,
    parser: Arc<dyn ScheduleParser>,
    reader: Identity,
    mode: ReloadMode,
    epoch: AtomicU64,
    loaded_epoch: AtomicU64,
    table_id: AtomicI64,
    token: AtomicI64,
    removed: Mutex<Vec<i64>>,
    reload_lock: Mutex<()>,
    jobs: RwLock<Arc<HashMap<i64, Job>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl JobCache {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        parser: Arc<dyn ScheduleParser>,
        reader: Identity,
        mode: ReloadMode,
    ) -> Self {
        Self {
            store,
            parser,
            reader,
            mode,
            epoch: AtomicU64::new(1),
            loaded_epoch: AtomicU64::new(0),
            table_id: AtomicI64::new(UNRESOLVED),
            token: AtomicI64::new(NO_TOKEN),
            removed: Mutex::new(Vec::new()),
            reload_lock: Mutex::new(()),
            jobs: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.loaded_epoch.load(Ordering::Acquire) == self.epoch.load(Ordering::Acquire)
    }

    /// Mark the mirror stale. Never blocks.
    pub fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop the mirror and the resolved table identity.
    pub fn reset(&self) {
        let _reload = lock(&self.reload_lock);
        self.table_id.store(UNRESOLVED, Ordering::Release);
        lock(&self.removed).clear();
        self.publish(HashMap::new());
        self.invalidate();
    }

    /// The job table identity this cache listens for, once resolved.
    pub fn table_id(&self) -> Option<TableId> {
        match self.table_id.load(Ordering::Acquire) {
            UNRESOLVED => None,
            id => Some(TableId(id)),
        }
    }

    /// Reload the mirror if it is stale.
    pub fn ensure_fresh(&self) -> Result<()> {
        if self.is_valid() {
            if !self.store_changed()? {
                return Ok(());
            }
            tracing::debug!("Job table changed by another connection");
            self.invalidate();
        }
        let _reload = lock(&self.reload_lock);
        if self.is_valid() {
            return Ok(());
        }

        let target = self.epoch.load(Ordering::Acquire);
        let removed: Vec<i64> = std::mem::take(&mut *lock(&self.removed));

        let (scanned, token) = match self.scan() {
            Ok(scanned) => scanned,
            Err(e) => {
                // Keep the notices for the next attempt.
                lock(&self.removed).extend(removed);
                return Err(e);
            }
        };

        let jobs = match (scanned, self.mode) {
            (None, _) => HashMap::new(),
            (Some(jobs), ReloadMode::Replace) => {
                jobs.into_iter().map(|job| (job.job_id, job)).collect()
            }
            (Some(jobs), ReloadMode::Merge) => {
                let mut merged = (*self.snapshot()).clone();
                for job_id in &removed {
                    merged.remove(job_id);
                }
                for job in jobs {
                    merged.insert(job.job_id, job);
                }
                merged
            }
        };

        tracing::debug!("Reloaded job cache: {} job(s)", jobs.len());
        self.publish(jobs);
        self.token.store(token.unwrap_or(NO_TOKEN), Ordering::Release);
        self.loaded_epoch.store(target, Ordering::Release);
        Ok(())
    }

    /// Whether the store's change counter moved since the last reload.
    fn store_changed(&self) -> Result<bool> {
        let mut tx = self.store.begin(&self.reader)?;
        let token = tx.change_token()?.unwrap_or(NO_TOKEN);
        tx.commit()?;
        Ok(token != self.token.load(Ordering::Acquire))
    }

    /// Read the job table along with the change counter it reflects. The job
    /// set is `None` when jobs are not visible on this node.
    fn scan(&self) -> Result<(Option<Vec<Job>>, Option<i64>)> {
        let mut tx = self.store.begin(&self.reader)?;
        let token = tx.change_token()?;
        let state = tx.probe()?;

        if state.jobs_table_ready() {
            if let Some(table) = tx.jobs_table_id()? {
                let _ = self.table_id.compare_exchange(
                    UNRESOLVED,
                    table.0,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
        if !state.jobs_visible() {
            tracing::debug!("Job table not visible, treating job set as empty");
            return Ok((None, token));
        }

        let records = tx.scan_jobs()?;
        let mut jobs = Vec::with_capacity(records.len());
        for record in records {
            let schedule = match self.parser.parse(&record.schedule) {
                Ok(schedule) => schedule,
                Err(e) => {
                    tracing::warn!("Job {} will never run: {}", record.job_id, e);
                    ParsedSchedule::never()
                }
            };
            let run_as = tx.role(&record.user_name)?;
            jobs.push(Job::from_record(record, schedule, run_as));
        }
        tx.commit()?;
        Ok((Some(jobs), token))
    }

    fn publish(&self, jobs: HashMap<i64, Job>) {
        let mut slot = match self.jobs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Arc::new(jobs);
    }

    fn snapshot(&self) -> Arc<HashMap<i64, Job>> {
        match self.jobs.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        self.ensure_fresh()?;
        Ok(self.snapshot().get(&job_id).cloned())
    }

    /// Every cached job, ordered by id.
    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.ensure_fresh()?;
        let mut jobs: Vec<Job> = self.snapshot().values().cloned().collect();
        jobs.sort_by_key(|job| job.job_id);
        Ok(jobs)
    }
}

impl InvalidationListener for JobCache {
    fn on_invalidate(&self, notice: &ChangeNotice) {
        let cached = self.table_id.load(Ordering::Acquire);
        let applies = match notice.table {
            None => true,
            Some(TableId(id)) => cached == UNRESOLVED || cached == id,
        };
        if !applies {
            return;
        }
        if let Some(job_id) = notice.removed_job {
            lock(&self.removed).push(job_id);
        }
        self.table_id.store(UNRESOLVED, Ordering::Release);
        self.invalidate();
        tracing::debug!("Job cache invalidated by {:?}", notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::InvalidationBus;
    use crate::models::{JobKey, ScheduleRequest};
    use crate::registrar::{JobRegistrar, JobTarget};
    use crate::schedule::CronParser;
    use crate::storage::schema::{InstallOptions, InstallState};
    use crate::storage::SqliteStore;
    use rusqlite::params;

    struct Fixture {
        store: Arc<SqliteStore>,
        cache: Arc<JobCache>,
        registrar: JobRegistrar,
    }

    fn fixture(mode: ReloadMode) -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
        store
            .install("postgres", InstallOptions::default())
            .expect("install");
        let bus = Arc::new(InvalidationBus::new());
        let cache = Arc::new(JobCache::new(
            store.clone(),
            Arc::new(CronParser),
            Identity::user("cron"),
            mode,
        ));
        bus.subscribe(cache.clone());
        let registrar =
            JobRegistrar::new(store.clone(), Arc::new(CronParser), bus, JobTarget::default());
        Fixture {
            store,
            cache,
            registrar,
        }
    }

    fn schedule(f: &Fixture, text: &str) -> i64 {
        f.registrar
            .schedule(&Identity::user("alice"), &ScheduleRequest::new(text, "SELECT 1"))
            .expect("schedule")
    }

    /// Delete a job behind the registrar's back, as another process would.
    fn delete_out_of_band(store: &SqliteStore, job_id: i64) {
        store
            .with_connection(|conn| {
                conn.execute("DELETE FROM job WHERE jobid = ?1", params![job_id])?;
                Ok(())
            })
            .expect("delete");
    }

    #[test]
    fn test_starts_invalid_and_loads() {
        let f = fixture(ReloadMode::Replace);
        assert!(!f.cache.is_valid());
        let job_id = schedule(&f, "*/5 * * * *");
        let job = f.cache.get_job(job_id).expect("get").expect("present");
        assert!(f.cache.is_valid());
        assert_eq!(job.schedule_text, "*/5 * * * *");
        assert!(job.schedule.can_fire());
        assert_eq!(job.run_as, Identity::user("alice"));
        assert!(f.cache.table_id().is_some());
    }

    #[test]
    fn test_schedule_and_unschedule_are_observed() {
        let f = fixture(ReloadMode::Replace);
        assert!(f.cache.list_jobs().expect("list").is_empty());

        let job_id = schedule(&f, "* * * * *");
        assert!(!f.cache.is_valid());
        assert_eq!(f.cache.list_jobs().expect("list").len(), 1);

        f.registrar
            .unschedule(&Identity::user("alice"), &JobKey::Id(job_id))
            .expect("unschedule");
        assert!(f.cache.get_job(job_id).expect("get").is_none());
    }

    #[test]
    fn test_malformed_stored_schedule_never_fires() {
        let f = fixture(ReloadMode::Replace);
        let good = schedule(&f, "* * * * *");
        let bad = schedule(&f, "* * * * *");
        f.store
            .with_connection(|conn| {
                conn.execute(
                    "UPDATE job SET schedule = 'garbage' WHERE jobid = ?1",
                    params![bad],
                )?;
                Ok(())
            })
            .expect("corrupt");
        f.cache.invalidate();

        let jobs = f.cache.list_jobs().expect("list");
        assert_eq!(jobs.len(), 2);
        assert!(f.cache.get_job(good).expect("get").expect("good").schedule.can_fire());
        assert!(!f.cache.get_job(bad).expect("get").expect("bad").schedule.can_fire());
    }

    #[test]
    fn test_replace_mode_evicts_out_of_band_delete() {
        let f = fixture(ReloadMode::Replace);
        let job_id = schedule(&f, "* * * * *");
        f.cache.ensure_fresh().expect("load");
        delete_out_of_band(&f.store, job_id);
        f.cache.invalidate();
        assert!(f.cache.get_job(job_id).expect("get").is_none());
    }

    #[test]
    fn test_merge_mode_keeps_rows_missing_from_scan() {
        let f = fixture(ReloadMode::Merge);
        let kept = schedule(&f, "* * * * *");
        let removed = schedule(&f, "* * * * *");
        f.cache.ensure_fresh().expect("load");

        delete_out_of_band(&f.store, kept);
        f.cache.invalidate();
        assert!(f.cache.get_job(kept).expect("get").is_some());

        f.registrar
            .unschedule(&Identity::user("alice"), &JobKey::Id(removed))
            .expect("unschedule");
        assert!(f.cache.get_job(removed).expect("get").is_none());
    }

    #[test]
    fn test_notice_for_other_table_is_ignored() {
        let f = fixture(ReloadMode::Replace);
        f.cache.ensure_fresh().expect("load");
        let table = f.cache.table_id().expect("resolved");

        f.cache
            .on_invalidate(&ChangeNotice::table(Some(TableId(table.0 + 1000))));
        assert!(f.cache.is_valid());

        f.cache.on_invalidate(&ChangeNotice::table(Some(table)));
        assert!(!f.cache.is_valid());
        assert!(f.cache.table_id().is_none());
    }

    #[test]
    fn test_unresolved_identity_accepts_any_notice() {
        let f = fixture(ReloadMode::Replace);
        f.cache.ensure_fresh().expect("load");
        f.cache.on_invalidate(&ChangeNotice::all());
        assert!(!f.cache.is_valid());
        f.cache
            .on_invalidate(&ChangeNotice::table(Some(TableId(424242))));
        assert!(!f.cache.is_valid());
    }

    #[test]
    fn test_not_ready_store_yields_empty_set() {
        let f = fixture(ReloadMode::Replace);
        schedule(&f, "* * * * *");
        f.store
            .set_install_state(InstallState::Upgrading)
            .expect("state");
        f.cache.invalidate();
        assert!(f.cache.list_jobs().expect("list").is_empty());

        f.store.set_install_state(InstallState::Ready).expect("state");
        f.cache.invalidate();
        assert_eq!(f.cache.list_jobs().expect("list").len(), 1);
    }

    #[test]
    fn test_invalidation_during_reload_forces_another() {
        let f = fixture(ReloadMode::Replace);
        f.cache.ensure_fresh().expect("load");
        f.cache.invalidate();
        let target = f.cache.epoch.load(Ordering::Acquire);
        // Simulate a notice arriving after the reload read its epoch.
        f.cache.invalidate();
        f.cache.loaded_epoch.store(target, Ordering::Release);
        assert!(!f.cache.is_valid());
    }

    #[test]
    fn test_reset_clears_mirror() {
        let f = fixture(ReloadMode::Merge);
        schedule(&f, "* * * * *");
        f.cache.ensure_fresh().expect("load");
        f.cache.reset();
        assert!(!f.cache.is_valid());
        assert!(f.cache.table_id().is_none());
        assert_eq!(f.cache.list_jobs().expect("list").len(), 1);
    }

    #[test]
    fn test_writes_through_another_connection_are_observed() {
        let tmp = tempfile::TempDir::new().expect("create temp dir");
        let path = tmp.path().join("catalog.db");
        let reader_store = Arc::new(SqliteStore::open(&path).expect("open reader"));
        reader_store
            .install("postgres", InstallOptions::default())
            .expect("install");
        let writer_store = Arc::new(SqliteStore::open(&path).expect("open writer"));

        let cache = JobCache::new(
            reader_store,
            Arc::new(CronParser),
            Identity::user("cron"),
            ReloadMode::Replace,
        );
        let registrar = JobRegistrar::new(
            writer_store,
            Arc::new(CronParser),
            Arc::new(InvalidationBus::new()),
            JobTarget::default(),
        );
        let alice = Identity::user("alice");

        assert!(cache.list_jobs().expect("list").is_empty());
        let job_id = registrar
            .schedule(&alice, &ScheduleRequest::new("* * * * *", "SELECT 1"))
            .expect("schedule");
        assert!(cache.get_job(job_id).expect("get").expect("present").active);

        registrar
            .set_active(&alice, &JobKey::Id(job_id), false)
            .expect("deactivate");
        assert!(!cache.get_job(job_id).expect("get").expect("present").active);

        registrar
            .unschedule(&alice, &JobKey::Id(job_id))
            .expect("unschedule");
        assert!(cache.get_job(job_id).expect("get").is_none());
    }

    #[test]
    fn test_unchanged_store_keeps_mirror_valid() {
        let f = fixture(ReloadMode::Replace);
        schedule(&f, "* * * * *");
        f.cache.ensure_fresh().expect("load");
        let loaded = f.cache.loaded_epoch.load(Ordering::Acquire);
        f.cache.ensure_fresh().expect("check");
        assert_eq!(f.cache.loaded_epoch.load(Ordering::Acquire), loaded);
    }

    #[test]
    fn test_concurrent_readers() {
        let f = fixture(ReloadMode::Replace);
        for _ in 0..5 {
            schedule(&f, "* * * * *");
        }
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = f.cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        cache.invalidate();
                        assert_eq!(cache.list_jobs().expect("list").len(), 5);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("reader");
        }
    }
}
