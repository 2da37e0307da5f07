// Daemon module: composition root, config loading, logging and the
// maintenance loop.

pub mod scheduler;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::cache::JobCache;
use crate::daemon::scheduler::{Clock, MaintenanceLoop, SystemClock};
use crate::invalidation::InvalidationBus;
use crate::models::{CatalogConfig, DispatchRequest, Identity};
use crate::registrar::{JobRegistrar, JobTarget};
use crate::runs::RunTracker;
use crate::schedule::{CronParser, ScheduleParser};
use crate::storage::SqliteStore;

const APP_DIR: &str = "cron-catalog";
const DATABASE_FILE: &str = "catalog.db";

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

fn read_config(path: &Path, source: &str) -> Result<CatalogConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", source))?;
    let config: CatalogConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", source))?;
    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}

/// Load the CatalogConfig using this resolution order:
///   1. --config CLI flag (passed as config_path)
///   2. CRON_CATALOG_CONFIG_DIR environment variable
///   3. Platform config dir (dirs::config_dir()/cron-catalog/config.json)
///   4. Fall back to {data_dir}/config.json
///   5. If no config file exists, use CatalogConfig::default()
pub fn load_config(config_path: Option<&Path>) -> Result<CatalogConfig> {
    if let Some(path) = config_path {
        if path.exists() {
            return read_config(path, "config file");
        }
        return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
    }

    if let Ok(config_dir) = std::env::var("CRON_CATALOG_CONFIG_DIR") {
        let path = PathBuf::from(&config_dir).join("config.json");
        if path.exists() {
            return read_config(&path, "CRON_CATALOG_CONFIG_DIR");
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join(APP_DIR).join("config.json");
        if path.exists() {
            return read_config(&path, "platform config dir");
        }
    }

    let path = resolve_data_dir(None).join("config.json");
    if path.exists() {
        return read_config(&path, "data dir");
    }

    tracing::info!("No config file found, using defaults");
    Ok(CatalogConfig::default())
}

/// Resolve the data directory: the override, then `CRON_CATALOG_DATA_DIR`,
/// then the platform data dir.
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }

    if let Ok(d) = std::env::var("CRON_CATALOG_DATA_DIR") {
        return PathBuf::from(d);
    }

    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// The catalog database file: `database_path` from config, or
/// `{data_dir}/catalog.db`.
pub fn database_path(config: &CatalogConfig, data_dir: &Path) -> PathBuf {
    config
        .database_path
        .clone()
        .unwrap_or_else(|| data_dir.join(DATABASE_FILE))
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the global subscriber: stderr always, plus `log_file` when set.
///
/// Keep the returned guard alive for as long as file output is wanted.
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // A subscriber may already be installed (tests, embedding).
    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    Ok(guard)
}

// ---------------------------------------------------------------------------
// Catalog (composition root)
// ---------------------------------------------------------------------------

/// Every catalog component, wired to one store and one invalidation bus.
pub struct Catalog {
    pub config: CatalogConfig,
    pub store: Arc<SqliteStore>,
    pub bus: Arc<InvalidationBus>,
    pub parser: Arc<dyn ScheduleParser>,
    pub cache: Arc<JobCache>,
    pub registrar: JobRegistrar,
    pub tracker: Arc<RunTracker>,
}

impl Catalog {
    /// Open (creating if needed) the catalog database under `data_dir`.
    /// A standby catalog is read-only.
    pub fn open(config: CatalogConfig, data_dir: &Path, standby: bool) -> Result<Self> {
        let path = database_path(&config, data_dir);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create data directory")?;
        }
        let store = if standby {
            SqliteStore::open_standby(&path)
        } else {
            SqliteStore::open(&path)
        }
        .with_context(|| format!("Failed to open catalog database {}", path.display()))?;
        tracing::debug!(
            "Opened catalog database {}{}",
            path.display(),
            if standby { " (standby)" } else { "" }
        );
        Ok(Self::from_store(config, Arc::new(store)))
    }

    pub fn from_store(config: CatalogConfig, store: Arc<SqliteStore>) -> Self {
        let parser: Arc<dyn ScheduleParser> = Arc::new(CronParser);
        let bus = Arc::new(InvalidationBus::new());
        let worker = Identity::user(config.worker_user.clone());

        let cache = Arc::new(JobCache::new(
            store.clone(),
            parser.clone(),
            worker.clone(),
            config.reload_mode,
        ));
        bus.subscribe(cache.clone());

        let registrar = JobRegistrar::new(
            store.clone(),
            parser.clone(),
            bus.clone(),
            JobTarget::from(&config),
        );
        let tracker = Arc::new(RunTracker::new(store.clone(), worker, config.run_retention));

        Self {
            config,
            store,
            bus,
            parser,
            cache,
            registrar,
            tracker,
        }
    }

    pub fn maintenance_loop(
        &self,
        clock: Arc<dyn Clock>,
        dispatch_tx: mpsc::Sender<DispatchRequest>,
    ) -> MaintenanceLoop {
        MaintenanceLoop::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.tracker),
            Arc::clone(&self.parser),
            clock,
            Duration::from_secs(self.config.tick_secs.max(1)),
            dispatch_tx,
        )
    }
}

// ---------------------------------------------------------------------------
// Foreground watch
// ---------------------------------------------------------------------------

/// Run the maintenance loop until Ctrl+C or SIGTERM, logging each due job.
pub async fn run_foreground(catalog: &Catalog) -> Result<()> {
    let (dispatch_tx, mut dispatch_rx) = mpsc::channel::<DispatchRequest>(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let maintenance = catalog.maintenance_loop(Arc::new(SystemClock), dispatch_tx);
    let loop_handle = tokio::spawn(async move { maintenance.run(shutdown_rx).await });

    let logger_handle = tokio::spawn(async move {
        while let Some(request) = dispatch_rx.recv().await {
            tracing::info!(
                "Job {} due at {} (as {}): {}",
                request.job_id(),
                request.due_at,
                request.job.run_as.name,
                request.job.command
            );
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C signal");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM signal");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C signal");
    }

    let _ = shutdown_tx.send(());
    let result = loop_handle.await.context("Maintenance loop panicked")?;
    logger_handle.abort();
    result
}
