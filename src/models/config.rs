use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::run::RUN_RETENTION_CAP;

/// What a cache reload does with cached jobs missing from the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReloadMode {
    /// The scan becomes the whole mirror; absent rows are evicted.
    #[default]
    Replace,
    /// The scan is upserted into the mirror; only delete notices evict.
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default = "default_node_port")]
    pub node_port: i32,
    #[serde(default = "default_database_name")]
    pub database_name: String,
    /// Identity the cache and run tracker act as.
    #[serde(default = "default_worker_user")]
    pub worker_user: String,
    #[serde(default = "default_run_retention")]
    pub run_retention: u64,
    #[serde(default)]
    pub reload_mode: ReloadMode,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_node_name() -> String {
    "localhost".to_string()
}

fn default_node_port() -> i32 {
    5432
}

fn default_database_name() -> String {
    "postgres".to_string()
}

fn default_worker_user() -> String {
    "cron".to_string()
}

fn default_run_retention() -> u64 {
    RUN_RETENTION_CAP
}

fn default_tick_secs() -> u64 {
    60
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            node_name: default_node_name(),
            node_port: default_node_port(),
            database_name: default_database_name(),
            worker_user: default_worker_user(),
            run_retention: default_run_retention(),
            reload_mode: ReloadMode::default(),
            tick_secs: default_tick_secs(),
            log_file: None,
        }
    }
}
