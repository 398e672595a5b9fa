use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Config path
    #[clap(short, long, default_value = "config.toml")]
    pub config_path: String,
}

impl Default for Cli {
    fn default() -> Self {
        Self::new()
    }
}

impl Cli {
    #[must_use]
    pub fn new() -> Self {
        Self::parse()
    }
}

fn default_data_dir() -> std::path::PathBuf {
    "/var/lib/forge".into()
}

fn default_pg_socket_url() -> secrecy::SecretString {
    "postgres://forge@%2Frun%2Fpostgresql:5432/forge".into()
}

const fn default_max_db_connections() -> u32 {
    32
}

fn default_machines_file() -> std::path::PathBuf {
    "/etc/forge/machines".into()
}

const fn default_machines_reload_interval_in_s() -> u64 {
    60
}

const fn default_dispatch_trigger_timer_in_s() -> i64 {
    120
}

const fn default_queue_trigger_timer_in_s() -> i64 {
    -1
}

const fn default_max_retries() -> u32 {
    5
}

const fn default_retry_interval() -> u32 {
    60
}

const fn default_retry_backoff() -> f32 {
    3.0
}

/// Main configuration of the application
#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
struct AppConfig {
    #[serde(default = "default_data_dir")]
    data_dir: std::path::PathBuf,

    // store root; defaults to <data_dir>/store
    store_dir: Option<std::path::PathBuf>,

    #[serde(default = "default_pg_socket_url")]
    db_url: secrecy::SecretString,

    #[serde(default = "default_max_db_connections")]
    max_db_connections: u32,

    #[serde(default = "default_machines_file")]
    machines_file: std::path::PathBuf,

    #[serde(default = "default_machines_reload_interval_in_s")]
    machines_reload_interval_in_s: u64,

    // setting this to -1, will disable the timer
    #[serde(default = "default_dispatch_trigger_timer_in_s")]
    dispatch_trigger_timer_in_s: i64,

    // setting this to -1, will disable the timer
    #[serde(default = "default_queue_trigger_timer_in_s")]
    queue_trigger_timer_in_s: i64,

    #[serde(default = "default_max_retries")]
    max_retries: u32,

    #[serde(default = "default_retry_interval")]
    retry_interval: u32,

    #[serde(default = "default_retry_backoff")]
    retry_backoff: f32,
}

/// Prepared configuration of the application
#[derive(Debug)]
pub struct PreparedApp {
    #[allow(dead_code)]
    data_dir: std::path::PathBuf,
    store_dir: std::path::PathBuf,
    log_dir: std::path::PathBuf,
    lockfile: std::path::PathBuf,
    pub db_url: secrecy::SecretString,
    max_db_connections: u32,
    machines_file: std::path::PathBuf,
    machines_reload_interval: std::time::Duration,
    dispatch_trigger_timer: Option<tokio::time::Duration>,
    queue_trigger_timer: Option<tokio::time::Duration>,
    max_retries: u32,
    retry_interval: f32,
    retry_backoff: f32,
}

impl TryFrom<AppConfig> for PreparedApp {
    type Error = anyhow::Error;

    fn try_from(val: AppConfig) -> Result<Self, Self::Error> {
        let store_dir = val
            .store_dir
            .unwrap_or_else(|| val.data_dir.join("store"));
        let log_dir = val.data_dir.join("build-logs");
        let lockfile = val.data_dir.join("queue-runner/lock");

        Ok(Self {
            data_dir: val.data_dir,
            store_dir,
            log_dir,
            lockfile,
            db_url: val.db_url,
            max_db_connections: val.max_db_connections,
            machines_file: val.machines_file,
            machines_reload_interval: std::time::Duration::from_secs(
                val.machines_reload_interval_in_s.max(1),
            ),
            dispatch_trigger_timer: u64::try_from(val.dispatch_trigger_timer_in_s)
                .ok()
                .and_then(|v| {
                    if v == 0 {
                        None
                    } else {
                        Some(tokio::time::Duration::from_secs(v))
                    }
                }),
            queue_trigger_timer: u64::try_from(val.queue_trigger_timer_in_s)
                .ok()
                .and_then(|v| {
                    if v == 0 {
                        None
                    } else {
                        Some(tokio::time::Duration::from_secs(v))
                    }
                }),
            max_retries: val.max_retries,
            #[allow(clippy::cast_precision_loss)]
            retry_interval: val.retry_interval as f32,
            retry_backoff: val.retry_backoff,
        })
    }
}

/// Loads the config from specified path
#[tracing::instrument(err)]
fn load_config(filepath: &str) -> anyhow::Result<PreparedApp> {
    tracing::info!("Trying to load file: {filepath}");
    let toml: AppConfig = if let Ok(content) = fs_err::read_to_string(filepath) {
        toml::from_str(&content)
            .with_context(|| format!("Failed to toml load from '{filepath}'"))?
    } else {
        tracing::warn!("no config file found! Using default config");
        toml::from_str("").context("Failed to parse empty string as config")?
    };

    toml.try_into().context("Failed to prepare configuration")
}

#[derive(Debug, Clone)]
pub struct App {
    inner: Arc<arc_swap::ArcSwap<PreparedApp>>,
}

impl App {
    #[tracing::instrument(err)]
    pub fn init(filepath: &str) -> anyhow::Result<Self> {
        Ok(Self {
            inner: Arc::new(arc_swap::ArcSwap::from(Arc::new(load_config(filepath)?))),
        })
    }

    fn swap_inner(&self, new_val: PreparedApp) {
        self.inner.store(Arc::new(new_val));
    }

    #[must_use]
    pub fn get_store_dir(&self) -> std::path::PathBuf {
        let inner = self.inner.load();
        inner.store_dir.clone()
    }

    #[must_use]
    pub fn get_log_dir(&self) -> std::path::PathBuf {
        let inner = self.inner.load();
        inner.log_dir.clone()
    }

    #[must_use]
    pub fn get_lockfile(&self) -> std::path::PathBuf {
        let inner = self.inner.load();
        inner.lockfile.clone()
    }

    #[must_use]
    pub fn get_db_url(&self) -> secrecy::SecretString {
        let inner = self.inner.load();
        inner.db_url.clone()
    }

    #[must_use]
    pub fn get_max_db_connections(&self) -> u32 {
        let inner = self.inner.load();
        inner.max_db_connections
    }

    #[must_use]
    pub fn get_machines_file(&self) -> std::path::PathBuf {
        let inner = self.inner.load();
        inner.machines_file.clone()
    }

    #[must_use]
    pub fn get_machines_reload_interval(&self) -> std::time::Duration {
        let inner = self.inner.load();
        inner.machines_reload_interval
    }

    #[must_use]
    pub fn get_dispatch_trigger_timer(&self) -> Option<tokio::time::Duration> {
        let inner = self.inner.load();
        inner.dispatch_trigger_timer
    }

    #[must_use]
    pub fn get_queue_trigger_timer(&self) -> Option<tokio::time::Duration> {
        let inner = self.inner.load();
        inner.queue_trigger_timer
    }

    #[must_use]
    pub fn get_retry(&self) -> (u32, f32, f32) {
        let inner = self.inner.load();
        (inner.max_retries, inner.retry_interval, inner.retry_backoff)
    }
}

pub async fn reload(current_config: &App, filepath: &str, state: &Arc<crate::state::State>) {
    let new_config = match load_config(filepath) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Failed to load new config: {e}");
            let _notify = sd_notify::notify(
                false,
                &[
                    sd_notify::NotifyState::Status("Reload failed"),
                    sd_notify::NotifyState::Errno(1),
                ],
            );

            return;
        }
    };

    if let Err(e) = state.reload_config_callback(&new_config).await {
        tracing::error!("Config reload failed with {e}");
        let _notify = sd_notify::notify(
            false,
            &[
                sd_notify::NotifyState::Status("Configuration reload failed - Running"),
                sd_notify::NotifyState::Errno(1),
            ],
        );
        return;
    }

    current_config.swap_inner(new_config);
    let _notify = sd_notify::notify(
        false,
        &[
            sd_notify::NotifyState::Status("Configuration reloaded - Running"),
            sd_notify::NotifyState::Ready,
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        let prepared: PreparedApp = config.try_into().unwrap();

        assert_eq!(prepared.store_dir, std::path::Path::new("/var/lib/forge/store"));
        assert_eq!(prepared.log_dir, std::path::Path::new("/var/lib/forge/build-logs"));
        assert_eq!(prepared.max_retries, 5);
        assert!((prepared.retry_interval - 60.0).abs() < f32::EPSILON);
        assert!((prepared.retry_backoff - 3.0).abs() < f32::EPSILON);
        assert_eq!(
            prepared.dispatch_trigger_timer,
            Some(std::time::Duration::from_secs(120))
        );
        assert!(prepared.queue_trigger_timer.is_none());
    }

    #[test]
    fn test_config_overrides() {
        let config: AppConfig = toml::from_str(
            r#"
            dataDir = "/srv/forge"
            machinesFile = "/srv/forge/machines"
            maxRetries = 2
            queueTriggerTimerInS = 30
            "#,
        )
        .unwrap();
        let prepared: PreparedApp = config.try_into().unwrap();

        assert_eq!(prepared.store_dir, std::path::Path::new("/srv/forge/store"));
        assert_eq!(prepared.machines_file, std::path::Path::new("/srv/forge/machines"));
        assert_eq!(prepared.max_retries, 2);
        assert_eq!(
            prepared.queue_trigger_timer,
            Some(std::time::Duration::from_secs(30))
        );
    }

    #[test]
    fn test_config_rejects_unknown_fields() {
        assert!(toml::from_str::<AppConfig>("unknownField = 1").is_err());
    }
}
