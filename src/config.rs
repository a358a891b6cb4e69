//! Configuration module for Heimdall.
//!
//! Static settings come from environment variables with sensible defaults.
//! The probe settings (targets, probe kind, interval, timeout) can also be
//! changed at runtime through the API; those changes are written to a JSON
//! settings file that takes precedence over the environment on the next
//! start.

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

pub const MIN_POLL_INTERVAL: u64 = 1;
pub const MAX_POLL_INTERVAL: u64 = 3600;
pub const MIN_PROBE_TIMEOUT: u64 = 1;
pub const MAX_PROBE_TIMEOUT: u64 = 60;
const MAX_TARGET_LEN: usize = 255;

/// How reachability is tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Ping,
    Http,
    Dns,
}

impl FromStr for ProbeKind {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ping" => Ok(ProbeKind::Ping),
            "http" => Ok(ProbeKind::Http),
            "dns" => Ok(ProbeKind::Dns),
            other => Err(SettingsError::Invalid(format!("unknown probe kind: {}", other))),
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Ping => write!(f, "ping"),
            ProbeKind::Http => write!(f, "http"),
            ProbeKind::Dns => write!(f, "dns"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("{0}")]
    Invalid(String),
    #[error("settings file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for the API (default: "0.0.0.0")
    pub http_host: String,
    /// HTTP port for the API (default: 9000)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "heimdall.db")
    pub db_path: String,
    /// Path to the runtime settings file (default: "heimdall.settings.json")
    pub settings_path: String,
    /// Hosts probed as one target; reachable if any answers.
    pub targets: Vec<String>,
    pub probe_kind: ProbeKind,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    /// Trailing window for uptime stats (default: 24h)
    pub stats_window: Duration,
    /// How long raw samples are kept (default: 7 days)
    pub sample_retention: Duration,
    /// Consecutive store failures before the store is flagged degraded.
    pub degraded_after: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_host: "0.0.0.0".to_string(),
            http_port: 9000,
            db_path: "heimdall.db".to_string(),
            settings_path: "heimdall.settings.json".to_string(),
            targets: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            probe_kind: ProbeKind::Ping,
            poll_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            stats_window: Duration::from_secs(24 * 3600),
            sample_retention: Duration::from_secs(7 * 24 * 3600),
            degraded_after: 3,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `HEIMDALL_HTTP_HOST`, `HEIMDALL_HTTP_PORT`: API bind address
    /// - `HEIMDALL_DB_PATH`: database file path
    /// - `HEIMDALL_SETTINGS_FILE`: runtime settings file path
    /// - `HEIMDALL_TARGETS`: comma separated hosts
    /// - `HEIMDALL_PROBE_KIND`: `ping`, `http` or `dns`
    /// - `HEIMDALL_POLL_INTERVAL`, `HEIMDALL_PROBE_TIMEOUT`: seconds
    /// - `HEIMDALL_STATS_WINDOW`, `HEIMDALL_SAMPLE_RETENTION`: seconds
    /// - `HEIMDALL_DEGRADED_AFTER`: consecutive store failures
    ///
    /// Unparseable values keep their defaults.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(host) = lookup("HEIMDALL_HTTP_HOST") {
            cfg.http_host = host;
        }
        if let Some(port) = lookup("HEIMDALL_HTTP_PORT").and_then(|s| s.parse().ok()) {
            cfg.http_port = port;
        }
        if let Some(db_path) = lookup("HEIMDALL_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(path) = lookup("HEIMDALL_SETTINGS_FILE") {
            cfg.settings_path = path;
        }
        if let Some(targets) = lookup("HEIMDALL_TARGETS").and_then(|s| normalize_target_csv(&s).ok()) {
            cfg.targets = targets;
        }
        if let Some(kind) = lookup("HEIMDALL_PROBE_KIND").and_then(|s| s.parse().ok()) {
            cfg.probe_kind = kind;
        }
        if let Some(secs) = lookup_secs(&lookup, "HEIMDALL_POLL_INTERVAL") {
            cfg.poll_interval = Duration::from_secs(secs.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL));
        }
        if let Some(secs) = lookup_secs(&lookup, "HEIMDALL_PROBE_TIMEOUT") {
            cfg.probe_timeout = Duration::from_secs(secs.clamp(MIN_PROBE_TIMEOUT, MAX_PROBE_TIMEOUT));
        }
        if let Some(secs) = lookup_secs(&lookup, "HEIMDALL_STATS_WINDOW") {
            cfg.stats_window = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = lookup_secs(&lookup, "HEIMDALL_SAMPLE_RETENTION") {
            cfg.sample_retention = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = lookup("HEIMDALL_DEGRADED_AFTER").and_then(|s| s.parse().ok()) {
            cfg.degraded_after = n;
        }

        cfg
    }
}

fn lookup_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

/// Probe settings that can change while the monitor runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    pub targets: Vec<String>,
    pub probe_kind: ProbeKind,
    /// Seconds between probe starts.
    pub poll_interval: u64,
    /// Seconds before a probe counts as failed.
    pub probe_timeout: u64,
}

impl RuntimeSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }

    fn from_config(cfg: &ServerConfig) -> Self {
        let poll_interval = cfg.poll_interval.as_secs().clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
        let probe_timeout = cfg.probe_timeout.as_secs().clamp(MIN_PROBE_TIMEOUT, MAX_PROBE_TIMEOUT);
        Self {
            targets: cfg.targets.clone(),
            probe_kind: cfg.probe_kind,
            poll_interval,
            probe_timeout: probe_timeout.min(poll_interval),
        }
    }

    /// Overlay stored values, skipping any that fail validation.
    fn overlay(mut self, stored: StoredSettings) -> Self {
        if let Some(targets) = stored.targets {
            match normalize_targets(targets) {
                Ok(t) => self.targets = t,
                Err(e) => tracing::warn!("Ignoring stored targets: {}", e),
            }
        }
        if let Some(kind) = stored.probe_kind {
            self.probe_kind = kind;
        }
        if let Some(v) = stored.poll_interval {
            match check_range(v, "pollInterval", MIN_POLL_INTERVAL, MAX_POLL_INTERVAL) {
                Ok(v) => self.poll_interval = v,
                Err(e) => tracing::warn!("Ignoring stored poll interval: {}", e),
            }
        }
        if let Some(v) = stored.probe_timeout {
            match check_range(v, "probeTimeout", MIN_PROBE_TIMEOUT, MAX_PROBE_TIMEOUT) {
                Ok(v) => self.probe_timeout = v,
                Err(e) => tracing::warn!("Ignoring stored probe timeout: {}", e),
            }
        }
        self.probe_timeout = self.probe_timeout.min(self.poll_interval);
        self
    }
}

/// On-disk form of the runtime settings. Every field is optional so a
/// partially written file still contributes what it has.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSettings {
    targets: Option<Vec<String>>,
    probe_kind: Option<ProbeKind>,
    poll_interval: Option<u64>,
    probe_timeout: Option<u64>,
}

impl From<&RuntimeSettings> for StoredSettings {
    fn from(s: &RuntimeSettings) -> Self {
        Self {
            targets: Some(s.targets.clone()),
            probe_kind: Some(s.probe_kind),
            poll_interval: Some(s.poll_interval),
            probe_timeout: Some(s.probe_timeout),
        }
    }
}

/// Targets given either as a list or a comma separated string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TargetList {
    List(Vec<String>),
    Csv(String),
}

/// A partial settings change as accepted by the API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingsUpdate {
    pub targets: Option<TargetList>,
    /// Replaces the target list with a single host.
    pub target: Option<String>,
    pub probe_kind: Option<ProbeKind>,
    pub poll_interval: Option<u64>,
    pub probe_timeout: Option<u64>,
}

impl SettingsUpdate {
    /// Apply to `current`, returning the validated result.
    pub fn apply(self, current: &RuntimeSettings) -> Result<RuntimeSettings, SettingsError> {
        if self.targets.is_none()
            && self.target.is_none()
            && self.probe_kind.is_none()
            && self.poll_interval.is_none()
            && self.probe_timeout.is_none()
        {
            return Err(SettingsError::Invalid("no supported settings provided".to_string()));
        }

        let mut next = current.clone();

        if let Some(targets) = self.targets {
            next.targets = match targets {
                TargetList::List(list) => normalize_targets(list)?,
                TargetList::Csv(csv) => normalize_target_csv(&csv)?,
            };
        }
        if let Some(target) = self.target {
            next.targets = vec![normalize_target(&target)?];
        }
        if let Some(kind) = self.probe_kind {
            next.probe_kind = kind;
        }
        if let Some(v) = self.poll_interval {
            next.poll_interval = check_range(v, "pollInterval", MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)?;
        }
        if let Some(v) = self.probe_timeout {
            next.probe_timeout = check_range(v, "probeTimeout", MIN_PROBE_TIMEOUT, MAX_PROBE_TIMEOUT)?;
        }

        if next.probe_timeout > next.poll_interval {
            return Err(SettingsError::Invalid(
                "probeTimeout cannot be greater than pollInterval".to_string(),
            ));
        }

        Ok(next)
    }
}

fn check_range(value: u64, name: &str, min: u64, max: u64) -> Result<u64, SettingsError> {
    if value < min {
        return Err(SettingsError::Invalid(format!("{} must be >= {}", name, min)));
    }
    if value > max {
        return Err(SettingsError::Invalid(format!("{} must be <= {}", name, max)));
    }
    Ok(value)
}

fn normalize_target(raw: &str) -> Result<String, SettingsError> {
    let target = raw.trim();
    if target.is_empty() {
        return Err(SettingsError::Invalid("target cannot be empty".to_string()));
    }
    if target.len() > MAX_TARGET_LEN {
        return Err(SettingsError::Invalid("target is too long".to_string()));
    }
    Ok(target.to_string())
}

/// Trim, drop blanks and de-duplicate while keeping order.
fn normalize_targets(raw: Vec<String>) -> Result<Vec<String>, SettingsError> {
    let mut targets: Vec<String> = Vec::with_capacity(raw.len());
    for item in raw.iter().filter(|s| !s.trim().is_empty()) {
        let target = normalize_target(item)?;
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
    if targets.is_empty() {
        return Err(SettingsError::Invalid("targets must include at least one host".to_string()));
    }
    Ok(targets)
}

fn normalize_target_csv(csv: &str) -> Result<Vec<String>, SettingsError> {
    normalize_targets(csv.split(',').map(str::to_string).collect())
}

/// Owner of the runtime settings: validates updates, persists them and
/// publishes them to the poll loop.
pub struct SettingsManager {
    path: PathBuf,
    tx: watch::Sender<RuntimeSettings>,
    write_lock: Mutex<()>,
}

impl SettingsManager {
    /// Start from the environment config, overlaid with the settings file if
    /// it exists and parses.
    pub fn load(cfg: &ServerConfig) -> Self {
        let path = PathBuf::from(&cfg.settings_path);
        let mut settings = RuntimeSettings::from_config(cfg);

        match read_settings_file(&path) {
            Ok(Some(stored)) => {
                tracing::info!("Loaded runtime settings from {}", path.display());
                settings = settings.overlay(stored);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Ignoring unreadable settings file {}: {}", path.display(), e),
        }

        let (tx, _) = watch::channel(settings);
        Self {
            path,
            tx,
            write_lock: Mutex::new(()),
        }
    }

    pub fn current(&self) -> RuntimeSettings {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RuntimeSettings> {
        self.tx.subscribe()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate, persist and publish an update.
    pub fn update(&self, update: SettingsUpdate) -> Result<RuntimeSettings, SettingsError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let next = update.apply(&self.current())?;
        write_settings_file(&self.path, &next)?;
        self.tx.send_replace(next.clone());

        tracing::info!(
            "Runtime settings updated: targets={:?} kind={} interval={}s timeout={}s",
            next.targets,
            next.probe_kind,
            next.poll_interval,
            next.probe_timeout
        );
        Ok(next)
    }
}

fn read_settings_file(path: &Path) -> Result<Option<StoredSettings>, SettingsError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&data)?))
}

/// Write via a temp file and rename so a crash never leaves a torn file.
fn write_settings_file(path: &Path, settings: &RuntimeSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_string_pretty(&StoredSettings::from(settings))?;
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
