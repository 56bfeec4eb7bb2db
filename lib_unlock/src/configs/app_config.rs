//! # Application Configuration
//!
//! The checker is driven by one YAML document. Every section carries serde
//! defaults, so an operator only has to write the keys that differ from the
//! stock setup. When the file does not exist yet, the defaults are written to
//! the requested path to serve as an editable template.
//!
//! ```yaml
//! config_urls:
//!   - https://example.com/fleet-a.yaml
//! schedule:
//!   cron: "0 */6 * * *"
//! engine:
//!   binary_path: /usr/local/bin/clash
//!   api_url: http://127.0.0.1:9090
//! probe:
//!   block_marker: "Oh no!"
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Location used when neither the CLI nor the environment names a file.
pub const DEFAULT_CONFIG_FILE: &str = "config/config.yaml";

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file exists but could not be read.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for [`AppConfig`].
    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yml::Error,
    },

    /// The configuration parsed but holds values the checker cannot run with.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// # App Config
///
/// Root of the configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Remote fleet documents, aggregated in this order on every run.
    pub config_urls: Vec<String>,
    /// Listener settings of the thin HTTP front-end.
    pub http_server: HttpServerConfig,
    /// When runs fire.
    pub schedule: ScheduleConfig,
    /// The routing-engine process and its control plane.
    pub engine: EngineConfig,
    /// How endpoints are probed against the target service.
    pub probe: ProbeConfig,
    /// Where run artifacts are persisted.
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpServerConfig {
    pub port: u16,
    /// Shared key expected in `Authorization: Bearer` or `X-Access-Key`.
    pub access_key: String,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            access_key: "change-me".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Cron expression. Five-field (minute-first) expressions get a leading
    /// seconds field of `0`.
    pub cron: String,
    /// Pause after a failed run before the next fire time is computed.
    pub error_backoff_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "0 */6 * * *".to_string(),
            error_backoff_secs: 300,
        }
    }
}

impl ScheduleConfig {
    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

/// # Engine Config
///
/// Describes the routing-engine binary, where its merged configuration is
/// written, and how to reach its control-plane API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Executable launched as `<binary_path> -f <config_path>`.
    pub binary_path: PathBuf,
    /// Where the merged control configuration is written for the engine.
    pub config_path: PathBuf,
    /// Base URL of the control-plane API.
    pub api_url: String,
    /// Optional bearer token for the control plane.
    pub secret: Option<String>,
    /// Preferred selector group; the first `Selector` group is used when absent.
    pub selector_group: String,
    /// Engine routing mode written into the merged configuration.
    pub mode: String,
    /// Wait between spawning the process and the first health check.
    pub startup_settle_ms: u64,
    /// Health checks attempted after the settle wait before giving up.
    pub health_attempts: u32,
    pub health_interval_ms: u64,
    /// Timeout applied to every control-plane request.
    pub api_timeout_secs: u64,
    /// Grace period between SIGTERM and a forced kill.
    pub stop_timeout_secs: u64,
    /// Number of process output lines kept for start-failure diagnostics.
    pub output_tail_lines: usize,
    /// The local mixed (HTTP/SOCKS) inbound that probes are routed through.
    pub proxy: LocalProxyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("/usr/local/bin/clash"),
            config_path: PathBuf::from("engine/config.yaml"),
            api_url: "http://127.0.0.1:9090".to_string(),
            secret: None,
            selector_group: "GLOBAL".to_string(),
            mode: "global".to_string(),
            startup_settle_ms: 3000,
            health_attempts: 5,
            health_interval_ms: 1000,
            api_timeout_secs: 10,
            stop_timeout_secs: 5,
            output_tail_lines: 50,
            proxy: LocalProxyConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn startup_settle(&self) -> Duration {
        Duration::from_millis(self.startup_settle_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// The bearer token, ignoring an empty string.
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalProxyConfig {
    pub host: String,
    pub port: u16,
    pub auth: Option<ProxyAuth>,
}

impl Default for LocalProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7890,
            auth: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub user: String,
    pub pass: String,
}

impl LocalProxyConfig {
    /// Proxy URL handed to the probe client, credentials included.
    pub fn url(&self) -> String {
        match &self.auth {
            Some(auth) => format!(
                "http://{}:{}@{}:{}",
                auth.user, auth.pass, self.host, self.port
            ),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

/// # Probe Config
///
/// Target-service URLs used as unlock evidence and the knobs of each probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// One GET per URL per endpoint. Must not be empty.
    pub target_urls: Vec<String>,
    /// Body substring that marks a blocked response.
    pub block_marker: String,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub accept_language: String,
    /// Wait after a route switch before the first probe.
    pub settle_ms: u64,
    /// Pause between two probes of the same endpoint.
    pub probe_gap_ms: u64,
    /// Timeout for downloading each fleet document.
    pub fetch_timeout_secs: u64,
    /// Optional egress-address lookup (e.g. `http://ip-api.com/json`) made
    /// through the active route after each switch. Only used when debug
    /// logging is enabled.
    pub exit_ip_url: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target_urls: vec![
                "https://www.netflix.com/title/70143836".to_string(),
                "https://www.netflix.com/title/81280792".to_string(),
            ],
            block_marker: "Oh no!".to_string(),
            timeout_secs: 20,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            settle_ms: 1000,
            probe_gap_ms: 1000,
            fetch_timeout_secs: 30,
            exit_ip_url: None,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn probe_gap(&self) -> Duration {
        Duration::from_millis(self.probe_gap_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub results_dir: PathBuf,
    /// JSON snapshot of the latest run, overwritten each run.
    pub snapshot_file: String,
    /// YAML subscription listing only fully unlocked endpoints.
    pub subscription_file: String,
    /// Appended to endpoint names in the subscription.
    pub subscription_suffix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            snapshot_file: "unlock_results.json".to_string(),
            subscription_file: "unlocked_proxies.yaml".to_string(),
            subscription_suffix: "-NF".to_string(),
        }
    }
}

impl AppConfig {
    /// Parses a YAML document. Used by [`load_config`] and by tests.
    pub fn from_yaml_str(source: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yml::from_str(source).map_err(|e| ConfigError::Yaml {
            path: origin.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the pipeline cannot execute.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe.target_urls.is_empty() {
            return Err(ConfigError::Invalid(
                "probe.target_urls must list at least one URL".to_string(),
            ));
        }
        if self.engine.api_url.trim().is_empty() {
            return Err(ConfigError::Invalid("engine.api_url is empty".to_string()));
        }
        if self.engine.health_attempts == 0 {
            return Err(ConfigError::Invalid(
                "engine.health_attempts must be at least 1".to_string(),
            ));
        }
        parse_cron(&self.schedule.cron)?;
        Ok(())
    }
}

/// Brings a cron expression into the seconds-first form `cron` expects.
///
/// Five fields are treated as classic minute-first crontab syntax: they get a
/// `0` seconds field and their numeric day-of-week values (0 or 7 = Sunday)
/// are shifted onto the 1 = Sunday numbering of `cron`. Six and seven fields
/// pass through unchanged.
pub fn normalize_cron(expression: &str) -> Result<String, ConfigError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let day_of_week = crontab_day_of_week(fields[4]).map_err(|reason| {
                ConfigError::Invalid(format!("cron expression '{}': {}", expression, reason))
            })?;
            Ok(format!("0 {} {}", fields[..4].join(" "), day_of_week))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(ConfigError::Invalid(format!(
            "cron expression '{}' has {} fields, expected 5, 6 or 7",
            expression, n
        ))),
    }
}

/// Rewrites a crontab day-of-week field for `cron`.
///
/// Numeric items (single days, ranges, steps) are expanded and mapped to an
/// explicit list; `*` and day names are kept as written.
fn crontab_day_of_week(field: &str) -> Result<String, String> {
    let mut kept: Vec<&str> = Vec::new();
    let mut days: BTreeSet<u32> = BTreeSet::new();

    for item in field.split(',') {
        if item == "*" || item.chars().any(|c| c.is_ascii_alphabetic()) {
            kept.push(item);
            continue;
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("bad day-of-week step '{}'", item))?;
                (range, Some(step))
            }
            None => (item, None),
        };
        let (first, last) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((a, b)) => (parse_weekday(a)?, parse_weekday(b)?),
            None if step.is_some() => (parse_weekday(range)?, 6),
            None => {
                let day = parse_weekday(range)?;
                (day, day)
            }
        };
        let step = step.unwrap_or(1);
        if step == 0 || first > last {
            return Err(format!("bad day-of-week item '{}'", item));
        }
        days.extend((first..=last).step_by(step as usize).map(|d| d % 7 + 1));
    }

    let mut parts: Vec<String> = kept.into_iter().map(str::to_string).collect();
    parts.extend(days.iter().map(u32::to_string));
    Ok(parts.join(","))
}

fn parse_weekday(value: &str) -> Result<u32, String> {
    match value.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("day-of-week '{}' is not in 0-7", value)),
    }
}

/// Normalizes and parses a cron expression.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, ConfigError> {
    let normalized = normalize_cron(expression)?;
    cron::Schedule::from_str(&normalized).map_err(|e| {
        ConfigError::Invalid(format!("cron expression '{}': {}", expression, e))
    })
}

/// Loads the configuration from `path`.
///
/// A missing file is not an error: defaults are returned and written to
/// `path` so the operator has a template. A failure to write the template is
/// only logged.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    if path.exists() {
        let source = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = AppConfig::from_yaml_str(&source, path)?;
        info!("Configuration loaded from {}", path.display());
        return Ok(config);
    }

    let config = AppConfig::default();
    info!(
        "Configuration file {} not found, using defaults",
        path.display()
    );
    if let Err(e) = write_template(path, &config) {
        warn!("Could not write configuration template {}: {}", path.display(), e);
    }
    Ok(config)
}

fn write_template(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    let io_err = |e: std::io::Error| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let yaml = serde_yml::to_string(config).map_err(|e| ConfigError::Yaml {
        path: path.to_path_buf(),
        source: e,
    })?;
    fs::write(path, yaml).map_err(io_err)
}
