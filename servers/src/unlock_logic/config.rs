//! Command-line and environment settings of `server_unlock`.
//!
//! Only what the operator may want to change per host lives here; everything
//! else comes from the YAML configuration file.

use std::path::PathBuf;

use clap::Parser;
use lib_unlock::configs::app_config::DEFAULT_CONFIG_FILE;
use lib_unlock::{load_config, AppConfig, ConfigError, LoggingOptions};

#[derive(Parser, Debug, Clone)]
#[clap(about = "Proxy fleet unlock checker daemon", version)]
pub struct Cli {
    #[clap(
        long = "config",
        env = "UNLOCK_CONFIG_FILE",
        default_value = DEFAULT_CONFIG_FILE,
        help = "Path to the YAML configuration file. Created with defaults when missing."
    )]
    pub config_path: PathBuf,

    #[clap(long, env = "UNLOCK_PORT", help = "Port of the HTTP API, overrides http_server.port.")]
    pub port: Option<u16>,

    #[clap(long, env = "UNLOCK_LOG_DIR", default_value = "logs", help = "Directory for log files.")]
    pub log_dir: PathBuf,

    #[clap(
        long,
        env = "UNLOCK_LOG_LEVEL",
        default_value = "info",
        help = "Logging level (trace, debug, info, warn, error). RUST_LOG wins when set."
    )]
    pub log_level: String,
}

impl Cli {
    pub fn logging_options(&self) -> LoggingOptions {
        LoggingOptions {
            log_dir: self.log_dir.clone(),
            level: self.log_level.clone(),
            ..Default::default()
        }
    }

    /// Loads the YAML configuration and applies the command-line overrides.
    pub fn load_app_config(&self) -> Result<AppConfig, ConfigError> {
        let mut config = load_config(&self.config_path)?;
        if let Some(port) = self.port {
            config.http_server.port = port;
        }
        Ok(config)
    }
}

/// Loads `.env`, then the platform file `.env.windows` or `.env.linux`.
/// Missing files are ignored.
pub fn load_dotenv() {
    let dotenv_os: &str = if cfg!(target_os = "windows") {
        ".env.windows"
    } else {
        ".env.linux"
    };
    dotenvy::dotenv().ok();
    dotenvy::from_filename(dotenv_os).ok();
}
