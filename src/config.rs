//! CLI configuration and argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::SecretString;

use crate::device::{Credentials, DeviceEndpoint, SessionTimeouts};
use crate::error::{Error, Result};
use crate::firmware::{DEFAULT_REPO_URL, ProvisionMode, ProvisionSettings};
use crate::operations::ExecutionContext;
use crate::reboot::RebootSettings;
use crate::upgrade::UpgradeSettings;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// MikroTik RouterOS firmware upgrade and device automation CLI tool.
///
/// Checks the running version, places the firmware package on the device,
/// reboots it, waits for it to come back and verifies the new version.
#[derive(Parser, Debug, Clone)]
#[command(name = "mtup")]
#[command(about = "MikroTik RouterOS firmware upgrade and device automation CLI tool")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    /// Device hostname or IP address
    #[arg(long, global = true, env = "MTUP_HOST")]
    pub host: Option<String>,

    /// SSH port
    #[arg(long, global = true, env = "MTUP_PORT", default_value = "22")]
    pub port: u16,

    /// Login username
    #[arg(short, long, global = true, env = "MTUP_USERNAME", default_value = "admin")]
    pub username: String,

    /// Login password
    #[arg(long, global = true, env = "MTUP_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Private key file for key authentication
    #[arg(long, global = true, env = "MTUP_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Passphrase for the private key
    #[arg(long, global = true, env = "MTUP_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,

    /// Connection attempts before giving up
    #[arg(long, global = true, env = "MTUP_CONNECT_RETRIES", default_value = "2")]
    pub connect_retries: u32,

    /// Delay between connection attempts in seconds
    #[arg(long, global = true, env = "MTUP_CONNECT_DELAY_SECONDS", default_value = "2")]
    pub connect_delay_seconds: u64,

    /// Session establishment timeout in seconds
    #[arg(long, global = true, env = "MTUP_CONNECT_TIMEOUT_SECONDS", default_value = "15")]
    pub connect_timeout_seconds: u64,

    /// Timeout for a single CLI command in seconds
    #[arg(long, global = true, env = "MTUP_COMMAND_TIMEOUT_SECONDS", default_value = "60")]
    pub command_timeout_seconds: u64,

    /// How long to wait for the device to come back after reboot, in seconds
    #[arg(long, global = true, env = "MTUP_RECONNECT_TIMEOUT_SECONDS", default_value = "300")]
    pub reconnect_timeout_seconds: u64,

    /// Delay between reconnect attempts in seconds
    #[arg(long, global = true, env = "MTUP_RECONNECT_DELAY_SECONDS", default_value = "10")]
    pub reconnect_delay_seconds: u64,

    /// Device name recorded in the outcome
    #[arg(long, global = true, env = "MTUP_DEVICE_NAME")]
    pub device_name: Option<String>,

    /// Job identifier recorded in the outcome
    #[arg(long, global = true, env = "MTUP_JOB_ID")]
    pub job_id: Option<String>,

    /// Log format: json or pretty
    #[arg(long, global = true, env = "MTUP_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "MTUP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Upgrade RouterOS to a target version
    #[command(after_help = r#"Examples:
  mtup --host 10.0.0.1 upgrade 7.14 --mode download
  mtup --host 10.0.0.1 upgrade 7.14 --mode upload --source-root /srv/routeros"#)]
    Upgrade {
        /// Target RouterOS version (e.g., 7.14, 7.14.1)
        #[arg(value_name = "VERSION")]
        version: String,

        /// How the package reaches the device: download or upload
        #[arg(long, env = "MTUP_MODE")]
        mode: Option<ProvisionMode>,

        /// Package repository for download mode
        #[arg(long, env = "MTUP_REPO_URL", default_value = DEFAULT_REPO_URL)]
        repo_url: String,

        /// Local mirror root for upload mode (<root>/<version>/<package>)
        #[arg(long, env = "MTUP_SOURCE_ROOT")]
        source_root: Option<PathBuf>,
    },

    /// Show device architecture and running version
    Info,

    /// Run CLI commands in order and print their output
    Run {
        /// Commands to run (e.g., "/system identity print")
        #[arg(value_name = "COMMAND", required = true)]
        commands: Vec<String>,
    },

    /// Create a system backup on the device and download it
    Backup {
        /// Backup name (stored on the device as nauto_<NAME>.backup)
        #[arg(value_name = "NAME")]
        name: String,

        /// Local directory for the downloaded backup
        #[arg(long, default_value = ".")]
        download_dir: PathBuf,
    },

    /// Upload local files to the device
    Upload {
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,

        /// Destination directory on the device
        #[arg(long, default_value = "")]
        remote_dir: String,
    },

    /// Download files from the device
    Download {
        #[arg(value_name = "FILE", required = true)]
        files: Vec<String>,

        /// Local destination directory
        #[arg(long, default_value = ".")]
        local_dir: PathBuf,
    },
}

/// Application configuration derived from CLI args.
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: DeviceEndpoint,
    pub settings: UpgradeSettings,
    pub context: ExecutionContext,
    pub command: Command,
}

impl Config {
    /// Create config from CLI arguments.
    pub fn from_args(args: Args) -> Result<Self> {
        let host = args
            .host
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| {
                Error::Configuration("device host is required (--host or MTUP_HOST)".to_string())
            })?;

        let credentials = match (args.password, args.key_file) {
            (Some(_), Some(_)) => {
                return Err(Error::Configuration(
                    "use either --password or --key-file, not both".to_string(),
                ));
            }
            (Some(password), None) => Credentials::Password(SecretString::from(password)),
            (None, Some(path)) => Credentials::Key {
                path,
                passphrase: args.passphrase.map(SecretString::from),
            },
            (None, None) => {
                return Err(Error::Configuration(
                    "a password or key file is required".to_string(),
                ));
            }
        };

        let endpoint = DeviceEndpoint::new(host, args.username, credentials)
            .with_port(args.port)
            .with_timeouts(SessionTimeouts {
                connect: Duration::from_secs(args.connect_timeout_seconds),
                command: Duration::from_secs(args.command_timeout_seconds),
            });

        let settings = UpgradeSettings {
            connect_attempts: args.connect_retries,
            connect_delay: Duration::from_secs(args.connect_delay_seconds),
            reboot: RebootSettings {
                reconnect_timeout: Duration::from_secs(args.reconnect_timeout_seconds),
                reconnect_delay: Duration::from_secs(args.reconnect_delay_seconds),
                ..RebootSettings::default()
            },
        };

        Ok(Self {
            endpoint,
            settings,
            context: ExecutionContext {
                device_name: args.device_name,
                job_id: args.job_id,
            },
            command: args.command,
        })
    }

    pub fn display(&self) {
        tracing::debug!(
            endpoint = %self.endpoint,
            connect_attempts = self.settings.connect_attempts,
            connect_delay_seconds = self.settings.connect_delay.as_secs(),
            reconnect_timeout_seconds = self.settings.reboot.reconnect_timeout.as_secs(),
            reconnect_delay_seconds = self.settings.reboot.reconnect_delay.as_secs(),
            "Configuration initialized"
        );
    }
}

/// Provisioning parameters from the `upgrade` subcommand.
pub fn provision_settings(
    mode: Option<ProvisionMode>,
    repo_url: String,
    source_root: Option<PathBuf>,
) -> ProvisionSettings {
    ProvisionSettings {
        mode,
        repo_url,
        source_root,
    }
}
