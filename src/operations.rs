//! Device client and the tracked single-session operations.
//!
//! Every operation follows the same shape: open a result record, acquire a
//! session with retry, do the work, then release the session and finish the
//! record on every path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{info, info_span};

use crate::clock::Clock;
use crate::connection::ConnectionManager;
use crate::device::{Connector, DeviceEndpoint, Session};
use crate::error::{Error, Result};
use crate::firmware::ProvisionSettings;
use crate::info::read_info;
use crate::result::{OperationFailure, OperationResult, ResultRecorder};
use crate::upgrade::{UpgradeOrchestrator, UpgradeSettings};

/// Prefix applied to backups created on the device.
pub const BACKUP_PREFIX: &str = "nauto_";

/// Time RouterOS needs to flush a backup file after `save` returns.
pub const BACKUP_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Caller-supplied labels attached to every outcome.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub device_name: Option<String>,
    pub job_id: Option<String>,
}

impl ExecutionContext {
    pub fn annotate(&self, recorder: &mut ResultRecorder) {
        if let Some(name) = &self.device_name {
            recorder.set("device_name", name.clone());
        }
        if let Some(job_id) = &self.job_id {
            recorder.set("job_id", job_id.clone());
        }
    }
}

/// Output of a single command run through [`DeviceClient::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub command: String,
    pub output: String,
}

type Outcome = std::result::Result<OperationResult, OperationFailure>;

/// Entry point for all device operations.
pub struct DeviceClient {
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    endpoint: DeviceEndpoint,
    settings: UpgradeSettings,
    context: ExecutionContext,
}

impl DeviceClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
        endpoint: DeviceEndpoint,
    ) -> Self {
        Self {
            connector,
            clock,
            endpoint,
            settings: UpgradeSettings::default(),
            context: ExecutionContext::default(),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: UpgradeSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub const fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    /// Full firmware upgrade to `target_version`.
    pub fn upgrade(&self, target_version: &str, provisioning: ProvisionSettings) -> Outcome {
        UpgradeOrchestrator::new(
            self.connector.clone(),
            self.clock.clone(),
            self.endpoint.clone(),
            target_version,
            provisioning,
        )
        .with_settings(self.settings)
        .with_context(self.context.clone())
        .run()
    }

    /// Read architecture and running version.
    pub fn info(&self) -> Outcome {
        self.tracked("info", |session, recorder| {
            let info = read_info(session)?;
            recorder.set("architecture", info.architecture);
            recorder.set("version", info.version);
            Ok("System information read successfully".to_string())
        })
    }

    /// Execute commands in order and collect their output.
    pub fn run<S: AsRef<str>>(&self, commands: &[S]) -> Outcome {
        let commands: Vec<String> = commands.iter().map(|c| c.as_ref().to_string()).collect();

        self.tracked("run", |session, recorder| {
            recorder.set("commands", commands.clone());
            if commands.is_empty() {
                return Err(Error::Configuration("at least one command is required".to_string()));
            }

            let mut outputs = Vec::with_capacity(commands.len());
            for command in &commands {
                info!(command = %command, "Running command");
                let output = session.execute(command)?;
                outputs.push(CommandOutput {
                    command: command.clone(),
                    output,
                });
            }

            recorder.set("output", json!(outputs));
            Ok("Commands executed successfully".to_string())
        })
    }

    /// Save a system backup on the device and download it.
    ///
    /// The device file is `nauto_<name>.backup`; the local copy drops the
    /// prefix and lands in `download_dir`.
    pub fn backup(&self, name: &str, download_dir: &Path) -> Outcome {
        self.tracked("backup", |session, recorder| {
            if name.trim().is_empty() || name.contains(['/', ' ', '"']) {
                return Err(Error::Configuration(format!("invalid backup name '{name}'")));
            }

            let remote_file = format!("{BACKUP_PREFIX}{name}.backup");
            let local_path = download_dir.join(format!("{name}.backup"));
            recorder.set("remote_file", remote_file.clone());
            recorder.set("local_path", local_path.display().to_string());

            info!(name = %name, "Creating backup");
            session.execute(&format!("/system backup save name={BACKUP_PREFIX}{name}"))?;
            self.clock.sleep(BACKUP_SETTLE_DELAY);

            std::fs::create_dir_all(download_dir)?;
            info!(
                remote_file = %remote_file,
                local_path = %local_path.display(),
                "Downloading backup"
            );
            session.get(&remote_file, &local_path)?;

            Ok(format!("Backup '{name}' created and downloaded"))
        })
    }

    /// Push local files into `remote_dir` on the device.
    pub fn upload(&self, files: &[PathBuf], remote_dir: &str) -> Outcome {
        self.tracked("upload", |session, recorder| {
            recorder.set("remote_dir", remote_dir.to_string());
            recorder.set("files", json!([]));

            let mut uploaded = Vec::with_capacity(files.len());
            for path in files {
                if !path.is_file() {
                    return Err(Error::Transfer(format!(
                        "local file not found: {}",
                        path.display()
                    )));
                }
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| {
                        Error::Transfer(format!("invalid file name: {}", path.display()))
                    })?;
                let remote_path = match remote_dir.trim_end_matches('/') {
                    "" => name.to_string(),
                    dir => format!("{dir}/{name}"),
                };

                info!(local_path = %path.display(), remote_path = %remote_path, "Uploading file");
                session.put(path, &remote_path)?;
                uploaded.push(name.to_string());
            }

            recorder.set("files", uploaded);
            Ok("Files uploaded successfully".to_string())
        })
    }

    /// Fetch device files into `local_dir`.
    pub fn download<S: AsRef<str>>(&self, files: &[S], local_dir: &Path) -> Outcome {
        self.tracked("download", |session, recorder| {
            let names: Vec<String> = files.iter().map(|f| f.as_ref().to_string()).collect();
            recorder.set("files", names.clone());
            recorder.set("local_dir", local_dir.display().to_string());

            std::fs::create_dir_all(local_dir)?;
            for name in &names {
                let local_path = local_dir.join(name);
                info!(remote_file = %name, local_path = %local_path.display(), "Downloading file");
                session.get(name, &local_path)?;
            }

            Ok("Files downloaded successfully".to_string())
        })
    }

    /// Shared connect / run / disconnect / finish wrapper.
    fn tracked<F>(&self, operation: &str, body: F) -> Outcome
    where
        F: FnOnce(&mut dyn Session, &mut ResultRecorder) -> Result<String>,
    {
        let span = info_span!(
            "operation",
            operation,
            host = %self.endpoint.host,
            device = self.context.device_name.as_deref().unwrap_or("-"),
        );
        let _enter = span.enter();

        let mut recorder = ResultRecorder::start(operation);
        self.context.annotate(&mut recorder);

        let connections = ConnectionManager::new(self.connector.clone(), self.clock.clone());
        let mut session = None;
        let outcome = connections
            .connect(
                &self.endpoint,
                self.settings.connect_attempts,
                self.settings.connect_delay,
            )
            .and_then(|opened| {
                let active = session.insert(opened);
                body(active.as_mut(), &mut recorder)
            });
        ConnectionManager::disconnect(&mut session);

        recorder.finish(outcome)
    }
}
