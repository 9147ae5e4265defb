//! Firmware upgrade workflow.
//!
//! `Start -> Connected -> VersionChecked -> {Skipped | Provisioned -> Rebooted
//! -> Reconnected -> Verified} -> Done`
//!
//! Each stage hands its values to the next explicitly; nothing is cached
//! between runs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, info_span, warn};

use crate::clock::Clock;
use crate::connection::ConnectionManager;
use crate::device::{Connector, DeviceEndpoint, Session};
use crate::error::{Error, Result};
use crate::firmware::{FirmwareProvisioner, ProvisionSettings, validate_release_id};
use crate::info::read_info;
use crate::operations::ExecutionContext;
use crate::reboot::{RebootCoordinator, RebootSettings};
use crate::result::{OperationFailure, OperationResult, ResultRecorder};
use crate::version;

/// Retry and timeout configuration shared by all operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeSettings {
    pub connect_attempts: u32,
    pub connect_delay: Duration,
    pub reboot: RebootSettings,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 2,
            connect_delay: Duration::from_secs(2),
            reboot: RebootSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStage {
    Start,
    Connected,
    VersionChecked,
    Skipped,
    Provisioned,
    Rebooted,
    Reconnected,
    Verified,
    Done,
}

impl UpgradeStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Connected => "connected",
            Self::VersionChecked => "version_checked",
            Self::Skipped => "skipped",
            Self::Provisioned => "provisioned",
            Self::Rebooted => "rebooted",
            Self::Reconnected => "reconnected",
            Self::Verified => "verified",
            Self::Done => "done",
        }
    }
}

/// Runs one upgrade against one device.
pub struct UpgradeOrchestrator {
    connections: ConnectionManager,
    clock: Arc<dyn Clock>,
    endpoint: DeviceEndpoint,
    target_version: String,
    provisioning: ProvisionSettings,
    settings: UpgradeSettings,
    context: ExecutionContext,
}

impl UpgradeOrchestrator {
    pub fn new(
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
        endpoint: DeviceEndpoint,
        target_version: impl Into<String>,
        provisioning: ProvisionSettings,
    ) -> Self {
        Self {
            connections: ConnectionManager::new(connector, clock.clone()),
            clock,
            endpoint,
            target_version: target_version.into(),
            provisioning,
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

    /// Run the full workflow.
    ///
    /// Whatever happens, the record is finished once and any held session is
    /// closed once. On failure the error is recorded in the result's error
    /// list and returned inside [`OperationFailure`].
    pub fn run(&self) -> std::result::Result<OperationResult, OperationFailure> {
        let span = info_span!(
            "upgrade",
            host = %self.endpoint.host,
            target_version = %self.target_version,
            device = self.context.device_name.as_deref().unwrap_or("-"),
        );
        let _enter = span.enter();

        let mut recorder = ResultRecorder::start("upgrade");
        recorder.set("target_version", self.target_version.clone());
        self.context.annotate(&mut recorder);

        let mut session: Option<Box<dyn Session>> = None;
        let mut stage = UpgradeStage::Start;
        let outcome = self.execute(&mut recorder, &mut session, &mut stage);
        ConnectionManager::disconnect(&mut session);

        if let Err(e) = &outcome {
            warn!(stage = stage.as_str(), error = %e, "Upgrade failed");
            recorder.set("failed_stage", stage.as_str());
        }
        recorder.finish(outcome)
    }

    fn advance(stage: &mut UpgradeStage, next: UpgradeStage) {
        debug!(from = stage.as_str(), to = next.as_str(), "Upgrade stage transition");
        *stage = next;
    }

    fn execute(
        &self,
        recorder: &mut ResultRecorder,
        session: &mut Option<Box<dyn Session>>,
        stage: &mut UpgradeStage,
    ) -> Result<String> {
        // Configuration problems surface before touching the device
        validate_release_id(&self.target_version)?;
        self.provisioning.validate()?;

        let active = session.insert(self.connections.connect(
            &self.endpoint,
            self.settings.connect_attempts,
            self.settings.connect_delay,
        )?);
        Self::advance(stage, UpgradeStage::Connected);

        let current = read_info(active.as_mut())?;
        recorder.set("current_version", current.version.clone());
        recorder.set("arch", current.architecture.clone());
        Self::advance(stage, UpgradeStage::VersionChecked);

        if !version::is_newer(&current.version, &self.target_version)? {
            let message = format!(
                "Skipping upgrade: current version {} is >= target {}",
                current.version, self.target_version
            );
            info!(current_version = %current.version, "{message}");
            recorder.set("skipped", true);
            Self::advance(stage, UpgradeStage::Skipped);
            Self::advance(stage, UpgradeStage::Done);
            return Ok(message);
        }

        info!(
            current_version = %current.version,
            architecture = %current.architecture,
            "Upgrade required"
        );

        let provisioner = FirmwareProvisioner::new(self.provisioning.clone(), self.clock.clone());
        let report =
            provisioner.provision(active.as_mut(), &self.target_version, &current.architecture)?;
        for warning in &report.warnings {
            recorder.warn(warning.clone());
        }
        recorder.set("firmware_file", report.descriptor.filename.clone());
        recorder.set("firmware_size_mib", report.size_mib);
        Self::advance(stage, UpgradeStage::Provisioned);

        let mut coordinator = RebootCoordinator::new(
            self.connections.clone(),
            self.clock.clone(),
            self.settings.reboot,
        );
        let handle = session
            .take()
            .ok_or_else(|| Error::Connection("no active session before reboot".to_string()))?;
        let request = coordinator.reboot(handle);
        if !request.prompt_detected {
            recorder.warn("reboot confirmation prompt not detected, confirmation sent anyway");
        }
        Self::advance(stage, UpgradeStage::Rebooted);

        let reconnected = coordinator.wait_for_reconnect(&self.endpoint, request.requested_at)?;
        let active = session.insert(reconnected);
        Self::advance(stage, UpgradeStage::Reconnected);

        let after = read_info(active.as_mut())?;
        recorder.set("final_version", after.version.clone());

        if !version::same_version(&after.version, &self.target_version)? {
            return Err(Error::VersionMismatch {
                expected: self.target_version.clone(),
                actual: after.version,
            });
        }
        Self::advance(stage, UpgradeStage::Verified);

        let message = format!("Upgrade completed successfully: {}", after.version);
        info!(final_version = %after.version, "Upgrade completed successfully");
        Self::advance(stage, UpgradeStage::Done);
        Ok(message)
    }
}
