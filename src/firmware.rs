//! Firmware package naming, on-device listing checks and provisioning.
//!
//! Two strategies put the `.npk` package on the device:
//! - download: the device fetches the package from the release repository
//! - upload: the package is pushed from a local mirror over file transfer
//!
//! Both end by re-reading the device file listing and validating the size,
//! which is the only check the reboot step relies on.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::device::Session;
use crate::error::{Error, Result};

/// Official RouterOS package repository.
pub const DEFAULT_REPO_URL: &str = "https://download.mikrotik.com/routeros";

/// Anything smaller is treated as a truncated or corrupted download.
pub const MIN_FIRMWARE_SIZE_MIB: f64 = 10.0;

/// The one architecture whose package name carries no suffix.
pub const X86_64_ARCH: &str = "x86_64";

/// Wait between `/tool fetch` and re-reading the file list.
pub const FETCH_SETTLE_DELAY: Duration = Duration::from_millis(500);

static SIZE_MIB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"size=(\d+(?:\.\d+)?)MiB").expect("valid size regex"));

/// RouterOS release identifiers: `7`, `7.14`, `7.14.1`, `7.15rc2`, `7.16beta4`.
static RELEASE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+(?:\.\d+){0,2}(?:[a-z]+\d*)?$").expect("valid release regex")
});

static ARCH_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]+$").expect("valid arch regex"));

/// How the firmware package reaches the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionMode {
    Download,
    Upload,
}

impl fmt::Display for ProvisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download => write!(f, "download"),
            Self::Upload => write!(f, "upload"),
        }
    }
}

impl FromStr for ProvisionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "download" => Ok(Self::Download),
            "upload" => Ok(Self::Upload),
            _ => Err(format!("Invalid provisioning mode: {s} (expected download or upload)")),
        }
    }
}

/// User-supplied provisioning parameters. `mode` has no default.
#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub mode: Option<ProvisionMode>,
    pub repo_url: String,
    pub source_root: Option<PathBuf>,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            mode: None,
            repo_url: DEFAULT_REPO_URL.to_string(),
            source_root: None,
        }
    }
}

impl ProvisionSettings {
    pub fn download(repo_url: impl Into<String>) -> Self {
        Self {
            mode: Some(ProvisionMode::Download),
            repo_url: repo_url.into(),
            source_root: None,
        }
    }

    pub fn upload(source_root: impl Into<PathBuf>) -> Self {
        Self {
            mode: Some(ProvisionMode::Upload),
            source_root: Some(source_root.into()),
            ..Self::default()
        }
    }

    /// Check the settings before any device interaction.
    pub fn validate(&self) -> Result<ProvisionMode> {
        let mode = self.mode.ok_or_else(|| {
            Error::Configuration(
                "firmware provisioning mode is required (download or upload)".to_string(),
            )
        })?;

        match mode {
            ProvisionMode::Download if self.repo_url.trim().is_empty() => Err(Error::Configuration(
                "repository URL is required for download mode".to_string(),
            )),
            ProvisionMode::Upload if self.source_root.is_none() => Err(Error::Configuration(
                "local firmware source root is required for upload mode".to_string(),
            )),
            _ => Ok(mode),
        }
    }
}

/// Where a package comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareSource {
    Remote(String),
    Local(PathBuf),
}

/// Everything needed to place and check one package.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirmwareDescriptor {
    pub version: String,
    pub architecture: String,
    pub filename: String,
    pub source: FirmwareSource,
    pub min_size_mib: f64,
}

impl FirmwareDescriptor {
    /// Package file name for a (version, architecture) pair.
    pub fn filename_for(version: &str, architecture: &str) -> String {
        if architecture == X86_64_ARCH {
            format!("routeros-{version}.npk")
        } else {
            format!("routeros-{version}-{architecture}.npk")
        }
    }

    pub fn new(version: &str, architecture: &str, settings: &ProvisionSettings) -> Result<Self> {
        validate_release_id(version)?;
        validate_architecture(architecture)?;

        let filename = Self::filename_for(version, architecture);
        let source = match settings.validate()? {
            ProvisionMode::Download => FirmwareSource::Remote(format!(
                "{}/{version}/{filename}",
                settings.repo_url.trim_end_matches('/')
            )),
            ProvisionMode::Upload => {
                let root = settings.source_root.as_deref().unwrap_or_else(|| Path::new("."));
                FirmwareSource::Local(root.join(version).join(&filename))
            }
        };

        Ok(Self {
            version: version.to_string(),
            architecture: architecture.to_string(),
            filename,
            source,
            min_size_mib: MIN_FIRMWARE_SIZE_MIB,
        })
    }
}

/// Reject identifiers that could make two (version, architecture) pairs
/// produce the same file name.
pub fn validate_release_id(version: &str) -> Result<()> {
    if RELEASE_ID.is_match(version) {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "invalid firmware version '{version}' (expected e.g. 7.14, 7.14.1 or 7.15rc2)"
        )))
    }
}

fn validate_architecture(architecture: &str) -> Result<()> {
    if ARCH_ID.is_match(architecture) {
        Ok(())
    } else {
        Err(Error::Firmware(format!(
            "unsupported architecture name '{architecture}'"
        )))
    }
}

/// Listing command filtered by file name.
pub fn listing_command(filename: &str) -> String {
    format!("/file print detail where name~\"{filename}\"")
}

/// Find the listing line whose `name=` field ends with `filename`.
pub fn find_listing_line<'a>(listing: &'a str, filename: &str) -> Option<&'a str> {
    let pattern = format!(r"\bname=[^\s]*{}\b", regex::escape(filename));
    let name = Regex::new(&pattern).ok()?;
    listing.lines().find(|line| name.is_match(line))
}

/// Parse the `size=<n>MiB` field from a listing line.
pub fn parse_size_mib(line: &str) -> Option<f64> {
    SIZE_MIB
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Check a listing for the package and return its size in MiB.
pub fn verify_listing(listing: &str, descriptor: &FirmwareDescriptor) -> Result<f64> {
    let filename = &descriptor.filename;
    let line = find_listing_line(listing, filename)
        .ok_or_else(|| Error::Firmware(format!("firmware '{filename}' not found on device")))?;

    let size = parse_size_mib(line)
        .ok_or_else(|| Error::Firmware(format!("firmware '{filename}' size missing or invalid")))?;

    if size < descriptor.min_size_mib {
        return Err(Error::Firmware(format!(
            "firmware '{filename}' too small ({size}MiB), invalid or corrupted"
        )));
    }

    Ok(size)
}

/// Outcome of a successful provisioning run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisionReport {
    pub descriptor: FirmwareDescriptor,
    pub size_mib: f64,
    /// False when the package was already on the device.
    pub transferred: bool,
    pub warnings: Vec<String>,
}

/// Places the firmware package on the device.
pub struct FirmwareProvisioner {
    settings: ProvisionSettings,
    clock: Arc<dyn Clock>,
}

impl FirmwareProvisioner {
    pub fn new(settings: ProvisionSettings, clock: Arc<dyn Clock>) -> Self {
        Self { settings, clock }
    }

    pub const fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    /// Make sure `routeros-<version>[-<arch>].npk` is on the device and large
    /// enough to be a real package.
    pub fn provision(
        &self,
        session: &mut dyn Session,
        version: &str,
        architecture: &str,
    ) -> Result<ProvisionReport> {
        let descriptor = FirmwareDescriptor::new(version, architecture, &self.settings)?;
        info!(
            filename = %descriptor.filename,
            source = ?descriptor.source,
            "Provisioning firmware"
        );

        let mut warnings = Vec::new();
        let transferred = match &descriptor.source {
            FirmwareSource::Remote(url) => self.download(session, &descriptor, url, &mut warnings)?,
            FirmwareSource::Local(path) => {
                Self::upload(session, &descriptor, path)?;
                true
            }
        };

        let listing = session.execute(&listing_command(&descriptor.filename))?;
        let size_mib = verify_listing(&listing, &descriptor)?;
        info!(filename = %descriptor.filename, size_mib, "Firmware size OK");

        Ok(ProvisionReport {
            descriptor,
            size_mib,
            transferred,
            warnings,
        })
    }

    /// Device-side fetch. Returns whether a fetch was issued.
    fn download(
        &self,
        session: &mut dyn Session,
        descriptor: &FirmwareDescriptor,
        url: &str,
        warnings: &mut Vec<String>,
    ) -> Result<bool> {
        let existing = session.execute(&listing_command(&descriptor.filename))?;
        if find_listing_line(&existing, &descriptor.filename).is_some() {
            info!(filename = %descriptor.filename, "Firmware already on device, skipping fetch");
            return Ok(false);
        }

        info!(url = %url, "Firmware not found on device, fetching");
        let output = session.execute(&format!("/tool fetch url=\"{url}\""))?;
        let lowered = output.to_lowercase();

        if lowered.contains("failure") || lowered.contains("error") {
            return Err(Error::Firmware(format!(
                "firmware download failed: {}",
                output.trim()
            )));
        }

        // A missing "finished" marker is tolerated: the listing check below is
        // authoritative, though a stale package from an earlier run would also
        // pass it.
        if !lowered.contains("finished") {
            let message = format!(
                "fetch of '{}' did not explicitly report 'finished'",
                descriptor.filename
            );
            warn!(filename = %descriptor.filename, "Fetch did not explicitly report 'finished'");
            warnings.push(message);
        }

        self.clock.sleep(FETCH_SETTLE_DELAY);
        Ok(true)
    }

    fn upload(
        session: &mut dyn Session,
        descriptor: &FirmwareDescriptor,
        path: &Path,
    ) -> Result<()> {
        if !path.is_file() {
            return Err(Error::Firmware(format!(
                "local firmware file not found: {}",
                path.display()
            )));
        }

        info!(
            local_path = %path.display(),
            remote_name = %descriptor.filename,
            "Uploading firmware to device"
        );
        session.put(path, &descriptor.filename)
    }
}
