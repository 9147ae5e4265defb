//! Simulated RouterOS device, scripted connector and manual clock.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use secrecy::SecretString;

use mtup::{Clock, Connector, Credentials, DeviceEndpoint, Error, Result, Session};

/// Clock that only moves when something sleeps on it.
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        })
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        *self.offset.lock().unwrap() += duration;
        self.sleeps.lock().unwrap().push(duration);
    }
}

/// What the device does on the next connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Open {
    Accept,
    Timeout,
    Refuse,
    RejectAuth,
}

/// Device-side state shared by the connector and every session it opens.
#[derive(Debug)]
pub struct DeviceState {
    pub version: String,
    pub architecture: String,
    /// Version reported after a confirmed reboot.
    pub version_after_reboot: Option<String>,
    /// File name to size in MiB.
    pub files: BTreeMap<String, f64>,
    pub fetch_reply: String,
    pub fetch_size_mib: f64,
    /// Fetch reports success but nothing lands on the device.
    pub fetch_drops_file: bool,
    pub upload_size_mib: f64,
    pub reboot_prompt: bool,
    /// Readiness probes that come back empty before the CLI answers.
    pub probe_failures: u32,

    reboot_pending: bool,
    pub reboots: u32,
    pub fetches: u32,
    pub opens: u32,
    pub closes: u32,
    pub commands: Vec<String>,
    pub puts: Vec<(PathBuf, String)>,
    pub gets: Vec<(String, PathBuf)>,
}

impl DeviceState {
    pub fn new(version: &str, architecture: &str) -> Self {
        Self {
            version: version.to_string(),
            architecture: architecture.to_string(),
            version_after_reboot: None,
            files: BTreeMap::new(),
            fetch_reply: "  status: finished\n  downloaded: 12800KiB".to_string(),
            fetch_size_mib: 12.5,
            fetch_drops_file: false,
            upload_size_mib: 12.5,
            reboot_prompt: true,
            probe_failures: 0,
            reboot_pending: false,
            reboots: 0,
            fetches: 0,
            opens: 0,
            closes: 0,
            commands: Vec::new(),
            puts: Vec::new(),
            gets: Vec::new(),
        }
    }

    fn resource_output(&self) -> String {
        [
            "                   uptime: 3d4h12m".to_string(),
            format!("                  version: {} (stable)", self.version),
            "               build-time: 2024-02-29 12:44:04".to_string(),
            format!("        architecture-name: {}", self.architecture),
            "               board-name: RB5009UG+S+".to_string(),
            String::new(),
        ]
        .join("\n")
    }

    fn listing(&self, filter: &str) -> String {
        self.files
            .iter()
            .filter(|(name, _)| name.contains(filter))
            .enumerate()
            .map(|(i, (name, size))| {
                format!(
                    " {i} name=\"{name}\" type=\"package\" size={size}MiB \
                     creation-time=2024-03-01 10:00:00"
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Connector whose attempts follow a script, then repeat a fallback.
pub struct MockConnector {
    device: Arc<Mutex<DeviceState>>,
    script: Mutex<VecDeque<Open>>,
    fallback: Open,
    attempts: Mutex<u32>,
}

impl MockConnector {
    pub fn new(device: Arc<Mutex<DeviceState>>) -> Arc<Self> {
        Self::scripted(device, [], Open::Accept)
    }

    pub fn scripted(
        device: Arc<Mutex<DeviceState>>,
        script: impl IntoIterator<Item = Open>,
        fallback: Open,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            attempts: Mutex::new(0),
        })
    }

    pub fn attempts(&self) -> u32 {
        *self.attempts.lock().unwrap()
    }
}

impl Connector for MockConnector {
    fn open(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn Session>> {
        *self.attempts.lock().unwrap() += 1;
        let behavior = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);

        match behavior {
            Open::Accept => {
                self.device.lock().unwrap().opens += 1;
                Ok(Box::new(MockSession {
                    device: Arc::clone(&self.device),
                }))
            }
            Open::Timeout => Err(Error::ConnectTimeout(endpoint.to_string())),
            Open::Refuse => Err(Error::Connection("Connection refused".to_string())),
            Open::RejectAuth => Err(Error::Authentication(endpoint.to_string())),
        }
    }
}

pub struct MockSession {
    device: Arc<Mutex<DeviceState>>,
}

impl MockSession {
    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.device.lock().unwrap()
    }
}

fn quoted(command: &str) -> String {
    command.split('"').nth(1).unwrap_or_default().to_string()
}

impl Session for MockSession {
    fn execute(&mut self, command: &str) -> Result<String> {
        let mut state = self.state();
        state.commands.push(command.to_string());

        if command == "/system resource print" {
            return Ok(state.resource_output());
        }
        if command.starts_with("/file print detail where name~") {
            return Ok(state.listing(&quoted(command)));
        }
        if command.starts_with("/tool fetch url=") {
            state.fetches += 1;
            let url = quoted(command);
            let name = url.rsplit('/').next().unwrap_or_default().to_string();
            let reply = state.fetch_reply.clone();
            let lowered = reply.to_lowercase();
            let failed = lowered.contains("failure") || lowered.contains("error");
            if !failed && !state.fetch_drops_file {
                let size = state.fetch_size_mib;
                state.files.insert(name, size);
            }
            return Ok(reply);
        }
        if let Some(name) = command.strip_prefix("/system backup save name=") {
            state.files.insert(format!("{name}.backup"), 0.1);
            return Ok("Configuration backup saved".to_string());
        }
        if command == "/system identity print" {
            return Ok("  name: edge-01".to_string());
        }
        Ok(String::new())
    }

    fn execute_timed(&mut self, command: &str, _read_timeout: Duration) -> Result<String> {
        let mut state = self.state();
        state.commands.push(command.to_string());

        match command {
            "/system reboot" => {
                state.reboot_pending = true;
                Ok(if state.reboot_prompt {
                    "Reboot, yes? [y/N]:".to_string()
                } else {
                    String::new()
                })
            }
            "y" if state.reboot_pending => {
                state.reboot_pending = false;
                state.reboots += 1;
                if let Some(version) = state.version_after_reboot.take() {
                    state.version = version;
                }
                Ok("system will reboot shortly".to_string())
            }
            "/system resource print" => {
                if state.probe_failures > 0 {
                    state.probe_failures -= 1;
                    Ok(String::new())
                } else {
                    Ok(state.resource_output())
                }
            }
            _ => Ok(String::new()),
        }
    }

    fn get(&mut self, remote_name: &str, local_path: &Path) -> Result<()> {
        let mut state = self.state();
        if !state.files.contains_key(remote_name) {
            return Err(Error::Transfer(format!("{remote_name}: no such file")));
        }
        state.gets.push((remote_name.to_string(), local_path.to_path_buf()));
        std::fs::write(local_path, format!("contents of {remote_name}"))?;
        Ok(())
    }

    fn put(&mut self, local_path: &Path, remote_name: &str) -> Result<()> {
        let mut state = self.state();
        if !local_path.is_file() {
            return Err(Error::Transfer(format!("{}: no such file", local_path.display())));
        }
        state.puts.push((local_path.to_path_buf(), remote_name.to_string()));
        let size = state.upload_size_mib;
        let name = remote_name.rsplit('/').next().unwrap_or(remote_name).to_string();
        state.files.insert(name, size);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.state().closes += 1;
        Ok(())
    }
}

pub fn device(version: &str, architecture: &str) -> Arc<Mutex<DeviceState>> {
    Arc::new(Mutex::new(DeviceState::new(version, architecture)))
}

pub fn endpoint() -> DeviceEndpoint {
    DeviceEndpoint::new(
        "192.0.2.10",
        "admin",
        Credentials::Password(SecretString::from("changeme")),
    )
}
