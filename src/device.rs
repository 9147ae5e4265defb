//! Device endpoint description and the session collaborator contract.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::error::Result;

/// Credential material for the device login.
#[derive(Debug, Clone)]
pub enum Credentials {
    Password(SecretString),
    Key {
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
}

/// Session-level timeouts handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Upper bound for establishing the session (TCP + auth + first prompt).
    pub connect: Duration,
    /// Upper bound for a prompt-terminated command.
    pub command: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            command: Duration::from_secs(60),
        }
    }
}

/// Where and how to log in. Never mutated once an operation starts.
#[derive(Debug, Clone)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
    pub timeouts: SessionTimeouts,
}

impl DeviceEndpoint {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            credentials,
            timeouts: SessionTimeouts::default(),
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// An open interactive command channel to the device.
///
/// A session is consumed by [`Session::close`], so a closed handle cannot be
/// used again.
pub trait Session: Send {
    /// Run a command and return its output once the CLI prompt reappears.
    fn execute(&mut self, command: &str) -> Result<String>;

    /// Run a command and collect its reply without requiring a prompt. The
    /// read ends at the prompt, at `read_timeout`, or once the reply has gone
    /// quiet.
    fn execute_timed(&mut self, command: &str, read_timeout: Duration) -> Result<String>;

    /// Copy a file from the device to `local_path`.
    fn get(&mut self, remote_name: &str, local_path: &Path) -> Result<()>;

    /// Copy `local_path` to the device as `remote_name`.
    fn put(&mut self, local_path: &Path, remote_name: &str) -> Result<()>;

    /// Close the underlying channel.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Opens sessions. A single call is one bare attempt with no internal retry.
///
/// Implementations report `Error::ConnectTimeout` for timeouts,
/// `Error::Authentication` for rejected credentials and `Error::Connection`
/// for everything else.
pub trait Connector: Send + Sync {
    fn open(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn Session>>;
}
