//! OpenSSH-backed device transport.
//!
//! Sessions run the system `ssh` client with a forced remote TTY and talk to
//! the RouterOS CLI over its stdin/stdout. File transfer uses `scp`.
//! Passwords and key passphrases reach the child through `SSH_ASKPASS`,
//! answered by this binary (see [`askpass_reply`]).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;
use secrecy::ExposeSecret;

use crate::device::{Connector, Credentials, DeviceEndpoint, Session};
use crate::error::{Error, Result};

mod openssh;

pub use openssh::OpenSshSession;

/// Environment variable carrying the secret to an askpass invocation.
pub const ASKPASS_SECRET_ENV: &str = "MTUP_ASKPASS_SECRET";

/// RouterOS login flags: no colors, no terminal detection, wide lines.
const LOGIN_FLAGS: &str = "+ct200w";

/// `[admin@MikroTik] > ` at the end of the buffer.
static PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[[^\]\r\n]+@[^\]\r\n]+\]\s*>\s*$").expect("valid prompt regex")
});

static PROMPT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\[[^\]\r\n]+@[^\]\r\n]+\]\s*>\s*$").expect("valid prompt regex")
});

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b[=>]").expect("valid ansi regex"));

/// When invoked by `ssh` as the askpass helper, the secret to print.
/// Only answers when `SSH_ASKPASS` names this executable.
pub fn askpass_reply() -> Option<String> {
    let current = std::env::current_exe().ok()?;
    askpass_secret(
        std::env::var(ASKPASS_SECRET_ENV).ok(),
        std::env::var_os("SSH_ASKPASS"),
        &current,
    )
}

fn askpass_secret(
    secret: Option<String>,
    helper: Option<OsString>,
    current_exe: &Path,
) -> Option<String> {
    let helper = helper?;
    if Path::new(&helper) == current_exe {
        secret
    } else {
        None
    }
}

/// Opens sessions by spawning the system OpenSSH client.
#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    ssh_program: PathBuf,
    scp_program: PathBuf,
}

impl Default for OpenSshConnector {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            scp_program: PathBuf::from("scp"),
        }
    }
}

impl OpenSshConnector {
    pub fn new(ssh_program: impl Into<PathBuf>, scp_program: impl Into<PathBuf>) -> Self {
        Self {
            ssh_program: ssh_program.into(),
            scp_program: scp_program.into(),
        }
    }
}

impl Connector for OpenSshConnector {
    fn open(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn Session>> {
        let mut ssh = Command::new(&self.ssh_program);
        ssh.arg("-tt").arg("-p").arg(endpoint.port.to_string());
        ssh.args(common_options(endpoint));
        ssh.arg(format!("{}{LOGIN_FLAGS}@{}", endpoint.username, endpoint.host));
        apply_askpass(&mut ssh, endpoint)?;

        let session = OpenSshSession::spawn(ssh, self.scp_program.clone(), endpoint)?;
        Ok(Box::new(session))
    }
}

/// Base `scp` invocation for one transfer; source and destination are
/// appended by the caller.
fn scp_command(program: &Path, endpoint: &DeviceEndpoint) -> Result<Command> {
    let mut scp = Command::new(program);
    scp.arg("-q").arg("-P").arg(endpoint.port.to_string());
    scp.args(common_options(endpoint));
    apply_askpass(&mut scp, endpoint)?;
    Ok(scp)
}

/// Options shared by `ssh` and `scp`.
fn common_options(endpoint: &DeviceEndpoint) -> Vec<String> {
    let mut options = vec![
        "-o".to_string(),
        format!("ConnectTimeout={}", endpoint.timeouts.connect.as_secs().max(1)),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=15".to_string(),
        "-o".to_string(),
        "ServerAliveCountMax=3".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
    ];

    match &endpoint.credentials {
        Credentials::Password(_) => {
            options.extend([
                "-o".to_string(),
                "PreferredAuthentications=password,keyboard-interactive".to_string(),
                "-o".to_string(),
                "PubkeyAuthentication=no".to_string(),
                "-o".to_string(),
                "NumberOfPasswordPrompts=1".to_string(),
            ]);
        }
        Credentials::Key { path, passphrase } => {
            options.extend([
                "-i".to_string(),
                path.display().to_string(),
                "-o".to_string(),
                "IdentitiesOnly=yes".to_string(),
            ]);
            if passphrase.is_none() {
                options.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
            }
        }
    }

    options
}

/// Route password or passphrase prompts back to this executable.
fn apply_askpass(command: &mut Command, endpoint: &DeviceEndpoint) -> Result<()> {
    let secret = match &endpoint.credentials {
        Credentials::Password(password) => Some(password),
        Credentials::Key { passphrase, .. } => passphrase.as_ref(),
    };

    if let Some(secret) = secret {
        command
            .env("SSH_ASKPASS", std::env::current_exe()?)
            .env("SSH_ASKPASS_REQUIRE", "force")
            .env(ASKPASS_SECRET_ENV, secret.expose_secret());
    }
    Ok(())
}

/// `user@host:path`, bracketing IPv6 literals.
pub fn scp_target(endpoint: &DeviceEndpoint, remote: &str) -> String {
    if endpoint.host.contains(':') {
        format!("{}@[{}]:{remote}", endpoint.username, endpoint.host)
    } else {
        format!("{}@{}:{remote}", endpoint.username, endpoint.host)
    }
}

/// Map `ssh` stderr from a failed login to the error taxonomy.
pub fn classify_login_failure(stderr: &str, endpoint: &DeviceEndpoint) -> Error {
    let lowered = stderr.to_lowercase();
    let details = stderr.trim().to_string();

    if lowered.contains("permission denied")
        || lowered.contains("authentication failed")
        || lowered.contains("too many authentication failures")
    {
        Error::Authentication(endpoint.to_string())
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        Error::ConnectTimeout(if details.is_empty() { endpoint.to_string() } else { details })
    } else if details.is_empty() {
        Error::Connection(format!("ssh to {endpoint} exited before the CLI prompt"))
    } else {
        Error::Connection(details)
    }
}

pub(crate) fn strip_ansi(raw: &str) -> String {
    ANSI_ESCAPE.replace_all(raw, "").replace('\r', "")
}

pub(crate) fn ends_with_prompt(buffer: &str) -> bool {
    PROMPT.is_match(&strip_ansi(buffer))
}

/// Drop the echoed command and the trailing prompt from raw CLI output.
pub(crate) fn clean_output(raw: &str, command: &str) -> String {
    let text = strip_ansi(raw);
    let mut lines: Vec<&str> = text.lines().collect();

    while lines.last().is_some_and(|l| l.trim().is_empty() || PROMPT_LINE.is_match(l)) {
        lines.pop();
    }

    let command = command.trim();
    if !command.is_empty() {
        if let Some(echo) = lines.iter().position(|l| l.trim_end().ends_with(command)) {
            lines.drain(..=echo);
        }
    }

    while lines.first().is_some_and(|l| l.trim().is_empty()) {
        lines.remove(0);
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn endpoint(host: &str) -> DeviceEndpoint {
        DeviceEndpoint::new(host, "admin", Credentials::Password(SecretString::from("pw")))
    }

    #[test]
    fn test_ends_with_prompt() {
        assert!(ends_with_prompt("\r\n[admin@MikroTik] > "));
        assert!(ends_with_prompt("\x1b[9999B[admin@core-01] >"));
        assert!(!ends_with_prompt("Reboot, yes? [y/N]:"));
    }

    #[test]
    fn test_clean_output() {
        let raw = "[admin@MikroTik] > /system resource print\r\n    version: 7.12 (stable)\r\n\
                   \x20 architecture-name: arm64\r\n\r\n[admin@MikroTik] > ";
        assert_eq!(
            clean_output(raw, "/system resource print"),
            "    version: 7.12 (stable)\n  architecture-name: arm64"
        );
    }

    #[test]
    fn test_clean_output_keeps_confirmation_prompt() {
        let raw = "[admin@MikroTik] > /system reboot\r\nReboot, yes? [y/N]: ";
        assert_eq!(clean_output(raw, "/system reboot"), "Reboot, yes? [y/N]: ");
    }

    #[test]
    fn test_scp_target() {
        assert_eq!(
            scp_target(&endpoint("10.0.0.1"), "backup.backup"),
            "admin@10.0.0.1:backup.backup"
        );
        assert_eq!(scp_target(&endpoint("fe80::1"), "a.npk"), "admin@[fe80::1]:a.npk");
    }

    #[test]
    fn test_classify_login_failure() {
        let ep = endpoint("10.0.0.1");
        assert!(matches!(
            classify_login_failure("admin@10.0.0.1: Permission denied (password).", &ep),
            Error::Authentication(_)
        ));
        let timed_out = "ssh: connect to host 10.0.0.1 port 22: Connection timed out";
        assert!(matches!(classify_login_failure(timed_out, &ep), Error::ConnectTimeout(_)));
        let refused = "ssh: connect to host 10.0.0.1 port 22: Connection refused";
        assert!(matches!(classify_login_failure(refused, &ep), Error::Connection(_)));
        assert!(matches!(classify_login_failure("", &ep), Error::Connection(_)));
    }

    #[test]
    fn test_askpass_secret_requires_helper_to_be_this_binary() {
        let exe = Path::new("/usr/local/bin/mtup");
        let secret = || Some("s3cret".to_string());

        assert_eq!(
            askpass_secret(secret(), Some(OsString::from("/usr/local/bin/mtup")), exe),
            Some("s3cret".to_string())
        );
        // Secret left over in the shell without ssh driving us
        assert_eq!(askpass_secret(secret(), None, exe), None);
        assert_eq!(
            askpass_secret(secret(), Some(OsString::from("/usr/lib/ssh/ssh-askpass")), exe),
            None
        );
        assert_eq!(
            askpass_secret(None, Some(OsString::from("/usr/local/bin/mtup")), exe),
            None
        );
    }

    #[test]
    fn test_key_without_passphrase_uses_batch_mode() {
        let ep = DeviceEndpoint::new(
            "10.0.0.1",
            "admin",
            Credentials::Key {
                path: PathBuf::from("/home/ops/.ssh/id_ed25519"),
                passphrase: None,
            },
        );
        let options = common_options(&ep);
        assert!(options.contains(&"BatchMode=yes".to_string()));
        assert!(options.contains(&"/home/ops/.ssh/id_ed25519".to_string()));

        let options = common_options(&endpoint("10.0.0.1"));
        assert!(!options.contains(&"BatchMode=yes".to_string()));
        assert!(options.contains(&"ConnectTimeout=15".to_string()));
    }
}
