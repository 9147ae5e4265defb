//! Interactive RouterOS CLI over a spawned `ssh -tt` child.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{classify_login_failure, clean_output, ends_with_prompt, scp_command, scp_target};
use crate::device::{DeviceEndpoint, Session, SessionTimeouts};
use crate::error::{Error, Result};

/// Granularity of child liveness checks while waiting for output.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Timed reads stop once the reply has gone quiet for this long.
const QUIET_WINDOW: Duration = Duration::from_millis(500);

const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Why a read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    Prompt,
    Quiet,
    Deadline,
    Closed,
}

/// One logged-in CLI session.
pub struct OpenSshSession {
    child: Child,
    stdin: Option<ChildStdin>,
    output: Receiver<Vec<u8>>,
    stderr: Arc<Mutex<String>>,
    stderr_reader: Option<JoinHandle<()>>,
    scp_program: PathBuf,
    endpoint: DeviceEndpoint,
    timeouts: SessionTimeouts,
}

impl OpenSshSession {
    /// Spawn `ssh` and wait for the first CLI prompt.
    pub(super) fn spawn(
        mut ssh: Command,
        scp_program: PathBuf,
        endpoint: &DeviceEndpoint,
    ) -> Result<Self> {
        debug!(endpoint = %endpoint, "Spawning ssh");
        let mut child = ssh
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Connection(format!("failed to start ssh: {e}")))?;

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr_pipe) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Connection("ssh stdio pipes unavailable".to_string()));
            }
        };

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("ssh-stdout".to_string())
            .spawn(move || pump(stdout, |chunk| tx.send(chunk.to_vec()).is_ok()))?;

        let stderr = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&stderr);
        let stderr_reader = thread::Builder::new()
            .name("ssh-stderr".to_string())
            .spawn(move || {
                pump(stderr_pipe, |chunk| {
                    if let Ok(mut buffer) = sink.lock() {
                        buffer.push_str(&String::from_utf8_lossy(chunk));
                    }
                    true
                });
            })?;

        let mut session = Self {
            child,
            stdin: Some(stdin),
            output: rx,
            stderr,
            stderr_reader: Some(stderr_reader),
            scp_program,
            endpoint: endpoint.clone(),
            timeouts: endpoint.timeouts,
        };

        let deadline = Instant::now() + session.timeouts.connect;
        let (_, end) = session.read(deadline, None);
        match end {
            ReadEnd::Prompt => Ok(session),
            ReadEnd::Deadline => {
                session.terminate();
                Err(Error::ConnectTimeout(format!(
                    "no CLI prompt from {} within {} seconds",
                    session.endpoint,
                    session.timeouts.connect.as_secs()
                )))
            }
            ReadEnd::Closed | ReadEnd::Quiet => {
                session.terminate();
                Err(classify_login_failure(&session.stderr_text(), &session.endpoint))
            }
        }
    }

    /// Collect output until the prompt or the deadline. With `quiet`, also
    /// stop once the reply to that command (anything past its echo) has
    /// started and then gone silent for the window.
    fn read(&mut self, deadline: Instant, quiet: Option<(&str, Duration)>) -> (String, ReadEnd) {
        let mut raw = Vec::new();
        let mut text = String::new();
        let mut last_reply: Option<Instant> = None;

        loop {
            if ends_with_prompt(&text) {
                return (text, ReadEnd::Prompt);
            }

            let now = Instant::now();
            if now >= deadline {
                return (text, ReadEnd::Deadline);
            }
            if let (Some((_, window)), Some(at)) = (quiet, last_reply) {
                if now.duration_since(at) >= window {
                    return (text, ReadEnd::Quiet);
                }
            }

            let wait = deadline.saturating_duration_since(now).min(POLL_INTERVAL);
            match self.output.recv_timeout(wait) {
                Ok(chunk) => {
                    raw.extend_from_slice(&chunk);
                    // Decode the whole buffer so characters split across chunks survive
                    text = String::from_utf8_lossy(&raw).into_owned();
                    if let Some((command, _)) = quiet {
                        if !clean_output(&text, command).trim().is_empty() {
                            last_reply = Some(Instant::now());
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if matches!(self.child.try_wait(), Ok(Some(_))) && raw.is_empty() {
                        return (text, ReadEnd::Closed);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return (text, ReadEnd::Closed),
            }
        }
    }

    /// Discard anything left over from the previous command.
    fn drain(&mut self) {
        while self.output.try_recv().is_ok() {}
    }

    fn send(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Connection("session input already closed".to_string()))?;
        stdin
            .write_all(format!("{line}\r\n").as_bytes())
            .and_then(|()| stdin.flush())
            .map_err(|e| Error::Connection(format!("failed to write to session: {e}")))
    }

    fn stderr_text(&mut self) -> String {
        if let Some(reader) = self.stderr_reader.take() {
            let _ = reader.join();
        }
        self.stderr.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn terminate(&mut self) {
        self.stdin.take();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn run_scp(&self, source: &str, destination: &str, what: &str) -> Result<()> {
        debug!(source = %source, destination = %destination, "Running scp");
        let output = scp_command(&self.scp_program, &self.endpoint)?
            .arg(source)
            .arg(destination)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::Transfer(format!("failed to start scp: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Transfer(format!(
                "{what} failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl Session for OpenSshSession {
    fn execute(&mut self, command: &str) -> Result<String> {
        self.drain();
        self.send(command)?;

        let deadline = Instant::now() + self.timeouts.command;
        match self.read(deadline, None) {
            (raw, ReadEnd::Prompt) => Ok(clean_output(&raw, command)),
            (_, ReadEnd::Deadline) => Err(Error::Timeout {
                operation: format!("command '{command}'"),
                details: format!("no prompt within {} seconds", self.timeouts.command.as_secs()),
            }),
            (_, ReadEnd::Closed | ReadEnd::Quiet) => {
                Err(Error::Connection(format!("session to {} closed by device", self.endpoint)))
            }
        }
    }

    fn execute_timed(&mut self, command: &str, read_timeout: Duration) -> Result<String> {
        self.drain();
        self.send(command)?;

        let (raw, end) = self.read(Instant::now() + read_timeout, Some((command, QUIET_WINDOW)));
        debug!(command = %command, end = ?end, bytes = raw.len(), "Timed read finished");
        Ok(clean_output(&raw, command))
    }

    fn get(&mut self, remote_name: &str, local_path: &Path) -> Result<()> {
        let source = scp_target(&self.endpoint, remote_name);
        let destination = local_path.display().to_string();
        self.run_scp(&source, &destination, "download")
    }

    fn put(&mut self, local_path: &Path, remote_name: &str) -> Result<()> {
        let source = local_path.display().to_string();
        let destination = scp_target(&self.endpoint, remote_name);
        self.run_scp(&source, &destination, "upload")
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        if let Err(e) = self.send("/quit") {
            debug!(error = %e, "Session already closed");
        }
        self.stdin.take();

        let deadline = Instant::now() + CLOSE_GRACE;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }

        warn!(endpoint = %self.endpoint, "ssh did not exit after /quit, killing");
        self.terminate();
        Ok(())
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.terminate();
        }
    }
}

/// Copy a pipe into `sink` until EOF, a read error, or `sink` returning false.
fn pump<R: Read>(mut reader: R, mut sink: impl FnMut(&[u8]) -> bool) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if !sink(&chunk[..n]) {
                    break;
                }
            }
        }
    }
}
