//! Reboot trigger and reconnect polling.
//!
//! `Connected -> RebootRequested -> Disconnected -> Polling -> {Online | TimedOut}`
//!
//! RouterOS asks `Reboot, yes? [y/N]:` on the interactive CLI. The prompt is
//! detected heuristically from the raw reply: the reboot command's own output
//! is checked first, then an empty probe, and if neither shows the prompt a
//! blind `y` is sent anyway.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::connection::ConnectionManager;
use crate::device::{DeviceEndpoint, Session};
use crate::error::{Error, Result};
use crate::info::SYSTEM_RESOURCE_COMMAND;

pub const REBOOT_COMMAND: &str = "/system reboot";

const CONFIRM_PROMPT_MARKER: &str = "[y/n";

/// Timing knobs for the reboot and reconnect phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebootSettings {
    /// Give up if the device is not back within this bound.
    pub reconnect_timeout: Duration,
    /// Sleep between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Wall-clock cadence of the "still waiting" log line.
    pub heartbeat_interval: Duration,
    /// Pause after a fresh login before probing the CLI.
    pub settle_delay: Duration,
    /// Read bound for the readiness probe.
    pub probe_timeout: Duration,
    /// Read bound for each step of the confirmation exchange.
    pub prompt_timeout: Duration,
    /// Pause before the second prompt probe.
    pub prompt_grace: Duration,
}

impl Default for RebootSettings {
    fn default() -> Self {
        Self {
            reconnect_timeout: Duration::from_secs(300),
            reconnect_delay: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(60),
            settle_delay: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(10),
            prompt_timeout: Duration::from_secs(2),
            prompt_grace: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootState {
    Connected,
    RebootRequested,
    Disconnected,
    Polling,
    Online,
    TimedOut,
}

/// What happened when the reboot was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebootRequest {
    pub requested_at: Instant,
    /// False when `y` was sent without ever seeing the confirmation prompt.
    pub prompt_detected: bool,
}

/// Drives one reboot cycle and hands back the fresh session.
pub struct RebootCoordinator {
    connections: ConnectionManager,
    clock: Arc<dyn Clock>,
    settings: RebootSettings,
    state: RebootState,
}

impl RebootCoordinator {
    pub fn new(
        connections: ConnectionManager,
        clock: Arc<dyn Clock>,
        settings: RebootSettings,
    ) -> Self {
        Self {
            connections,
            clock,
            settings,
            state: RebootState::Connected,
        }
    }

    pub const fn state(&self) -> RebootState {
        self.state
    }

    fn transition(&mut self, next: RebootState) {
        debug!(from = ?self.state, to = ?next, "Reboot state transition");
        self.state = next;
    }

    /// Ask the device to reboot and drop the session.
    ///
    /// The session is always closed afterwards, whatever the device replied:
    /// the device tearing the channel down is the real signal.
    pub fn reboot(&mut self, session: Box<dyn Session>) -> RebootRequest {
        let mut session = Some(session);
        let requested_at = self.clock.now();
        self.transition(RebootState::RebootRequested);
        info!("Rebooting device");

        let prompt_detected = match session.as_deref_mut() {
            Some(active) => match self.confirm_reboot(active) {
                Ok(detected) => detected,
                Err(e) => {
                    debug!(error = %e, "Session dropped during reboot confirmation");
                    false
                }
            },
            None => false,
        };

        ConnectionManager::disconnect(&mut session);
        self.transition(RebootState::Disconnected);

        RebootRequest {
            requested_at,
            prompt_detected,
        }
    }

    fn confirm_reboot(&self, session: &mut dyn Session) -> Result<bool> {
        let timeout = self.settings.prompt_timeout;

        let reply = session.execute_timed(REBOOT_COMMAND, timeout)?;
        if has_confirm_prompt(&reply) {
            session.execute_timed("y", timeout)?;
            return Ok(true);
        }

        // The prompt can arrive after the first read window closes
        self.clock.sleep(self.settings.prompt_grace);
        let reply = session.execute_timed("", timeout)?;
        if has_confirm_prompt(&reply) {
            session.execute_timed("y", timeout)?;
            return Ok(true);
        }

        warn!("Reboot prompt not detected, sending 'y' anyway");
        session.execute_timed("y", timeout)?;
        Ok(false)
    }

    /// Poll until the device accepts a login and its CLI answers.
    ///
    /// Every failure inside an iteration counts as "not ready yet"; only the
    /// reconnect timeout ends the loop with an error.
    pub fn wait_for_reconnect(
        &mut self,
        endpoint: &DeviceEndpoint,
        requested_at: Instant,
    ) -> Result<Box<dyn Session>> {
        self.transition(RebootState::Polling);
        info!(host = %endpoint.host, "Waiting for device to reconnect");

        let mut heartbeat = Heartbeat::new(self.settings.heartbeat_interval, self.clock.now());
        let mut attempts = 0u32;

        loop {
            let elapsed = self.clock.now().saturating_duration_since(requested_at);
            if elapsed > self.settings.reconnect_timeout {
                self.transition(RebootState::TimedOut);
                return Err(Error::Timeout {
                    operation: "device reconnect".to_string(),
                    details: format!(
                        "device did not reconnect within {} seconds",
                        self.settings.reconnect_timeout.as_secs()
                    ),
                });
            }

            attempts += 1;
            let mut candidate = None;
            match self.try_reconnect(endpoint, &mut candidate) {
                Ok(true) => {
                    if let Some(session) = candidate.take() {
                        self.transition(RebootState::Online);
                        info!(
                            host = %endpoint.host,
                            attempts,
                            elapsed_seconds = elapsed.as_secs(),
                            "Device fully online (SSH + CLI ready)"
                        );
                        return Ok(session);
                    }
                }
                Ok(false) => debug!(attempts, "Device CLI not ready yet"),
                Err(e) => debug!(attempts, error = %e, "Reconnect attempt failed"),
            }
            ConnectionManager::disconnect(&mut candidate);

            let now = self.clock.now();
            if heartbeat.due(now) {
                info!(
                    host = %endpoint.host,
                    elapsed_seconds = now.saturating_duration_since(requested_at).as_secs(),
                    attempts,
                    "Still waiting for device to reconnect"
                );
            }

            self.clock.sleep(self.settings.reconnect_delay);
        }
    }

    /// One bare attempt: open, settle, probe. The opened session is left in
    /// `slot` so the caller decides whether to keep or close it.
    fn try_reconnect(
        &self,
        endpoint: &DeviceEndpoint,
        slot: &mut Option<Box<dyn Session>>,
    ) -> Result<bool> {
        let session = slot.insert(self.connections.open_once(endpoint)?);
        self.clock.sleep(self.settings.settle_delay);

        let reply = session.execute_timed(SYSTEM_RESOURCE_COMMAND, self.settings.probe_timeout)?;
        Ok(reply.to_lowercase().contains("version"))
    }
}

/// Wall-clock gate for the "still waiting" line, independent of how many
/// attempts fit into one interval.
#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    interval: Duration,
    last: Instant,
}

impl Heartbeat {
    const fn new(interval: Duration, now: Instant) -> Self {
        Self { interval, last: now }
    }

    fn due(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

fn has_confirm_prompt(reply: &str) -> bool {
    reply.to_lowercase().contains(CONFIRM_PROMPT_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_confirm_prompt() {
        assert!(has_confirm_prompt("Reboot, yes? [y/N]:"));
        assert!(has_confirm_prompt("reboot, yes? [Y/n]"));
        assert!(!has_confirm_prompt("[admin@MikroTik] >"));
    }

    #[test]
    fn test_heartbeat_follows_wall_clock() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(Duration::from_secs(60), start);

        // Five minutes of polls every 10 s
        let beats = (0..=30u64)
            .filter(|&i| heartbeat.due(start + Duration::from_secs(i * 10)))
            .count();
        assert_eq!(beats, 5);

        // Slow attempts still get at most one line per interval
        let mut heartbeat = Heartbeat::new(Duration::from_secs(60), start);
        assert!(!heartbeat.due(start + Duration::from_secs(59)));
        assert!(heartbeat.due(start + Duration::from_secs(130)));
        assert!(!heartbeat.due(start + Duration::from_secs(150)));
        assert!(heartbeat.due(start + Duration::from_secs(190)));
    }

    #[test]
    fn test_default_settings() {
        let s = RebootSettings::default();
        assert_eq!(s.reconnect_timeout, Duration::from_secs(300));
        assert_eq!(s.reconnect_delay, Duration::from_secs(10));
        assert_eq!(s.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(s.probe_timeout, Duration::from_secs(10));
    }
}
