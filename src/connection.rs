//! Session establishment with bounded retry, and best-effort teardown.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::device::{Connector, DeviceEndpoint, Session};
use crate::error::{Error, Result};

/// Opens and closes device sessions.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, clock: Arc<dyn Clock>) -> Self {
        Self { connector, clock }
    }

    /// Open a session, retrying timeouts and unexpected errors.
    ///
    /// Sleeps `delay` between attempts but not after the last one. An
    /// authentication failure aborts immediately.
    pub fn connect(
        &self,
        endpoint: &DeviceEndpoint,
        max_attempts: u32,
        delay: Duration,
    ) -> Result<Box<dyn Session>> {
        if max_attempts == 0 {
            return Err(Error::Configuration(
                "connect attempts must be at least 1".to_string(),
            ));
        }

        for attempt in 1..=max_attempts {
            info!(
                endpoint = %endpoint,
                attempt,
                max_attempts,
                "Connecting to device"
            );

            match self.connector.open(endpoint) {
                Ok(session) => {
                    info!(endpoint = %endpoint, attempt, "Connected successfully");
                    return Ok(session);
                }
                Err(Error::ConnectTimeout(details)) => {
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        details = %details,
                        "Connection timeout, device may be offline"
                    );
                }
                Err(Error::Authentication(details)) => {
                    error!(endpoint = %endpoint, details = %details, "Authentication failed");
                    return Err(Error::Authentication(details));
                }
                Err(e) => {
                    error!(
                        endpoint = %endpoint,
                        attempt,
                        error = %e,
                        "Unexpected connection error"
                    );
                }
            }

            if attempt < max_attempts {
                info!(delay_seconds = delay.as_secs_f64(), "Retrying connection");
                self.clock.sleep(delay);
            }
        }

        Err(Error::ConnectionExhausted {
            endpoint: endpoint.to_string(),
            attempts: max_attempts,
        })
    }

    /// Single bare attempt, used by reconnect polling which owns its own loop.
    pub fn open_once(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn Session>> {
        self.connector.open(endpoint)
    }

    /// Close the held session, if any, and clear the handle.
    ///
    /// Close-time errors are logged and swallowed.
    pub fn disconnect(session: &mut Option<Box<dyn Session>>) {
        if let Some(session) = session.take() {
            match session.close() {
                Ok(()) => debug!("Session closed"),
                Err(e) => debug!(error = %e, "Ignoring error while closing session"),
            }
        }
    }
}
