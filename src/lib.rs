//! mtup - MikroTik RouterOS firmware upgrade orchestrator.
//!
//! Drives a single RouterOS device through a firmware upgrade over its
//! interactive CLI: connect with bounded retry, read the running version,
//! provision the firmware package (device-side fetch or local push), reboot,
//! wait for the device to come back and verify the final version. Every
//! operation produces a timestamped [`OperationResult`].

pub mod clock;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod firmware;
pub mod info;
pub mod logging;
pub mod operations;
pub mod reboot;
pub mod result;
pub mod transport;
pub mod upgrade;
pub mod version;

pub use clock::{Clock, SystemClock};
pub use connection::ConnectionManager;
pub use device::{Connector, Credentials, DeviceEndpoint, Session, SessionTimeouts};
pub use error::{Error, ErrorKind, Result};
pub use firmware::{FirmwareDescriptor, FirmwareProvisioner, ProvisionMode, ProvisionSettings};
pub use info::DeviceInfo;
pub use operations::{DeviceClient, ExecutionContext};
pub use reboot::{RebootCoordinator, RebootSettings};
pub use result::{OperationFailure, OperationResult, ResultRecorder};
pub use upgrade::{UpgradeOrchestrator, UpgradeSettings};
pub use version::VersionTuple;
