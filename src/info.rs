//! System resource parsing (architecture and running version).

use serde::Serialize;
use tracing::{debug, info};

use crate::device::Session;
use crate::error::{Error, Result};

/// Status command whose output carries both fields.
pub const SYSTEM_RESOURCE_COMMAND: &str = "/system resource print";

const ARCHITECTURE_LABEL: &str = "architecture-name:";
const VERSION_LABEL: &str = "version:";

/// Architecture and running version as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub architecture: String,
    pub version: String,
}

/// Extract architecture and version from `/system resource print` output.
///
/// The first occurrence of each label wins. Both fields are required; a
/// missing architecture is never inferred from the version.
pub fn parse_system_resource(output: &str) -> Result<DeviceInfo> {
    let mut architecture = None;
    let mut version = None;

    for line in output.lines().map(str::trim) {
        if architecture.is_none() {
            architecture = field_value(line, ARCHITECTURE_LABEL);
        }
        if version.is_none() {
            version = field_value(line, VERSION_LABEL);
        }
        if architecture.is_some() && version.is_some() {
            break;
        }
    }

    let architecture = architecture.ok_or(Error::MissingField {
        field: "architecture",
        output: "system resource",
    })?;
    let version = version.ok_or(Error::MissingField {
        field: "version",
        output: "system resource",
    })?;

    Ok(DeviceInfo {
        architecture,
        version,
    })
}

fn field_value(line: &str, label: &str) -> Option<String> {
    line.strip_prefix(label)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

/// Issue the status command on an open session and parse the reply.
pub fn read_info(session: &mut dyn Session) -> Result<DeviceInfo> {
    debug!(command = SYSTEM_RESOURCE_COMMAND, "Reading system info");
    let output = session.execute(SYSTEM_RESOURCE_COMMAND)?;
    let info = parse_system_resource(&output)?;

    info!(
        architecture = %info.architecture,
        version = %info.version,
        "Read device system info"
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESOURCE_OUTPUT: &str = "\
                   uptime: 1w2d3h
                  version: 7.13.5 (stable)
               build-time: 2024-02-08 13:51:12
         factory-software: 7.5
              free-memory: 871.3MiB
                      cpu: ARM64
        architecture-name: arm64
               board-name: RB5009UG+S+
                 platform: MikroTik
";

    #[test]
    fn test_parse_system_resource() {
        let info = parse_system_resource(RESOURCE_OUTPUT).unwrap();
        assert_eq!(info.architecture, "arm64");
        assert_eq!(info.version, "7.13.5 (stable)");
    }

    #[test]
    fn test_parse_missing_architecture() {
        let output = "version: 7.13.5 (stable)\nplatform: MikroTik\n";
        let err = parse_system_resource(output).unwrap_err();
        assert!(matches!(
            err,
            Error::MissingField {
                field: "architecture",
                ..
            }
        ));
    }

    #[test]
    fn test_parse_missing_version() {
        let err = parse_system_resource("architecture-name: x86_64\n").unwrap_err();
        assert!(matches!(err, Error::MissingField { field: "version", .. }));
    }

    #[test]
    fn test_parse_first_match_wins() {
        let output = "version: 7.14\nversion: 6.0\narchitecture-name: mipsbe\n";
        let info = parse_system_resource(output).unwrap();
        assert_eq!(info.version, "7.14");
        assert_eq!(info.architecture, "mipsbe");
    }

    #[test]
    fn test_parse_ignores_similar_labels() {
        // factory-software must not be mistaken for the version field
        let output = "factory-software: 6.44\narchitecture-name: arm\n";
        assert!(parse_system_resource(output).is_err());
    }

    #[test]
    fn test_parse_empty_value_is_missing() {
        let output = "version:\narchitecture-name: arm\n";
        assert!(matches!(
            parse_system_resource(output),
            Err(Error::MissingField { field: "version", .. })
        ));
    }
}
