//! RouterOS version parsing and comparison.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::{Error, Result};

/// First dotted numeric run: `7`, `7.14`, `7.14.1`.
static VERSION_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+){0,2}").expect("valid version regex"));

/// Ordered (major, minor, patch) triple.
///
/// Field order gives the derived `Ord` lexicographic semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct VersionTuple {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl VersionTuple {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub const fn as_tuple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }
}

impl fmt::Display for VersionTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Normalize a free-text version string such as `7.14.1 (stable)`.
///
/// Anything around the first numeric run is ignored; missing minor or patch
/// components default to zero.
pub fn normalize(text: &str) -> Result<VersionTuple> {
    let run = VERSION_RUN.find(text).ok_or_else(|| {
        Error::InvalidVersion(format!("cannot extract numeric version from '{}'", text.trim()))
    })?;

    let mut parts = [0u32; 3];
    for (slot, part) in parts.iter_mut().zip(run.as_str().split('.')) {
        *slot = part.parse().map_err(|_| {
            Error::InvalidVersion(format!("component '{part}' out of range in '{}'", text.trim()))
        })?;
    }

    Ok(VersionTuple::new(parts[0], parts[1], parts[2]))
}

/// Returns true if `candidate` is strictly newer than `current`.
pub fn is_newer(current: &str, candidate: &str) -> Result<bool> {
    Ok(normalize(candidate)? > normalize(current)?)
}

/// Returns true if both strings normalize to the same triple.
pub fn same_version(a: &str, b: &str) -> Result<bool> {
    Ok(normalize(a)? == normalize(b)?)
}
