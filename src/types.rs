//! Type-safe deployment mode enums
//!
//! These replace the stringly-typed `.env` values (`DEPLOYMENT_MODE=hybrid`,
//! `STORAGE_MODE=raw_disk`, ...) with enums that parse case-insensitively and
//! round-trip through `Display`.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// How the cache service itself is run on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum DeploymentMode {
    /// Native varnishd under systemd, monitoring optionally in containers
    #[default]
    #[strum(serialize = "hybrid")]
    #[serde(rename = "hybrid")]
    Hybrid,
    /// Everything in containers, wrapped by a compose unit
    #[strum(serialize = "docker")]
    #[serde(rename = "docker")]
    Docker,
}

/// Kind of backing storage handed to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum StorageMode {
    /// Whole block devices, formatted or reused as XFS
    #[default]
    #[strum(serialize = "raw_disk")]
    #[serde(rename = "raw_disk")]
    RawDevice,
    /// Directories on an existing filesystem
    #[strum(serialize = "filepath")]
    #[serde(rename = "filepath")]
    FilePath,
}

/// What to do with raw devices that are selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum DeviceMode {
    /// Wipe and create a fresh XFS filesystem (destructive)
    #[default]
    #[strum(serialize = "format")]
    #[serde(rename = "format")]
    Format,
    /// Keep the existing XFS filesystem and its data
    #[strum(serialize = "reuse")]
    #[serde(rename = "reuse")]
    Reuse,
}

impl DeviceMode {
    /// Returns true if this mode erases data
    pub fn is_destructive(self) -> bool {
        matches!(self, Self::Format)
    }
}
