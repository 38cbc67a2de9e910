//! Storage data model
//!
//! The provisioning pipeline is a chain of immutable values:
//!
//! ```text
//! StorageDescriptor  (inventory)
//!     ↓ provision
//! MountAssignment    (stable id resolved, mount point chosen)
//!     ↓ layout
//! LayoutPlan         (engine::layout)
//! ```
//!
//! A descriptor's `action` is fixed when it is constructed. Resolving the
//! stable identifier yields a new descriptor instead of mutating the old one.

use crate::types::{DeviceMode, StorageMode};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// One gibibyte in bytes
pub const GIB: u64 = 1 << 30;

/// Smallest device or free-space amount accepted for cache storage
pub const MIN_CAPACITY_BYTES: u64 = 10 * GIB;

/// Stable identity of a storage location, used for fstab and layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StableId {
    /// Filesystem UUID of a formatted block device
    Uuid(String),
    /// Absolute directory path
    Path(PathBuf),
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uuid(uuid) => write!(f, "UUID={}", uuid),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Provisioning decision made once per descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProvisioningAction {
    /// Wipe signatures and create a fresh XFS filesystem
    Format,
    /// Keep the existing XFS filesystem
    Reuse,
    /// Create the directory (filepath mode)
    CreateDirectory,
    /// Directory already exists (filepath mode)
    UseExisting,
}

impl ProvisioningAction {
    /// Returns true if the action erases data
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Format)
    }
}

impl fmt::Display for ProvisioningAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Format => "format",
            Self::Reuse => "reuse",
            Self::CreateDirectory => "create directory",
            Self::UseExisting => "use existing",
        };
        write!(f, "{}", s)
    }
}

/// A candidate storage location and what will be done with it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageDescriptor {
    identifier: String,
    capacity_bytes: u64,
    mode: StorageMode,
    filesystem_type: Option<String>,
    stable_id: Option<StableId>,
    action: ProvisioningAction,
}

impl StorageDescriptor {
    /// Describe a whole block device.
    ///
    /// `device_mode` fixes the action: `Format` or `Reuse`.
    pub fn raw_device(
        identifier: impl Into<String>,
        capacity_bytes: u64,
        filesystem_type: Option<String>,
        device_mode: DeviceMode,
    ) -> Self {
        let action = match device_mode {
            DeviceMode::Format => ProvisioningAction::Format,
            DeviceMode::Reuse => ProvisioningAction::Reuse,
        };
        Self {
            identifier: identifier.into(),
            capacity_bytes,
            mode: StorageMode::RawDevice,
            filesystem_type: filesystem_type.filter(|fs| !fs.is_empty()),
            stable_id: None,
            action,
        }
    }

    /// Describe a directory. `exists` picks between creating and reusing it.
    pub fn file_path(path: impl Into<PathBuf>, capacity_bytes: u64, exists: bool) -> Self {
        let path = path.into();
        let action = if exists {
            ProvisioningAction::UseExisting
        } else {
            ProvisioningAction::CreateDirectory
        };
        Self {
            identifier: path.display().to_string(),
            capacity_bytes,
            mode: StorageMode::FilePath,
            filesystem_type: None,
            stable_id: None,
            action,
        }
    }

    /// Return a copy of this descriptor with its stable identifier resolved
    #[must_use]
    pub fn with_stable_id(&self, stable_id: StableId) -> Self {
        Self {
            stable_id: Some(stable_id),
            ..self.clone()
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The identifier as a path (device node or directory)
    pub fn path(&self) -> &Path {
        Path::new(&self.identifier)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Capacity in GiB, for display only
    pub fn capacity_gib(&self) -> f64 {
        self.capacity_bytes as f64 / GIB as f64
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn filesystem_type(&self) -> Option<&str> {
        self.filesystem_type.as_deref()
    }

    pub fn stable_id(&self) -> Option<&StableId> {
        self.stable_id.as_ref()
    }

    pub fn action(&self) -> ProvisioningAction {
        self.action
    }

    /// Returns true if the capacity meets the minimum for cache storage
    pub fn meets_minimum_capacity(&self) -> bool {
        self.capacity_bytes >= MIN_CAPACITY_BYTES
    }
}

impl fmt::Display for StorageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:.1} GiB, {}, {})",
            self.identifier,
            self.capacity_gib(),
            self.filesystem_type.as_deref().unwrap_or("no filesystem"),
            self.action
        )
    }
}

/// A provisioned location bound to its mount point
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountAssignment {
    pub descriptor: StorageDescriptor,
    pub mount_point: PathBuf,
    /// The location was already live at its target before this run
    pub already_active: bool,
}

impl fmt::Display for MountAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}{}",
            self.descriptor.identifier(),
            self.mount_point.display(),
            if self.already_active { " (already active)" } else { "" }
        )
    }
}
