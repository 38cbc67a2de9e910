//! Device inventory
//!
//! Enumerates candidate storage and filters out anything unsuitable:
//!
//! | Check | Excluded when |
//! |-------|---------------|
//! | Type | lsblk `type` is not `disk` |
//! | Partitions | any child partition (or deeper) is mounted |
//! | Size | capacity below 10 GiB |
//! | Mount | the whole disk is mounted outside the managed root |
//!
//! Disks mounted at their managed target (`/cache/diskN`) stay in the list so
//! a re-run can adopt them. When devices are named explicitly, a disk mounted
//! under the managed root must sit at the slot its position in the list maps
//! to. Per-device query failures exclude that device without aborting the pass.
//!
//! Filepath storage is resolved without shelling out: `statvfs` on the path,
//! or on its nearest existing ancestor if it does not exist yet. Space already
//! held by a previous run's book and store files counts as available, so a
//! re-run sizes the layout the same way.

use crate::command_runner::CommandRunner;
use crate::commands::disk::ListBlockDevices;
use crate::engine::layout::{BOOK_FILE, STORE_FILE};
use crate::provision::mount_point_for;
use crate::storage::{MIN_CAPACITY_BYTES, StorageDescriptor};
use crate::types::DeviceMode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// lsblk JSON
// ============================================================================

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

/// lsblk reports SIZE as a number with `-b` on recent util-linux, as a string on older ones
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum SizeField {
    Bytes(u64),
    Text(String),
}

/// One node of the lsblk device tree
#[derive(Debug, Clone, Deserialize)]
pub struct LsblkDevice {
    pub path: Option<String>,
    #[serde(default)]
    size: Option<SizeField>,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
    pub model: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    pub fn size_bytes(&self) -> Option<u64> {
        match &self.size {
            Some(SizeField::Bytes(n)) => Some(*n),
            Some(SizeField::Text(s)) => s.trim().parse().ok(),
            None => None,
        }
    }

    /// Mount points of every descendant, depth first
    pub fn mounted_descendants(&self) -> Vec<String> {
        let mut found = Vec::new();
        for child in &self.children {
            if let Some(mp) = child.mountpoint.as_deref().filter(|m| !m.is_empty()) {
                found.push(format!("{} on {}", child.path.as_deref().unwrap_or("?"), mp));
            }
            found.extend(child.mounted_descendants());
        }
        found
    }
}

/// Parse `lsblk -J` output into the top-level device list
pub fn parse_lsblk(json: &str) -> Result<Vec<LsblkDevice>> {
    let output: LsblkOutput = serde_json::from_str(json).context("Failed to parse lsblk JSON")?;
    Ok(output.blockdevices)
}

// ============================================================================
// Discovery results
// ============================================================================

/// Why a candidate was left out
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExclusionReason {
    NotADisk { kind: String },
    MountedPartitions(Vec<String>),
    TooSmall { capacity_bytes: u64 },
    ForeignMount { mount_point: PathBuf },
    /// Mounted under the managed root, but at another device's slot
    WrongSlot { mount_point: PathBuf, expected: PathBuf },
    UnknownSize,
    QueryFailed(String),
    NotAbsolute,
    NotADirectory,
    NoExistingAncestor,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotADisk { kind } => write!(f, "not a whole disk (type {})", kind),
            Self::MountedPartitions(parts) => write!(f, "has mounted partitions: {}", parts.join(", ")),
            Self::TooSmall { capacity_bytes } => write!(
                f,
                "too small ({:.1} GiB, minimum 10 GiB)",
                *capacity_bytes as f64 / (1u64 << 30) as f64
            ),
            Self::ForeignMount { mount_point } => {
                write!(f, "mounted at {} outside the managed root", mount_point.display())
            }
            Self::WrongSlot { mount_point, expected } => write!(
                f,
                "mounted at {} but its position in DEVICES maps to {}",
                mount_point.display(),
                expected.display()
            ),
            Self::UnknownSize => write!(f, "size could not be determined"),
            Self::QueryFailed(msg) => write!(f, "query failed: {}", msg),
            Self::NotAbsolute => write!(f, "path must be absolute"),
            Self::NotADirectory => write!(f, "exists but is not a directory"),
            Self::NoExistingAncestor => write!(f, "no existing parent directory"),
        }
    }
}

/// A candidate that did not qualify
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exclusion {
    pub identifier: String,
    pub reason: ExclusionReason,
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.identifier, self.reason)
    }
}

/// Outcome of one discovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub candidates: Vec<StorageDescriptor>,
    pub excluded: Vec<Exclusion>,
}

impl DiscoveryReport {
    fn exclude(&mut self, identifier: impl Into<String>, reason: ExclusionReason) {
        let exclusion = Exclusion {
            identifier: identifier.into(),
            reason,
        };
        info!("Excluding {}", exclusion);
        self.excluded.push(exclusion);
    }
}

// ============================================================================
// Raw devices
// ============================================================================

/// Decide whether one lsblk disk qualifies as cache storage
pub fn classify_device(
    device: &LsblkDevice,
    managed_root: &Path,
    device_mode: DeviceMode,
) -> std::result::Result<StorageDescriptor, ExclusionReason> {
    if device.kind != "disk" {
        return Err(ExclusionReason::NotADisk {
            kind: device.kind.clone(),
        });
    }

    let mounted = device.mounted_descendants();
    if !mounted.is_empty() {
        return Err(ExclusionReason::MountedPartitions(mounted));
    }

    let capacity_bytes = device.size_bytes().ok_or(ExclusionReason::UnknownSize)?;
    if capacity_bytes < MIN_CAPACITY_BYTES {
        return Err(ExclusionReason::TooSmall { capacity_bytes });
    }

    if let Some(mp) = device.mountpoint.as_deref().filter(|m| !m.is_empty()) {
        let mp = Path::new(mp);
        if !mp.starts_with(managed_root) {
            return Err(ExclusionReason::ForeignMount {
                mount_point: mp.to_path_buf(),
            });
        }
    }

    let identifier = device
        .path
        .clone()
        .ok_or_else(|| ExclusionReason::QueryFailed("lsblk reported no device path".to_string()))?;
    Ok(StorageDescriptor::raw_device(
        identifier,
        capacity_bytes,
        device.fstype.clone(),
        device_mode,
    ))
}

/// Enumerate every suitable whole disk on the host
pub fn discover_raw(
    runner: &dyn CommandRunner,
    managed_root: &Path,
    device_mode: DeviceMode,
) -> Result<DiscoveryReport> {
    let output = runner.run(&ListBlockDevices::default())?;
    output.ensure_success("lsblk")?;

    let mut report = DiscoveryReport::default();
    for device in parse_lsblk(&output.stdout)? {
        let name = device.path.clone().unwrap_or_else(|| "<unnamed>".to_string());
        match classify_device(&device, managed_root, device_mode) {
            Ok(descriptor) => {
                debug!("Candidate {}", descriptor);
                report.candidates.push(descriptor);
            }
            // Loop and ROM devices are noise, not exclusions worth reporting
            Err(ExclusionReason::NotADisk { .. }) => debug!("Skipping non-disk {}", name),
            Err(reason) => report.exclude(name, reason),
        }
    }

    info!(
        "Discovered {} candidate device(s), {} excluded",
        report.candidates.len(),
        report.excluded.len()
    );
    Ok(report)
}

/// Query explicitly named devices one by one, in the given order.
///
/// The `i`-th device owns `<managed_root>/disk<i+1>`; a managed mount anywhere
/// else is excluded as [`ExclusionReason::WrongSlot`].
pub fn probe_devices(
    runner: &dyn CommandRunner,
    devices: &[String],
    managed_root: &Path,
    device_mode: DeviceMode,
) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();

    for (index, name) in devices.iter().enumerate() {
        match probe_one(runner, name) {
            Ok(device) => match classify_device(&device, managed_root, device_mode) {
                Ok(descriptor) => {
                    let expected = mount_point_for(managed_root, index);
                    match device.mountpoint.as_deref().filter(|m| !m.is_empty()).map(Path::new) {
                        Some(mp) if mp != expected => report.exclude(
                            name.clone(),
                            ExclusionReason::WrongSlot {
                                mount_point: mp.to_path_buf(),
                                expected,
                            },
                        ),
                        _ => report.candidates.push(descriptor),
                    }
                }
                Err(reason) => report.exclude(name.clone(), reason),
            },
            Err(e) => {
                warn!("Could not query {}: {:#}", name, e);
                report.exclude(name.clone(), ExclusionReason::QueryFailed(format!("{:#}", e)));
            }
        }
    }

    report
}

fn probe_one(runner: &dyn CommandRunner, name: &str) -> Result<LsblkDevice> {
    let output = runner.run(&ListBlockDevices {
        device: Some(PathBuf::from(name)),
    })?;
    output.ensure_success(&format!("lsblk {}", name))?;
    parse_lsblk(&output.stdout)?
        .into_iter()
        .next()
        .with_context(|| format!("lsblk returned no entry for {}", name))
}

// ============================================================================
// Filepath storage
// ============================================================================

/// Bytes available to unprivileged writers on the filesystem holding `path`
pub fn available_bytes(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)
        .with_context(|| format!("statvfs failed for {}", path.display()))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Bytes allocated to MSE4 book and store files already inside `dir`
pub fn reclaimable_bytes(dir: &Path) -> u64 {
    [BOOK_FILE, STORE_FILE]
        .iter()
        .filter_map(|name| std::fs::metadata(dir.join(name)).ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.blocks() * 512)
        .sum()
}

/// The path itself if it exists, otherwise its closest existing ancestor
pub fn nearest_existing(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| p.exists())
}

/// Resolve one filepath entry into a descriptor
pub fn resolve_path(path: &Path) -> std::result::Result<StorageDescriptor, ExclusionReason> {
    if !path.is_absolute() {
        return Err(ExclusionReason::NotAbsolute);
    }

    let exists = path.exists();
    if exists && !path.is_dir() {
        return Err(ExclusionReason::NotADirectory);
    }

    let probe = nearest_existing(path).ok_or(ExclusionReason::NoExistingAncestor)?;
    let mut capacity_bytes =
        available_bytes(probe).map_err(|e| ExclusionReason::QueryFailed(format!("{:#}", e)))?;
    if exists {
        let held = reclaimable_bytes(path);
        if held > 0 {
            debug!("{} already holds {} bytes of MSE4 files", path.display(), held);
            capacity_bytes += held;
        }
    }

    if capacity_bytes < MIN_CAPACITY_BYTES {
        return Err(ExclusionReason::TooSmall { capacity_bytes });
    }

    Ok(StorageDescriptor::file_path(path, capacity_bytes, exists))
}

/// Resolve every filepath entry, in order
pub fn resolve_paths(paths: &[String]) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();
    for raw in paths {
        match resolve_path(Path::new(raw)) {
            Ok(descriptor) => report.candidates.push(descriptor),
            Err(reason) => report.exclude(raw.clone(), reason),
        }
    }
    report
}
