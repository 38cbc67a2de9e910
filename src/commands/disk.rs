//! Typed invocations of block-device and filesystem tools.
//!
//! | Struct | Command | Mutating |
//! |--------|---------|----------|
//! | `ListBlockDevices` | `lsblk -J -b -o PATH,SIZE,FSTYPE,MOUNTPOINT,MODEL,TYPE [dev]` | no |
//! | `ReadFsUuid` | `blkid -s UUID -o value <dev>` | no |
//! | `WipeSignatures` | `wipefs -a <dev>` | yes |
//! | `MakeXfs` | `mkfs.xfs -f <dev>` | yes |
//! | `MountFstabEntry` | `mount <mp>` | yes |
//! | `MountDevice` | `mount <dev> <mp>` | yes |
//! | `Unmount` | `umount <target>` | yes |
//! | `ChownRecursive` | `chown -R <owner> <path>` | yes |
//! | `FindMountSource` | `findmnt -n -o SOURCE <mp>` | no |
//! | `ListFileContexts` | `semanage fcontext -l -C` | no |
//! | `LabelVarnishStorage` | `semanage fcontext -a\|-m -t varnishd_var_lib_t <path>(/.*)?` | yes |
//! | `RestoreContext` | `restorecon -R <path>` | yes |

use std::path::PathBuf;

use crate::command_traits::HostCommand;

/// Columns requested from lsblk. `-b` makes SIZE a byte count.
pub const LSBLK_COLUMNS: &str = "PATH,SIZE,FSTYPE,MOUNTPOINT,MODEL,TYPE";

/// List block devices as JSON, optionally restricted to one device
#[derive(Debug, Clone, Default)]
pub struct ListBlockDevices {
    pub device: Option<PathBuf>,
}

impl HostCommand for ListBlockDevices {
    fn program(&self) -> &'static str {
        "lsblk"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "-J".to_string(),
            "-b".to_string(),
            "-o".to_string(),
            LSBLK_COLUMNS.to_string(),
        ];
        if let Some(device) = &self.device {
            args.push(device.display().to_string());
        }
        args
    }

    fn is_mutating(&self) -> bool {
        false
    }
}

/// Read the filesystem UUID of a device
#[derive(Debug, Clone)]
pub struct ReadFsUuid {
    pub device: PathBuf,
}

impl HostCommand for ReadFsUuid {
    fn program(&self) -> &'static str {
        "blkid"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-s".to_string(),
            "UUID".to_string(),
            "-o".to_string(),
            "value".to_string(),
            self.device.display().to_string(),
        ]
    }

    fn is_mutating(&self) -> bool {
        false
    }
}

/// Remove all filesystem and partition-table signatures
#[derive(Debug, Clone)]
pub struct WipeSignatures {
    pub device: PathBuf,
}

impl HostCommand for WipeSignatures {
    fn program(&self) -> &'static str {
        "wipefs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["-a".to_string(), self.device.display().to_string()]
    }

    fn is_mutating(&self) -> bool {
        true
    }
}

/// Create an XFS filesystem, overwriting whatever is there
#[derive(Debug, Clone)]
pub struct MakeXfs {
    pub device: PathBuf,
}

impl HostCommand for MakeXfs {
    fn program(&self) -> &'static str {
        "mkfs.xfs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["-f".to_string(), self.device.display().to_string()]
    }

    fn is_mutating(&self) -> bool {
        true
    }
}

/// Mount a mount point using its fstab entry
#[derive(Debug, Clone)]
pub struct MountFstabEntry {
    pub mount_point: PathBuf,
}

impl HostCommand for MountFstabEntry {
    fn program(&self) -> &'static str {
        "mount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.mount_point.display().to_string()]
    }

    fn is_mutating(&self) -> bool {
        true
    }
}

/// Mount a device at an explicit mount point
#[derive(Debug, Clone)]
pub struct MountDevice {
    pub device: PathBuf,
    pub mount_point: PathBuf,
}

impl HostCommand for MountDevice {
    fn program(&self) -> &'static str {
        "mount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            self.device.display().to_string(),
            self.mount_point.display().to_string(),
        ]
    }

    fn is_mutating(&self) -> bool {
        true
    }
}

/// Unmount a device or mount point
#[derive(Debug, Clone)]
pub struct Unmount {
    pub target: PathBuf,
}

impl HostCommand for Unmount {
    fn program(&self) -> &'static str {
        "umount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.target.display().to_string()]
    }

    fn is_mutating(&self) -> bool {
        true
    }
}

/// Recursively change ownership
#[derive(Debug, Clone)]
pub struct ChownRecursive {
    pub path: PathBuf,
    /// `user:group`
    pub owner: String,
}

impl HostCommand for ChownRecursive {
    fn program(&self) -> &'static str {
        "chown"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-R".to_string(),
            self.owner.clone(),
            self.path.display().to_string(),
        ]
    }

    fn is_mutating(&self) -> bool {
        true
    }
}

/// Print the source device mounted at a mount point (empty output, exit 1 when nothing is)
#[derive(Debug, Clone)]
pub struct FindMountSource {
    pub mount_point: PathBuf,
}

impl HostCommand for FindMountSource {
    fn program(&self) -> &'static str {
        "findmnt"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-n".to_string(),
            "-o".to_string(),
            "SOURCE".to_string(),
            self.mount_point.display().to_string(),
        ]
    }

    fn is_mutating(&self) -> bool {
        false
    }
}

/// List locally added SELinux file context rules
#[derive(Debug, Clone, Default)]
pub struct ListFileContexts;

impl HostCommand for ListFileContexts {
    fn program(&self) -> &'static str {
        "semanage"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["fcontext".to_string(), "-l".to_string(), "-C".to_string()]
    }

    fn is_mutating(&self) -> bool {
        false
    }
}

/// SELinux file context pattern covering a storage directory and its contents
pub fn varnish_context_pattern(path: &std::path::Path) -> String {
    format!("{}(/.*)?", path.display())
}

/// Register an SELinux file context so varnishd may use the storage.
///
/// `modify` rewrites an existing rule (`-m`) instead of adding one (`-a`),
/// which semanage rejects once the rule is defined.
#[derive(Debug, Clone)]
pub struct LabelVarnishStorage {
    pub path: PathBuf,
    pub modify: bool,
}

impl HostCommand for LabelVarnishStorage {
    fn program(&self) -> &'static str {
        "semanage"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "fcontext".to_string(),
            if self.modify { "-m" } else { "-a" }.to_string(),
            "-t".to_string(),
            "varnishd_var_lib_t".to_string(),
            varnish_context_pattern(&self.path),
        ]
    }

    fn is_mutating(&self) -> bool {
        true
    }
}

/// Apply SELinux contexts recursively
#[derive(Debug, Clone)]
pub struct RestoreContext {
    pub path: PathBuf,
}

impl HostCommand for RestoreContext {
    fn program(&self) -> &'static str {
        "restorecon"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["-R".to_string(), self.path.display().to_string()]
    }

    fn is_mutating(&self) -> bool {
        true
    }
}
