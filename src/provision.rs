//! Storage provisioning
//!
//! Turns selected [`StorageDescriptor`]s into [`MountAssignment`]s. For raw
//! devices the live mount state is re-read from lsblk and combined with the
//! descriptor's action in one explicit decision table:
//!
//! | state \ action | Format | Reuse |
//! |----------------|--------|-------|
//! | Unmounted | wipe, mkfs.xfs, read UUID, mount | verify xfs, read UUID, mount |
//! | AtTarget | verify xfs, read UUID, adopt | verify xfs, read UUID, adopt |
//! | Foreign | refuse | refuse |
//!
//! "Adopt" skips formatting and mounting entirely and marks the assignment
//! `already_active`, which is what makes re-runs safe.
//!
//! Provisioning is fail-fast: the first failing device stops the run and
//! nothing already done is rolled back.

use crate::command_runner::{CommandOutput, CommandRunner};
use crate::commands::disk::{
    ChownRecursive, FindMountSource, LabelVarnishStorage, ListBlockDevices, ListFileContexts, MakeXfs,
    MountDevice, MountFstabEntry, ReadFsUuid, RestoreContext, Unmount, WipeSignatures,
    varnish_context_pattern,
};
use crate::commands::service::{Systemctl, SystemctlAction};
use crate::command_traits::HostCommand;
use crate::fstab::{FstabEntry, FstabFile};
use crate::inventory::parse_lsblk;
use crate::process_guard::CancelToken;
use crate::storage::{MountAssignment, ProvisioningAction, StableId, StorageDescriptor};
use crate::types::{DeploymentMode, StorageMode};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Owner applied to cache storage in hybrid deployments
pub const VARNISH_OWNER: &str = "varnish:varnish";

/// Errors that stop provisioning
#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Formatting {} requires explicit confirmation (set AUTO_CONFIRM=true)", .devices.join(", "))]
    DestructiveNotConfirmed { devices: Vec<String> },

    #[error("Mount point {} is assigned more than once", .0.display())]
    DuplicateMountPoint(PathBuf),

    #[error("{device} is mounted at {}, expected {} (unmount it or set UNMOUNT_FOREIGN=true)", .mounted_at.display(), .expected.display())]
    ForeignMount {
        device: String,
        mounted_at: PathBuf,
        expected: PathBuf,
    },

    #[error("{} is already in use by {occupant}; refusing to mount {device} over it", .mount_point.display())]
    TargetOccupied {
        device: String,
        mount_point: PathBuf,
        occupant: String,
    },

    #[error("{device} has filesystem {}, reuse requires xfs", .found.as_deref().unwrap_or("none"))]
    UnexpectedFilesystem { device: String, found: Option<String> },

    #[error("{step} failed for {target}: {detail}")]
    CommandFailed {
        step: String,
        target: String,
        detail: String,
    },

    #[error("No filesystem UUID found on {0}")]
    MissingUuid(String),

    #[error("Could not mount {device} at {}: {detail}", .mount_point.display())]
    MountFailed {
        device: String,
        mount_point: PathBuf,
        detail: String,
    },

    #[error("Could not unmount {device} from {}: {detail}", .mounted_at.display())]
    UnmountFailed {
        device: String,
        mounted_at: PathBuf,
        detail: String,
    },

    #[error("fstab update failed: {0}")]
    Fstab(String),

    #[error("{}: {detail}", .path.display())]
    Io { path: PathBuf, detail: String },

    #[error("{} exists but is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("{identifier} cannot be provisioned with action '{action}'")]
    InvalidAction {
        identifier: String,
        action: ProvisioningAction,
    },

    #[error("Provisioning interrupted")]
    Interrupted,
}

// ============================================================================
// Decision table
// ============================================================================

/// Where a raw device is mounted relative to its assigned target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    AtTarget,
    Foreign(PathBuf),
}

pub fn mount_state(current: Option<&Path>, target: &Path) -> MountState {
    match current {
        None => MountState::Unmounted,
        Some(mp) if mp == target => MountState::AtTarget,
        Some(mp) => MountState::Foreign(mp.to_path_buf()),
    }
}

/// What the provisioner will do for one location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionStep {
    FormatAndMount,
    VerifyAndMount,
    /// Already mounted where it belongs; keep it as is
    AdoptMounted,
    CreateDirectory,
    UseExistingDirectory,
    Refuse { mounted_at: PathBuf },
}

pub fn decide(state: &MountState, action: ProvisioningAction) -> ProvisionStep {
    use ProvisioningAction as A;
    match (state, action) {
        (_, A::CreateDirectory) => ProvisionStep::CreateDirectory,
        (_, A::UseExisting) => ProvisionStep::UseExistingDirectory,
        (MountState::Foreign(at), A::Format | A::Reuse) => ProvisionStep::Refuse {
            mounted_at: at.clone(),
        },
        (MountState::AtTarget, A::Format | A::Reuse) => ProvisionStep::AdoptMounted,
        (MountState::Unmounted, A::Format) => ProvisionStep::FormatAndMount,
        (MountState::Unmounted, A::Reuse) => ProvisionStep::VerifyAndMount,
    }
}

/// Managed mount point for the `index`-th (0-based) raw device
pub fn mount_point_for(mount_root: &Path, index: usize) -> PathBuf {
    mount_root.join(format!("disk{}", index + 1))
}

/// Mount points in discovery order. Raw devices are numbered, paths map to themselves.
pub fn assign_mount_points(
    mount_root: &Path,
    descriptors: &[StorageDescriptor],
) -> Result<Vec<PathBuf>, ProvisioningError> {
    let mut seen = HashSet::new();
    let mut points = Vec::with_capacity(descriptors.len());

    for (index, desc) in descriptors.iter().enumerate() {
        let mp = match desc.mode() {
            StorageMode::RawDevice => mount_point_for(mount_root, index),
            StorageMode::FilePath => desc.path().to_path_buf(),
        };
        if !seen.insert(mp.clone()) {
            return Err(ProvisioningError::DuplicateMountPoint(mp));
        }
        points.push(mp);
    }

    Ok(points)
}

// ============================================================================
// Provisioner
// ============================================================================

/// Result of a successful provisioning pass
#[derive(Debug, Clone, Default)]
pub struct ProvisionOutcome {
    pub assignments: Vec<MountAssignment>,
    pub warnings: Vec<String>,
}

/// Live state of a raw device as lsblk sees it now
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveDevice {
    pub mountpoint: Option<PathBuf>,
    pub fstype: Option<String>,
}

pub struct StorageProvisioner<'a> {
    runner: &'a dyn CommandRunner,
    mount_root: PathBuf,
    fstab: FstabFile,
    deployment_mode: DeploymentMode,
    settle_delay: Duration,
    cancel: CancelToken,
}

impl<'a> StorageProvisioner<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        mount_root: impl Into<PathBuf>,
        fstab: FstabFile,
        deployment_mode: DeploymentMode,
    ) -> Self {
        Self {
            runner,
            mount_root: mount_root.into(),
            fstab,
            deployment_mode,
            settle_delay: Duration::from_secs(1),
            cancel: CancelToken::new(),
        }
    }

    /// Pause between mkfs and the UUID read so udev can publish the new filesystem
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Provision every descriptor in order.
    ///
    /// Formatting requires `destructive_confirmed`; without it nothing runs.
    pub fn provision(
        &self,
        descriptors: &[StorageDescriptor],
        destructive_confirmed: bool,
    ) -> Result<ProvisionOutcome, ProvisioningError> {
        let to_format: Vec<String> = descriptors
            .iter()
            .filter(|d| d.action().is_destructive())
            .map(|d| d.identifier().to_string())
            .collect();
        if !to_format.is_empty() && !destructive_confirmed {
            return Err(ProvisioningError::DestructiveNotConfirmed { devices: to_format });
        }

        let mount_points = assign_mount_points(&self.mount_root, descriptors)?;
        let mut outcome = ProvisionOutcome::default();

        for (index, (desc, mount_point)) in descriptors.iter().zip(mount_points).enumerate() {
            if self.cancel.is_cancelled() {
                return Err(ProvisioningError::Interrupted);
            }

            let result = match desc.mode() {
                StorageMode::RawDevice => self.provision_raw(index, desc, mount_point),
                StorageMode::FilePath => self.provision_path(desc),
            };

            match result {
                Ok(assignment) => {
                    info!("Provisioned {}", assignment);
                    outcome.assignments.push(assignment);
                }
                Err(e) => {
                    error!(
                        "Provisioning stopped at {} after {} of {} location(s): {}",
                        desc.identifier(),
                        outcome.assignments.len(),
                        descriptors.len(),
                        e
                    );
                    if self.cancel.is_cancelled() {
                        return Err(ProvisioningError::Interrupted);
                    }
                    return Err(e);
                }
            }
        }

        if self.deployment_mode == DeploymentMode::Hybrid {
            for assignment in &outcome.assignments {
                outcome.warnings.extend(self.fix_ownership(&assignment.mount_point));
            }
        }

        Ok(outcome)
    }

    fn provision_raw(
        &self,
        index: usize,
        desc: &StorageDescriptor,
        mount_point: PathBuf,
    ) -> Result<MountAssignment, ProvisioningError> {
        let live = self.query_device(desc.identifier())?;
        let state = mount_state(live.mountpoint.as_deref(), &mount_point);
        let step = decide(&state, desc.action());
        info!("{}: {:?} with action '{}' -> {:?}", desc.identifier(), state, desc.action(), step);

        match step {
            ProvisionStep::Refuse { mounted_at } => Err(ProvisioningError::ForeignMount {
                device: desc.identifier().to_string(),
                mounted_at,
                expected: mount_point,
            }),
            ProvisionStep::FormatAndMount => {
                self.ensure_target_free(desc, &mount_point)?;
                let device = desc.path().to_path_buf();
                self.run_step("wipefs", desc.identifier(), &WipeSignatures { device: device.clone() })?;
                self.run_step("mkfs.xfs", desc.identifier(), &MakeXfs { device })?;

                let uuid = if self.runner.is_dry_run() {
                    format!("DRY-RUN-UUID-disk{}", index + 1)
                } else {
                    if !self.cancel.sleep(self.settle_delay, Duration::from_millis(100)) {
                        return Err(ProvisioningError::Interrupted);
                    }
                    self.read_uuid(desc.identifier())?
                };
                self.mount_fresh(desc, uuid, mount_point)
            }
            ProvisionStep::VerifyAndMount => {
                require_xfs(desc.identifier(), live.fstype.as_deref())?;
                self.ensure_target_free(desc, &mount_point)?;
                let uuid = self.read_uuid(desc.identifier())?;
                self.mount_fresh(desc, uuid, mount_point)
            }
            ProvisionStep::AdoptMounted => {
                require_xfs(desc.identifier(), live.fstype.as_deref())?;
                let uuid = self.read_uuid(desc.identifier())?;
                self.record_fstab(&uuid, &mount_point)?;
                info!("{} already mounted at {}, skipping format and mount", desc.identifier(), mount_point.display());
                Ok(MountAssignment {
                    descriptor: desc.with_stable_id(StableId::Uuid(uuid)),
                    mount_point,
                    already_active: true,
                })
            }
            ProvisionStep::CreateDirectory | ProvisionStep::UseExistingDirectory => {
                Err(ProvisioningError::InvalidAction {
                    identifier: desc.identifier().to_string(),
                    action: desc.action(),
                })
            }
        }
    }

    fn provision_path(&self, desc: &StorageDescriptor) -> Result<MountAssignment, ProvisioningError> {
        let path = desc.path().to_path_buf();
        let already_active = match decide(&MountState::Unmounted, desc.action()) {
            ProvisionStep::CreateDirectory => {
                self.create_dir(&path)?;
                false
            }
            ProvisionStep::UseExistingDirectory => {
                if !path.is_dir() {
                    return Err(ProvisioningError::NotADirectory(path));
                }
                true
            }
            _ => {
                return Err(ProvisioningError::InvalidAction {
                    identifier: desc.identifier().to_string(),
                    action: desc.action(),
                });
            }
        };

        Ok(MountAssignment {
            descriptor: desc.with_stable_id(StableId::Path(path.clone())),
            mount_point: path,
            already_active,
        })
    }

    /// Unmount devices that are mounted somewhere other than their managed target.
    ///
    /// Stops `service_unit` first since the cache may hold those mounts open.
    pub fn unmount_foreign(
        &self,
        mounts: &[(String, PathBuf)],
        service_unit: &str,
    ) -> Result<(), ProvisioningError> {
        if mounts.is_empty() {
            return Ok(());
        }

        let stop = self.run_quiet(&Systemctl::unit(SystemctlAction::Stop, service_unit));
        if !stop.success {
            warn!("Could not stop {} before unmounting: {}", service_unit, stop.stderr.trim());
        }

        for (device, mounted_at) in mounts {
            info!("Unmounting {} from {}", device, mounted_at.display());
            let out = self.run_quiet(&Unmount {
                target: mounted_at.clone(),
            });
            if !out.success {
                return Err(ProvisioningError::UnmountFailed {
                    device: device.clone(),
                    mounted_at: mounted_at.clone(),
                    detail: out.stderr.trim().to_string(),
                });
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------------

    fn query_device(&self, device: &str) -> Result<LiveDevice, ProvisioningError> {
        let out = self.run_step(
            "lsblk",
            device,
            &ListBlockDevices {
                device: Some(PathBuf::from(device)),
            },
        )?;
        let first = parse_lsblk(&out.stdout)
            .map_err(|e| ProvisioningError::CommandFailed {
                step: "lsblk".to_string(),
                target: device.to_string(),
                detail: format!("{:#}", e),
            })?
            .into_iter()
            .next();

        Ok(first
            .map(|d| LiveDevice {
                mountpoint: d.mountpoint.filter(|m| !m.is_empty()).map(PathBuf::from),
                fstype: d.fstype.filter(|f| !f.is_empty()),
            })
            .unwrap_or_default())
    }

    /// Refuse a mount point that something else is already mounted on
    fn ensure_target_free(&self, desc: &StorageDescriptor, mount_point: &Path) -> Result<(), ProvisioningError> {
        let out = self.run_quiet(&FindMountSource {
            mount_point: mount_point.to_path_buf(),
        });
        let occupant = out.stdout.trim();
        if !out.success || occupant.is_empty() || occupant == desc.identifier() {
            return Ok(());
        }
        Err(ProvisioningError::TargetOccupied {
            device: desc.identifier().to_string(),
            mount_point: mount_point.to_path_buf(),
            occupant: occupant.to_string(),
        })
    }

    fn read_uuid(&self, device: &str) -> Result<String, ProvisioningError> {
        let out = self.run_quiet(&ReadFsUuid {
            device: PathBuf::from(device),
        });
        let uuid = out.stdout.trim();
        if !out.success || uuid.is_empty() {
            return Err(ProvisioningError::MissingUuid(device.to_string()));
        }
        Ok(uuid.to_string())
    }

    fn mount_fresh(
        &self,
        desc: &StorageDescriptor,
        uuid: String,
        mount_point: PathBuf,
    ) -> Result<MountAssignment, ProvisioningError> {
        self.create_dir(&mount_point)?;
        self.record_fstab(&uuid, &mount_point)?;
        self.run_step("systemctl daemon-reload", "fstab", &Systemctl::daemon_reload())?;

        let by_fstab = self.run_quiet(&MountFstabEntry {
            mount_point: mount_point.clone(),
        });
        if !by_fstab.success {
            warn!(
                "mount {} via fstab failed ({}), retrying with explicit device",
                mount_point.display(),
                by_fstab.stderr.trim()
            );
            let direct = self.run_quiet(&MountDevice {
                device: desc.path().to_path_buf(),
                mount_point: mount_point.clone(),
            });
            if !direct.success {
                return Err(ProvisioningError::MountFailed {
                    device: desc.identifier().to_string(),
                    mount_point,
                    detail: direct.stderr.trim().to_string(),
                });
            }
        }

        Ok(MountAssignment {
            descriptor: desc.with_stable_id(StableId::Uuid(uuid)),
            mount_point,
            already_active: false,
        })
    }

    fn record_fstab(&self, uuid: &str, mount_point: &Path) -> Result<(), ProvisioningError> {
        let entry = FstabEntry::xfs(uuid, mount_point);
        if self.runner.is_dry_run() {
            info!("[DRY RUN] Skipped: fstab entry '{}' in {}", entry, self.fstab.path().display());
            return Ok(());
        }
        self.fstab
            .apply(&entry)
            .map(|_| ())
            .map_err(|e| ProvisioningError::Fstab(format!("{:#}", e)))
    }

    fn create_dir(&self, path: &Path) -> Result<(), ProvisioningError> {
        if self.runner.is_dry_run() {
            info!("[DRY RUN] Skipped: mkdir -p {}", path.display());
            return Ok(());
        }
        std::fs::create_dir_all(path).map_err(|e| ProvisioningError::Io {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    /// Best-effort ownership and SELinux labelling. Failures become warnings.
    fn fix_ownership(&self, path: &Path) -> Vec<String> {
        let rules = self.run_quiet(&ListFileContexts);
        let pattern = varnish_context_pattern(path);
        let labelled = rules.success
            && rules
                .stdout
                .lines()
                .any(|line| line.split_whitespace().next() == Some(pattern.as_str()));

        let steps: [&dyn HostCommand; 3] = [
            &ChownRecursive {
                path: path.to_path_buf(),
                owner: VARNISH_OWNER.to_string(),
            },
            &LabelVarnishStorage {
                path: path.to_path_buf(),
                modify: labelled,
            },
            &RestoreContext {
                path: path.to_path_buf(),
            },
        ];

        let mut warnings = Vec::new();
        for cmd in steps {
            let out = self.run_quiet(cmd);
            if !out.success {
                let msg = format!("{} failed: {}", cmd.describe(), out.stderr.trim());
                warn!("{}", msg);
                warnings.push(msg);
            }
        }
        warnings
    }

    /// Run a command that must succeed
    fn run_step(
        &self,
        step: &str,
        target: &str,
        cmd: &dyn HostCommand,
    ) -> Result<CommandOutput, ProvisioningError> {
        let out = self.run_quiet(cmd);
        if out.success {
            Ok(out)
        } else {
            Err(ProvisioningError::CommandFailed {
                step: step.to_string(),
                target: target.to_string(),
                detail: out.stderr.trim().to_string(),
            })
        }
    }

    /// Run a command, folding spawn errors into a failed output
    fn run_quiet(&self, cmd: &dyn HostCommand) -> CommandOutput {
        match self.runner.run(cmd) {
            Ok(out) => out,
            Err(e) => CommandOutput::failed(-1, format!("{:#}", e)),
        }
    }
}

fn require_xfs(device: &str, found: Option<&str>) -> Result<(), ProvisioningError> {
    if found == Some("xfs") {
        Ok(())
    } else {
        Err(ProvisioningError::UnexpectedFilesystem {
            device: device.to_string(),
            found: found.map(String::from),
        })
    }
}
