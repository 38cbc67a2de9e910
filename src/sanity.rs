//! Pre-flight checks for the runtime environment
//!
//! Verifies, before anything on the host is touched:
//! - the host binaries this particular run will call are on `PATH`
//! - the process runs with root privileges (EUID 0)
//!
//! In dry-run mode both checks degrade to warnings so a plan can be previewed
//! on any machine.

use crate::config_file::DeployConfig;
use crate::error::ValidationErrors;
use crate::process_guard::CommandProcessGroup;
use crate::types::{DeploymentMode, DeviceMode, StorageMode};
use std::process::Command;
use tracing::debug;

/// Result of environment verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    /// Missing binaries that only disable optional features
    pub missing_optional: Vec<String>,
    pub is_root: bool,
}

impl SanityCheckResult {
    /// Returns true if all checks passed
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }

    /// Split findings into blocking errors and warnings
    pub fn into_findings(self, dry_run: bool) -> (ValidationErrors, Vec<String>) {
        let mut errors = ValidationErrors::new();
        let mut warnings = Vec::new();

        let mut report = |msg: String| {
            if dry_run {
                warnings.push(msg);
            } else {
                errors.push(msg);
            }
        };

        if !self.is_root {
            report("Root privileges required (run with sudo)".to_string());
        }
        for binary in &self.missing_binaries {
            report(format!(
                "Required binary {} not found (package: {})",
                binary,
                package_for_binary(binary)
            ));
        }
        for binary in &self.missing_optional {
            warnings.push(format!(
                "Optional binary {} not found (package: {})",
                binary,
                package_for_binary(binary)
            ));
        }

        (errors, warnings)
    }
}

/// Binaries the configured run cannot proceed without
pub fn required_binaries(config: &DeployConfig) -> Vec<&'static str> {
    let mut bins = vec!["systemctl"];

    if config.storage_mode == StorageMode::RawDevice {
        bins.extend(["lsblk", "blkid", "findmnt", "mount"]);
        if config.device_mode == DeviceMode::Format {
            bins.extend(["wipefs", "mkfs.xfs"]);
        }
    }

    match config.deployment_mode {
        DeploymentMode::Hybrid => bins.extend(["varnishd", "mkfs.mse4"]),
        DeploymentMode::Docker => bins.push("docker"),
    }

    bins
}

/// Binaries whose absence only degrades the run
pub fn optional_binaries(config: &DeployConfig) -> Vec<&'static str> {
    let mut bins = Vec::new();
    if config.deployment_mode == DeploymentMode::Hybrid {
        bins.extend(["chown", "semanage", "restorecon"]);
        if config.enable_monitoring {
            bins.push("docker");
        }
    }
    bins
}

/// Check if a binary is available in PATH
fn binary_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .in_new_process_group()
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Perform all sanity checks for `config`
pub fn verify_environment(config: &DeployConfig) -> SanityCheckResult {
    let missing_binaries = required_binaries(config)
        .into_iter()
        .filter(|b| !binary_exists(b))
        .map(String::from)
        .collect();

    let missing_optional: Vec<String> = optional_binaries(config)
        .into_iter()
        .filter(|b| !binary_exists(b))
        .map(String::from)
        .collect();

    for binary in &missing_optional {
        debug!("Optional binary not found: {}", binary);
    }

    SanityCheckResult {
        missing_binaries,
        missing_optional,
        is_root: is_running_as_root(),
    }
}

/// Map binary names to the package that usually provides them
fn package_for_binary(binary: &str) -> &'static str {
    match binary {
        "lsblk" | "blkid" | "findmnt" | "wipefs" | "mount" => "util-linux",
        "mkfs.xfs" => "xfsprogs",
        "systemctl" => "systemd",
        "docker" => "docker-ce + docker-compose-plugin",
        "varnishd" | "mkfs.mse4" => "varnish-plus",
        "chown" => "coreutils",
        "semanage" => "policycoreutils-python-utils",
        "restorecon" => "policycoreutils",
        _ => "unknown",
    }
}
