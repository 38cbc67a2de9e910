//! Shared fixtures for integration tests
//!
//! `FakeRunner` answers host commands from a script keyed by command-line
//! prefix and records every invocation, so tests can assert on both the
//! outcome and the exact commands issued.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;

use teamcache::command_runner::{CommandOutput, CommandRunner};
use teamcache::command_traits::HostCommand;
use teamcache::config_file::{DeployConfig, HostLayout};
use teamcache::sanity::SanityCheckResult;
use teamcache::storage::GIB;
use teamcache::types::{DeploymentMode, DeviceMode, StorageMode};

/// Scripted [`CommandRunner`].
///
/// Responses are matched by the longest prefix of `describe()`. Each prefix
/// holds a queue; the last response repeats once the queue drains. Unscripted
/// commands succeed with empty output.
#[derive(Default)]
pub struct FakeRunner {
    script: RefCell<Vec<(String, VecDeque<CommandOutput>)>>,
    calls: RefCell<Vec<String>>,
    dry_run: bool,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    pub fn on(&self, prefix: &str, output: CommandOutput) -> &Self {
        let mut script = self.script.borrow_mut();
        match script.iter_mut().find(|(p, _)| p == prefix) {
            Some((_, queue)) => queue.push_back(output),
            None => script.push((prefix.to_string(), VecDeque::from([output]))),
        }
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls.borrow().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.count(prefix) > 0
    }

    /// Index of the first call starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.calls.borrow().iter().position(|c| c.starts_with(prefix))
    }

    fn respond(&self, line: &str) -> CommandOutput {
        let mut script = self.script.borrow_mut();
        let best = script
            .iter_mut()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());

        match best {
            Some((_, queue)) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| CommandOutput::ok("")),
            Some((_, queue)) => queue.front().cloned().unwrap_or_else(|| CommandOutput::ok("")),
            None => CommandOutput::ok(""),
        }
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, command: &dyn HostCommand) -> anyhow::Result<CommandOutput> {
        let line = command.describe();
        self.calls.borrow_mut().push(line.clone());
        if self.dry_run && command.is_mutating() {
            return Ok(CommandOutput::skipped(&line));
        }
        Ok(self.respond(&line))
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

/// `lsblk -J` output for a single whole disk
pub fn lsblk_disk(path: &str, size_bytes: u64, fstype: Option<&str>, mountpoint: Option<&Path>) -> CommandOutput {
    let quote = |v: Option<String>| v.map(|s| format!("\"{}\"", s)).unwrap_or_else(|| "null".to_string());
    CommandOutput::ok(format!(
        r#"{{"blockdevices":[{{"path":"{}","size":{},"fstype":{},"mountpoint":{},"model":"Test Disk","type":"disk"}}]}}"#,
        path,
        size_bytes,
        quote(fstype.map(String::from)),
        quote(mountpoint.map(|p| p.display().to_string())),
    ))
}

/// Script lsblk for `device` on both the exact query and its describe() prefix
pub fn script_disk(runner: &FakeRunner, device: &str, size_gib: u64, fstype: Option<&str>, mountpoint: Option<&Path>) {
    runner.on(
        &format!("lsblk -J -b -o PATH,SIZE,FSTYPE,MOUNTPOINT,MODEL,TYPE {}", device),
        lsblk_disk(device, size_gib * GIB, fstype, mountpoint),
    );
}

pub const RUNNING: &str = "● teamcache.service - TeamCache\n     Active: active (running) since Tue 2026-10-13 10:00:00 UTC";
pub const ACTIVATING: &str = "● teamcache.service - TeamCache\n     Active: activating (start-pre)";
pub const FAILED: &str = "● teamcache.service - TeamCache\n     Active: failed (Result: exit-code)";

/// A host layout rooted in a temp dir
pub fn temp_host(root: &Path) -> HostLayout {
    let host = HostLayout::under(root);
    std::fs::create_dir_all(host.fstab.parent().unwrap_or(root)).unwrap();
    std::fs::write(&host.fstab, "# test fstab\nUUID=root / ext4 defaults 0 1\n").unwrap();
    host
}

pub fn all_present() -> SanityCheckResult {
    SanityCheckResult {
        missing_binaries: Vec::new(),
        missing_optional: Vec::new(),
        is_root: true,
    }
}

/// Hybrid, raw-disk, format mode config that passes validation
pub fn raw_config(devices: &[&str]) -> DeployConfig {
    DeployConfig {
        devices: devices.iter().map(|d| d.to_string()).collect(),
        deployment_mode: DeploymentMode::Hybrid,
        storage_mode: StorageMode::RawDevice,
        device_mode: DeviceMode::Format,
        server_ip: "10.0.0.5".to_string(),
        enable_monitoring: false,
        auto_confirm: true,
        activation_interval_secs: 0,
        ..DeployConfig::default()
    }
}
