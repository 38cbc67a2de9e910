//! fstab reconciliation
//!
//! Each managed mount point owns exactly one fstab line. Reconciling a mount
//! point removes every line whose second field equals it, then appends the
//! fresh `UUID=` entry. Comments and unrelated lines are preserved verbatim.
//!
//! The file is backed up to `fstab.bak.<YYYYmmdd-HHMMSS>` before every write.

use anyhow::{Context, Result};
use chrono::Local;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One managed fstab line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub uuid: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: String,
    pub dump: u8,
    pub pass: u8,
}

impl FstabEntry {
    /// Entry for an XFS cache filesystem, as written by the provisioner
    pub fn xfs(uuid: impl Into<String>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            uuid: uuid.into(),
            mount_point: mount_point.into(),
            fs_type: "xfs".to_string(),
            options: "defaults,noatime".to_string(),
            dump: 0,
            pass: 2,
        }
    }
}

impl fmt::Display for FstabEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UUID={} {} {} {} {} {}",
            self.uuid,
            self.mount_point.display(),
            self.fs_type,
            self.options,
            self.dump,
            self.pass
        )
    }
}

/// True if `line` is an active entry whose mount point field is `mount_point`
fn targets(line: &str, mount_point: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return false;
    }
    trimmed.split_whitespace().nth(1) == Some(mount_point)
}

/// Drop every active line for `mount_point`. Returns the new text and the number removed.
pub fn remove_mount_point(contents: &str, mount_point: &Path) -> (String, usize) {
    let mp = mount_point.display().to_string();
    let mut kept = String::with_capacity(contents.len());
    let mut removed = 0;

    for line in contents.lines() {
        if targets(line, &mp) {
            removed += 1;
        } else {
            kept.push_str(line);
            kept.push('\n');
        }
    }

    (kept, removed)
}

/// Replace all lines for the entry's mount point with the entry itself
pub fn reconcile(contents: &str, entry: &FstabEntry) -> (String, usize) {
    let (mut updated, removed) = remove_mount_point(contents, &entry.mount_point);
    updated.push_str(&entry.to_string());
    updated.push('\n');
    (updated, removed)
}

/// True if `contents` holds exactly this entry and nothing else for its mount point
pub fn is_reconciled(contents: &str, entry: &FstabEntry) -> bool {
    let mp = entry.mount_point.display().to_string();
    let wanted = entry.to_string();
    let matching: Vec<&str> = contents.lines().filter(|l| targets(l, &mp)).collect();
    matching.len() == 1 && matching[0].split_whitespace().eq(wanted.split_whitespace())
}

/// Result of reconciling one entry on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabUpdate {
    pub backup: Option<PathBuf>,
    pub removed: usize,
    pub changed: bool,
}

/// An fstab file on disk
#[derive(Debug, Clone)]
pub struct FstabFile {
    path: PathBuf,
}

impl FstabFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<String> {
        if !self.path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))
    }

    /// Copy the current file to a timestamped sibling, never overwriting an older backup
    pub fn backup(&self) -> Result<PathBuf> {
        let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "fstab".to_string());

        let mut candidate = self.path.with_file_name(format!("{}.bak.{}", name, stamp));
        let mut n = 1;
        while candidate.exists() {
            candidate = self.path.with_file_name(format!("{}.bak.{}.{}", name, stamp, n));
            n += 1;
        }

        fs::copy(&self.path, &candidate).with_context(|| {
            format!("Failed to back up {} to {}", self.path.display(), candidate.display())
        })?;
        debug!("Backed up {} to {}", self.path.display(), candidate.display());
        Ok(candidate)
    }

    /// Make `entry` the only line for its mount point. A no-op if already so.
    pub fn apply(&self, entry: &FstabEntry) -> Result<FstabUpdate> {
        let current = self.read()?;
        if is_reconciled(&current, entry) {
            debug!("fstab already has {}", entry);
            return Ok(FstabUpdate {
                backup: None,
                removed: 0,
                changed: false,
            });
        }

        let backup = if self.path.exists() {
            Some(self.backup()?)
        } else {
            None
        };

        let (updated, removed) = reconcile(&current, entry);
        fs::write(&self.path, updated)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        info!(
            "fstab: {} ({} stale entr{} removed)",
            entry,
            removed,
            if removed == 1 { "y" } else { "ies" }
        );

        Ok(FstabUpdate {
            backup,
            removed,
            changed: true,
        })
    }
}
