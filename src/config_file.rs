//! Declarative deployment configuration (`.env` file).
//!
//! The file is flat `KEY=VALUE` text: `#` starts a comment line, blank lines
//! are ignored, values are split at the first `=` and may be quoted. Mode
//! values are parsed into the enums from [`crate::types`].
//!
//! Loading never stops at the first problem: every syntax, type and semantic
//! error is collected into one [`ValidationErrors`] so the operator can fix
//! the file in a single pass.

use crate::error::{DeployError, ValidationErrors};
use crate::types::{DeploymentMode, DeviceMode, StorageMode};
use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// Keys understood by the deployment tool
pub const KNOWN_KEYS: &[&str] = &[
    "DEVICES",
    "DEPLOYMENT_MODE",
    "STORAGE_MODE",
    "DEVICE_MODE",
    "SERVER_IP",
    "VARNISH_PORT",
    "ADMIN_LISTEN",
    "ENABLE_MONITORING",
    "GRAFANA_PASSWORD",
    "LICENSE_FILE",
    "AUTO_CONFIRM",
    "UNMOUNT_FOREIGN",
    "ACTIVATION_ATTEMPTS",
    "ACTIVATION_INTERVAL_SECS",
];

pub const DEFAULT_VARNISH_PORT: u16 = 80;
pub const DEFAULT_ADMIN_LISTEN: &str = "localhost:6082";
pub const DEFAULT_LICENSE_FILE: &str = "./varnish-enterprise.lic";
pub const DEFAULT_ACTIVATION_ATTEMPTS: u32 = 30;
pub const DEFAULT_ACTIVATION_INTERVAL_SECS: u64 = 1;

/// Raw key/value pairs from an `.env` file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    entries: BTreeMap<String, String>,
}

impl EnvFile {
    /// Parse `.env` text. Malformed lines are reported, not fatal.
    pub fn parse(contents: &str) -> (Self, ValidationErrors) {
        let mut entries = BTreeMap::new();
        let mut errors = ValidationErrors::new();

        for (idx, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            match line.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    entries.insert(key.trim().to_string(), unquote(value.trim()).to_string());
                }
                _ => errors.push(format!("line {}: expected KEY=VALUE, got '{}'", idx + 1, line)),
            }
        }

        (Self { entries }, errors)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Keys present in the file that the tool does not understand
    pub fn unknown_keys(&self) -> Vec<&str> {
        self.entries
            .keys()
            .map(String::as_str)
            .filter(|k| !KNOWN_KEYS.contains(k))
            .collect()
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Fixed host locations, overridable so tests can run inside a temp dir
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostLayout {
    pub fstab: PathBuf,
    /// Parent of the numbered `diskN` mount points
    pub mount_root: PathBuf,
    pub varnish_dir: PathBuf,
    pub systemd_dir: PathBuf,
    /// Working directory for compose files and monitoring config
    pub install_dir: PathBuf,
}

impl Default for HostLayout {
    fn default() -> Self {
        Self {
            fstab: PathBuf::from("/etc/fstab"),
            mount_root: PathBuf::from("/cache"),
            varnish_dir: PathBuf::from("/etc/varnish"),
            systemd_dir: PathBuf::from("/etc/systemd/system"),
            install_dir: PathBuf::from("/opt/teamcache"),
        }
    }
}

impl HostLayout {
    /// The default layout re-rooted under `root`
    pub fn under(root: &Path) -> Self {
        let reroot = |p: PathBuf| root.join(p.strip_prefix("/").unwrap_or(&p));
        let d = Self::default();
        Self {
            fstab: reroot(d.fstab),
            mount_root: reroot(d.mount_root),
            varnish_dir: reroot(d.varnish_dir),
            systemd_dir: reroot(d.systemd_dir),
            install_dir: reroot(d.install_dir),
        }
    }
}

/// Validated deployment configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployConfig {
    /// Devices or directories, in the order their mount points are numbered
    pub devices: Vec<String>,
    pub deployment_mode: DeploymentMode,
    pub storage_mode: StorageMode,
    pub device_mode: DeviceMode,
    pub server_ip: String,
    pub varnish_port: u16,
    pub admin_listen: String,
    pub enable_monitoring: bool,
    #[serde(skip_serializing)]
    pub grafana_password: Option<String>,
    pub license_file: PathBuf,
    /// Destructive-confirmation flag required before formatting
    pub auto_confirm: bool,
    /// Allow unmounting devices mounted outside the managed root
    pub unmount_foreign: bool,
    pub activation_attempts: u32,
    pub activation_interval_secs: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            deployment_mode: DeploymentMode::default(),
            storage_mode: StorageMode::default(),
            device_mode: DeviceMode::default(),
            server_ip: String::new(),
            varnish_port: DEFAULT_VARNISH_PORT,
            admin_listen: DEFAULT_ADMIN_LISTEN.to_string(),
            enable_monitoring: true,
            grafana_password: None,
            license_file: PathBuf::from(DEFAULT_LICENSE_FILE),
            auto_confirm: false,
            unmount_foreign: false,
            activation_attempts: DEFAULT_ACTIVATION_ATTEMPTS,
            activation_interval_secs: DEFAULT_ACTIVATION_INTERVAL_SECS,
        }
    }
}

impl DeployConfig {
    /// Load and validate a configuration file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, DeployError> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;
        Ok(Self::parse(&content)?)
    }

    /// Parse and validate `.env` text, collecting every problem
    pub fn parse(contents: &str) -> Result<Self, ValidationErrors> {
        let (env, mut errors) = EnvFile::parse(contents);

        for key in env.unknown_keys() {
            warn!("Ignoring unknown configuration key {}", key);
        }

        let mut config = Self::default();

        match env.get("DEVICES") {
            Some(list) => {
                config.devices = list
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
            None => errors.push("DEVICES is required"),
        }

        parse_enum(&env, "DEPLOYMENT_MODE", &mut config.deployment_mode, &mut errors);
        parse_enum(&env, "STORAGE_MODE", &mut config.storage_mode, &mut errors);
        parse_enum(&env, "DEVICE_MODE", &mut config.device_mode, &mut errors);

        match env.get("SERVER_IP") {
            Some(ip) => config.server_ip = ip.to_string(),
            None => errors.push("SERVER_IP is required"),
        }

        if let Some(port) = env.get("VARNISH_PORT") {
            match port.parse::<u16>() {
                Ok(p) if p > 0 => config.varnish_port = p,
                _ => errors.push(format!("VARNISH_PORT must be a port number 1-65535, got '{}'", port)),
            }
        }

        if let Some(admin) = env.get("ADMIN_LISTEN") {
            config.admin_listen = admin.to_string();
        }

        parse_flag(&env, "ENABLE_MONITORING", &mut config.enable_monitoring, &mut errors);
        parse_flag(&env, "AUTO_CONFIRM", &mut config.auto_confirm, &mut errors);
        parse_flag(&env, "UNMOUNT_FOREIGN", &mut config.unmount_foreign, &mut errors);

        config.grafana_password = env
            .get("GRAFANA_PASSWORD")
            .filter(|p| !p.is_empty())
            .map(String::from);

        if let Some(license) = env.get("LICENSE_FILE") {
            config.license_file = PathBuf::from(license);
        }

        if let Some(attempts) = env.get("ACTIVATION_ATTEMPTS") {
            match attempts.parse::<u32>() {
                Ok(n) => config.activation_attempts = n,
                Err(_) => errors.push(format!("ACTIVATION_ATTEMPTS must be a whole number, got '{}'", attempts)),
            }
        }

        if let Some(interval) = env.get("ACTIVATION_INTERVAL_SECS") {
            match interval.parse::<u64>() {
                Ok(n) => config.activation_interval_secs = n,
                Err(_) => errors.push(format!(
                    "ACTIVATION_INTERVAL_SECS must be a whole number, got '{}'",
                    interval
                )),
            }
        }

        if let Err(semantic) = config.validate() {
            errors.extend(semantic);
        }

        errors.into_result().map(|()| config)
    }

    /// Check cross-field rules. Returns every violation at once.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.devices.is_empty() {
            errors.push("DEVICES must list at least one device or path");
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.as_str()) {
                errors.push(format!("DEVICES lists {} more than once", device));
            }
        }

        if self.server_ip.trim().is_empty() {
            errors.push("SERVER_IP must not be empty");
        } else if self.server_ip.contains(char::is_whitespace) {
            errors.push(format!("SERVER_IP '{}' contains whitespace", self.server_ip));
        }

        match self.admin_listen.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => errors.push(format!("ADMIN_LISTEN must be host:port, got '{}'", self.admin_listen)),
        }

        if self.enable_monitoring && self.grafana_password.is_none() {
            errors.push("GRAFANA_PASSWORD is required when ENABLE_MONITORING=true");
        }
        if let Some(password) = &self.grafana_password {
            if password.contains(['\n', '\r']) || password.contains(r#"""""#) {
                errors.push("GRAFANA_PASSWORD must not contain line breaks or a triple quote");
            }
        }

        if self.requires_format() && !self.auto_confirm {
            errors.push(
                "DEVICE_MODE=format erases all data on DEVICES; set AUTO_CONFIRM=true to proceed",
            );
        }

        if self.storage_mode == StorageMode::FilePath {
            for path in &self.devices {
                if !Path::new(path).is_absolute() {
                    errors.push(format!("Storage path {} must be absolute", path));
                }
            }
        }

        if self.activation_attempts == 0 {
            errors.push("ACTIVATION_ATTEMPTS must be at least 1");
        }

        errors.into_result()
    }

    /// Returns true if this run will format raw devices
    pub fn requires_format(&self) -> bool {
        self.storage_mode == StorageMode::RawDevice && self.device_mode.is_destructive()
    }

    /// Non-fatal problems to surface in the final summary
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.license_file.exists() {
            warnings.push(format!(
                "License file {} not found; the cache service may refuse to start",
                self.license_file.display()
            ));
        }
        warnings
    }
}

fn parse_enum<T>(env: &EnvFile, key: &str, slot: &mut T, errors: &mut ValidationErrors)
where
    T: FromStr + strum::IntoEnumIterator + std::fmt::Display,
{
    if let Some(value) = env.get(key) {
        match value.parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => {
                let valid: Vec<String> = T::iter().map(|v| v.to_string()).collect();
                errors.push(format!("{} must be one of {}, got '{}'", key, valid.join("|"), value));
            }
        }
    }
}

fn parse_flag(env: &EnvFile, key: &str, slot: &mut bool, errors: &mut ValidationErrors) {
    if let Some(value) = env.get(key) {
        match parse_bool(value) {
            Some(b) => *slot = b,
            None => errors.push(format!("{} must be true or false, got '{}'", key, value)),
        }
    }
}
