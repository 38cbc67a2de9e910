//! Deployment orchestration
//!
//! [`Deployer::run`] walks the [`DeployContext`] stages in order:
//!
//! | Stage | Work | Mutates host |
//! |-------|------|--------------|
//! | ValidatingConfig | config rules, binaries, root | no |
//! | DiscoveringStorage | lsblk / statvfs per configured entry | no |
//! | ProvisioningStorage | foreign unmounts (opt-in), format/reuse, fstab | yes |
//! | GeneratingConfig | layout, mse4.conf, units, monitoring files | yes |
//! | ActivatingService | start, poll, health probe, monitoring stack | yes |
//!
//! Every validation and discovery problem is collected before the first
//! mutation. After that the first fatal error stops the run. Optional parts
//! (monitoring, ownership fix-ups, health) only add warnings.

use crate::activation::{ActivationController, ActivationReport};
use crate::command_runner::{CommandOutput, CommandRunner};
use crate::commands::disk::ChownRecursive;
use crate::commands::service::{DockerComposeVersion, Systemctl, SystemctlAction};
use crate::command_traits::HostCommand;
use crate::config_file::{DeployConfig, HostLayout};
use crate::deploy_state::{DeployContext, DeployStage};
use crate::engine::artifacts::{self, ArtifactSet, ArtifactWriter, GRAFANA_PORT, PROMETHEUS_PORT};
use crate::engine::layout::{self, BasePathScheme, LayoutPlan};
use crate::engine::unit::{MONITORING_UNIT, SERVICE_UNIT};
use crate::error::{DeployError, Result, ValidationErrors};
use crate::fstab::FstabFile;
use crate::health::{self, HealthStatus};
use crate::inventory::{self, DiscoveryReport, ExclusionReason};
use crate::process_guard::CancelToken;
use crate::provision::{StorageProvisioner, VARNISH_OWNER, assign_mount_points};
use crate::sanity::{self, SanityCheckResult};
use crate::storage::{MountAssignment, ProvisioningAction, StableId, StorageDescriptor};
use crate::types::{DeploymentMode, StorageMode};
use chrono::Local;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// Placeholder stable id shown by `plan` for devices that will be formatted
pub const PENDING_UUID: &str = "<assigned-at-format>";

// ============================================================================
// Reports
// ============================================================================

/// What a deployment did, for the final summary
#[derive(Debug, Clone)]
pub struct DeployReport {
    pub deployment_mode: DeploymentMode,
    pub dry_run: bool,
    pub server_ip: String,
    pub varnish_port: u16,
    pub monitoring: bool,
    pub assignments: Vec<MountAssignment>,
    pub plan: LayoutPlan,
    pub files: Vec<PathBuf>,
    /// `None` in dry-run
    pub activation: Option<ActivationReport>,
    pub warnings: Vec<String>,
}

impl DeployReport {
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let heading = if self.dry_run {
            "Dry run complete (no changes made)"
        } else {
            "Deployment complete"
        };
        let _ = writeln!(out, "{} [{} mode]", heading, self.deployment_mode);

        let _ = writeln!(out, "\nStorage:");
        for (assignment, book) in self.assignments.iter().zip(&self.plan.books) {
            let _ = writeln!(
                out,
                "  {} -> {} ({}, store {} GiB){}",
                assignment.descriptor.identifier(),
                assignment.mount_point.display(),
                book.id,
                book.store_size_gib(),
                if assignment.already_active { " [reused]" } else { "" }
            );
        }

        let _ = writeln!(out, "\nGenerated files:");
        for file in &self.files {
            let _ = writeln!(out, "  {}", file.display());
        }

        if let Some(activation) = &self.activation {
            let _ = writeln!(
                out,
                "\nService: {} active after {} check(s)",
                activation.unit, activation.attempts
            );
            if let Some(health) = &activation.health {
                let _ = writeln!(out, "Endpoint: {}", health);
            }
        }

        let _ = writeln!(out, "\nAccess points:");
        let _ = writeln!(out, "  TeamCache endpoint: http://{}:{}", self.server_ip, self.varnish_port);
        if self.monitoring {
            let _ = writeln!(out, "  Grafana dashboard:  http://{}:{}", self.server_ip, GRAFANA_PORT);
            let _ = writeln!(out, "  Prometheus:         http://{}:{}", self.server_ip, PROMETHEUS_PORT);
        }

        if !self.warnings.is_empty() {
            let _ = writeln!(out, "\nWarnings:");
            for warning in &self.warnings {
                let _ = writeln!(out, "  - {}", warning);
            }
        }
        out
    }
}

/// Read-only preview produced by `plan`
#[derive(Debug, Clone)]
pub struct PlanPreview {
    pub descriptors: Vec<StorageDescriptor>,
    pub assignments: Vec<MountAssignment>,
    pub plan: LayoutPlan,
    pub artifacts: ArtifactSet,
    pub warnings: Vec<String>,
}

/// Result of the read-only stages
#[derive(Debug, Clone, Default)]
pub struct Preflight {
    pub descriptors: Vec<StorageDescriptor>,
    /// Devices mounted outside the managed root, to unmount once provisioning starts
    pub foreign: Vec<(String, PathBuf)>,
    pub warnings: Vec<String>,
}

// ============================================================================
// Deployer
// ============================================================================

pub struct Deployer<'a> {
    config: DeployConfig,
    host: HostLayout,
    runner: &'a dyn CommandRunner,
    cancel: CancelToken,
    environment: Option<SanityCheckResult>,
    probe_health: bool,
    settle_delay: Duration,
    generated_at: Option<String>,
}

impl<'a> Deployer<'a> {
    pub fn new(config: DeployConfig, host: HostLayout, runner: &'a dyn CommandRunner) -> Self {
        Self {
            config,
            host,
            runner,
            cancel: CancelToken::new(),
            environment: None,
            probe_health: true,
            settle_delay: Duration::from_secs(1),
            generated_at: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Use a precomputed environment check instead of probing `PATH` and EUID
    pub fn with_environment(mut self, environment: SanityCheckResult) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_health_probe(mut self, enabled: bool) -> Self {
        self.probe_health = enabled;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Fix the header timestamp of generated files
    pub fn with_timestamp(mut self, generated_at: impl Into<String>) -> Self {
        self.generated_at = Some(generated_at.into());
        self
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    fn dry_run(&self) -> bool {
        self.runner.is_dry_run()
    }

    fn timestamp(&self) -> String {
        self.generated_at
            .clone()
            .unwrap_or_else(|| Local::now().format("%Y-%m-%d %H:%M:%S").to_string())
    }

    fn scheme(&self) -> BasePathScheme {
        match self.config.deployment_mode {
            DeploymentMode::Hybrid => BasePathScheme::Host,
            DeploymentMode::Docker => BasePathScheme::Container,
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(DeployError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Run every stage. On error the context is marked failed and the error returned.
    pub fn run(&self) -> Result<DeployReport> {
        let mut ctx = DeployContext::new();
        let result = self.run_stages(&mut ctx);

        if let Err(e) = &result {
            let stage = ctx.fail();
            error!("Deployment failed during '{}': {}", stage, e);
        }
        result
    }

    fn run_stages(&self, ctx: &mut DeployContext) -> Result<DeployReport> {
        if self.dry_run() {
            info!("Dry-run mode: mutating commands and file writes are skipped");
        }

        ctx.transition_to(DeployStage::ValidatingConfig)?;
        ctx.transition_to(DeployStage::DiscoveringStorage)?;
        let preflight = self.preflight()?;
        let mut warnings = preflight.warnings.clone();

        self.check_cancel()?;
        if !self.config.requires_format() || self.config.auto_confirm {
            ctx.confirm_destructive_operations();
        }
        ctx.transition_to(DeployStage::ProvisioningStorage)?;
        let assignments = self.provision(&preflight, &mut warnings)?;

        self.check_cancel()?;
        ctx.transition_to(DeployStage::GeneratingConfig)?;
        let (plan, files) = self.generate(&assignments, &mut warnings)?;

        self.check_cancel()?;
        ctx.transition_to(DeployStage::ActivatingService)?;
        let activation = self.activate(&mut warnings)?;

        ctx.transition_to(DeployStage::Completed)?;

        let report = DeployReport {
            deployment_mode: self.config.deployment_mode,
            dry_run: self.dry_run(),
            server_ip: self.config.server_ip.clone(),
            varnish_port: self.config.varnish_port,
            monitoring: self.config.enable_monitoring,
            assignments,
            plan,
            files,
            activation,
            warnings,
        };
        info!("Deployment finished with {} warning(s)", report.warnings.len());
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Read-only stages
    // ------------------------------------------------------------------------

    /// Validate config and environment, then discover storage. Collects every problem.
    pub fn preflight(&self) -> Result<Preflight> {
        let mut errors = ValidationErrors::new();
        let mut out = Preflight::default();

        if let Err(e) = self.config.validate() {
            errors.extend(e);
        }

        let environment = self
            .environment
            .clone()
            .unwrap_or_else(|| sanity::verify_environment(&self.config));
        let (env_errors, env_warnings) = environment.into_findings(self.dry_run());
        errors.extend(env_errors);
        out.warnings.extend(env_warnings);
        out.warnings.extend(self.config.warnings());

        let report = self.discover();
        for exclusion in report.excluded {
            match exclusion.reason {
                ExclusionReason::ForeignMount { mount_point } if self.config.unmount_foreign => {
                    info!(
                        "{} is mounted at {}; it will be unmounted (UNMOUNT_FOREIGN)",
                        exclusion.identifier,
                        mount_point.display()
                    );
                    out.foreign.push((exclusion.identifier, mount_point));
                }
                ExclusionReason::ForeignMount { mount_point } => errors.push(format!(
                    "{} is mounted at {}; unmount it or set UNMOUNT_FOREIGN=true",
                    exclusion.identifier,
                    mount_point.display()
                )),
                reason => errors.push(format!("{}: {}", exclusion.identifier, reason)),
            }
        }

        for desc in &report.candidates {
            if desc.action() == ProvisioningAction::Reuse && desc.filesystem_type() != Some("xfs") {
                errors.push(format!(
                    "{} has filesystem {}; DEVICE_MODE=reuse requires xfs",
                    desc.identifier(),
                    desc.filesystem_type().unwrap_or("none")
                ));
            }
        }
        out.descriptors = report.candidates;

        if !errors.is_empty() {
            return Err(DeployError::Validation(errors));
        }

        for desc in &out.descriptors {
            info!("Selected {}", desc);
        }
        Ok(out)
    }

    fn discover(&self) -> DiscoveryReport {
        match self.config.storage_mode {
            StorageMode::RawDevice => inventory::probe_devices(
                self.runner,
                &self.config.devices,
                &self.host.mount_root,
                self.config.device_mode,
            ),
            StorageMode::FilePath => inventory::resolve_paths(&self.config.devices),
        }
    }

    // ------------------------------------------------------------------------
    // Mutating stages
    // ------------------------------------------------------------------------

    fn provision(&self, preflight: &Preflight, warnings: &mut Vec<String>) -> Result<Vec<MountAssignment>> {
        let provisioner = StorageProvisioner::new(
            self.runner,
            &self.host.mount_root,
            FstabFile::new(&self.host.fstab),
            self.config.deployment_mode,
        )
        .with_settle_delay(self.settle_delay)
        .with_cancel(self.cancel.clone());

        let mut descriptors = preflight.descriptors.clone();
        if !preflight.foreign.is_empty() {
            provisioner.unmount_foreign(&preflight.foreign, SERVICE_UNIT)?;
            descriptors = self.rediscover(preflight, warnings)?;
        }

        let outcome = provisioner.provision(&descriptors, self.config.auto_confirm)?;
        warnings.extend(outcome.warnings);
        Ok(outcome.assignments)
    }

    /// Probe again after foreign mounts were released. Anything still excluded is fatal.
    fn rediscover(&self, preflight: &Preflight, warnings: &mut Vec<String>) -> Result<Vec<StorageDescriptor>> {
        if self.dry_run() {
            // Nothing was unmounted, so those devices would still read as foreign
            for (device, mounted_at) in &preflight.foreign {
                warnings.push(format!(
                    "{} would be unmounted from {}; left out of this dry run",
                    device,
                    mounted_at.display()
                ));
            }
            return Ok(preflight.descriptors.clone());
        }
        let report = self.discover();
        if report.excluded.is_empty() {
            return Ok(report.candidates);
        }
        let errors: Vec<String> = report.excluded.iter().map(|e| e.to_string()).collect();
        Err(DeployError::Validation(errors.into()))
    }

    fn generate(
        &self,
        assignments: &[MountAssignment],
        warnings: &mut Vec<String>,
    ) -> Result<(LayoutPlan, Vec<PathBuf>)> {
        let plan = layout::generate(assignments, self.scheme())?;
        info!("Layout:\n{}", plan.summary());

        let host_dirs: Vec<PathBuf> = assignments.iter().map(|a| a.mount_point.clone()).collect();
        let set = artifacts::collect(&self.config, &self.host, &plan, &host_dirs, &self.timestamp());

        let mut writer = ArtifactWriter::new(self.dry_run());
        writer.write_set(&set)?;

        if self.config.deployment_mode == DeploymentMode::Hybrid {
            let secret = ArtifactSet::secret_path(&self.host);
            let out = self.run_quiet(&ChownRecursive {
                path: secret.clone(),
                owner: VARNISH_OWNER.to_string(),
            });
            if !out.success {
                let msg = format!(
                    "Could not hand {} to {}: {}",
                    secret.display(),
                    VARNISH_OWNER,
                    out.stderr.trim()
                );
                warn!("{}", msg);
                warnings.push(msg);
            }
        }

        Ok((plan, writer.written().to_vec()))
    }

    fn activate(&self, warnings: &mut Vec<String>) -> Result<Option<ActivationReport>> {
        if self.dry_run() {
            info!("[DRY RUN] Skipped: activation of {}", SERVICE_UNIT);
            return Ok(None);
        }

        let mut controller = ActivationController::new(self.runner, SERVICE_UNIT)
            .with_attempts(self.config.activation_attempts)
            .with_interval(Duration::from_secs(self.config.activation_interval_secs))
            .with_cancel(self.cancel.clone());
        if self.probe_health {
            controller = controller.with_health_probe(self.config.varnish_port, health::DEFAULT_PROBE_TIMEOUT);
        }

        let report = controller.activate()?;
        if let Some(HealthStatus::Unreachable(reason)) = &report.health {
            warnings.push(format!(
                "{} is active but port {} is not answering yet ({}); check again with: curl -I http://{}:{}",
                SERVICE_UNIT, self.config.varnish_port, reason, self.config.server_ip, self.config.varnish_port
            ));
        }

        if self.config.deployment_mode == DeploymentMode::Hybrid && self.config.enable_monitoring {
            self.check_cancel()?;
            warnings.extend(self.start_monitoring());
        }

        Ok(Some(report))
    }

    /// Bring up tc-grafana.service. Every problem here is a warning.
    fn start_monitoring(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let docker = self.run_quiet(&DockerComposeVersion);
        if !docker.success {
            let msg = "Docker Compose is not available; the cache is running but monitoring was not started".to_string();
            warn!("{}", msg);
            warnings.push(msg);
            return warnings;
        }

        let steps = [
            Systemctl::daemon_reload(),
            Systemctl::unit(SystemctlAction::Enable, MONITORING_UNIT),
            Systemctl::unit(SystemctlAction::Start, MONITORING_UNIT),
        ];
        for step in &steps {
            let out = self.run_quiet(step);
            if !out.success {
                let msg = format!("{} failed: {}", step.describe(), out.stderr.trim());
                warn!("{}", msg);
                warnings.push(msg);
                return warnings;
            }
        }

        info!("Monitoring stack started ({})", MONITORING_UNIT);
        warnings
    }

    fn run_quiet(&self, cmd: &dyn HostCommand) -> CommandOutput {
        match self.runner.run(cmd) {
            Ok(out) => out,
            Err(e) => CommandOutput::failed(-1, format!("{:#}", e)),
        }
    }

    // ------------------------------------------------------------------------
    // Preview
    // ------------------------------------------------------------------------

    /// Everything `run` would generate, computed from discovery alone
    pub fn plan(&self) -> Result<PlanPreview> {
        let preflight = self.preflight()?;
        let mount_points = assign_mount_points(&self.host.mount_root, &preflight.descriptors)?;

        let assignments: Vec<MountAssignment> = preflight
            .descriptors
            .iter()
            .zip(mount_points)
            .map(|(desc, mount_point)| {
                let stable_id = match desc.mode() {
                    StorageMode::RawDevice => StableId::Uuid(PENDING_UUID.to_string()),
                    StorageMode::FilePath => StableId::Path(desc.path().to_path_buf()),
                };
                MountAssignment {
                    descriptor: desc.with_stable_id(stable_id),
                    mount_point,
                    already_active: false,
                }
            })
            .collect();

        let plan = layout::generate(&assignments, self.scheme())?;
        let host_dirs: Vec<PathBuf> = assignments.iter().map(|a| a.mount_point.clone()).collect();
        let artifacts = artifacts::collect(&self.config, &self.host, &plan, &host_dirs, &self.timestamp());

        Ok(PlanPreview {
            descriptors: preflight.descriptors,
            assignments,
            plan,
            artifacts,
            warnings: preflight.warnings,
        })
    }
}
