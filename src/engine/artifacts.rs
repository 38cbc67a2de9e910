//! Generated files besides `mse4.conf` and the service unit
//!
//! [`collect`] assembles the full set of files a deployment writes, in write
//! order, without touching the disk. [`ArtifactWriter`] then puts them in
//! place: every file is replaced whole, except the admin secret, which is
//! only created when absent so existing CLI clients keep working.

use crate::config_file::{DeployConfig, HostLayout};
use crate::engine::layout::{CONTAINER_STORAGE_ROOT, LayoutPlan};
use crate::engine::unit::{
    MONITORING_UNIT, SERVICE_UNIT, ServiceTunables, render_compose_unit, render_monitoring_unit,
    render_service_unit,
};
use crate::types::DeploymentMode;
use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const GRAFANA_PORT: u16 = 3000;
pub const PROMETHEUS_PORT: u16 = 9090;

/// VCL shipped with every deployment. Traffic is routed by Host header to a
/// TLS backend; only GETs are cached and range requests are keyed by range.
pub const DEFAULT_VCL: &str = r#"vcl 4.1;
import uri;
import std;
import utils;
import goto;
import accounting;
import stat;

backend default none;

sub vcl_init {
	accounting.create_namespace("lucid");
}

sub vcl_recv {
	set req.url = uri.decode(req.url);
	accounting.set_namespace("lucid");

	if (req.method != "GET" &&
		req.method != "HEAD" &&
		req.method != "PUT" &&
		req.method != "POST" &&
		req.method != "TRACE" &&
		req.method != "OPTIONS" &&
		req.method != "DELETE" &&
		req.method != "PATCH") {
		return (synth(405));
	}

	if (req.url == "/metrics") {
		return(pass);
	}

	unset req.http.x-method;
	set req.http.x-method = req.method;

	accounting.add_keys(req.method);

	if (req.method != "GET") {
		return (pass);
	}

	# AWSv4 signs the Range header, so carry it to the backend untouched
	unset req.http.x-range;
	if (req.http.Range) {
		set req.http.x-range = req.http.Range;
		unset req.http.Range;
	}
	return (hash);
}

sub vcl_hash {
	hash_data(req.method);
	hash_data(req.http.x-range);
}

sub vcl_backend_fetch {
	if (bereq.url == "/metrics") {
		set bereq.backend = stat.backend_prometheus();
		return(fetch);
	}

	if (bereq.http.x-method) {
		set bereq.method = bereq.http.x-method;
		unset bereq.http.x-method;
	}

	if (bereq.http.x-range) {
		set bereq.http.range = bereq.http.x-range;
		unset bereq.http.x-range;
	}

	set bereq.backend = goto.dns_backend(bereq.http.host, ssl=true);
}

sub vcl_backend_response {
	if (beresp.status == 200 || beresp.status == 206 || beresp.status == 304) {
		unset beresp.http.cache-control;
		unset beresp.http.expires;
		set beresp.ttl = 10y;
	}
}
"#;

// ============================================================================
// Renderers
// ============================================================================

/// Admin CLI secret: a random v4 UUID and a trailing newline
pub fn generate_secret() -> String {
    format!("{}\n", uuid::Uuid::new_v4())
}

/// One `KEY=value` item of a compose `environment:` list, as a double-quoted
/// YAML scalar. `$` is doubled so compose does not interpolate it.
pub fn compose_env_item(key: &str, value: &str) -> String {
    serde_json::Value::String(format!("{}={}", key, value.replace('$', "$$"))).to_string()
}

/// Grafana's ini reader only keeps `#` and `;` inside triple quotes
pub fn render_grafana_ini(admin_password: &str, generated_at: &str) -> String {
    format!(
        r#"# Grafana Configuration
# Generated by teamcache-deploy on {generated_at}

[server]
http_port = {GRAFANA_PORT}

[security]
admin_user = admin
admin_password = """{admin_password}"""

[auth.anonymous]
enabled = true
org_role = Viewer

[dashboards]
default_home_dashboard_path = /etc/grafana/provisioning/dashboards/varnish_metrics.json

[paths]
provisioning = /etc/grafana/provisioning

[log]
mode = console
level = info

[alerting]
enabled = false

[users]
allow_sign_up = false
"#
    )
}

/// Prometheus scrapes varnish on its in-network port, not the published one
pub fn render_prometheus_yml() -> String {
    r#"global:
  scrape_interval: 5s

scrape_configs:
  - job_name: varnish
    static_configs:
      - targets: ["varnish:80"]
"#
    .to_string()
}

/// Prometheus and Grafana only, for hybrid deployments
pub fn render_monitoring_compose(admin_password: &str, server_ip: &str, generated_at: &str) -> String {
    let password_env = compose_env_item("GF_SECURITY_ADMIN_PASSWORD", admin_password);
    format!(
        r#"# Monitoring Stack Compose Configuration
# Generated by teamcache-deploy on {generated_at}

services:
  prometheus:
    image: prom/prometheus:latest
    container_name: prometheus
    ports:
      - "{PROMETHEUS_PORT}:9090"
    volumes:
      - ./conf/prometheus.yml:/etc/prometheus/prometheus.yml:ro
      - prometheus_data:/prometheus
    command:
      - '--config.file=/etc/prometheus/prometheus.yml'
      - '--storage.tsdb.path=/prometheus'
      - '--web.console.libraries=/usr/share/prometheus/console_libraries'
      - '--web.console.templates=/usr/share/prometheus/consoles'
    restart: unless-stopped

  grafana:
    image: grafana/grafana:latest
    container_name: grafana
    ports:
      - "{GRAFANA_PORT}:3000"
    environment:
      - {password_env}
      - GF_SERVER_ROOT_URL=http://{server_ip}:{GRAFANA_PORT}
    volumes:
      - ./conf/grafana/grafana.ini:/etc/grafana/grafana.ini:ro
      - ./conf/grafana/provisioning:/etc/grafana/provisioning:ro
      - grafana_data:/var/lib/grafana
    depends_on:
      - prometheus
    restart: unless-stopped

volumes:
  prometheus_data:
  grafana_data:
"#
    )
}

const VARNISH_IMAGE_BUILD: &str = r#"    build:
      dockerfile_inline: |
        FROM debian:bookworm-slim
        RUN set -ex; \
          apt-get update; \
          apt-get install -y curl; \
          curl -s https://packagecloud.io/install/repositories/varnishplus/60-enterprise/script.deb.sh | bash; \
          apt-get install -y varnish-plus
"#;

/// Full docker-mode stack. `host_dirs` are the provisioned locations in book order.
pub fn render_compose_yaml(
    host_dirs: &[PathBuf],
    listen_port: u16,
    monitoring_password: Option<&str>,
    generated_at: &str,
) -> String {
    let storage_volumes: String = host_dirs
        .iter()
        .enumerate()
        .map(|(i, dir)| format!("      - {}:{}/disk{}\n", dir.display(), CONTAINER_STORAGE_ROOT, i + 1))
        .collect();
    let chowns: String = (1..=host_dirs.len())
        .map(|i| format!("        chown -R varnish:varnish {}/disk{}\n", CONTAINER_STORAGE_ROOT, i))
        .collect();

    let mut out = format!(
        "# Docker Compose Configuration for TeamCache\n# Generated by teamcache-deploy on {}\n# Number of storage devices: {}\n\nservices:\n",
        generated_at,
        host_dirs.len()
    );

    out.push_str("  mse4_check:\n");
    out.push_str(VARNISH_IMAGE_BUILD);
    out.push_str(
        r#"    volumes:
      - ./mse4.conf:/etc/varnish/mse4.conf
      - ./varnish-enterprise.lic:/etc/varnish/varnish-enterprise.lic
    entrypoint: []
    user: root
    command: mkfs.mse4 check-config -c /etc/varnish/mse4.conf

  varnish_pre:
"#,
    );
    out.push_str(VARNISH_IMAGE_BUILD);
    out.push_str(
        r#"    container_name: varnish_pre
    depends_on:
      mse4_check:
        condition: service_completed_successfully
    volumes:
"#,
    );
    out.push_str(&storage_volumes);
    out.push_str(
        r#"      - ./varnish-enterprise.lic:/etc/varnish/varnish-enterprise.lic
    entrypoint: []
    user: root
    command: |
      sh -c '
        echo "Setting permissions for MSE directories..."
"#,
    );
    out.push_str(&chowns);
    out.push_str(
        r#"        echo "MSE permissions set"
      '

  varnish:
    depends_on:
      varnish_pre:
        condition: service_completed_successfully
"#,
    );
    out.push_str(VARNISH_IMAGE_BUILD);
    out.push_str(&format!(
        r#"    hostname: varnish
    container_name: varnish
    ports:
      - "{listen_port}:80"
    environment:
      - MSE4_CONFIG=/etc/varnish/mse4.conf
      - MSE4_CACHE_FORCE_PRESERVE=0
      - VARNISH_ADMIN_LISTEN_ADDRESS=127.0.0.1
      - VARNISH_ADMIN_LISTEN_PORT=6082
      - VARNISH_LISTEN_PORT=80
      - VARNISH_MAX_THREADS=1000
      - VARNISH_MIN_THREADS=50
      - VARNISH_SECRET_FILE=/etc/varnish/secret
      - VARNISH_THREAD_TIMEOUT=120
      - VARNISH_TTL=120
      - VARNISH_VCL_CONF=/etc/varnish/default.vcl
    volumes:
      - workdir:/var/lib/varnish
      - ./mse4.conf:/etc/varnish/mse4.conf:ro
      - ./conf/default.vcl:/etc/varnish/default.vcl:ro
      - ./varnish-enterprise.lic:/etc/varnish/varnish-enterprise.lic
      - ./entrypoint.sh:/entrypoint.sh
"#
    ));
    out.push_str(&storage_volumes);
    out.push_str(
        r#"    ulimits:
      memlock:
        soft: -1
        hard: -1
    command: ["bash", "/entrypoint.sh"]
"#,
    );

    if let Some(password) = monitoring_password {
        let password_env = compose_env_item("GF_SECURITY_ADMIN_PASSWORD", password);
        out.push_str(&format!(
            r#"
  prometheus:
    image: prom/prometheus:v2.53.0
    container_name: prometheus
    volumes:
      - ./conf/prometheus.yml:/etc/prometheus/prometheus.yml:ro
      - prometheus_data:/prometheus
    command: --config.file=/etc/prometheus/prometheus.yml --storage.tsdb.path=/prometheus --enable-feature=native-histograms --storage.tsdb.retention.time=6d
    ports:
      - "{PROMETHEUS_PORT}:9090"

  grafana:
    image: grafana/grafana-enterprise
    container_name: grafana
    ports:
      - "{GRAFANA_PORT}:3000"
    environment:
      - {password_env}
      - GF_SECURITY_ADMIN_USER=admin
      - GF_AUTH_ANONYMOUS_ENABLED=true
      - GF_AUTH_ANONYMOUS_ORG_ROLE=Viewer
    volumes:
      - ./conf/grafana/grafana.ini:/etc/grafana/grafana.ini:ro
      - ./conf/grafana/provisioning:/etc/grafana/provisioning:ro
      - grafana_data:/var/lib/grafana
"#
        ));
    }

    out.push_str(
        r#"
volumes:
  workdir:
    driver: local
    driver_opts:
      type: tmpfs
      device: tmpfs
"#,
    );
    if monitoring_password.is_some() {
        out.push_str("  prometheus_data:\n  grafana_data:\n");
    }
    out
}

/// Container entrypoint: lay out MSE4 storage, then run varnishd in the foreground
pub fn render_entrypoint() -> String {
    r#"#!/bin/bash
set -e

if [ ! -s /etc/varnish/secret ]; then
    cat /proc/sys/kernel/random/uuid > /etc/varnish/secret
    chmod 0640 /etc/varnish/secret
fi

mkfs.mse4 -c /etc/varnish/mse4.conf configure

exec varnishd -F \
    -a :80 \
    -T 127.0.0.1:6082 \
    -S /etc/varnish/secret \
    -p feature=+http2 \
    -p thread_pool_max=1000 \
    -p thread_pool_min=50 \
    -f /etc/varnish/default.vcl \
    -s mse4,/etc/varnish/mse4.conf
"#
    .to_string()
}

// ============================================================================
// Artifact set
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    Overwrite,
    /// Keep an existing file untouched
    CreateOnly,
}

/// One file to put on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub contents: String,
    pub mode: u32,
    pub policy: WritePolicy,
}

impl Artifact {
    pub fn file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            mode: 0o644,
            policy: WritePolicy::Overwrite,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn create_only(mut self) -> Self {
        self.policy = WritePolicy::CreateOnly;
        self
    }

    /// Secrets are never echoed, even in plan output
    pub fn is_secret(&self) -> bool {
        self.mode & 0o004 == 0
    }
}

/// Everything a deployment writes, in order
#[derive(Debug, Clone, Default)]
pub struct ArtifactSet {
    pub directories: Vec<PathBuf>,
    pub files: Vec<Artifact>,
}

impl ArtifactSet {
    pub fn paths(&self) -> Vec<&Path> {
        self.files.iter().map(|a| a.path.as_path()).collect()
    }

    pub fn get(&self, path: &Path) -> Option<&Artifact> {
        self.files.iter().find(|a| a.path == path)
    }

    pub fn secret_path(host: &HostLayout) -> PathBuf {
        host.varnish_dir.join("secret")
    }
}

/// Assemble every generated file for `config`.
///
/// `host_dirs` are the provisioned locations in book order; docker mode
/// bind-mounts them into the containers.
pub fn collect(
    config: &DeployConfig,
    host: &HostLayout,
    plan: &LayoutPlan,
    host_dirs: &[PathBuf],
    generated_at: &str,
) -> ArtifactSet {
    let mut set = ArtifactSet::default();
    let mse4 = plan.render_mse4_conf(generated_at);
    let monitoring = if config.enable_monitoring {
        config.grafana_password.as_deref()
    } else {
        None
    };

    match config.deployment_mode {
        DeploymentMode::Hybrid => {
            let tunables = ServiceTunables::new(config.varnish_port, &config.admin_listen, &host.varnish_dir);
            set.files.push(
                Artifact::file(ArtifactSet::secret_path(host), generate_secret())
                    .with_mode(0o640)
                    .create_only(),
            );
            set.files.push(Artifact::file(&tunables.vcl_file, DEFAULT_VCL));
            set.files.push(Artifact::file(&tunables.mse4_conf, mse4));
            set.files.push(Artifact::file(
                host.systemd_dir.join(SERVICE_UNIT),
                render_service_unit(plan, &tunables),
            ));

            if let Some(password) = monitoring {
                push_monitoring_config(&mut set, host, password, generated_at);
                set.files.push(Artifact::file(
                    host.install_dir.join("monitoring-compose.yaml"),
                    render_monitoring_compose(password, &config.server_ip, generated_at),
                ));
                set.files.push(Artifact::file(
                    host.systemd_dir.join(MONITORING_UNIT),
                    render_monitoring_unit(&host.install_dir),
                ));
            }
        }
        DeploymentMode::Docker => {
            set.directories.push(host.install_dir.join("conf"));
            set.files.push(Artifact::file(host.install_dir.join("mse4.conf"), mse4));
            set.files.push(Artifact::file(host.install_dir.join("conf/default.vcl"), DEFAULT_VCL));
            set.files.push(Artifact::file(host.install_dir.join("entrypoint.sh"), render_entrypoint()).with_mode(0o755));
            if let Some(password) = monitoring {
                push_monitoring_config(&mut set, host, password, generated_at);
            }
            set.files.push(Artifact::file(
                host.install_dir.join("compose.yaml"),
                render_compose_yaml(host_dirs, config.varnish_port, monitoring, generated_at),
            ));
            set.files.push(Artifact::file(
                host.systemd_dir.join(SERVICE_UNIT),
                render_compose_unit(&host.install_dir),
            ));
        }
    }

    set
}

fn push_monitoring_config(set: &mut ArtifactSet, host: &HostLayout, password: &str, generated_at: &str) {
    let grafana = host.install_dir.join("conf/grafana");
    set.directories.push(grafana.join("provisioning/dashboards"));
    set.directories.push(grafana.join("provisioning/datasources"));
    set.files.push(Artifact::file(grafana.join("grafana.ini"), render_grafana_ini(password, generated_at)).with_mode(0o640));
    set.files.push(Artifact::file(host.install_dir.join("conf/prometheus.yml"), render_prometheus_yml()));
}

// ============================================================================
// Writer
// ============================================================================

/// Puts artifacts on disk, or only logs them in dry-run mode
#[derive(Debug)]
pub struct ArtifactWriter {
    dry_run: bool,
    written: Vec<PathBuf>,
}

impl ArtifactWriter {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            written: Vec::new(),
        }
    }

    /// Paths written (or that would have been, in dry-run) so far
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    pub fn write_set(&mut self, set: &ArtifactSet) -> Result<()> {
        for dir in &set.directories {
            self.ensure_dir(dir)?;
        }
        for artifact in &set.files {
            self.write(artifact)?;
        }
        Ok(())
    }

    pub fn ensure_dir(&self, dir: &Path) -> Result<()> {
        if self.dry_run {
            info!("[DRY RUN] Skipped: mkdir -p {}", dir.display());
            return Ok(());
        }
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))
    }

    /// Write one artifact. Returns false if a create-only file already existed.
    pub fn write(&mut self, artifact: &Artifact) -> Result<bool> {
        let path = &artifact.path;
        if artifact.policy == WritePolicy::CreateOnly && path.exists() {
            info!("{} already exists, keeping it", path.display());
            return Ok(false);
        }

        if self.dry_run {
            info!(
                "[DRY RUN] Skipped: write {} ({} bytes, mode {:o})",
                path.display(),
                artifact.contents.len(),
                artifact.mode
            );
            self.written.push(path.clone());
            return Ok(true);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, &artifact.contents).with_context(|| format!("Failed to write {}", path.display()))?;
        fs::set_permissions(path, fs::Permissions::from_mode(artifact.mode))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;

        debug!("Wrote {} ({} bytes)", path.display(), artifact.contents.len());
        info!("Generated {}", path.display());
        self.written.push(path.clone());
        Ok(true)
    }
}
