//! systemd unit generation
//!
//! `teamcache.service` comes in two shapes: a native varnishd unit for
//! hybrid deployments and a thin `docker compose` wrapper for docker mode.
//! Both are rendered whole; regenerating replaces the file, it never patches it.

use crate::engine::layout::LayoutPlan;
use std::path::{Path, PathBuf};

/// Unit name managed by the activation controller
pub const SERVICE_UNIT: &str = "teamcache.service";

/// Unit running the monitoring compose stack
pub const MONITORING_UNIT: &str = "tc-grafana.service";

/// Knobs that end up on the varnishd command line and in the limits section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTunables {
    pub listen_port: u16,
    pub admin_listen: String,
    pub secret_file: PathBuf,
    pub vcl_file: PathBuf,
    pub mse4_conf: PathBuf,
    pub nofile_limit: u64,
    pub memlock_limit: String,
    pub thread_pool_min: u32,
    pub thread_pool_max: u32,
}

impl ServiceTunables {
    /// Stock tunables with config files under `varnish_dir`
    pub fn new(listen_port: u16, admin_listen: impl Into<String>, varnish_dir: &Path) -> Self {
        Self {
            listen_port,
            admin_listen: admin_listen.into(),
            secret_file: varnish_dir.join("secret"),
            vcl_file: varnish_dir.join("default.vcl"),
            mse4_conf: varnish_dir.join("mse4.conf"),
            nofile_limit: 131072,
            memlock_limit: "100M".to_string(),
            thread_pool_min: 50,
            thread_pool_max: 1000,
        }
    }
}

/// Shell loop handing every book directory to the varnish user after mkfs.mse4 ran as root
fn ownership_fixup(plan: &LayoutPlan) -> String {
    let dirs: Vec<String> = plan
        .base_paths()
        .iter()
        .map(|p| format!("\"{}\"", p.display()))
        .collect();
    format!(
        "for dir in {}; do [ -d \"$dir\" ] && chown -R varnish:varnish \"$dir\" && restorecon -R \"$dir\"; done",
        dirs.join(" ")
    )
}

/// Native varnishd unit for hybrid deployments
pub fn render_service_unit(plan: &LayoutPlan, tunables: &ServiceTunables) -> String {
    let exec_args = [
        format!("-a :{}", tunables.listen_port),
        format!("-T {}", tunables.admin_listen),
        format!("-S {}", tunables.secret_file.display()),
        "-p feature=+http2".to_string(),
        format!("-p thread_pool_max={}", tunables.thread_pool_max),
        format!("-p thread_pool_min={}", tunables.thread_pool_min),
        "-r vcc_allow_inline_c".to_string(),
        "-r allow_exec".to_string(),
        format!("-f {}", tunables.vcl_file.display()),
        format!("-s mse4,{}", tunables.mse4_conf.display()),
    ];
    let exec_start = exec_args
        .iter()
        .map(|a| format!("\t  {}", a))
        .collect::<Vec<_>>()
        .join(" \\\n");

    format!(
        r#"[Unit]
Description=Varnish Cache Plus, a high-performance HTTP accelerator
After=network-online.target nss-lookup.target

[Service]
Type=forking
KillMode=process

# Maximum number of open files (for ulimit -n)
LimitNOFILE={nofile}

# Shared memory (VSM) segments are tentatively locked in memory.
LimitMEMLOCK={memlock}

# Avoid "fork failed" on reload
TasksMax=infinity
LimitCORE=infinity
LimitNPROC=infinity

# Large persisted caches need a long start-up window
TimeoutStartSec=720
TimeoutStopSec=300

# Configure MSE4 storage (creates book and store files as root)
ExecStartPre=/usr/bin/mkfs.mse4 -c {mse4} configure
# Fix ownership and SELinux context after mkfs.mse4 creates files
ExecStartPre=/usr/bin/bash -c '{fixup}'

ExecStart=/usr/sbin/varnishd \
{exec_start}
ExecReload=/usr/sbin/varnishreload

[Install]
WantedBy=multi-user.target
"#,
        nofile = tunables.nofile_limit,
        memlock = tunables.memlock_limit,
        mse4 = tunables.mse4_conf.display(),
        fixup = ownership_fixup(plan),
        exec_start = exec_start,
    )
}

/// `teamcache.service` wrapping `compose.yaml` in `install_dir` (docker mode)
pub fn render_compose_unit(install_dir: &Path) -> String {
    format!(
        r#"[Unit]
Description=TeamCache (Varnish Enterprise with MSE4, Docker Compose)
After=network-online.target docker.service
Requires=docker.service

[Service]
Type=simple
WorkingDirectory={dir}
ExecStart=/usr/bin/env docker compose -f compose.yaml up
ExecStop=/usr/bin/env docker compose -f compose.yaml down
Restart=on-failure
TimeoutStartSec=0

[Install]
WantedBy=multi-user.target
"#,
        dir = install_dir.display()
    )
}

/// `tc-grafana.service` running the monitoring stack from `install_dir`
pub fn render_monitoring_unit(install_dir: &Path) -> String {
    format!(
        r#"[Unit]
Description=TeamCache Monitoring Stack (Prometheus + Grafana)
After=network.target docker.service
Requires=docker.service

[Service]
Type=simple
RemainAfterExit=true
WorkingDirectory={dir}
ExecStart=/usr/bin/env docker compose -f monitoring-compose.yaml up
ExecStop=/usr/bin/env docker compose -f monitoring-compose.yaml down
TimeoutStartSec=0

[Install]
WantedBy=multi-user.target
"#,
        dir = install_dir.display()
    )
}
