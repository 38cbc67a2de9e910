//! End-to-end deployment runs against a scripted host rooted in a temp dir

mod common;

use common::{ACTIVATING, FAILED, FakeRunner, RUNNING, all_present, raw_config, script_disk, temp_host};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use teamcache::command_runner::CommandOutput;
use teamcache::config_file::{DeployConfig, HostLayout};
use teamcache::deploy::{Deployer, PENDING_UUID};
use teamcache::error::DeployError;
use teamcache::inventory::available_bytes;
use teamcache::process_guard::CancelToken;
use teamcache::sanity::SanityCheckResult;
use teamcache::storage::{GIB, StableId};
use teamcache::types::{DeploymentMode, DeviceMode, StorageMode};
use tempfile::TempDir;

const STAMP: &str = "2026-10-15 12:00:00";

fn deployer<'a>(config: DeployConfig, host: HostLayout, runner: &'a FakeRunner) -> Deployer<'a> {
    Deployer::new(config, host, runner)
        .with_environment(all_present())
        .with_health_probe(false)
        .with_settle_delay(Duration::ZERO)
        .with_timestamp(STAMP)
}

fn script_fresh_disks(runner: &FakeRunner) {
    script_disk(runner, "/dev/sdb", 100, None, None);
    script_disk(runner, "/dev/sdc", 500, None, None);
    runner.on("blkid -s UUID -o value /dev/sdb", CommandOutput::ok("uuid-b\n"));
    runner.on("blkid -s UUID -o value /dev/sdc", CommandOutput::ok("uuid-c\n"));
}

#[test]
fn test_hybrid_deploy_formats_generates_and_activates() {
    let root = TempDir::new().unwrap();
    let host = temp_host(root.path());
    let runner = FakeRunner::new();
    script_fresh_disks(&runner);
    runner.on("systemctl status teamcache.service", CommandOutput::ok(RUNNING));

    let report = deployer(raw_config(&["/dev/sdb", "/dev/sdc"]), host.clone(), &runner)
        .run()
        .unwrap();

    assert_eq!(report.assignments.len(), 2);
    let sizes: Vec<u64> = report.plan.books.iter().map(|b| b.store_size_gib()).collect();
    assert_eq!(sizes, vec![90, 482]);
    assert_eq!(report.activation.as_ref().map(|a| a.attempts), Some(1));

    let mse4 = fs::read_to_string(host.varnish_dir.join("mse4.conf")).unwrap();
    assert!(mse4.contains(&host.mount_root.join("disk1").display().to_string()));
    assert!(mse4.contains("482G"));
    assert!(host.systemd_dir.join("teamcache.service").exists());
    assert!(host.varnish_dir.join("default.vcl").exists());

    let secret = host.varnish_dir.join("secret");
    let mode = fs::metadata(&secret).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o640);

    let mkfs = runner.position("mkfs.xfs").unwrap();
    let enable = runner.position("systemctl enable teamcache.service").unwrap();
    assert!(mkfs < enable);
    assert!(runner.called(&format!("chown -R varnish:varnish {}", secret.display())));
    assert!(report.summary().contains("Deployment complete [hybrid mode]"));
}

#[test]
fn test_validation_collects_every_problem_before_mutation() {
    let root = TempDir::new().unwrap();
    let host = temp_host(root.path());
    let runner = FakeRunner::new();
    script_disk(&runner, "/dev/sdb", 5, None, None);
    runner.on(
        "lsblk -J -b -o PATH,SIZE,FSTYPE,MOUNTPOINT,MODEL,TYPE /dev/sdz",
        CommandOutput::failed(32, "lsblk: /dev/sdz: not a block device"),
    );

    let mut config = raw_config(&["/dev/sdb", "/dev/sdz"]);
    config.server_ip = String::new();
    let env = SanityCheckResult {
        missing_binaries: vec!["mkfs.xfs".into()],
        missing_optional: Vec::new(),
        is_root: true,
    };

    let err = Deployer::new(config, host, &runner)
        .with_environment(env)
        .with_health_probe(false)
        .run()
        .unwrap_err();

    let DeployError::Validation(errors) = &err else {
        panic!("expected validation error, got {err}");
    };
    let text = errors.messages().join("\n");
    assert!(text.contains("SERVER_IP"), "{text}");
    assert!(text.contains("mkfs.xfs"), "{text}");
    assert!(text.contains("/dev/sdb"), "{text}");
    assert!(text.contains("/dev/sdz"), "{text}");
    assert_eq!(err.exit_code(), 2);
    assert!(!runner.called("wipefs"));
    assert!(!runner.called("systemctl"));
}

#[test]
fn test_foreign_mount_requires_opt_in() {
    let root = TempDir::new().unwrap();
    let host = temp_host(root.path());
    let runner = FakeRunner::new();
    script_disk(&runner, "/dev/sdb", 100, Some("xfs"), Some(&PathBuf::from("/mnt/old")));

    let err = deployer(raw_config(&["/dev/sdb"]), host, &runner).run().unwrap_err();

    assert!(err.to_string().contains("UNMOUNT_FOREIGN"));
    assert!(!runner.called("umount"));
}

#[test]
fn test_foreign_mount_is_released_with_opt_in() {
    let root = TempDir::new().unwrap();
    let host = temp_host(root.path());
    let runner = FakeRunner::new();
    // The first lsblk read sees the foreign mount; every later read sees it released
    script_disk(&runner, "/dev/sdb", 100, Some("xfs"), Some(&PathBuf::from("/mnt/old")));
    script_disk(&runner, "/dev/sdb", 100, Some("xfs"), None);
    runner.on("blkid -s UUID -o value /dev/sdb", CommandOutput::ok("uuid-b"));
    runner.on("systemctl status teamcache.service", CommandOutput::ok(RUNNING));

    let mut config = raw_config(&["/dev/sdb"]);
    config.unmount_foreign = true;
    let report = deployer(config, host, &runner).run().unwrap();

    let stop = runner.position("systemctl stop teamcache.service").unwrap();
    let umount = runner.position("umount /mnt/old").unwrap();
    let mkfs = runner.position("mkfs.xfs -f /dev/sdb").unwrap();
    assert!(stop < umount && umount < mkfs);
    assert_eq!(report.assignments.len(), 1);
}

#[test]
fn test_reuse_of_non_xfs_is_rejected_up_front() {
    let root = TempDir::new().unwrap();
    let host = temp_host(root.path());
    let runner = FakeRunner::new();
    script_disk(&runner, "/dev/sdb", 100, Some("ext4"), None);

    let mut config = raw_config(&["/dev/sdb"]);
    config.device_mode = DeviceMode::Reuse;
    config.auto_confirm = false;
    let err = deployer(config, host, &runner).run().unwrap_err();

    assert!(matches!(err, DeployError::Validation(_)));
    assert!(err.to_string().contains("ext4"));
    assert!(!runner.called("mount"));
}

#[test]
fn test_dry_run_changes_nothing() {
    let root = TempDir::new().unwrap();
    let host = temp_host(root.path());
    let fstab_before = fs::read_to_string(&host.fstab).unwrap();
    let runner = FakeRunner::dry_run();
    script_fresh_disks(&runner);

    let not_root = SanityCheckResult {
        missing_binaries: Vec::new(),
        missing_optional: Vec::new(),
        is_root: false,
    };
    let report = deployer(raw_config(&["/dev/sdb", "/dev/sdc"]), host.clone(), &runner)
        .with_environment(not_root)
        .run()
        .unwrap();

    assert!(report.dry_run);
    assert!(report.activation.is_none());
    assert!(report.warnings.iter().any(|w| w.contains("Root privileges")));
    assert_eq!(
        report.assignments[1].descriptor.stable_id(),
        Some(&StableId::Uuid("DRY-RUN-UUID-disk2".into()))
    );
    assert!(!report.files.is_empty());
    assert!(report.files.iter().all(|f| !f.exists()));
    assert_eq!(fs::read_to_string(&host.fstab).unwrap(), fstab_before);
    assert!(!runner.called("systemctl start"));
    assert!(report.summary().starts_with("Dry run complete"));
}

#[test]
fn test_failed_service_reports_hint_and_exit_code() {
    let root = TempDir::new().unwrap();
    let host = temp_host(root.path());
    let runner = FakeRunner::new();
    script_fresh_disks(&runner);
    runner.on(
        "systemctl status teamcache.service",
        CommandOutput::ok(format!("{}\nError: pull access denied for quay.io/varnish", FAILED)),
    );

    let err = deployer(raw_config(&["/dev/sdb"]), host.clone(), &runner).run().unwrap_err();

    assert_eq!(err.exit_code(), 4);
    assert!(err.to_string().contains("docker login"));
    assert!(host.varnish_dir.join("mse4.conf").exists(), "generated files are kept");
}

#[test]
fn test_activation_timeout_exit_code() {
    let root = TempDir::new().unwrap();
    let host = temp_host(root.path());
    let runner = FakeRunner::new();
    script_fresh_disks(&runner);
    runner.on("systemctl status teamcache.service", CommandOutput::ok(ACTIVATING));

    let mut config = raw_config(&["/dev/sdb"]);
    config.activation_attempts = 3;
    let err = deployer(config, host, &runner).run().unwrap_err();

    assert_eq!(err.exit_code(), 5);
    assert_eq!(runner.count("systemctl status teamcache.service"), 3);
}

#[test]
fn test_monitoring_problems_are_warnings() {
    let root = TempDir::new().unwrap();
    let host = temp_host(root.path());
    let runner = FakeRunner::new();
    script_fresh_disks(&runner);
    runner.on("systemctl status teamcache.service", CommandOutput::ok(RUNNING));
    runner.on("docker compose version", CommandOutput::failed(127, "docker: command not found"));

    let mut config = raw_config(&["/dev/sdb"]);
    config.enable_monitoring = true;
    config.grafana_password = Some("s3cret".into());
    let report = deployer(config, host.clone(), &runner).run().unwrap();

    assert!(report.warnings.iter().any(|w| w.contains("monitoring was not started")));
    assert!(!runner.called("systemctl start tc-grafana.service"));
    assert!(host.systemd_dir.join("tc-grafana.service").exists());
    assert!(report.summary().contains(":3000"));
}

#[test]
fn test_monitoring_stack_started_after_cache() {
    let root = TempDir::new().unwrap();
    let host = temp_host(root.path());
    let runner = FakeRunner::new();
    script_fresh_disks(&runner);
    runner.on("systemctl status teamcache.service", CommandOutput::ok(RUNNING));

    let mut config = raw_config(&["/dev/sdb"]);
    config.enable_monitoring = true;
    config.grafana_password = Some("s3cret".into());
    let report = deployer(config, host, &runner).run().unwrap();

    let cache = runner.position("systemctl start teamcache.service").unwrap();
    let grafana = runner.position("systemctl start tc-grafana.service").unwrap();
    assert!(cache < grafana);
    assert!(report.warnings.iter().all(|w| !w.contains("tc-grafana")));
}

#[test]
fn test_docker_mode_uses_container_paths() {
    let root = TempDir::new().unwrap();
    let host = temp_host(root.path());
    let runner = FakeRunner::new();
    script_fresh_disks(&runner);
    runner.on("systemctl status teamcache.service", CommandOutput::ok(RUNNING));

    let mut config = raw_config(&["/dev/sdb", "/dev/sdc"]);
    config.deployment_mode = DeploymentMode::Docker;
    deployer(config, host.clone(), &runner).run().unwrap();

    let mse4 = fs::read_to_string(host.install_dir.join("mse4.conf")).unwrap();
    assert!(mse4.contains("/var/lib/mse/disk2"));
    let compose = fs::read_to_string(host.install_dir.join("compose.yaml")).unwrap();
    assert!(compose.contains(&host.mount_root.join("disk1").display().to_string()));
    assert!(!host.varnish_dir.join("secret").exists());
    assert!(!runner.called("chown -R varnish:varnish"));
}

#[test]
fn test_plan_previews_without_mutation() {
    let root = TempDir::new().unwrap();
    let host = temp_host(root.path());
    let runner = FakeRunner::new();
    script_fresh_disks(&runner);

    let preview = deployer(raw_config(&["/dev/sdb", "/dev/sdc"]), host.clone(), &runner)
        .plan()
        .unwrap();

    assert_eq!(preview.plan.books.len(), 2);
    assert_eq!(
        preview.assignments[0].descriptor.stable_id(),
        Some(&StableId::Uuid(PENDING_UUID.into()))
    );
    assert!(preview.artifacts.get(&host.varnish_dir.join("mse4.conf")).is_some());
    assert!(!host.varnish_dir.join("mse4.conf").exists());
    assert!(runner.calls().iter().all(|c| c.starts_with("lsblk")));
}

#[test]
fn test_cancel_before_provisioning_is_interrupted() {
    let root = TempDir::new().unwrap();
    let host = temp_host(root.path());
    let runner = FakeRunner::new();
    script_fresh_disks(&runner);
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = deployer(raw_config(&["/dev/sdb"]), host, &runner)
        .with_cancel(cancel)
        .run()
        .unwrap_err();

    assert!(matches!(err, DeployError::Interrupted));
    assert_eq!(err.exit_code(), 130);
    assert!(!runner.called("wipefs"));
}

#[test]
fn test_rerun_adopts_provisioned_disks() {
    let root = TempDir::new().unwrap();
    let host = temp_host(root.path());
    let runner = FakeRunner::new();
    let disk1 = host.mount_root.join("disk1");
    script_disk(&runner, "/dev/sdb", 100, Some("xfs"), Some(&disk1));
    runner.on("blkid -s UUID -o value /dev/sdb", CommandOutput::ok("uuid-b"));
    runner.on("systemctl status teamcache.service", CommandOutput::ok(RUNNING));

    let report = deployer(raw_config(&["/dev/sdb"]), host, &runner).run().unwrap();

    assert!(report.assignments[0].already_active);
    assert!(!runner.called("wipefs"));
    assert!(report.summary().contains("[reused]"));
}

#[test]
fn test_reordered_devices_never_format_over_a_live_slot() {
    let root = TempDir::new().unwrap();
    let host = temp_host(root.path());
    let fstab_before = fs::read_to_string(&host.fstab).unwrap();
    let runner = FakeRunner::new();
    let disk1 = host.mount_root.join("disk1");
    script_disk(&runner, "/dev/sdd", 100, None, None);
    script_disk(&runner, "/dev/sdb", 100, Some("xfs"), Some(&disk1));
    runner.on(&format!("findmnt -n -o SOURCE {}", disk1.display()), CommandOutput::ok("/dev/sdb\n"));

    let err = deployer(raw_config(&["/dev/sdd", "/dev/sdb"]), host.clone(), &runner)
        .run()
        .unwrap_err();

    let DeployError::Validation(errors) = &err else {
        panic!("expected validation error, got {err}");
    };
    let text = errors.messages().join("\n");
    assert!(text.contains("/dev/sdb"), "{text}");
    assert!(text.contains(&disk1.display().to_string()), "{text}");
    assert!(text.contains(&host.mount_root.join("disk2").display().to_string()), "{text}");
    assert_eq!(err.exit_code(), 2);
    assert!(!runner.called("wipefs"));
    assert!(!runner.called("mkfs.xfs"));
    assert!(!runner.called("mount "));
    assert_eq!(fs::read_to_string(&host.fstab).unwrap(), fstab_before);
}

fn fill(path: &std::path::Path, bytes: usize) {
    let mut file = fs::File::create(path).unwrap();
    file.write_all(&vec![0xA5u8; bytes]).unwrap();
    file.sync_all().unwrap();
}

#[test]
fn test_filepath_rerun_keeps_the_same_plan() {
    let root = TempDir::new().unwrap();
    if available_bytes(root.path()).unwrap() < 12 * GIB {
        eprintln!("skipping: temp filesystem has less than 12 GiB free");
        return;
    }
    let host = temp_host(root.path());
    let store_dir = root.path().join("srv/cache");
    let mut config = raw_config(&[store_dir.to_str().unwrap()]);
    config.storage_mode = StorageMode::FilePath;

    let runner = FakeRunner::new();
    runner.on("systemctl status teamcache.service", CommandOutput::ok(RUNNING));
    let first = deployer(config.clone(), host.clone(), &runner).run().unwrap();
    assert!(!first.assignments[0].already_active);

    // The running cache preallocates its files inside the directory
    fill(&store_dir.join("book"), 4 << 20);
    fill(&store_dir.join("store"), 64 << 20);

    let runner = FakeRunner::new();
    runner.on("systemctl status teamcache.service", CommandOutput::ok(RUNNING));
    let second = deployer(config, host, &runner).run().unwrap();

    assert!(second.assignments[0].already_active);
    assert_eq!(first.plan, second.plan);
}
