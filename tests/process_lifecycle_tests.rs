//! Host command lifecycle on a real system
//!
//! These verify that:
//! 1. Commands spawned with `in_new_process_group()` lead their own group
//! 2. Signalling the group reaches grandchildren (an interrupted `mkfs` wrapper
//!    must not leave the real tool running)
//! 3. `SystemRunner` reports exit status and spawn failures faithfully

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, getpgid};
use teamcache::command_runner::{CommandRunner, SystemRunner};
use teamcache::command_traits::HostCommand;
use teamcache::process_guard::{CancelToken, CommandProcessGroup};

fn is_process_alive(pid: i32) -> bool {
    if kill(Pid::from_raw(pid), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !matches!(stat.split_whitespace().nth(2), Some("Z" | "X")),
        Err(_) => false,
    }
}

fn wait_for_death(pid: i32, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !is_process_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

struct Shell(&'static str);

impl HostCommand for Shell {
    fn program(&self) -> &'static str {
        "sh"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["-c".to_string(), self.0.to_string()]
    }

    fn is_mutating(&self) -> bool {
        true
    }
}

struct Missing;

impl HostCommand for Missing {
    fn program(&self) -> &'static str {
        "teamcache-no-such-binary"
    }

    fn to_cli_args(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_mutating(&self) -> bool {
        false
    }
}

#[test]
fn test_child_leads_its_own_process_group() {
    let mut child = Command::new("sleep")
        .arg("1000")
        .stdin(Stdio::null())
        .in_new_process_group()
        .spawn()
        .expect("spawn sleep");
    let pid = child.id() as i32;

    let pgid = getpgid(Some(Pid::from_raw(pid))).expect("getpgid");
    assert_eq!(pgid.as_raw(), pid);

    let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
    let _ = child.wait();
}

#[test]
fn test_group_signal_reaches_grandchildren() {
    let mut parent = Command::new("sh")
        .args(["-c", "sleep 1000 & echo $!; wait"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .in_new_process_group()
        .spawn()
        .expect("spawn sh");

    let mut line = String::new();
    {
        use std::io::BufRead;
        let stdout = parent.stdout.take().expect("piped stdout");
        std::io::BufReader::new(stdout).read_line(&mut line).expect("read grandchild pid");
    }
    let grandchild: i32 = line.trim().parse().expect("pid");
    assert!(is_process_alive(grandchild));

    kill(Pid::from_raw(-(parent.id() as i32)), Signal::SIGTERM).expect("group kill");
    let _ = parent.wait();

    assert!(wait_for_death(grandchild, Duration::from_secs(3)), "grandchild survived group SIGTERM");
}

#[test]
fn test_runner_reports_exit_status_and_streams() {
    let runner = SystemRunner::new(false, CancelToken::new());
    let out = runner.run(&Shell("echo out; echo err >&2; exit 3")).unwrap();

    assert!(!out.success);
    assert_eq!(out.exit_code, Some(3));
    assert_eq!(out.stdout.trim(), "out");
    assert_eq!(out.stderr.trim(), "err");
}

#[test]
fn test_runner_spawn_failure_is_an_error() {
    let runner = SystemRunner::new(false, CancelToken::new());
    let err = runner.run(&Missing).unwrap_err();
    assert!(format!("{:#}", err).contains("teamcache-no-such-binary"));
}

#[test]
fn test_dry_run_runner_never_spawns_mutations() {
    let dir = tempfile::TempDir::new().unwrap();
    let marker = dir.path().join("ran");
    let script: &'static str = Box::leak(format!("touch {}", marker.display()).into_boxed_str());

    let runner = SystemRunner::new(true, CancelToken::new());
    let out = runner.run(&Shell(script)).unwrap();

    assert!(out.dry_run);
    assert!(out.stdout.starts_with("[DRY RUN] Skipped: sh -c touch"));
    assert!(!marker.exists());
}
