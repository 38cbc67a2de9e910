//! Service activation polling and the endpoint health check

mod common;

use common::{ACTIVATING, FAILED, FakeRunner, RUNNING};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;
use teamcache::activation::{ActivationController, ActivationError, ServiceActivationState};
use teamcache::command_runner::{CommandOutput, CommandRunner};
use teamcache::command_traits::HostCommand;
use teamcache::health::HealthStatus;
use teamcache::process_guard::CancelToken;

/// Delivers a "signal" while a matching command runs: the token is cancelled
/// and the command reports the killed-child result.
struct SignalDuring<'a> {
    inner: &'a FakeRunner,
    prefix: &'static str,
    cancel: CancelToken,
}

impl CommandRunner for SignalDuring<'_> {
    fn run(&self, command: &dyn HostCommand) -> anyhow::Result<CommandOutput> {
        let out = self.inner.run(command)?;
        if command.describe().starts_with(self.prefix) {
            self.cancel.cancel();
            return Ok(CommandOutput::failed(-1, ""));
        }
        Ok(out)
    }

    fn is_dry_run(&self) -> bool {
        false
    }
}

fn controller(runner: &FakeRunner) -> ActivationController<'_> {
    ActivationController::new(runner, "teamcache.service").with_interval(Duration::ZERO)
}

#[test]
fn test_verify_polls_without_starting() {
    let runner = FakeRunner::new();
    runner.on("systemctl status teamcache.service", CommandOutput::ok(ACTIVATING));
    runner.on("systemctl status teamcache.service", CommandOutput::ok(RUNNING));

    let report = controller(&runner).verify().unwrap();

    assert_eq!(report.attempts, 2);
    assert!(!runner.called("systemctl start"));
    assert!(!runner.called("systemctl enable"));
}

#[test]
fn test_activate_order() {
    let runner = FakeRunner::new();
    runner.on("systemctl status teamcache.service", CommandOutput::ok(RUNNING));

    controller(&runner).activate().unwrap();

    let calls = runner.calls();
    assert_eq!(
        calls,
        vec![
            "systemctl daemon-reload",
            "systemctl enable teamcache.service",
            "systemctl start teamcache.service",
            "systemctl status teamcache.service --no-pager",
        ]
    );
}

#[test]
fn test_enable_failure_is_fatal() {
    let runner = FakeRunner::new();
    runner.on("systemctl enable teamcache.service", CommandOutput::failed(1, "Unit not found"));

    let err = controller(&runner).activate().unwrap_err();

    assert!(matches!(err, ActivationError::Command(_)));
    assert!(!runner.called("systemctl status"));
}

#[test]
fn test_start_error_still_classified_by_status() {
    let runner = FakeRunner::new();
    runner.on("systemctl start teamcache.service", CommandOutput::failed(1, "Job failed"));
    runner.on(
        "systemctl status teamcache.service",
        CommandOutput::ok(format!("{}\nmkfs.mse4: book size mismatch", FAILED)),
    );

    let mut ctl = controller(&runner);
    let err = ctl.activate().unwrap_err();

    match err {
        ActivationError::Failed { attempt, hint, .. } => {
            assert_eq!(attempt, 1);
            assert!(hint.contains("MSE4"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(ctl.state(), ServiceActivationState::Failed);
}

#[test]
fn test_timeout_keeps_last_status() {
    let runner = FakeRunner::new();
    runner.on("systemctl status teamcache.service", CommandOutput::ok(ACTIVATING));

    let err = controller(&runner).with_attempts(4).verify().unwrap_err();

    assert!(matches!(err, ActivationError::Timeout { attempts: 4, .. }));
    assert_eq!(err.last_status(), Some(ACTIVATING));
    assert_eq!(runner.count("systemctl status"), 4);
}

#[test]
fn test_cancelled_poll_is_interrupted() {
    let runner = FakeRunner::new();
    runner.on("systemctl status teamcache.service", CommandOutput::ok(ACTIVATING));
    let cancel = CancelToken::new();
    cancel.cancel();

    let mut ctl = controller(&runner).with_cancel(cancel);
    let err = ctl.verify().unwrap_err();

    assert_eq!(err, ActivationError::Interrupted { attempts: 0 });
    assert_eq!(ctl.state(), ServiceActivationState::Interrupted);
    assert!(runner.calls().is_empty());
}

#[test]
fn test_health_check_runs_after_active() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        if let Ok((mut conn, _)) = listener.accept() {
            let mut buf = [0u8; 256];
            let _ = conn.read(&mut buf);
            let _ = conn.write_all(b"HTTP/1.1 503 Backend fetch failed\r\n\r\n");
        }
    });

    let runner = FakeRunner::new();
    runner.on("systemctl status teamcache.service", CommandOutput::ok(RUNNING));

    let report = controller(&runner)
        .with_health_probe(port, Duration::from_secs(2))
        .verify()
        .unwrap();

    assert_eq!(report.health, Some(HealthStatus::UpstreamNotConfigured));
}

#[test]
fn test_signal_during_enable_is_interrupted() {
    let fake = FakeRunner::new();
    let cancel = CancelToken::new();
    let runner = SignalDuring {
        inner: &fake,
        prefix: "systemctl enable",
        cancel: cancel.clone(),
    };

    let mut ctl = ActivationController::new(&runner, "teamcache.service")
        .with_interval(Duration::ZERO)
        .with_cancel(cancel);
    let err = ctl.activate().unwrap_err();

    assert_eq!(err, ActivationError::Interrupted { attempts: 0 });
    assert_eq!(ctl.state(), ServiceActivationState::Interrupted);
    assert!(!fake.called("systemctl start"));
}

#[test]
fn test_signal_during_start_is_interrupted() {
    let fake = FakeRunner::new();
    let cancel = CancelToken::new();
    let runner = SignalDuring {
        inner: &fake,
        prefix: "systemctl start",
        cancel: cancel.clone(),
    };

    let err = ActivationController::new(&runner, "teamcache.service")
        .with_cancel(cancel)
        .activate()
        .unwrap_err();

    assert_eq!(err, ActivationError::Interrupted { attempts: 0 });
    assert!(!fake.called("systemctl status"));
}

#[test]
fn test_signal_during_final_status_is_interrupted_not_timeout() {
    let fake = FakeRunner::new();
    let cancel = CancelToken::new();
    let runner = SignalDuring {
        inner: &fake,
        prefix: "systemctl status",
        cancel: cancel.clone(),
    };

    let mut ctl = ActivationController::new(&runner, "teamcache.service")
        .with_attempts(1)
        .with_cancel(cancel);
    let err = ctl.verify().unwrap_err();

    assert_eq!(err, ActivationError::Interrupted { attempts: 1 });
    assert_eq!(ctl.state(), ServiceActivationState::Interrupted);
}
