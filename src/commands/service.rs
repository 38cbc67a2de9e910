//! Typed invocations of service-manager and container tools.

use crate::command_traits::HostCommand;

/// systemctl verbs used by deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemctlAction {
    DaemonReload,
    Enable,
    Start,
    Stop,
    Status,
}

impl SystemctlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DaemonReload => "daemon-reload",
            Self::Enable => "enable",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Status => "status",
        }
    }
}

/// A `systemctl` call, with a unit for every verb except `daemon-reload`
#[derive(Debug, Clone)]
pub struct Systemctl {
    pub action: SystemctlAction,
    pub unit: Option<String>,
}

impl Systemctl {
    pub fn daemon_reload() -> Self {
        Self {
            action: SystemctlAction::DaemonReload,
            unit: None,
        }
    }

    pub fn unit(action: SystemctlAction, unit: impl Into<String>) -> Self {
        Self {
            action,
            unit: Some(unit.into()),
        }
    }
}

impl HostCommand for Systemctl {
    fn program(&self) -> &'static str {
        "systemctl"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![self.action.as_str().to_string()];
        if let Some(unit) = &self.unit {
            args.push(unit.clone());
        }
        if self.action == SystemctlAction::Status {
            args.push("--no-pager".to_string());
        }
        args
    }

    fn is_mutating(&self) -> bool {
        self.action != SystemctlAction::Status
    }
}

/// `docker compose version`, used to check the compose plugin is available
#[derive(Debug, Clone, Default)]
pub struct DockerComposeVersion;

impl HostCommand for DockerComposeVersion {
    fn program(&self) -> &'static str {
        "docker"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["compose".to_string(), "version".to_string()]
    }

    fn is_mutating(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_appends_no_pager() {
        let cmd = Systemctl::unit(SystemctlAction::Status, "teamcache.service");
        assert_eq!(cmd.describe(), "systemctl status teamcache.service --no-pager");
        assert!(!cmd.is_mutating());
    }

    #[test]
    fn test_daemon_reload_has_no_unit() {
        let cmd = Systemctl::daemon_reload();
        assert_eq!(cmd.to_cli_args(), vec!["daemon-reload"]);
        assert!(cmd.is_mutating());
    }

    #[test]
    fn test_state_changing_verbs_are_mutating() {
        for action in [SystemctlAction::Enable, SystemctlAction::Start, SystemctlAction::Stop] {
            assert!(Systemctl::unit(action, "teamcache.service").is_mutating());
        }
        assert!(!Systemctl::unit(SystemctlAction::Status, "teamcache.service").is_mutating());
    }

    #[test]
    fn test_docker_compose_version() {
        assert_eq!(DockerComposeVersion.describe(), "docker compose version");
    }
}
