//! Deployment stage machine
//!
//! `DeployContext` is the single source of truth for how far a run got. It
//! only moves forward, one stage at a time, and refuses to enter the
//! destructive provisioning stage without confirmation.
//!
//! # Stage Flow
//!
//! ```text
//! NotStarted
//!     ↓
//! ValidatingConfig
//!     ↓
//! DiscoveringStorage
//!     ↓
//! ProvisioningStorage   (destructive)
//!     ↓
//! GeneratingConfig
//!     ↓
//! ActivatingService
//!     ↓
//! Completed
//!
//! (Any non-terminal stage can transition to Failed)
//! ```

use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Deployment stages in sequential order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeployStage {
    #[default]
    NotStarted = 0,

    /// Config file, environment and binaries
    ValidatingConfig = 1,

    /// lsblk / statvfs queries, read-only
    DiscoveringStorage = 2,

    /// Formatting, mounting and fstab edits.
    /// This is a DESTRUCTIVE stage when any device is formatted.
    ProvisioningStorage = 3,

    /// mse4.conf, unit files, monitoring config
    GeneratingConfig = 4,

    /// Enable, start and poll the service
    ActivatingService = 5,

    Completed = 6,

    Failed = 255,
}

impl DeployStage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[inline]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::ProvisioningStorage)
    }

    pub const fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::ValidatingConfig),
            Self::ValidatingConfig => Some(Self::DiscoveringStorage),
            Self::DiscoveringStorage => Some(Self::ProvisioningStorage),
            Self::ProvisioningStorage => Some(Self::GeneratingConfig),
            Self::GeneratingConfig => Some(Self::ActivatingService),
            Self::ActivatingService => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::ValidatingConfig => "Validating configuration",
            Self::DiscoveringStorage => "Discovering storage",
            Self::ProvisioningStorage => "Provisioning storage",
            Self::GeneratingConfig => "Generating configuration",
            Self::ActivatingService => "Activating service",
            Self::Completed => "Deployment complete",
            Self::Failed => "Deployment failed",
        }
    }
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeployTransitionError {
    #[error("Cannot skip from {from} to {to}")]
    SkippedStage { from: DeployStage, to: DeployStage },

    #[error("Cannot go backwards from {from} to {to} (deployment is forward-only)")]
    BackwardTransition { from: DeployStage, to: DeployStage },

    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: DeployStage },

    #[error("Stage {stage} requires explicit confirmation (destructive operation)")]
    MissingConfirmation { stage: DeployStage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: DeployStage },
}

/// Tracks the progress of one deployment run
#[derive(Debug, Clone, Default)]
pub struct DeployContext {
    current: DeployStage,
    destructive_confirmed: bool,
}

impl DeployContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn current_stage(&self) -> DeployStage {
        self.current
    }

    /// Authorize the destructive stage. One-way.
    pub fn confirm_destructive_operations(&mut self) {
        self.destructive_confirmed = true;
    }

    /// Transition to `target`, which must be the immediate next stage
    pub fn transition_to(&mut self, target: DeployStage) -> Result<DeployStage, DeployTransitionError> {
        if self.current.is_terminal() {
            return Err(DeployTransitionError::FromTerminalState { from: self.current });
        }
        if target == self.current {
            return Err(DeployTransitionError::AlreadyAtStage { stage: target });
        }
        if target.order() < self.current.order() {
            return Err(DeployTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }
        if self.current.next() != Some(target) {
            return Err(DeployTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }
        if target.is_destructive() && !self.destructive_confirmed {
            return Err(DeployTransitionError::MissingConfirmation { stage: target });
        }
        self.current = target;
        debug!("Stage: {}", target);
        Ok(target)
    }

    /// Mark the run as failed and return the stage it stopped in.
    ///
    /// A context that already reached a terminal stage keeps it.
    pub fn fail(&mut self) -> DeployStage {
        let stopped_in = self.current;
        if !stopped_in.is_terminal() {
            self.current = DeployStage::Failed;
        }
        stopped_in
    }
}
