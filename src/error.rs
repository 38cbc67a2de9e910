//! Error handling for the deployment tool
//!
//! Each stage owns a focused error enum (`ProvisioningError`, `LayoutError`,
//! `ActivationError`, `DeployTransitionError`). `DeployError` wraps them at the
//! top level and decides the process exit code.

use crate::activation::ActivationError;
use crate::deploy_state::DeployTransitionError;
use crate::engine::layout::LayoutError;
use crate::provision::ProvisioningError;
use std::fmt;
use thiserror::Error;

/// Every pre-flight problem found in one pass, reported together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(Vec<String>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: impl Into<String>) {
        self.0.push(msg.into());
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn messages(&self) -> &[String] {
        &self.0
    }

    /// `Ok(())` if nothing was collected, otherwise the collected errors
    pub fn into_result(self) -> std::result::Result<(), ValidationErrors> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} problem(s) found", self.0.len())?;
        for msg in &self.0 {
            write!(f, "\n  - {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

impl From<Vec<String>> for ValidationErrors {
    fn from(v: Vec<String>) -> Self {
        Self(v)
    }
}

/// Top-level error type for a deployment run
#[derive(Error, Debug)]
pub enum DeployError {
    /// Configuration or environment problems caught before any mutation
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    /// Storage preparation failed (fail-fast, no rollback)
    #[error("Provisioning failed: {0}")]
    Provisioning(ProvisioningError),

    /// Storage layout could not be derived
    #[error("Layout generation failed: {0}")]
    Layout(#[from] LayoutError),

    /// Service did not reach a healthy state
    #[error("Activation failed: {0}")]
    Activation(ActivationError),

    /// A termination signal arrived mid-run
    #[error("Deployment interrupted by signal")]
    Interrupted,

    /// Stage machine misuse
    #[error("Deploy transition error: {0}")]
    Transition(#[from] DeployTransitionError),

    /// IO errors (config files, generated artifacts)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else surfaced with context from a lower layer
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for deployment operations
pub type Result<T> = std::result::Result<T, DeployError>;

impl From<ValidationErrors> for DeployError {
    fn from(errors: ValidationErrors) -> Self {
        Self::Validation(errors)
    }
}

// Interruption is its own outcome no matter which stage observed it
impl From<ProvisioningError> for DeployError {
    fn from(err: ProvisioningError) -> Self {
        match err {
            ProvisioningError::Interrupted => Self::Interrupted,
            other => Self::Provisioning(other),
        }
    }
}

impl From<ActivationError> for DeployError {
    fn from(err: ActivationError) -> Self {
        match err {
            ActivationError::Interrupted { .. } => Self::Interrupted,
            other => Self::Activation(other),
        }
    }
}

impl DeployError {
    /// Create a single-message validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(ValidationErrors(vec![msg.into()]))
    }

    /// Process exit code for this failure class
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 2,
            Self::Provisioning(_) | Self::Layout(_) => 3,
            Self::Activation(ActivationError::Timeout { .. }) => 5,
            Self::Activation(_) => 4,
            Self::Interrupted => 130,
            Self::Transition(_) | Self::Io(_) | Self::Other(_) => 1,
        }
    }
}
