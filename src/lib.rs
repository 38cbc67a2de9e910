//! TeamCache deployment library
//!
//! Provisions cache storage, derives the MSE4 layout, writes the service
//! configuration and brings the TeamCache service up on a single host.

pub mod activation;
pub mod cli;
pub mod command_runner;
pub mod command_traits;
pub mod commands;
pub mod config_file;
pub mod deploy;
pub mod deploy_state;
pub mod engine;
pub mod error;
pub mod fstab;
pub mod health;
pub mod inventory;
pub mod process_guard;
pub mod provision;
pub mod sanity;
pub mod storage;
pub mod types;

// Re-export main types for convenience
pub use activation::{ActivationController, ActivationError, ActivationReport, StatusClass, classify_status};
pub use command_runner::{CommandOutput, CommandRunner, SystemRunner};
pub use command_traits::HostCommand;
pub use config_file::{DeployConfig, HostLayout};
pub use deploy::{DeployReport, Deployer, PlanPreview};
pub use deploy_state::{DeployContext, DeployStage, DeployTransitionError};
pub use engine::layout::{BookEntry, LayoutError, LayoutPlan, store_size_gib};
pub use error::{DeployError, ValidationErrors};
pub use health::HealthStatus;
pub use inventory::{DiscoveryReport, ExclusionReason};
pub use process_guard::{CancelToken, ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use provision::{ProvisioningError, StorageProvisioner};
pub use storage::{MountAssignment, ProvisioningAction, StableId, StorageDescriptor};
pub use types::{DeploymentMode, DeviceMode, StorageMode};
