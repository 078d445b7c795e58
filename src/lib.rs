pub mod cloud;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod phases;
pub mod provision;
pub mod remote;
pub mod stages;
pub mod topology;
pub mod waiter;

pub use config::DeployConfig;
pub use error::{DeployError, DeployResult, ProviderError};
pub use orchestrator::{ClusterBuild, build_cluster};
