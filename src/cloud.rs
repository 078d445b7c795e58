//! Cloud provider capability used by the provisioner.
//!
//! The orchestrator only talks to EC2 through [`CloudProvider`]; [`AwsCli`]
//! implements it on top of the `aws` command line tool.

mod aws_cli;

pub use aws_cli::AwsCli;

use crate::error::ProviderError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One ingress authorization on the security group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngressRule {
    pub protocol: String,
    pub from_port: u16,
    pub to_port: u16,
    pub cidr: String,
}

impl IngressRule {
    pub fn tcp(from_port: u16, to_port: u16, cidr: &str) -> Self {
        Self {
            protocol: "tcp".to_string(),
            from_port,
            to_port,
            cidr: cidr.to_string(),
        }
    }
}

impl fmt::Display for IngressRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}-{} from {}",
            self.protocol, self.from_port, self.to_port, self.cidr
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairInfo {
    pub name: String,
    pub fingerprint: String,
}

/// A newly created key pair. `material` is the private key, only available
/// at creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedKeyPair {
    pub name: String,
    pub material: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub group_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInstancesRequest<'a> {
    pub image_id: &'a str,
    pub instance_type: &'a str,
    pub key_name: &'a str,
    pub security_group: &'a str,
    pub zone: &'a str,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub instance_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Unknown,
}

impl InstanceState {
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub state: InstanceState,
    pub public_dns: Option<String>,
    pub private_ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
    Error,
    Unknown,
}

impl VolumeState {
    pub fn parse(s: &str) -> Self {
        match s {
            "creating" => Self::Creating,
            "available" => Self::Available,
            "in-use" => Self::InUse,
            "deleting" => Self::Deleting,
            "deleted" => Self::Deleted,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDescription {
    pub volume_id: String,
    pub state: VolumeState,
}

/// Instance, volume, security group and key pair lifecycle calls.
///
/// Implementations report provider failures as [`ProviderError`] with the
/// provider's error code, so callers can tell known-tolerable conflicts from
/// real failures.
pub trait CloudProvider {
    fn describe_key_pair(&self, name: &str) -> Result<Option<KeyPairInfo>, ProviderError>;

    fn create_key_pair(&self, name: &str) -> Result<CreatedKeyPair, ProviderError>;

    fn describe_security_group(&self, name: &str) -> Result<Option<SecurityGroup>, ProviderError>;

    fn create_security_group(
        &self,
        name: &str,
        description: &str,
    ) -> Result<SecurityGroup, ProviderError>;

    fn authorize_ingress(
        &self,
        group: &SecurityGroup,
        rule: &IngressRule,
    ) -> Result<(), ProviderError>;

    /// One reservation for exactly `request.count` instances.
    fn run_instances(
        &self,
        request: &RunInstancesRequest<'_>,
    ) -> Result<Vec<InstanceHandle>, ProviderError>;

    fn describe_instance(&self, instance_id: &str) -> Result<InstanceDescription, ProviderError>;

    fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &[(String, String)],
    ) -> Result<(), ProviderError>;

    fn create_volume(&self, size_gb: u32, zone: &str) -> Result<VolumeDescription, ProviderError>;

    fn describe_volume(&self, volume_id: &str) -> Result<VolumeDescription, ProviderError>;

    fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), ProviderError>;

    fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), ProviderError>;

    fn delete_volume(&self, volume_id: &str) -> Result<(), ProviderError>;
}
