use crate::cloud::{
    CloudProvider, IngressRule, InstanceDescription, InstanceHandle, InstanceState,
    RunInstancesRequest, SecurityGroup, VolumeState,
};
use crate::config::DeployConfig;
use crate::error::{DeployError, DeployResult, ProviderError};
use crate::topology::{NodeDescriptor, NodeRole};
use crate::waiter::{WaitPolicy, wait_until};
use cmd_lib::*;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

pub const CLUSTER_ID_TAG: &str = "swift-bootstrap:cluster-id";

/// Security group, its ingress rules and the ssh key pair used to reach the
/// instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub group_name: String,
    pub description: String,
    pub rules: Vec<IngressRule>,
    pub key_name: String,
    /// Where a newly created private key is saved.
    pub key_path: PathBuf,
}

impl SecurityPolicy {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            group_name: config.cloud.security_group.clone(),
            description: config.cloud.security_group_desc.clone(),
            rules: config.cloud.rules.clone(),
            key_name: config.cloud.key_name.clone(),
            key_path: config.key_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyState {
    pub group: SecurityGroup,
    pub key_name: String,
    pub key_created: bool,
    pub group_created: bool,
    pub rules_added: usize,
    pub rules_already_present: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec<'a> {
    pub role: NodeRole,
    pub count: usize,
    pub image_id: &'a str,
    pub instance_type: &'a str,
    pub zone: &'a str,
    pub key_name: &'a str,
    pub security_group: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    Creating,
    Available,
    Attached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeAttachment {
    pub volume_id: String,
    pub instance_id: String,
    pub device: String,
    pub state: AttachmentState,
}

/// Everything this run allocated, in creation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionLedger {
    instances: Vec<String>,
    volumes: Vec<String>,
}

impl ProvisionLedger {
    pub fn instances(&self) -> &[String] {
        &self.instances
    }

    pub fn volumes(&self) -> &[String] {
        &self.volumes
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.volumes.is_empty()
    }
}

pub struct Provisioner<'a, C: CloudProvider + ?Sized> {
    cloud: &'a C,
    cluster_id: String,
    instance_wait: WaitPolicy,
    volume_wait: WaitPolicy,
    ledger: ProvisionLedger,
}

impl<'a, C: CloudProvider + ?Sized> Provisioner<'a, C> {
    pub fn new(
        cloud: &'a C,
        cluster_id: &str,
        instance_wait: WaitPolicy,
        volume_wait: WaitPolicy,
    ) -> Self {
        Self {
            cloud,
            cluster_id: cluster_id.to_string(),
            instance_wait,
            volume_wait,
            ledger: ProvisionLedger::default(),
        }
    }

    pub fn ledger(&self) -> &ProvisionLedger {
        &self.ledger
    }

    /// Make sure the key pair, the security group and every rule exist.
    /// Safe to call repeatedly: existing pieces are looked up, and a rule the
    /// provider reports as a duplicate counts as already present.
    pub fn ensure_security_policy(&self, policy: &SecurityPolicy) -> DeployResult<PolicyState> {
        let key_created = self.ensure_key_pair(policy)?;

        let (group, group_created) = match self.cloud.describe_security_group(&policy.group_name)? {
            Some(group) => (group, false),
            None => {
                info!("Creating security group '{}'", policy.group_name);
                match self
                    .cloud
                    .create_security_group(&policy.group_name, &policy.description)
                {
                    Ok(group) => (group, true),
                    Err(e) if e.is_already_exists() => {
                        warn!("Security group '{}' appeared concurrently", policy.group_name);
                        let group = self
                            .cloud
                            .describe_security_group(&policy.group_name)?
                            .ok_or(e)?;
                        (group, false)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };
        info!("Got security group '{}' ({})", group.name, group.group_id);

        let mut rules_added = 0;
        let mut rules_already_present = 0;
        for rule in &policy.rules {
            info!("Authorizing group '{}' for {rule}", group.name);
            match self.cloud.authorize_ingress(&group, rule) {
                Ok(()) => rules_added += 1,
                Err(e) if e.is_duplicate_permission() => {
                    warn!("Group '{}' already allows {rule}, continuing", group.name);
                    rules_already_present += 1;
                }
                Err(e) => {
                    error!("Unexpected error authorizing {rule}: {e}");
                    return Err(e.into());
                }
            }
        }

        Ok(PolicyState {
            group,
            key_name: policy.key_name.clone(),
            key_created,
            group_created,
            rules_added,
            rules_already_present,
        })
    }

    fn ensure_key_pair(&self, policy: &SecurityPolicy) -> DeployResult<bool> {
        if self.cloud.describe_key_pair(&policy.key_name)?.is_some() {
            info!("Got key pair '{}'", policy.key_name);
            return Ok(false);
        }

        info!("Key pair '{}' does not exist, creating it", policy.key_name);
        let created = match self.cloud.create_key_pair(&policy.key_name) {
            Ok(created) => created,
            Err(e) if e.is_already_exists() => {
                warn!("Key pair '{}' appeared concurrently", policy.key_name);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(dir) = policy.key_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&policy.key_path)?;
        file.write_all(created.material.as_bytes())?;
        info!("Saved private key to {}", policy.key_path.display());
        Ok(true)
    }

    /// Request `spec.count` instances in a single reservation and tag them.
    /// The returned handles may still be pending.
    pub fn launch_instances(&mut self, spec: &LaunchSpec<'_>) -> DeployResult<Vec<InstanceHandle>> {
        let request = RunInstancesRequest {
            image_id: spec.image_id,
            instance_type: spec.instance_type,
            key_name: spec.key_name,
            security_group: spec.security_group,
            zone: spec.zone,
            count: spec.count,
        };
        let handles = self.cloud.run_instances(&request)?;
        let ids: Vec<String> = handles.iter().map(|h| h.instance_id.clone()).collect();
        self.ledger.instances.extend(ids.iter().cloned());
        info!("Started {} {} node(s): {}", handles.len(), spec.role, ids.join(", "));

        if handles.len() != spec.count {
            return Err(DeployError::Provider(ProviderError::new(
                "PartialReservation",
                format!("requested {} instances, got {}", spec.count, handles.len()),
            )));
        }

        let tags = vec![
            ("Name".to_string(), spec.role.tag_name().to_string()),
            (CLUSTER_ID_TAG.to_string(), self.cluster_id.clone()),
        ];
        self.cloud.create_tags(&ids, &tags)?;
        Ok(handles)
    }

    /// Block until every instance is running and return node descriptors for
    /// them, in handle order.
    pub fn wait_for_instances(
        &self,
        role: NodeRole,
        handles: &[InstanceHandle],
    ) -> DeployResult<Vec<NodeDescriptor>> {
        let ids: Vec<String> = handles.iter().map(|h| h.instance_id.clone()).collect();
        let described: Vec<InstanceDescription> = wait_until(
            "instance",
            &ids,
            |id| Ok(self.cloud.describe_instance(id)?),
            |desc| desc.state == InstanceState::Running,
            &self.instance_wait,
        )?;
        info!("All {role} node instances running");

        described
            .into_iter()
            .map(|desc| {
                let public_address = desc.public_dns.ok_or_else(|| {
                    DeployError::Topology(format!("{} has no public address", desc.instance_id))
                })?;
                let private_address = desc.private_ip.ok_or_else(|| {
                    DeployError::Topology(format!("{} has no private address", desc.instance_id))
                })?;
                Ok(NodeDescriptor {
                    instance_id: desc.instance_id,
                    public_address,
                    private_address,
                    role,
                })
            })
            .collect()
    }

    /// Create a volume next to the instance, wait for it to become available,
    /// attach it as `device` and wait until the provider reports it in use.
    pub fn create_and_attach_volume(
        &mut self,
        instance_id: &str,
        size_gb: u32,
        zone: &str,
        device: &str,
    ) -> DeployResult<VolumeAttachment> {
        info!("Creating {size_gb}GB volume for instance {instance_id}");
        let volume = self.cloud.create_volume(size_gb, zone)?;
        self.ledger.volumes.push(volume.volume_id.clone());
        let mut attachment = VolumeAttachment {
            volume_id: volume.volume_id.clone(),
            instance_id: instance_id.to_string(),
            device: device.to_string(),
            state: AttachmentState::Creating,
        };
        info!("Created volume {}, current state: {:?}", volume.volume_id, volume.state);

        if volume.state != VolumeState::Available {
            wait_until(
                "volume",
                std::slice::from_ref(&volume.volume_id),
                |id| Ok(self.cloud.describe_volume(id)?),
                |desc| desc.state == VolumeState::Available,
                &self.volume_wait,
            )?;
        }
        attachment.state = AttachmentState::Available;
        info!("Volume {} available", volume.volume_id);

        info!("Attaching volume {} to instance {instance_id} at {device}", volume.volume_id);
        self.cloud
            .attach_volume(&volume.volume_id, instance_id, device)?;
        // attach is asynchronous, the device shows up once the volume is in-use
        wait_until(
            "volume",
            std::slice::from_ref(&volume.volume_id),
            |id| Ok(self.cloud.describe_volume(id)?),
            |desc| desc.state == VolumeState::InUse,
            &self.volume_wait,
        )?;
        attachment.state = AttachmentState::Attached;
        info!("Volume {} in use by {instance_id}", volume.volume_id);
        Ok(attachment)
    }

    /// Best-effort removal of everything in the ledger. Failures are logged
    /// and the ids that could not be released are returned.
    pub fn teardown(&self) -> Vec<String> {
        let mut leftovers = Vec::new();
        if !self.ledger.instances.is_empty() {
            info!("Terminating instances {}", self.ledger.instances.join(", "));
            if let Err(e) = self.cloud.terminate_instances(&self.ledger.instances) {
                error!("Failed to terminate instances: {e}");
                leftovers.extend(self.ledger.instances.iter().cloned());
            }
        }
        for volume_id in &self.ledger.volumes {
            // volumes detach asynchronously once their instance terminates
            let detached = wait_until(
                "volume",
                std::slice::from_ref(volume_id),
                |id| Ok(self.cloud.describe_volume(id)?),
                |desc| desc.state != VolumeState::InUse,
                &self.volume_wait,
            );
            if let Err(e) = detached {
                warn!("Volume {volume_id} still attached: {e}");
                leftovers.push(volume_id.clone());
                continue;
            }
            info!("Deleting volume {volume_id}");
            if let Err(e) = self.cloud.delete_volume(volume_id) {
                warn!("Failed to delete volume {volume_id}: {e}");
                leftovers.push(volume_id.clone());
            }
        }
        leftovers
    }
}
