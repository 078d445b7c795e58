use super::*;
use cmd_lib::*;
use regex::Regex;
use serde::de::DeserializeOwned;
use std::process::Command;
use std::sync::LazyLock;

static ERROR_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"An error occurred \(([^)]+)\)").unwrap());

const KEY_PAIR_NOT_FOUND: &str = "InvalidKeyPair.NotFound";

/// [`CloudProvider`] backed by the `aws ec2` command line tool.
pub struct AwsCli {
    region: String,
}

impl AwsCli {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
        }
    }

    fn run(&self, args: &[String]) -> Result<String, ProviderError> {
        debug!("aws ec2 {}", args.join(" "));
        let output = Command::new("aws")
            .arg("ec2")
            .args(args)
            .args(["--region", &self.region, "--output", "json"])
            .output()
            .map_err(|e| {
                ProviderError::new(ProviderError::UNKNOWN, format!("failed to run aws: {e}"))
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(parse_cli_error(&stderr))
        }
    }

    fn call<T: DeserializeOwned>(&self, args: &[String]) -> Result<T, ProviderError> {
        let stdout = self.run(args)?;
        serde_json::from_str(&stdout).map_err(|e| {
            ProviderError::new(
                ProviderError::UNKNOWN,
                format!("failed to parse aws output for {}: {e}", args[0]),
            )
        })
    }
}

/// Turn the CLI's stderr into a [`ProviderError`], keeping the EC2 error
/// code when the CLI reported one.
pub(crate) fn parse_cli_error(stderr: &str) -> ProviderError {
    let message = stderr.trim().to_string();
    match ERROR_CODE_RE.captures(stderr) {
        Some(caps) => ProviderError::new(&caps[1], message),
        None => ProviderError::new(ProviderError::UNKNOWN, message),
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyPairItem {
    key_name: String,
    #[serde(default)]
    key_fingerprint: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeKeyPairsOutput {
    #[serde(default)]
    key_pairs: Vec<KeyPairItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateKeyPairOutput {
    key_name: String,
    key_material: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroupItem {
    group_id: String,
    group_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSecurityGroupsOutput {
    #[serde(default)]
    security_groups: Vec<SecurityGroupItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateSecurityGroupOutput {
    group_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StateItem {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceItem {
    instance_id: String,
    #[serde(default)]
    state: Option<StateItem>,
    #[serde(default)]
    public_dns_name: Option<String>,
    #[serde(default)]
    private_ip_address: Option<String>,
}

impl From<InstanceItem> for InstanceDescription {
    fn from(item: InstanceItem) -> Self {
        Self {
            instance_id: item.instance_id,
            state: item
                .state
                .map(|s| InstanceState::parse(&s.name))
                .unwrap_or(InstanceState::Unknown),
            public_dns: non_empty(item.public_dns_name),
            private_ip: non_empty(item.private_ip_address),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesOutput {
    #[serde(default)]
    instances: Vec<InstanceItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReservationItem {
    #[serde(default)]
    instances: Vec<InstanceItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<ReservationItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VolumeItem {
    volume_id: String,
    state: String,
}

impl From<VolumeItem> for VolumeDescription {
    fn from(item: VolumeItem) -> Self {
        Self {
            volume_id: item.volume_id,
            state: VolumeState::parse(&item.state),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeVolumesOutput {
    #[serde(default)]
    volumes: Vec<VolumeItem>,
}

impl CloudProvider for AwsCli {
    fn describe_key_pair(&self, name: &str) -> Result<Option<KeyPairInfo>, ProviderError> {
        match self.call::<DescribeKeyPairsOutput>(&args(["describe-key-pairs", "--key-names", name])) {
            Ok(out) => Ok(out.key_pairs.into_iter().next().map(|k| KeyPairInfo {
                name: k.key_name,
                fingerprint: k.key_fingerprint,
            })),
            Err(e) if e.code == KEY_PAIR_NOT_FOUND => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_key_pair(&self, name: &str) -> Result<CreatedKeyPair, ProviderError> {
        let out: CreateKeyPairOutput = self.call(&args(["create-key-pair", "--key-name", name]))?;
        Ok(CreatedKeyPair {
            name: out.key_name,
            material: out.key_material,
        })
    }

    fn describe_security_group(&self, name: &str) -> Result<Option<SecurityGroup>, ProviderError> {
        let filter = format!("Name=group-name,Values={name}");
        let out: DescribeSecurityGroupsOutput =
            self.call(&args(["describe-security-groups", "--filters", &filter]))?;
        Ok(out
            .security_groups
            .into_iter()
            .find(|g| g.group_name == name)
            .map(|g| SecurityGroup {
                group_id: g.group_id,
                name: g.group_name,
            }))
    }

    fn create_security_group(
        &self,
        name: &str,
        description: &str,
    ) -> Result<SecurityGroup, ProviderError> {
        let out: CreateSecurityGroupOutput = self.call(&args([
            "create-security-group",
            "--group-name",
            name,
            "--description",
            description,
        ]))?;
        Ok(SecurityGroup {
            group_id: out.group_id,
            name: name.to_string(),
        })
    }

    fn authorize_ingress(
        &self,
        group: &SecurityGroup,
        rule: &IngressRule,
    ) -> Result<(), ProviderError> {
        let port = format!("{}-{}", rule.from_port, rule.to_port);
        self.run(&args([
            "authorize-security-group-ingress",
            "--group-id",
            &group.group_id,
            "--protocol",
            &rule.protocol,
            "--port",
            &port,
            "--cidr",
            &rule.cidr,
        ]))?;
        Ok(())
    }

    fn run_instances(
        &self,
        request: &RunInstancesRequest<'_>,
    ) -> Result<Vec<InstanceHandle>, ProviderError> {
        let count = format!("{}:{}", request.count, request.count);
        let placement = format!("AvailabilityZone={}", request.zone);
        let out: RunInstancesOutput = self.call(&args([
            "run-instances",
            "--image-id",
            request.image_id,
            "--instance-type",
            request.instance_type,
            "--key-name",
            request.key_name,
            "--security-groups",
            request.security_group,
            "--placement",
            &placement,
            "--count",
            &count,
        ]))?;
        Ok(out
            .instances
            .into_iter()
            .map(|i| InstanceHandle {
                instance_id: i.instance_id,
            })
            .collect())
    }

    fn describe_instance(&self, instance_id: &str) -> Result<InstanceDescription, ProviderError> {
        let out: DescribeInstancesOutput =
            self.call(&args(["describe-instances", "--instance-ids", instance_id]))?;
        out.reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .find(|i| i.instance_id == instance_id)
            .map(InstanceDescription::from)
            .ok_or_else(|| {
                ProviderError::new(
                    "InvalidInstanceID.NotFound",
                    format!("instance {instance_id} not returned by describe-instances"),
                )
            })
    }

    fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &[(String, String)],
    ) -> Result<(), ProviderError> {
        let mut cli_args = vec!["create-tags".to_string(), "--resources".to_string()];
        cli_args.extend(resource_ids.iter().cloned());
        cli_args.push("--tags".to_string());
        cli_args.extend(tags.iter().map(|(k, v)| format!("Key={k},Value={v}")));
        self.run(&cli_args)?;
        Ok(())
    }

    fn create_volume(&self, size_gb: u32, zone: &str) -> Result<VolumeDescription, ProviderError> {
        let size = size_gb.to_string();
        let out: VolumeItem = self.call(&args([
            "create-volume",
            "--size",
            &size,
            "--availability-zone",
            zone,
        ]))?;
        Ok(out.into())
    }

    fn describe_volume(&self, volume_id: &str) -> Result<VolumeDescription, ProviderError> {
        let out: DescribeVolumesOutput =
            self.call(&args(["describe-volumes", "--volume-ids", volume_id]))?;
        out.volumes
            .into_iter()
            .next()
            .map(VolumeDescription::from)
            .ok_or_else(|| {
                ProviderError::new(
                    "InvalidVolume.NotFound",
                    format!("volume {volume_id} not returned by describe-volumes"),
                )
            })
    }

    fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), ProviderError> {
        self.run(&args([
            "attach-volume",
            "--volume-id",
            volume_id,
            "--instance-id",
            instance_id,
            "--device",
            device,
        ]))?;
        Ok(())
    }

    fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), ProviderError> {
        let mut cli_args = vec![
            "terminate-instances".to_string(),
            "--instance-ids".to_string(),
        ];
        cli_args.extend(instance_ids.iter().cloned());
        self.run(&cli_args)?;
        Ok(())
    }

    fn delete_volume(&self, volume_id: &str) -> Result<(), ProviderError> {
        self.run(&args(["delete-volume", "--volume-id", volume_id]))?;
        Ok(())
    }
}
