use crate::cloud::IngressRule;
use crate::error::{DeployError, DeployResult};
use crate::remote::ExecMode;
use crate::waiter::WaitPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// First block device attached to a storage node. Following devices take the
/// next letters (`/dev/xvdh`, `/dev/xvdi`, ...).
const FIRST_DEVICE_LETTER: u8 = b'g';
const MAX_DEVICES_PER_NODE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub region: String,
    pub zone: String,
    pub image_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub key_dir: PathBuf,
    pub security_group: String,
    pub security_group_desc: String,
    pub rules: Vec<IngressRule>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            zone: "us-east-1b".to_string(),
            image_id: "ami-d8ae5db0".to_string(),
            instance_type: "m1.small".to_string(),
            key_name: "swift_controller_test".to_string(),
            key_dir: PathBuf::from("."),
            security_group: "vf_sec_grp".to_string(),
            security_group_desc: "Swift cluster security group".to_string(),
            rules: vec![
                IngressRule::tcp(22, 22, "0.0.0.0/0"),
                IngressRule::tcp(6000, 6002, "0.0.0.0/0"),
                IngressRule::tcp(8080, 8080, "0.0.0.0/0"),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub proxy_count: usize,
    pub storage_count: usize,
    pub devices_per_node: usize,
    pub volume_size_gb: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            proxy_count: 1,
            storage_count: 2,
            devices_per_node: 1,
            volume_size_gb: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub login: String,
    pub ssh_port: u16,
    /// Hosts configured concurrently within one phase. 1 keeps the
    /// sequential behaviour.
    pub max_parallel_hosts: usize,
    /// Stop configuring a host at its first failed operation. Off, failures
    /// are only reported.
    pub strict: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            login: "ubuntu".to_string(),
            ssh_port: 22,
            max_parallel_hosts: 1,
            strict: false,
        }
    }
}

impl RemoteConfig {
    pub fn exec_mode(&self) -> ExecMode {
        if self.strict {
            ExecMode::Strict
        } else {
            ExecMode::Tolerant
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwiftConfig {
    pub git_url: String,
    pub hash_path_prefix: String,
    pub hash_path_suffix: String,
    pub proxy_port: u16,
    /// Local directory holding generated files and the fetched rings.
    pub artifact_dir: PathBuf,
}

impl Default for SwiftConfig {
    fn default() -> Self {
        Self {
            git_url: "https://github.com/openstack/swift.git".to_string(),
            hash_path_prefix: "4f2b1586632d59a8".to_string(),
            hash_path_suffix: "4f2b1586632d59a8".to_string(),
            proxy_port: 8080,
            artifact_dir: PathBuf::from("swift-artifacts"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub poll_interval_secs: u64,
    pub instance_max_polls: u32,
    pub volume_max_polls: u32,
    pub reboot_grace_secs: u64,
    pub reboot_max_polls: u32,
    pub show_progress: bool,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            instance_max_polls: 150,
            volume_max_polls: 90,
            reboot_grace_secs: 15,
            reboot_max_polls: 60,
            show_progress: true,
        }
    }
}

impl WaitConfig {
    fn policy(&self, max_attempts: u32) -> WaitPolicy {
        WaitPolicy {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_attempts,
            show_progress: self.show_progress,
        }
    }

    pub fn instance_policy(&self) -> WaitPolicy {
        self.policy(self.instance_max_polls)
    }

    pub fn volume_policy(&self) -> WaitPolicy {
        self.policy(self.volume_max_polls)
    }

    pub fn reboot_policy(&self) -> WaitPolicy {
        self.policy(self.reboot_max_polls)
    }

    pub fn reboot_grace(&self) -> Duration {
        Duration::from_secs(self.reboot_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Terminate instances and delete volumes created by this run when the
    /// run fails.
    #[serde(default = "default_teardown_on_failure")]
    pub teardown_on_failure: bool,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub swift: SwiftConfig,
    #[serde(default)]
    pub wait: WaitConfig,
}

fn default_teardown_on_failure() -> bool {
    true
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            teardown_on_failure: default_teardown_on_failure(),
            cloud: CloudConfig::default(),
            cluster: ClusterConfig::default(),
            remote: RemoteConfig::default(),
            swift: SwiftConfig::default(),
            wait: WaitConfig::default(),
        }
    }
}

/// A data device on a storage node: the ring/mount label (`d1`) and the
/// block device the volume is attached as (`/dev/xvdg`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDevice {
    pub label: String,
    pub block_device: String,
}

impl DeployConfig {
    pub fn from_toml(s: &str) -> DeployResult<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| DeployError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> DeployResult<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            DeployError::Config(format!(
                "failed to read config from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Load `path` if given, otherwise the compiled-in defaults.
    pub fn load(path: Option<&Path>) -> DeployResult<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn to_toml(&self) -> DeployResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DeployError::Config(format!("failed to serialize config: {e}")))
    }

    pub fn validate(&self) -> DeployResult<()> {
        let cluster = &self.cluster;
        if cluster.proxy_count == 0 {
            return Err(DeployError::Config("proxy_count must be at least 1".into()));
        }
        if cluster.storage_count == 0 {
            return Err(DeployError::Config("storage_count must be at least 1".into()));
        }
        if cluster.devices_per_node == 0 || cluster.devices_per_node > MAX_DEVICES_PER_NODE {
            return Err(DeployError::Config(format!(
                "devices_per_node must be between 1 and {MAX_DEVICES_PER_NODE}"
            )));
        }
        if cluster.volume_size_gb == 0 {
            return Err(DeployError::Config("volume_size_gb must be positive".into()));
        }
        if self.remote.max_parallel_hosts == 0 {
            return Err(DeployError::Config(
                "max_parallel_hosts must be at least 1".into(),
            ));
        }
        for (name, polls) in [
            ("instance_max_polls", self.wait.instance_max_polls),
            ("volume_max_polls", self.wait.volume_max_polls),
            ("reboot_max_polls", self.wait.reboot_max_polls),
        ] {
            if polls == 0 {
                return Err(DeployError::Config(format!("{name} must be at least 1")));
            }
        }
        if !self.cloud.zone.starts_with(&self.cloud.region) {
            return Err(DeployError::Config(format!(
                "zone {} is not in region {}",
                self.cloud.zone, self.cloud.region
            )));
        }
        for rule in &self.cloud.rules {
            if rule.from_port > rule.to_port {
                return Err(DeployError::Config(format!(
                    "invalid port range {}-{}",
                    rule.from_port, rule.to_port
                )));
            }
        }
        Ok(())
    }

    /// Devices every storage node carries, in ring order.
    pub fn storage_devices(&self) -> Vec<StorageDevice> {
        (0..self.cluster.devices_per_node)
            .map(|i| StorageDevice {
                label: format!("d{}", i + 1),
                block_device: format!("/dev/xvd{}", (FIRST_DEVICE_LETTER + i as u8) as char),
            })
            .collect()
    }

    /// Local copies of the rings pulled from the ring builder host.
    pub fn ring_dir(&self) -> PathBuf {
        self.swift.artifact_dir.join("rings")
    }

    pub fn key_path(&self) -> PathBuf {
        self.cloud
            .key_dir
            .join(format!("{}.pem", self.cloud.key_name))
    }
}
