//! Placement ring construction on the proxy tier.

use super::SWIFT_ETC;
use crate::config::StorageDevice;
use crate::error::{DeployError, DeployResult};
use crate::remote::{ExecMode, HostGroup, PhaseReport, RemoteOperation, RemoteTransport};
use crate::topology::ClusterTopology;
use cmd_lib::*;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const PARTITION_POWER: u32 = 16;
pub const REPLICAS: u32 = 3;
pub const MIN_PART_HOURS: u32 = 24;
pub const RING_ZONE: u32 = 1;
pub const DEVICE_WEIGHT: u32 = 10;

static DEVICE_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) devices").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingKind {
    Account,
    Container,
    Object,
}

impl RingKind {
    pub const ALL: [RingKind; 3] = [RingKind::Account, RingKind::Container, RingKind::Object];

    pub fn name(&self) -> &'static str {
        match self {
            RingKind::Account => "account",
            RingKind::Container => "container",
            RingKind::Object => "object",
        }
    }

    /// Port the storage node serves this ring's data on.
    pub fn port(&self) -> u16 {
        match self {
            RingKind::Object => 6000,
            RingKind::Container => 6001,
            RingKind::Account => 6002,
        }
    }

    pub fn builder_file(&self) -> String {
        format!("{}.builder", self.name())
    }

    pub fn ring_file(&self) -> String {
        format!("{}.ring.gz", self.name())
    }

    pub fn remote_ring_path(&self) -> String {
        format!("{SWIFT_ETC}/{}", self.ring_file())
    }
}

impl fmt::Display for RingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingDevice {
    pub zone: u32,
    pub address: String,
    pub port: u16,
    pub device: String,
    pub weight: u32,
}

impl RingDevice {
    /// Arguments of `swift-ring-builder <builder> add`.
    pub fn add_args(&self) -> String {
        format!(
            "z{}-{}:{}/{} {}",
            self.zone, self.address, self.port, self.device, self.weight
        )
    }
}

/// All ring entries for one immutable topology snapshot, in the order they
/// are added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingPlan {
    entries: Vec<(RingKind, RingDevice)>,
}

impl RingPlan {
    pub fn new(topology: &ClusterTopology, devices: &[StorageDevice]) -> Self {
        let mut entries = Vec::new();
        for node in topology.storage() {
            for device in devices {
                for kind in RingKind::ALL {
                    entries.push((
                        kind,
                        RingDevice {
                            zone: RING_ZONE,
                            address: node.private_address.clone(),
                            port: kind.port(),
                            device: device.label.clone(),
                            weight: DEVICE_WEIGHT,
                        },
                    ));
                }
            }
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[(RingKind, RingDevice)] {
        &self.entries
    }

    pub fn device_count(&self, kind: RingKind) -> usize {
        self.entries.iter().filter(|(k, _)| *k == kind).count()
    }

    /// create, then every add, then a summary and one rebalance per ring.
    /// Rebalancing must wait until every device is in.
    pub fn operations(&self) -> Vec<RemoteOperation> {
        let mut ops = Vec::with_capacity(self.entries.len() + 3 * RingKind::ALL.len());
        for kind in RingKind::ALL {
            ops.push(RemoteOperation::sudo_in(
                SWIFT_ETC,
                format!(
                    "swift-ring-builder {} create {PARTITION_POWER} {REPLICAS} {MIN_PART_HOURS}",
                    kind.builder_file()
                ),
            ));
        }
        for (kind, device) in &self.entries {
            ops.push(RemoteOperation::sudo_in(
                SWIFT_ETC,
                format!(
                    "swift-ring-builder {} add {}",
                    kind.builder_file(),
                    device.add_args()
                ),
            ));
        }
        ops.extend(RingKind::ALL.iter().map(|kind| summary_op(*kind)));
        for kind in RingKind::ALL {
            ops.push(RemoteOperation::sudo_in(
                SWIFT_ETC,
                format!("swift-ring-builder {} rebalance", kind.builder_file()),
            ));
        }
        ops
    }
}

fn summary_op(kind: RingKind) -> RemoteOperation {
    RemoteOperation::sudo_in(SWIFT_ETC, format!("swift-ring-builder {}", kind.builder_file()))
}

/// Device count from the summary `swift-ring-builder <builder>` prints.
pub fn parse_device_count(summary: &str) -> Option<usize> {
    DEVICE_COUNT_RE
        .captures(summary)
        .and_then(|caps| caps[1].parse().ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingArtifact {
    pub kind: RingKind,
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

/// The three ring files on the local control host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingArtifacts {
    artifacts: Vec<RingArtifact>,
}

impl RingArtifacts {
    /// Index the ring files already present in `dir`.
    pub fn from_dir(dir: &Path) -> DeployResult<Self> {
        let mut artifacts = Vec::with_capacity(RingKind::ALL.len());
        for kind in RingKind::ALL {
            let path = dir.join(kind.ring_file());
            let bytes = std::fs::read(&path)?;
            artifacts.push(RingArtifact {
                kind,
                sha256: hex::encode(Sha256::digest(&bytes)),
                size: bytes.len() as u64,
                path,
            });
        }
        Ok(Self { artifacts })
    }

    pub fn iter(&self) -> impl Iterator<Item = &RingArtifact> {
        self.artifacts.iter()
    }

    pub fn get(&self, kind: RingKind) -> Option<&RingArtifact> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }
}

/// Check every ring holds exactly the devices the plan added.
pub fn validate<T: RemoteTransport + ?Sized>(
    transport: &T,
    host: &str,
    plan: &RingPlan,
) -> DeployResult<()> {
    for kind in RingKind::ALL {
        let cmd = summary_op(kind).command_line().unwrap_or_default();
        let summary = transport
            .exec(host, &cmd, true)
            .map_err(|e| DeployError::RemoteFailure {
                host: host.to_string(),
                op: cmd.clone(),
                reason: e.to_string(),
            })?;
        let expected = plan.device_count(kind);
        let actual = parse_device_count(&summary).unwrap_or(0);
        if actual != expected {
            return Err(DeployError::RingValidation {
                ring: kind.name(),
                expected,
                actual,
            });
        }
        info!("{kind} ring has {actual} devices");
    }
    Ok(())
}

/// Pull the ring files from `host` into `ring_dir`.
pub fn fetch<T: RemoteTransport + ?Sized>(
    transport: &T,
    host: &str,
    ring_dir: &Path,
) -> DeployResult<RingArtifacts> {
    std::fs::create_dir_all(ring_dir)?;
    for kind in RingKind::ALL {
        let remote = kind.remote_ring_path();
        let local = ring_dir.join(kind.ring_file());
        transport
            .download(host, &remote, &local)
            .map_err(|e| DeployError::RemoteFailure {
                host: host.to_string(),
                op: format!("get {remote}"),
                reason: e.to_string(),
            })?;
    }
    let artifacts = RingArtifacts::from_dir(ring_dir)?;
    for artifact in artifacts.iter() {
        info!(
            "Fetched {} ({} bytes, sha256 {})",
            artifact.path.display(),
            artifact.size,
            artifact.sha256
        );
    }
    Ok(artifacts)
}

/// Build, validate and fetch the rings on the single host of `group`.
pub fn build<T: RemoteTransport + ?Sized>(
    group: &HostGroup<'_, T>,
    plan: &RingPlan,
    ring_dir: &Path,
) -> DeployResult<(PhaseReport, RingArtifacts)> {
    let [leader] = group.nodes() else {
        return Err(DeployError::Topology(format!(
            "ring must be built on exactly one host, got {}",
            group.nodes().len()
        )));
    };
    info!(
        "Building rings on {} with {} devices each",
        leader.public_address,
        plan.device_count(RingKind::Object)
    );

    let report = group.run("ring-build", &plan.operations(), ExecMode::Tolerant)?;
    validate(group.transport(), &leader.public_address, plan)?;
    let artifacts = fetch(group.transport(), &leader.public_address, ring_dir)?;
    Ok((report, artifacts))
}
