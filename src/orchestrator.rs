//! The fixed build pipeline: provision, fix the topology, then configure
//! the proxy and storage tiers in order.

use crate::cloud::CloudProvider;
use crate::config::DeployConfig;
use crate::error::DeployResult;
use crate::phases::ring::RingArtifacts;
use crate::phases::{install, proxy, storage};
use crate::provision::{LaunchSpec, PolicyState, Provisioner, SecurityPolicy};
use crate::remote::{HostGroup, PhaseReport, RemoteTransport};
use crate::stages::{self, STAGES, names};
use crate::topology::{ClusterTopology, NodeDescriptor, NodeRole, TopologyBuilder};
use cmd_lib::*;
use uuid::Uuid;

/// Result of a successful run.
#[derive(Debug)]
pub struct ClusterBuild {
    pub cluster_id: String,
    pub policy: PolicyState,
    pub topology: ClusterTopology,
    pub rings: RingArtifacts,
    pub reports: Vec<PhaseReport>,
    /// Storage hosts missing a data mount after the reboot.
    pub unmounted: Vec<String>,
}

fn announce(stage: &mut &'static str, name: &'static str) {
    *stage = name;
    match (stages::position(name), stages::get(name)) {
        (Some(n), Some(s)) => info!("[{n}/{}] {}", STAGES.len(), s.desc),
        _ => info!("{name}"),
    }
}

/// Summarize `report`, keep it, and fail on its first fatal record.
fn record(reports: &mut Vec<PhaseReport>, report: PhaseReport) -> DeployResult<()> {
    report.log_summary();
    let checked = report.check();
    reports.push(report);
    checked
}

/// How much of the cluster exists when `stage` fails.
fn failure_scope(stage: &str) -> &'static str {
    match stages::get(stage) {
        Some(s) if s.provisions => "partially provisioned",
        _ => "fully provisioned",
    }
}

/// Provision and configure a complete cluster under a fresh run id.
pub fn build_cluster<C, T>(config: &DeployConfig, cloud: &C, transport: &T) -> DeployResult<ClusterBuild>
where
    C: CloudProvider + ?Sized,
    T: RemoteTransport + ?Sized,
{
    let cluster_id = Uuid::new_v4().to_string();
    build_cluster_with_id(config, cloud, transport, &cluster_id)
}

/// Like [`build_cluster`] with a caller-chosen run id.
pub fn build_cluster_with_id<C, T>(
    config: &DeployConfig,
    cloud: &C,
    transport: &T,
    cluster_id: &str,
) -> DeployResult<ClusterBuild>
where
    C: CloudProvider + ?Sized,
    T: RemoteTransport + ?Sized,
{
    config.validate()?;
    info!("Building swift cluster {cluster_id}");

    let mut provisioner = Provisioner::new(
        cloud,
        cluster_id,
        config.wait.instance_policy(),
        config.wait.volume_policy(),
    );
    let mut stage = names::SECURITY_POLICY;
    match run_pipeline(config, &mut provisioner, transport, cluster_id, &mut stage) {
        Ok(build) => {
            log_cluster(&build.topology, config);
            Ok(build)
        }
        Err(e) => {
            error!("Cluster build failed at {stage}: {e}");
            let ledger = provisioner.ledger();
            if ledger.is_empty() {
                return Err(e);
            }
            let scope = failure_scope(stage);
            if config.teardown_on_failure {
                warn!("Tearing down {scope} cluster {cluster_id}");
                let leftovers = provisioner.teardown();
                if !leftovers.is_empty() {
                    error!("Could not release: {}", leftovers.join(", "));
                }
            } else {
                warn!(
                    "Leaving {scope} cluster in place: instances [{}], volumes [{}]",
                    ledger.instances().join(", "),
                    ledger.volumes().join(", ")
                );
            }
            Err(e)
        }
    }
}

fn run_pipeline<C, T>(
    config: &DeployConfig,
    provisioner: &mut Provisioner<'_, C>,
    transport: &T,
    cluster_id: &str,
    stage: &mut &'static str,
) -> DeployResult<ClusterBuild>
where
    C: CloudProvider + ?Sized,
    T: RemoteTransport + ?Sized,
{
    let cloud = &config.cloud;
    let mode = config.remote.exec_mode();
    let max_parallel = config.remote.max_parallel_hosts;
    let mut reports = Vec::new();

    announce(stage, names::SECURITY_POLICY);
    let policy = provisioner.ensure_security_policy(&SecurityPolicy::from_config(config))?;

    announce(stage, names::PROXY_INSTANCES);
    let proxies = launch_role(provisioner, config, NodeRole::Proxy, config.cluster.proxy_count)?;

    announce(stage, names::STORAGE_INSTANCES);
    let storage_nodes = launch_role(
        provisioner,
        config,
        NodeRole::Storage,
        config.cluster.storage_count,
    )?;
    for node in &storage_nodes {
        for device in config.storage_devices() {
            provisioner.create_and_attach_volume(
                &node.instance_id,
                config.cluster.volume_size_gb,
                &cloud.zone,
                &device.block_device,
            )?;
        }
    }

    announce(stage, names::TOPOLOGY);
    let mut builder = TopologyBuilder::new();
    for node in proxies.into_iter().chain(storage_nodes) {
        builder.add(node);
    }
    let topology = builder.finish()?;

    let proxy_group = HostGroup::new(NodeRole::Proxy, topology.proxies(), transport, max_parallel)?;
    let storage_group =
        HostGroup::new(NodeRole::Storage, topology.storage(), transport, max_parallel)?;

    announce(stage, names::INSTALL_SOFTWARE);
    let install_ops = install::operations(config);
    record(
        &mut reports,
        proxy_group.run("install-software (proxy)", &install_ops, mode)?,
    )?;
    record(
        &mut reports,
        storage_group.run("install-software (storage)", &install_ops, mode)?,
    )?;

    announce(stage, names::PROXY_PHASE_1);
    record(
        &mut reports,
        proxy_group.run(names::PROXY_PHASE_1, &proxy::phase1_operations(), mode)?,
    )?;

    announce(stage, names::PROXY_PHASE_2);
    let (report, rings) = proxy::phase2(config, &topology, transport, mode)?;
    record(&mut reports, report)?;

    announce(stage, names::STORAGE_PHASE_1);
    let files = storage::write_generated_files(config)?;
    let boots = storage::boot_ids(topology.storage(), transport);
    record(
        &mut reports,
        storage_group.run(
            names::STORAGE_PHASE_1,
            &storage::phase1_operations(config, &files),
            mode,
        )?,
    )?;

    announce(stage, names::STORAGE_REBOOT_WAIT);
    storage::wait_for_reboot(topology.storage(), transport, &config.wait, &boots)?;
    let unmounted = storage::check_mounts(topology.storage(), transport, config);

    announce(stage, names::STORAGE_PHASE_2);
    record(
        &mut reports,
        storage_group.run(
            names::STORAGE_PHASE_2,
            &storage::phase2_operations(config, &rings, &files),
            mode,
        )?,
    )?;

    Ok(ClusterBuild {
        cluster_id: cluster_id.to_string(),
        policy,
        topology,
        rings,
        reports,
        unmounted,
    })
}

fn launch_role<C: CloudProvider + ?Sized>(
    provisioner: &mut Provisioner<'_, C>,
    config: &DeployConfig,
    role: NodeRole,
    count: usize,
) -> DeployResult<Vec<NodeDescriptor>> {
    let cloud = &config.cloud;
    let handles = provisioner.launch_instances(&LaunchSpec {
        role,
        count,
        image_id: &cloud.image_id,
        instance_type: &cloud.instance_type,
        zone: &cloud.zone,
        key_name: &cloud.key_name,
        security_group: &cloud.security_group,
    })?;
    provisioner.wait_for_instances(role, &handles)
}

fn log_cluster(topology: &ClusterTopology, config: &DeployConfig) {
    for node in topology.proxies() {
        info!(
            "Proxy {} ({}): http://{}:{}",
            node.instance_id, node.private_address, node.public_address, config.swift.proxy_port
        );
    }
    for node in topology.storage() {
        info!(
            "Storage {} ({}): {}",
            node.instance_id, node.private_address, node.public_address
        );
    }
}
