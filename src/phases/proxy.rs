use super::ring::{self, RingArtifacts, RingPlan};
use super::{SWIFT_ETC, common_phase2_ops, sample_config_ops};
use crate::config::DeployConfig;
use crate::error::DeployResult;
use crate::remote::{ExecMode, HostGroup, PhaseReport, RemoteOperation, RemoteTransport, ServiceAction};
use crate::topology::{ClusterTopology, NodeDescriptor, NodeRole};

const MEMCACHED_CONF: &str = "/etc/memcached.conf";
const MEMCACHED_PORT: u16 = 11211;

pub fn phase1_operations() -> Vec<RemoteOperation> {
    let mut ops = sample_config_ops();
    ops.insert(1, RemoteOperation::sudo("useradd swift").tolerated());
    ops
}

/// Memcached and proxy-server settings for one proxy, bound to its private
/// address.
pub fn service_operations(config: &DeployConfig, node: &NodeDescriptor) -> Vec<RemoteOperation> {
    let ip = node.private_address.as_str();
    let proxy_conf = format!("{SWIFT_ETC}/proxy-server.conf");
    vec![
        RemoteOperation::patch(MEMCACHED_CONF, "-l 127.0.0.1", &format!("-l {ip}")),
        RemoteOperation::service("memcached", ServiceAction::Stop),
        RemoteOperation::service("memcached", ServiceAction::Start),
        RemoteOperation::patch(&proxy_conf, "# bind_ip = 0.0.0.0", &format!("bind_ip = {ip}")),
        RemoteOperation::patch(
            &proxy_conf,
            "# bind_port = 80",
            &format!("bind_port = {}", config.swift.proxy_port),
        ),
        RemoteOperation::patch(
            &proxy_conf,
            "# memcache_servers = 127.0.0.1:11211",
            &format!("memcache_servers = {ip}:{MEMCACHED_PORT}"),
        ),
        RemoteOperation::patch(
            &proxy_conf,
            "# allow_account_management = false",
            "allow_account_management = true",
        ),
        RemoteOperation::patch(
            &proxy_conf,
            "# account_autocreate = false",
            "account_autocreate = true",
        ),
        RemoteOperation::sudo("swift-init proxy start"),
    ]
}

/// Ring files for a proxy that did not build them itself.
pub fn ring_upload_operations(rings: &RingArtifacts) -> Vec<RemoteOperation> {
    let mut ops: Vec<RemoteOperation> = rings
        .iter()
        .map(|artifact| RemoteOperation::upload(&artifact.path, &artifact.kind.remote_ring_path(), 0o644))
        .collect();
    ops.push(RemoteOperation::sudo(format!("chown -R swift:swift {SWIFT_ETC}")));
    ops
}

/// Second proxy phase: shared setup on every proxy, the ring build on the
/// first proxy, then memcached and the proxy server itself.
pub fn phase2<T: RemoteTransport + ?Sized>(
    config: &DeployConfig,
    topology: &ClusterTopology,
    transport: &T,
    mode: ExecMode,
) -> DeployResult<(PhaseReport, RingArtifacts)> {
    let max_parallel = config.remote.max_parallel_hosts;
    let proxies = HostGroup::new(NodeRole::Proxy, topology.proxies(), transport, max_parallel)?;
    let mut report = proxies.run("proxy-common", &common_phase2_ops(config), mode)?;
    report.check()?;

    let leader = topology.ring_builder_host();
    let leader_group = HostGroup::new(
        NodeRole::Proxy,
        std::slice::from_ref(leader),
        transport,
        1,
    )?;
    let plan = RingPlan::new(topology, &config.storage_devices());
    let (ring_report, rings) = ring::build(&leader_group, &plan, &config.ring_dir())?;
    report.extend(ring_report);

    let services = proxies.run_with("proxy-services", mode, |node| {
        let mut ops = Vec::new();
        if node.instance_id != leader.instance_id {
            ops.extend(ring_upload_operations(&rings));
        }
        ops.extend(service_operations(config, node));
        ops
    })?;
    report.extend(services);
    report.phase = "proxy-phase-2".to_string();
    Ok((report, rings))
}
