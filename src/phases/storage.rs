use super::ring::{RingArtifacts, RingKind};
use super::{SWIFT_ETC, SWIFT_SRC, common_phase2_ops, sample_config_ops};
use crate::config::{DeployConfig, StorageDevice, WaitConfig};
use crate::error::DeployResult;
use crate::remote::{RemoteOperation, RemoteTransport, ServiceAction};
use crate::topology::NodeDescriptor;
use crate::waiter::wait_until;
use cmd_lib::*;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;

pub const SRV_NODE: &str = "/srv/node";
const MOUNT_OPTS: &str = "noatime,nodiratime,logbufs=8";
const UPSTART_CONF: &str = "/etc/init/start_swift.conf";
const RSYNCD_CONF: &str = "/etc/rsyncd.conf";
const BOOT_ID: &str = "cat /proc/sys/kernel/random/boot_id";

fn mount_command(device: &StorageDevice) -> String {
    format!(
        "mount -t xfs -o {MOUNT_OPTS} -L {label} {SRV_NODE}/{label}",
        label = device.label
    )
}

pub fn mount_script_remote_path() -> String {
    format!("{SWIFT_SRC}/bin/mount_devices")
}

/// Boot-time script mounting every data device by label.
pub fn mount_devices_script(devices: &[StorageDevice]) -> String {
    let mut script = String::from("#!/bin/sh\n");
    for device in devices {
        let _ = writeln!(script, "mkdir -p {SRV_NODE}/{}", device.label);
        let _ = writeln!(script, "{}", mount_command(device));
    }
    script
}

fn max_connections(kind: RingKind) -> u32 {
    match kind {
        RingKind::Account => 2,
        RingKind::Container => 4,
        RingKind::Object => 8,
    }
}

/// rsync daemon config with one module per ring, all served from
/// `/srv/node`.
pub fn rsyncd_conf() -> String {
    let mut conf = String::from(
        "uid = swift\n\
         gid = swift\n\
         log file = /var/log/rsyncd.log\n\
         pid file = /var/run/rsyncd.pid\n\
         address = 0.0.0.0\n",
    );
    for kind in RingKind::ALL {
        let name = kind.name();
        let _ = write!(
            conf,
            "\n[{name}]\n\
             max connections = {}\n\
             path = {SRV_NODE}/\n\
             read only = false\n\
             lock file = /var/lock/{name}.lock\n",
            max_connections(kind)
        );
    }
    conf
}

/// Files rendered locally and pushed to every storage node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFiles {
    pub mount_devices: PathBuf,
    pub rsyncd_conf: PathBuf,
}

pub fn write_generated_files(config: &DeployConfig) -> DeployResult<GeneratedFiles> {
    let dir = &config.swift.artifact_dir;
    std::fs::create_dir_all(dir)?;
    let files = GeneratedFiles {
        mount_devices: dir.join("mount_devices"),
        rsyncd_conf: dir.join("rsyncd.conf"),
    };
    std::fs::write(
        &files.mount_devices,
        mount_devices_script(&config.storage_devices()),
    )?;
    std::fs::write(&files.rsyncd_conf, rsyncd_conf())?;
    info!(
        "Generated {} and {}",
        files.mount_devices.display(),
        files.rsyncd_conf.display()
    );
    Ok(files)
}

/// Format and mount the data devices, install the boot-time mount hook,
/// then reboot so the hook is exercised.
pub fn phase1_operations(config: &DeployConfig, files: &GeneratedFiles) -> Vec<RemoteOperation> {
    let devices = config.storage_devices();
    let mut ops = sample_config_ops();
    for device in &devices {
        ops.push(RemoteOperation::sudo(format!(
            "mkfs.xfs -f -i size=512 -L {} {}",
            device.label, device.block_device
        )));
        ops.push(RemoteOperation::sudo(format!("mkdir -p {SRV_NODE}/{}", device.label)));
        ops.push(RemoteOperation::sudo(mount_command(device)));
    }
    ops.push(RemoteOperation::sudo("useradd swift").tolerated());
    ops.push(RemoteOperation::sudo(format!("chown -R swift:swift {SRV_NODE}")));
    ops.push(RemoteOperation::upload(
        &files.mount_devices,
        &mount_script_remote_path(),
        0o755,
    ));
    for line in [
        "start on runlevel [234]".to_string(),
        "stop on runlevel [0156]".to_string(),
        format!("exec {}", mount_script_remote_path()),
    ] {
        ops.push(RemoteOperation::append(UPSTART_CONF, &line));
    }
    for device in &devices {
        ops.push(RemoteOperation::sudo(format!("umount {SRV_NODE}/{}", device.label)));
    }
    // the connection drops under us
    ops.push(RemoteOperation::sudo("reboot").tolerated());
    ops
}

/// Boot id of every node that reports one, keyed by public address.
pub fn boot_ids<T: RemoteTransport + ?Sized>(
    nodes: &[NodeDescriptor],
    transport: &T,
) -> HashMap<String, String> {
    let mut ids = HashMap::new();
    for node in nodes {
        let host = &node.public_address;
        match transport.exec(host, BOOT_ID, false) {
            Ok(id) => {
                ids.insert(host.clone(), id.trim().to_string());
            }
            Err(e) => warn!("[{host}] no boot id: {e}"),
        }
    }
    ids
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostBoot {
    Down,
    SameBoot,
    Rebooted,
}

/// Block until every storage node answers again under a boot id different
/// from `before`. A host missing from `before` only has to answer.
pub fn wait_for_reboot<T: RemoteTransport + ?Sized>(
    nodes: &[NodeDescriptor],
    transport: &T,
    wait: &WaitConfig,
    before: &HashMap<String, String>,
) -> DeployResult<()> {
    let grace = wait.reboot_grace();
    info!("Giving {} storage node(s) {grace:?} to go down", nodes.len());
    std::thread::sleep(grace);

    let hosts: Vec<String> = nodes.iter().map(|n| n.public_address.clone()).collect();
    wait_until(
        "storage host",
        &hosts,
        |host| {
            if !transport.probe(host) {
                return Ok(HostBoot::Down);
            }
            let Ok(id) = transport.exec(host, BOOT_ID, false) else {
                return Ok(HostBoot::Down);
            };
            Ok(match before.get(host) {
                Some(old) if old == id.trim() => HostBoot::SameBoot,
                _ => HostBoot::Rebooted,
            })
        },
        |boot| *boot == HostBoot::Rebooted,
        &wait.reboot_policy(),
    )?;
    info!("All storage nodes are back");
    Ok(())
}

/// Rings, rsync and the storage services.
pub fn phase2_operations(
    config: &DeployConfig,
    rings: &RingArtifacts,
    files: &GeneratedFiles,
) -> Vec<RemoteOperation> {
    let mut ops = vec![RemoteOperation::run("df -k")];
    ops.extend(common_phase2_ops(config));
    ops.extend(
        rings
            .iter()
            .map(|artifact| RemoteOperation::upload(&artifact.path, &artifact.kind.remote_ring_path(), 0o644)),
    );
    ops.push(RemoteOperation::sudo(format!("chown -R swift:swift {SWIFT_ETC}")));
    ops.push(RemoteOperation::patch(
        "/etc/default/rsync",
        "RSYNC_ENABLE=false",
        "RSYNC_ENABLE=true",
    ));
    ops.push(RemoteOperation::upload(&files.rsyncd_conf, RSYNCD_CONF, 0o644));
    ops.push(RemoteOperation::service("rsync", ServiceAction::Start));
    ops.push(RemoteOperation::sudo("swift-init all start"));
    ops
}

/// Mount points a storage node should report after the reboot.
pub fn expected_mounts(config: &DeployConfig) -> Vec<String> {
    config
        .storage_devices()
        .iter()
        .map(|d| format!("{SRV_NODE}/{}", d.label))
        .collect()
}

/// Hosts whose `df -k` output lacks one of the data mounts. Missing mounts
/// are only warned about; the services still start on the root disk.
pub fn check_mounts<T: RemoteTransport + ?Sized>(
    nodes: &[NodeDescriptor],
    transport: &T,
    config: &DeployConfig,
) -> Vec<String> {
    let expected = expected_mounts(config);
    let mut unmounted = Vec::new();
    for node in nodes {
        let host = node.public_address.as_str();
        let missing: Vec<&str> = match transport.exec(host, "df -k", false) {
            Ok(df) => expected
                .iter()
                .filter(|m| !df.lines().any(|l| l.split_whitespace().last() == Some(m.as_str())))
                .map(String::as_str)
                .collect(),
            Err(e) => {
                warn!("[{host}] df -k failed: {e}");
                expected.iter().map(String::as_str).collect()
            }
        };
        if !missing.is_empty() {
            warn!("[{host}] not mounted after reboot: {}", missing.join(", "));
            unmounted.push(host.to_string());
        }
    }
    unmounted
}
