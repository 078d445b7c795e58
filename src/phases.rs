//! Role-specific configuration phases. Each phase is a fixed, ordered list of
//! [`RemoteOperation`]s; nothing branches on earlier results.

pub mod install;
pub mod proxy;
pub mod ring;
pub mod storage;

use crate::config::DeployConfig;
use crate::remote::RemoteOperation;

pub const SWIFT_ETC: &str = "/etc/swift";
pub const SWIFT_SRC: &str = "/opt/swift";
pub const SWIFT_CACHE: &str = "/var/cache/swift";
pub const SWIFT_LOG_DIR: &str = "/var/log/swift";

const SAMPLE_CONFIGS: &[&str] = &[
    "account-server.conf",
    "container-server.conf",
    "object-server.conf",
    "proxy-server.conf",
    "drive-audit.conf",
    "swift.conf",
];

/// Copy the sample configs shipped with the swift sources into /etc/swift.
pub(crate) fn sample_config_ops() -> Vec<RemoteOperation> {
    let src = format!("{SWIFT_SRC}/etc");
    let mut ops = vec![RemoteOperation::sudo(format!("mkdir -p {SWIFT_ETC}"))];
    ops.extend(SAMPLE_CONFIGS.iter().map(|conf| {
        RemoteOperation::sudo_in(&src, format!("cp {conf}-sample {SWIFT_ETC}/{conf}"))
    }));
    ops
}

/// Cache dir, hash path prefix/suffix and rsyslog routing; shared by the
/// second phase of both roles.
pub(crate) fn common_phase2_ops(config: &DeployConfig) -> Vec<RemoteOperation> {
    let swift_conf = format!("{SWIFT_ETC}/swift.conf");
    vec![
        RemoteOperation::sudo(format!("mkdir -p {SWIFT_CACHE}")),
        RemoteOperation::sudo(format!("chown -R swift:swift {SWIFT_CACHE}")),
        RemoteOperation::patch(
            &swift_conf,
            "swift_hash_path_prefix = changeme",
            &format!("swift_hash_path_prefix = {}", config.swift.hash_path_prefix),
        ),
        RemoteOperation::patch(
            &swift_conf,
            "swift_hash_path_suffix = changeme",
            &format!("swift_hash_path_suffix = {}", config.swift.hash_path_suffix),
        ),
        RemoteOperation::append(
            "/etc/rsyslog.d/0-swift.conf",
            &format!("local0.* {SWIFT_LOG_DIR}/all.log"),
        ),
        RemoteOperation::sudo(format!("mkdir -p {SWIFT_LOG_DIR}")),
        RemoteOperation::sudo(format!("chown -R syslog.adm {SWIFT_LOG_DIR}")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::OpKind;

    #[test]
    fn sample_configs_copied_from_source_tree() {
        let ops = sample_config_ops();
        assert_eq!(ops.len(), SAMPLE_CONFIGS.len() + 1);
        assert_eq!(
            ops[6].command_line().unwrap(),
            "cd '/opt/swift/etc' && cp swift.conf-sample /etc/swift/swift.conf"
        );
    }

    #[test]
    fn hash_patches_use_configured_values() {
        let mut config = DeployConfig::default();
        config.swift.hash_path_suffix = "feedface".into();
        let ops = common_phase2_ops(&config);
        let patches: Vec<_> = ops
            .iter()
            .filter_map(|op| match &op.kind {
                OpKind::Patch(p) => Some(p.replace.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            patches,
            vec![
                "swift_hash_path_prefix = 4f2b1586632d59a8",
                "swift_hash_path_suffix = feedface"
            ]
        );
    }
}
