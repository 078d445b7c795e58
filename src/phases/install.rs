use super::SWIFT_SRC;
use crate::config::DeployConfig;
use crate::remote::RemoteOperation;

const PACKAGE_SETS: &[&[&str]] = &[
    &[
        "gcc",
        "bzr",
        "python-configobj",
        "python-coverage",
        "python-dev",
        "python-nose",
        "python-setuptools",
    ],
    &[
        "python-simplejson",
        "python-xattr",
        "python-webob",
        "python-eventlet",
        "python-greenlet",
        "debhelper",
    ],
    &[
        "python-sphinx",
        "python-all",
        "python-openssl",
        "python-pastedeploy",
        "python-netifaces",
        "bzr-builddeb",
    ],
    &[
        "xfsprogs", "memcached", "nmap", "git", "python-pip", "sqlite3", "ssh", "curl", "rsync",
    ],
];

/// Packages and swift sources, identical for every role.
pub fn operations(config: &DeployConfig) -> Vec<RemoteOperation> {
    let mut ops = vec![RemoteOperation::sudo("apt-get update -y")];
    ops.extend(PACKAGE_SETS.iter().map(|pkgs| {
        RemoteOperation::sudo(format!(
            "DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
            pkgs.join(" ")
        ))
    }));
    ops.push(
        // fails harmlessly when the checkout is already there
        RemoteOperation::sudo_in("/opt", format!("git clone {} {SWIFT_SRC}", config.swift.git_url))
            .tolerated(),
    );
    ops.push(RemoteOperation::sudo_in(SWIFT_SRC, "python setup.py install"));
    ops
}
