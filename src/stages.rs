/// Build pipeline stage definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageInfo {
    pub name: &'static str,
    pub desc: &'static str,
    /// Stage creates cloud resources; a failure from here on may leave
    /// orphans behind.
    pub provisions: bool,
}

/// Ordered list of build pipeline stages
pub const STAGES: &[StageInfo] = &[
    StageInfo {
        name: names::SECURITY_POLICY,
        desc: "Key pair and security group ready",
        provisions: true,
    },
    StageInfo {
        name: names::PROXY_INSTANCES,
        desc: "Proxy instances running",
        provisions: true,
    },
    StageInfo {
        name: names::STORAGE_INSTANCES,
        desc: "Storage instances running with volumes attached",
        provisions: true,
    },
    StageInfo {
        name: names::TOPOLOGY,
        desc: "Cluster topology fixed",
        provisions: false,
    },
    StageInfo {
        name: names::INSTALL_SOFTWARE,
        desc: "Swift installed on all nodes",
        provisions: false,
    },
    StageInfo {
        name: names::PROXY_PHASE_1,
        desc: "Proxy nodes prepared",
        provisions: false,
    },
    StageInfo {
        name: names::PROXY_PHASE_2,
        desc: "Rings built, proxy server started",
        provisions: false,
    },
    StageInfo {
        name: names::STORAGE_PHASE_1,
        desc: "Storage devices formatted, nodes rebooting",
        provisions: false,
    },
    StageInfo {
        name: names::STORAGE_REBOOT_WAIT,
        desc: "Storage nodes back after reboot",
        provisions: false,
    },
    StageInfo {
        name: names::STORAGE_PHASE_2,
        desc: "Storage services started",
        provisions: false,
    },
];

/// Stage name constants
pub mod names {
    pub const SECURITY_POLICY: &str = "security-policy";
    pub const PROXY_INSTANCES: &str = "proxy-instances";
    pub const STORAGE_INSTANCES: &str = "storage-instances";
    pub const TOPOLOGY: &str = "topology";
    pub const INSTALL_SOFTWARE: &str = "install-software";
    pub const PROXY_PHASE_1: &str = "proxy-phase-1";
    pub const PROXY_PHASE_2: &str = "proxy-phase-2";
    pub const STORAGE_PHASE_1: &str = "storage-phase-1";
    pub const STORAGE_REBOOT_WAIT: &str = "storage-reboot-wait";
    pub const STORAGE_PHASE_2: &str = "storage-phase-2";
}

/// 1-based position of `name` in [`STAGES`].
pub fn position(name: &str) -> Option<usize> {
    STAGES.iter().position(|s| s.name == name).map(|i| i + 1)
}

pub fn get(name: &str) -> Option<&'static StageInfo> {
    STAGES.iter().find(|s| s.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_order() {
        assert_eq!(STAGES.len(), 10);
        assert_eq!(position(names::SECURITY_POLICY), Some(1));
        assert!(position(names::PROXY_PHASE_2) < position(names::STORAGE_PHASE_1));
        assert!(position(names::STORAGE_REBOOT_WAIT) < position(names::STORAGE_PHASE_2));
        assert_eq!(position("nope"), None);
    }

    #[test]
    fn only_leading_stages_provision() {
        let provisioning: Vec<&str> = STAGES
            .iter()
            .filter(|s| s.provisions)
            .map(|s| s.name)
            .collect();
        assert_eq!(
            provisioning,
            vec![
                names::SECURITY_POLICY,
                names::PROXY_INSTANCES,
                names::STORAGE_INSTANCES
            ]
        );
        assert!(get(names::TOPOLOGY).is_some_and(|s| !s.provisions));
    }
}
