//! Remote configuration: the operations a phase is made of, the transport
//! that carries them to a host, and the executor that replays an ordered
//! operation list across a group of hosts.

mod ssh;

pub use ssh::SshTransport;

use crate::error::{DeployError, DeployResult};
use crate::topology::{NodeDescriptor, NodeRole};
use cmd_lib::*;
use rayon::prelude::*;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn escape_sed_pattern(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '/' | '.' | '*' | '[' | ']' | '^' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_sed_replacement(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '/' | '&') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Exact-text search/replace within a remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub path: String,
    pub search: String,
    pub replace: String,
    /// Suffix for the copy of the original file, e.g. `.bak`.
    pub backup: Option<String>,
}

impl FilePatch {
    /// `sed` invocation replacing every literal occurrence of `search`.
    pub fn to_sed_command(&self) -> String {
        let script = format!(
            "s/{}/{}/g",
            escape_sed_pattern(&self.search),
            escape_sed_replacement(&self.replace)
        );
        format!(
            "sed -i{} -e {} {}",
            self.backup.as_deref().unwrap_or(""),
            shell_quote(&script),
            shell_quote(&self.path)
        )
    }
}

/// Append `line` to `path` unless the exact line is already there.
pub fn append_line_command(path: &str, line: &str) -> String {
    let path = shell_quote(path);
    let line = shell_quote(line);
    format!("grep -qxF -- {line} {path} || echo {line} >> {path}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    Command {
        cmd: String,
        sudo: bool,
        cwd: Option<String>,
    },
    Upload {
        local: PathBuf,
        remote: String,
        mode: u32,
        sudo: bool,
    },
    Download {
        remote: String,
        local: PathBuf,
    },
    Patch(FilePatch),
    Append {
        path: String,
        line: String,
    },
    Service {
        name: String,
        action: ServiceAction,
    },
}

/// One atomic step of remote configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOperation {
    pub kind: OpKind,
    /// A failure of this operation never aborts the host, even in strict
    /// mode (e.g. `useradd` of a user that may already exist).
    pub tolerate_failure: bool,
}

impl RemoteOperation {
    fn new(kind: OpKind) -> Self {
        Self {
            kind,
            tolerate_failure: false,
        }
    }

    pub fn sudo(cmd: impl Into<String>) -> Self {
        Self::new(OpKind::Command {
            cmd: cmd.into(),
            sudo: true,
            cwd: None,
        })
    }

    pub fn sudo_in(cwd: &str, cmd: impl Into<String>) -> Self {
        Self::new(OpKind::Command {
            cmd: cmd.into(),
            sudo: true,
            cwd: Some(cwd.to_string()),
        })
    }

    pub fn run(cmd: impl Into<String>) -> Self {
        Self::new(OpKind::Command {
            cmd: cmd.into(),
            sudo: false,
            cwd: None,
        })
    }

    pub fn upload(local: impl Into<PathBuf>, remote: &str, mode: u32) -> Self {
        Self::new(OpKind::Upload {
            local: local.into(),
            remote: remote.to_string(),
            mode,
            sudo: true,
        })
    }

    pub fn download(remote: &str, local: impl Into<PathBuf>) -> Self {
        Self::new(OpKind::Download {
            remote: remote.to_string(),
            local: local.into(),
        })
    }

    /// Literal search/replace keeping a `.bak` copy of the original.
    pub fn patch(path: &str, search: &str, replace: &str) -> Self {
        Self::new(OpKind::Patch(FilePatch {
            path: path.to_string(),
            search: search.to_string(),
            replace: replace.to_string(),
            backup: Some(".bak".to_string()),
        }))
    }

    pub fn append(path: &str, line: &str) -> Self {
        Self::new(OpKind::Append {
            path: path.to_string(),
            line: line.to_string(),
        })
    }

    pub fn service(name: &str, action: ServiceAction) -> Self {
        Self::new(OpKind::Service {
            name: name.to_string(),
            action,
        })
    }

    pub fn tolerated(mut self) -> Self {
        self.tolerate_failure = true;
        self
    }

    /// Shell command line for command-like operations.
    pub fn command_line(&self) -> Option<String> {
        match &self.kind {
            OpKind::Command { cmd, cwd, .. } => Some(match cwd {
                Some(dir) => format!("cd {} && {cmd}", shell_quote(dir)),
                None => cmd.clone(),
            }),
            OpKind::Service { name, action } => Some(format!("service {name} {}", action.as_str())),
            _ => None,
        }
    }

    fn apply<T: RemoteTransport + ?Sized>(&self, transport: &T, host: &str) -> io::Result<()> {
        match &self.kind {
            OpKind::Command { sudo, .. } => {
                let cmd = self.command_line().unwrap_or_default();
                transport.exec(host, &cmd, *sudo).map(|_| ())
            }
            OpKind::Service { .. } => {
                let cmd = self.command_line().unwrap_or_default();
                transport.exec(host, &cmd, true).map(|_| ())
            }
            OpKind::Upload {
                local,
                remote,
                mode,
                sudo,
            } => transport.upload(host, local, remote, *mode, *sudo),
            OpKind::Download { remote, local } => transport.download(host, remote, local),
            OpKind::Patch(patch) => transport.patch_file(host, patch),
            OpKind::Append { path, line } => transport.append_line(host, path, line),
        }
    }
}

impl fmt::Display for RemoteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OpKind::Command { sudo: true, .. } => {
                write!(f, "sudo {}", self.command_line().unwrap_or_default())
            }
            OpKind::Command { .. } | OpKind::Service { .. } => {
                write!(f, "{}", self.command_line().unwrap_or_default())
            }
            OpKind::Upload { local, remote, .. } => {
                write!(f, "put {} -> {remote}", local.display())
            }
            OpKind::Download { remote, local } => {
                write!(f, "get {remote} -> {}", local.display())
            }
            OpKind::Patch(p) => write!(f, "sed {}: '{}' -> '{}'", p.path, p.search, p.replace),
            OpKind::Append { path, line } => write!(f, "append {path}: '{line}'"),
        }
    }
}

/// Secure-shell style access to a named host.
///
/// `patch_file`, `append_line` and `probe` have default implementations in
/// terms of `exec`; transports may override them.
pub trait RemoteTransport: Sync {
    /// Run `command` through the remote shell and return its stdout. A
    /// non-zero exit status is an error.
    fn exec(&self, host: &str, command: &str, sudo: bool) -> io::Result<String>;

    fn upload(&self, host: &str, local: &Path, remote: &str, mode: u32, sudo: bool)
    -> io::Result<()>;

    fn download(&self, host: &str, remote: &str, local: &Path) -> io::Result<()>;

    fn patch_file(&self, host: &str, patch: &FilePatch) -> io::Result<()> {
        self.exec(host, &patch.to_sed_command(), true).map(|_| ())
    }

    fn append_line(&self, host: &str, path: &str, line: &str) -> io::Result<()> {
        self.exec(host, &append_line_command(path, line), true)
            .map(|_| ())
    }

    /// Cheap reachability check.
    fn probe(&self, host: &str) -> bool {
        self.exec(host, "true", false).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// The first non-tolerated failure stops the remaining operations on
    /// that host.
    Strict,
    /// Failures are recorded and execution moves on.
    Tolerant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    Succeeded,
    FailedTolerated(String),
    FailedFatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRecord {
    pub host: String,
    pub op: String,
    pub outcome: OpOutcome,
}

/// What happened to every operation of a phase, per host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: String,
    records: Vec<OpRecord>,
}

impl PhaseReport {
    pub fn new(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[OpRecord] {
        &self.records
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &OpRecord> {
        self.records
            .iter()
            .filter(|r| r.outcome == OpOutcome::Succeeded)
    }

    pub fn tolerated(&self) -> impl Iterator<Item = &OpRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r.outcome, OpOutcome::FailedTolerated(_)))
    }

    pub fn fatal(&self) -> impl Iterator<Item = &OpRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r.outcome, OpOutcome::FailedFatal(_)))
    }

    pub fn is_clean(&self) -> bool {
        self.records
            .iter()
            .all(|r| r.outcome == OpOutcome::Succeeded)
    }

    pub fn extend(&mut self, other: PhaseReport) {
        self.records.extend(other.records);
    }

    /// First fatal failure as an error, if any.
    pub fn check(&self) -> DeployResult<()> {
        match self.records.iter().find_map(|r| match &r.outcome {
            OpOutcome::FailedFatal(reason) => Some((r, reason)),
            _ => None,
        }) {
            Some((record, reason)) => Err(DeployError::RemoteFailure {
                host: record.host.clone(),
                op: record.op.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn log_summary(&self) {
        let ok = self.succeeded().count();
        let tolerated = self.tolerated().count();
        let fatal = self.fatal().count();
        if tolerated == 0 && fatal == 0 {
            info!("{}: {ok} operation(s) succeeded", self.phase);
            return;
        }
        warn!(
            "{}: {ok} succeeded, {tolerated} failed (tolerated), {fatal} failed (fatal)",
            self.phase
        );
        for record in self.tolerated().chain(self.fatal()) {
            warn!("  [{}] {}", record.host, record.op);
        }
    }
}

/// A set of hosts of one role, configured together by one phase.
pub struct HostGroup<'a, T: RemoteTransport + ?Sized> {
    role: NodeRole,
    nodes: &'a [NodeDescriptor],
    transport: &'a T,
    max_parallel: usize,
}

impl<'a, T: RemoteTransport + ?Sized> HostGroup<'a, T> {
    pub fn new(
        role: NodeRole,
        nodes: &'a [NodeDescriptor],
        transport: &'a T,
        max_parallel: usize,
    ) -> DeployResult<Self> {
        if let Some(node) = nodes.iter().find(|n| n.role != role) {
            return Err(DeployError::Topology(format!(
                "{} node {} in {role} host group",
                node.role, node.instance_id
            )));
        }
        Ok(Self {
            role,
            nodes,
            transport,
            max_parallel: max_parallel.max(1),
        })
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn nodes(&self) -> &'a [NodeDescriptor] {
        self.nodes
    }

    pub fn transport(&self) -> &'a T {
        self.transport
    }

    /// Replay the same ordered operations on every host.
    pub fn run(&self, phase: &str, ops: &[RemoteOperation], mode: ExecMode) -> DeployResult<PhaseReport> {
        self.run_with(phase, mode, |_| ops.to_vec())
    }

    /// Like [`HostGroup::run`], with the operation list built per node (for
    /// steps that need the node's own address). Returns once every host is
    /// done.
    pub fn run_with<F>(&self, phase: &str, mode: ExecMode, ops_for: F) -> DeployResult<PhaseReport>
    where
        F: Fn(&NodeDescriptor) -> Vec<RemoteOperation> + Sync,
    {
        info!("START: {phase} on {} {} host(s)", self.nodes.len(), self.role);

        let per_host: Vec<Vec<OpRecord>> = if self.max_parallel > 1 && self.nodes.len() > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.max_parallel.min(self.nodes.len()))
                .build()
                .map_err(|e| DeployError::Io(io::Error::other(e)))?;
            pool.install(|| {
                self.nodes
                    .par_iter()
                    .map(|node| self.run_on_host(node, &ops_for(node), mode))
                    .collect()
            })
        } else {
            self.nodes
                .iter()
                .map(|node| self.run_on_host(node, &ops_for(node), mode))
                .collect()
        };

        let mut report = PhaseReport::new(phase);
        for records in per_host {
            report.records.extend(records);
        }
        info!("END: {phase}");
        Ok(report)
    }

    fn run_on_host(
        &self,
        node: &NodeDescriptor,
        ops: &[RemoteOperation],
        mode: ExecMode,
    ) -> Vec<OpRecord> {
        let host = node.public_address.as_str();
        let mut records = Vec::with_capacity(ops.len());
        for op in ops {
            debug!("[{host}] {op}");
            let outcome = match op.apply(self.transport, host) {
                Ok(()) => OpOutcome::Succeeded,
                Err(e) if mode == ExecMode::Tolerant || op.tolerate_failure => {
                    warn!("[{host}] `{op}` failed, continuing: {e}");
                    OpOutcome::FailedTolerated(e.to_string())
                }
                Err(e) => {
                    error!("[{host}] `{op}` failed: {e}");
                    OpOutcome::FailedFatal(e.to_string())
                }
            };
            let stop = matches!(outcome, OpOutcome::FailedFatal(_));
            records.push(OpRecord {
                host: host.to_string(),
                op: op.to_string(),
                outcome,
            });
            if stop {
                break;
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn sed_escapes_literal_text() {
        let patch = FilePatch {
            path: "/etc/swift/proxy-server.conf".into(),
            search: "# bind_ip = 0.0.0.0".into(),
            replace: "bind_ip = 10.0.0.1".into(),
            backup: Some(".bak".into()),
        };
        assert_eq!(
            patch.to_sed_command(),
            r"sed -i.bak -e 's/# bind_ip = 0\.0\.0\.0/bind_ip = 10.0.0.1/g' '/etc/swift/proxy-server.conf'"
        );
    }

    #[test]
    fn sed_escapes_slashes_and_ampersands() {
        let patch = FilePatch {
            path: "/etc/x".into(),
            search: "a/b[1]".into(),
            replace: "c&d/e".into(),
            backup: None,
        };
        assert_eq!(
            patch.to_sed_command(),
            r"sed -i -e 's/a\/b\[1\]/c\&d\/e/g' '/etc/x'"
        );
    }

    #[test]
    fn append_is_guarded_by_exact_grep() {
        assert_eq!(
            append_line_command("/etc/init/start_swift.conf", "start on runlevel [234]"),
            "grep -qxF -- 'start on runlevel [234]' '/etc/init/start_swift.conf' \
             || echo 'start on runlevel [234]' >> '/etc/init/start_swift.conf'"
        );
    }

    #[test]
    fn command_in_directory() {
        let op = RemoteOperation::sudo_in("/opt/swift", "python setup.py install");
        assert_eq!(
            op.command_line().unwrap(),
            "cd '/opt/swift' && python setup.py install"
        );
        assert_eq!(
            op.to_string(),
            "sudo cd '/opt/swift' && python setup.py install"
        );
        assert!(!op.tolerate_failure);
        assert!(RemoteOperation::sudo("useradd swift").tolerated().tolerate_failure);
    }

    #[test]
    fn report_check_surfaces_first_fatal() {
        let mut report = PhaseReport::new("phase");
        report.records.push(OpRecord {
            host: "h1".into(),
            op: "a".into(),
            outcome: OpOutcome::FailedTolerated("x".into()),
        });
        assert!(report.check().is_ok());
        assert!(!report.is_clean());
        report.records.push(OpRecord {
            host: "h2".into(),
            op: "b".into(),
            outcome: OpOutcome::FailedFatal("boom".into()),
        });
        let err = report.check().unwrap_err();
        assert!(matches!(err, DeployError::RemoteFailure { ref host, .. } if host == "h2"));
    }
}
