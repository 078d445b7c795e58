use super::*;
use std::path::Path;

/// [`RemoteTransport`] over `ssh`/`scp` with key based authentication.
pub struct SshTransport {
    user: String,
    key_path: PathBuf,
    port: u16,
}

impl SshTransport {
    pub fn new(user: &str, key_path: &Path, port: u16) -> Self {
        Self {
            user: user.to_string(),
            key_path: key_path.to_path_buf(),
            port,
        }
    }

    fn common_opts(&self) -> Vec<String> {
        let key = self.key_path.display().to_string();
        let mut opts = vec!["-i".to_string(), key];
        for opt in [
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
            "BatchMode=yes",
            "ConnectTimeout=10",
            "LogLevel=ERROR",
        ] {
            opts.push("-o".to_string());
            opts.push(opt.to_string());
        }
        opts
    }

    fn ssh_opts(&self) -> Vec<String> {
        let mut opts = self.common_opts();
        opts.push("-p".to_string());
        opts.push(self.port.to_string());
        opts
    }

    fn scp_opts(&self) -> Vec<String> {
        let mut opts = self.common_opts();
        opts.push("-P".to_string());
        opts.push(self.port.to_string());
        opts
    }

    fn target(&self, host: &str) -> String {
        format!("{}@{host}", self.user)
    }
}

fn wrap_sudo(command: &str) -> String {
    format!("sudo -n sh -c {}", shell_quote(command))
}

impl RemoteTransport for SshTransport {
    fn exec(&self, host: &str, command: &str, sudo: bool) -> io::Result<String> {
        let opts = self.ssh_opts();
        let target = self.target(host);
        let remote_cmd = if sudo {
            wrap_sudo(command)
        } else {
            command.to_string()
        };
        run_fun!(ssh $[opts] $target $remote_cmd)
    }

    fn upload(
        &self,
        host: &str,
        local: &Path,
        remote: &str,
        mode: u32,
        sudo: bool,
    ) -> io::Result<()> {
        let opts = self.scp_opts();
        let mode = format!("{mode:o}");
        if !sudo {
            let dest = format!("{}:{remote}", self.target(host));
            run_cmd!(scp -q $[opts] $local $dest)?;
            return self
                .exec(host, &format!("chmod {mode} {}", shell_quote(remote)), false)
                .map(|_| ());
        }

        // stage in /tmp, then move into place with root privileges
        let staged = format!("/tmp/swift-bootstrap.{}", uuid::Uuid::new_v4());
        let dest = format!("{}:{staged}", self.target(host));
        run_cmd!(scp -q $[opts] $local $dest)?;
        let install = format!(
            "install -m {mode} {staged} {} && rm -f {staged}",
            shell_quote(remote)
        );
        self.exec(host, &install, true).map(|_| ())
    }

    fn download(&self, host: &str, remote: &str, local: &Path) -> io::Result<()> {
        let opts = self.scp_opts();
        let src = format!("{}:{remote}", self.target(host));
        if let Some(dir) = local.parent() {
            std::fs::create_dir_all(dir)?;
        }
        run_cmd!(scp -q $[opts] $src $local)
    }

    fn probe(&self, host: &str) -> bool {
        let opts = self.ssh_opts();
        let target = self.target(host);
        run_cmd!(ssh $[opts] $target true 2>/dev/null).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sudo_wraps_whole_command_line() {
        assert_eq!(
            wrap_sudo("cd '/etc/swift' && swift-ring-builder account.builder"),
            r"sudo -n sh -c 'cd '\''/etc/swift'\'' && swift-ring-builder account.builder'"
        );
    }

    #[test]
    fn ssh_and_scp_use_their_own_port_flags() {
        let transport = SshTransport::new("ubuntu", Path::new("./key.pem"), 2222);
        let ssh = transport.ssh_opts();
        let scp = transport.scp_opts();
        assert_eq!(&ssh[..2], ["-i", "./key.pem"]);
        assert_eq!(&ssh[ssh.len() - 2..], ["-p", "2222"]);
        assert_eq!(&scp[scp.len() - 2..], ["-P", "2222"]);
        assert_eq!(transport.target("ec2-1.example"), "ubuntu@ec2-1.example");
    }
}
