use clap::Parser;
use cmd_lib::*;
use std::path::PathBuf;
use swift_bootstrap::cloud::AwsCli;
use swift_bootstrap::remote::SshTransport;
use swift_bootstrap::{DeployConfig, build_cluster};

#[derive(Parser)]
#[clap(
    name = "swift-bootstrap",
    about = "Provision and configure a swift cluster on ec2"
)]
enum Cmd {
    #[command(name = "build_cluster", about = "Provision and configure the whole cluster")]
    BuildCluster {
        #[clap(long, help = "TOML file overriding the built-in defaults")]
        config: Option<PathBuf>,
    },
    #[command(name = "print_config", about = "Print the effective configuration")]
    PrintConfig {
        #[clap(long)]
        config: Option<PathBuf>,
    },
}

#[cmd_lib::main]
fn main() -> CmdResult {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .init();

    match Cmd::parse() {
        Cmd::BuildCluster { config } => {
            let config = DeployConfig::load(config.as_deref())?;
            let cloud = AwsCli::new(&config.cloud.region);
            let transport =
                SshTransport::new(&config.remote.login, &config.key_path(), config.remote.ssh_port);
            let build = build_cluster(&config, &cloud, &transport)?;
            info!(
                "Cluster {} is up: {} proxy node(s), {} storage node(s)",
                build.cluster_id,
                build.topology.proxies().len(),
                build.topology.storage().len()
            );
            Ok(())
        }
        Cmd::PrintConfig { config } => {
            let config = DeployConfig::load(config.as_deref())?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}
