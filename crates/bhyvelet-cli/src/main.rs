//! bhyvelet command-line entry point.
//!
//! One subcommand per lifecycle operation, each taking the instance name.
//! Logs go to stderr; command results (addresses, URLs, states) to stdout.

mod config;

use anyhow::Context;
use bhyvelet_core::{precheck, Host, Instance};
use clap::{Parser, Subcommand};
use config::{CliConfig, Overrides};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bhyvelet", version, about = "Run a boot2docker guest under FreeBSD bhyve")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Prepare the host, provision the instance, and start it
    Create {
        name: String,
        /// Disk size in MiB
        #[arg(long)]
        disk_size: Option<u64>,
        /// Memory in MiB
        #[arg(long)]
        memory: Option<u64>,
        #[arg(long)]
        cpus: Option<u32>,
    },
    /// Boot a created instance
    Start { name: String },
    /// Destroy the VM, keeping its disk
    Stop { name: String },
    /// Same as stop
    Kill { name: String },
    /// Destroy the VM and delete its disk
    Remove { name: String },
    /// Stop if running, then start
    Restart { name: String },
    /// Print the guest's IP address
    Ip { name: String },
    /// Print Absent, Created, or Running
    State { name: String },
    /// Print the Docker engine URL
    Url { name: String },
    /// Check and prepare the host without creating anything
    Precheck { name: String },
}

async fn open(config: &CliConfig, host: Host, name: &str) -> anyhow::Result<Instance> {
    let dir = config.instance_dir(name);
    Instance::open(&dir, host)
        .await
        .with_context(|| format!("instance {name} not found in {}", dir.display()))
}

async fn run(command: Command, config: &CliConfig) -> anyhow::Result<()> {
    let host = Host::system(config.sudo, &config.boot_iso);

    match command {
        Command::Create {
            name,
            disk_size,
            memory,
            cpus,
        } => {
            let overrides = Overrides {
                disk_mib: disk_size,
                memory_mib: memory,
                cpus,
            };
            let settings = config.settings(&name, &overrides)?;
            precheck::run(&settings, &host, config.sudo).await?;
            let mut instance = Instance::new(settings, host);
            instance.create().await?;
            println!("{}", instance.url().await?);
        }
        Command::Start { name } => open(config, host, &name).await?.start().await?,
        Command::Stop { name } => open(config, host, &name).await?.stop().await?,
        Command::Kill { name } => open(config, host, &name).await?.kill().await?,
        Command::Remove { name } => open(config, host, &name).await?.remove().await?,
        Command::Restart { name } => open(config, host, &name).await?.restart().await?,
        Command::Ip { name } => println!("{}", open(config, host, &name).await?.get_ip().await?),
        Command::State { name } => println!("{}", open(config, host, &name).await?.state().await?),
        Command::Url { name } => println!("{}", open(config, host, &name).await?.url().await?),
        Command::Precheck { name } => {
            let settings = match Instance::open(&config.instance_dir(&name), host.clone()).await {
                Ok(instance) => instance.settings().clone(),
                Err(_) => config.settings(&name, &Overrides::default())?,
            };
            precheck::run(&settings, &host, config.sudo).await?;
            println!("host ready for {name}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("bhyvelet=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = CliConfig::from_env()?;
    tracing::debug!(?config, "configuration loaded");

    run(cli.command, &config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_create_flags() {
        let cli = Cli::try_parse_from([
            "bhyvelet", "create", "dev", "--cpus", "2", "--memory", "2048",
        ])
        .unwrap();
        match cli.command {
            Command::Create {
                name,
                cpus,
                memory,
                disk_size,
            } => {
                assert_eq!(name, "dev");
                assert_eq!(cpus, Some(2));
                assert_eq!(memory, Some(2048));
                assert_eq!(disk_size, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_name_is_required() {
        assert!(Cli::try_parse_from(["bhyvelet", "start"]).is_err());
    }
}
