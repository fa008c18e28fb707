//! One-time host network preparation: IP forwarding, the bridge, and the
//! dnsmasq instance that hands out guest leases.

use crate::command::{command_to_string, execute, privileged};
use crate::error::{HostError, Result};
use crate::network::NetworkHost;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

const IP_FORWARDING: &str = "net.inet.ip.forwarding";

/// Parse the numeric output of `sysctl -n` as a boolean flag.
pub fn parse_sysctl_flag(output: &str) -> Result<bool> {
    output
        .trim()
        .parse::<i64>()
        .map(|v| v != 0)
        .map_err(|_| HostError::Parse {
            command: "sysctl -n".into(),
            output: output.to_string(),
        })
}

/// Enable IPv4 forwarding if it is off.
pub async fn ensure_ip_forwarding(elevate: bool) -> Result<()> {
    let output = execute(Command::new("sysctl").args(["-n", IP_FORWARDING])).await?;
    if parse_sysctl_flag(&String::from_utf8_lossy(&output.stdout))? {
        debug!("IP forwarding already enabled");
        return Ok(());
    }
    let mut cmd = privileged(elevate, "sysctl");
    cmd.arg(format!("{IP_FORWARDING}=1"));
    execute(&mut cmd).await?;
    info!("IP forwarding enabled");
    Ok(())
}

/// Whether kernel module `name` is loaded (`kldstat -q -m`).
pub async fn kernel_module_loaded(name: &str) -> Result<bool> {
    let mut cmd = Command::new("kldstat");
    cmd.args(["-q", "-m", name]);
    let status = cmd
        .status()
        .await
        .map_err(|source| HostError::ExecutionStart {
            command: command_to_string(cmd.as_std()),
            source,
        })?;
    Ok(status.success())
}

/// Create `bridge` with address `subnet` unless it already exists.
pub async fn ensure_bridge(net: &dyn NetworkHost, bridge: &str, subnet: &str) -> Result<()> {
    if net.interface_names().await?.iter().any(|n| n == bridge) {
        debug!(bridge, "bridge already present");
        return Ok(());
    }
    net.create_interface(bridge).await?;
    net.set_address(bridge, subnet).await?;
    net.set_up(bridge).await?;
    info!(bridge, subnet, "bridge created");
    Ok(())
}

/// A dnsmasq instance serving one DHCP range on one bridge.
#[derive(Debug, Clone)]
pub struct DhcpServer {
    pub bridge: String,
    /// `start,end` as dnsmasq expects it.
    pub range: String,
    pub lease_file: PathBuf,
    pub pid_file: PathBuf,
}

/// Arguments for a DHCP-only dnsmasq.
pub fn dnsmasq_args(server: &DhcpServer) -> Vec<String> {
    vec![
        "--port=0".into(),
        format!("--interface={}", server.bridge),
        "--bind-interfaces".into(),
        "--except-interface=lo0".into(),
        format!("--dhcp-range={}", server.range),
        format!("--dhcp-leasefile={}", server.lease_file.display()),
        format!("--pid-file={}", server.pid_file.display()),
    ]
}

async fn server_running(server: &DhcpServer) -> Result<bool> {
    let pid = match tokio::fs::read_to_string(&server.pid_file).await {
        Ok(contents) => contents.trim().parse::<i32>().ok(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    let Some(pid) = pid else {
        return Ok(false);
    };
    // Signal 0 checks existence; EPERM means it exists under another user.
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
        Ok(()) | Err(nix::errno::Errno::EPERM) => Ok(true),
        Err(_) => Ok(false),
    }
}

/// Start dnsmasq for `server` unless its pid file names a live process.
pub async fn start_dhcp_server(server: &DhcpServer, elevate: bool) -> Result<()> {
    if server_running(server).await? {
        debug!(pid_file = %server.pid_file.display(), "dnsmasq already running");
        return Ok(());
    }
    let mut cmd = privileged(elevate, "dnsmasq");
    cmd.args(dnsmasq_args(server));
    execute(&mut cmd).await?;
    info!(bridge = %server.bridge, range = %server.range, "dnsmasq started");
    Ok(())
}
