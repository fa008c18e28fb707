//! Host preparation run before the first Create.

use crate::config::MachineSettings;
use crate::error::{CoreError, Result};
use crate::host::Host;
use bhyvelet_host::{
    ensure_bridge, ensure_ip_forwarding, kernel_module_loaded, start_dhcp_server, DhcpServer,
};

/// Kernel modules the guest depends on.
pub const REQUIRED_MODULES: &[&str] = &["vmm", "nmdm", "if_bridge", "if_tap"];

/// Tools invoked over the instance lifecycle.
pub const REQUIRED_COMMANDS: &[&str] = &[
    "bhyve",
    "bhyvectl",
    "grub-bhyve",
    "dnsmasq",
    "daemon",
    "cu",
    "fstat",
    "ifconfig",
    "sysctl",
    "kldstat",
    "ssh-keygen",
];

/// Entries of `commands` with no executable on `PATH`.
pub fn missing_commands<'a>(commands: &[&'a str]) -> Vec<&'a str> {
    commands
        .iter()
        .copied()
        .filter(|cmd| which::which(cmd).is_err())
        .collect()
}

/// Verify kernel modules and tools, then bring up forwarding, the bridge,
/// and the instance's DHCP server.
pub async fn run(settings: &MachineSettings, host: &Host, elevate: bool) -> Result<()> {
    for module in REQUIRED_MODULES {
        if !kernel_module_loaded(module).await? {
            return Err(CoreError::Precheck(format!(
                "kernel module {module} is not loaded (kldload {module})"
            )));
        }
    }
    tracing::debug!("kernel modules present");

    let mut commands = REQUIRED_COMMANDS.to_vec();
    if elevate {
        commands.push("sudo");
    }
    let missing = missing_commands(&commands);
    if !missing.is_empty() {
        return Err(CoreError::Precheck(format!(
            "required commands not found in PATH: {}",
            missing.join(", ")
        )));
    }
    tracing::debug!("required commands present");

    ensure_ip_forwarding(elevate).await?;
    ensure_bridge(host.network.as_ref(), &settings.bridge, &settings.subnet).await?;

    tokio::fs::create_dir_all(&settings.store_dir)
        .await
        .map_err(CoreError::resource(&settings.store_dir))?;
    let dhcp = DhcpServer {
        bridge: settings.bridge.clone(),
        range: settings.dhcp_range.clone(),
        lease_file: settings.lease_file(),
        pid_file: settings.dhcp_pid_file(),
    };
    start_dhcp_server(&dhcp, elevate).await?;

    tracing::info!(instance = %settings.name, bridge = %settings.bridge, "host ready");
    Ok(())
}
