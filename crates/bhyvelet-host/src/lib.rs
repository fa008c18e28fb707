//! # bhyvelet-host
//!
//! Host-side plumbing for running a single bhyve guest per logical instance.
//! Everything here talks to the live operating system (device nodes, network
//! interfaces, external tools) and knows nothing about lifecycle ordering;
//! that lives in `bhyvelet-core`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bhyvelet_host::{allocate_tap, find_console_device, Fstat, Ifconfig, ConsolePolicy};
//!
//! # async fn example() -> bhyvelet_host::Result<()> {
//! let net = Ifconfig::new(true);
//! let tap = allocate_tap(&net, "bridge0").await.map_err(|e| e.source)?;
//!
//! let console = find_console_device(&Fstat::default(), &ConsolePolicy::default()).await?;
//! println!("tap={tap} console={}", console.path().display());
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Identity**: deterministic VM names and random locally-administered MACs
//! - **Device Allocation**: next free `tapN` and `nmdmN` device pair
//! - **Lease Lookup**: MAC to IP resolution from a dnsmasq lease file
//! - **Teardown**: bounded destroy loop with an explicit outcome
//! - **Command Execution**: captured stdout/stderr with structured logging

mod command;
mod console;
mod error;
mod hypervisor;
mod identity;
mod lease;
mod netsetup;
mod network;
mod tap;

pub use command::{execute, privileged, CommandFailure};
pub use console::{
    find_console_device, ConsoleDevice, ConsoleLogger, ConsolePolicy, DaemonConsoleLogger,
    DeviceProbe, Fstat, MAX_CONSOLE_DEVICES,
};
pub use error::{HostError, Result};
pub use hypervisor::{
    bhyve_args, destroy_until_gone, Bhyve, BootSpec, DestroyOutcome, DestroyPolicy, Hypervisor,
    LaunchSpec,
};
pub use identity::{
    current_username, MacAddress, MacParseError, VmIdentity, IDENTITY_PREFIX, MAC_PREFIX,
};
pub use lease::{lookup, parse_record, LeaseRecord};
pub use netsetup::{
    dnsmasq_args, ensure_bridge, ensure_ip_forwarding, kernel_module_loaded, parse_sysctl_flag,
    start_dhcp_server, DhcpServer,
};
pub use network::{Ifconfig, NetworkHost};
pub use tap::{allocate_tap, next_tap_name, tap_index, TapAllocationError, TAP_PREFIX};
