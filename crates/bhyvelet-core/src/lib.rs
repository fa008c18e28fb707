//! # bhyvelet-core
//!
//! Lifecycle state machine for a single bhyve guest.
//!
//! An [`Instance`] owns its settings and the ephemeral host resources it
//! holds while running. Everything it touches on the host goes through the
//! trait objects bundled in [`Host`], so the lifecycle can be driven against
//! fakes.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    bhyvelet-core                           │
//! │                                                            │
//! │  Instance ── create() ── disk image + key bundle           │
//! │     │        start()  ── console, tap, bhyve, IP poll      │
//! │     │        kill()   ── Teardown (fail loudly)            │
//! │     ▼                                                      │
//! │  ResourceLease (tap, nmdm, console helper pid)             │
//! └────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │  bhyvelet-host: Hypervisor, NetworkHost, DeviceProbe,      │
//! │                 ConsoleLogger, lease file, commands        │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use bhyvelet_core::{Host, Instance, MachineSettings};
//!
//! # async fn example() -> bhyvelet_core::Result<()> {
//! let settings = MachineSettings::builder("default", "/home/me/.bhyvelet/machines")
//!     .memory_mib(2048)
//!     .cpus(2)
//!     .build()?;
//!
//! let host = Host::system(true, "/home/me/.docker/machine/cache/boot2docker.iso");
//! bhyvelet_core::precheck::run(&settings, &host, true).await?;
//!
//! let mut instance = Instance::new(settings, host);
//! instance.create().await?;
//! println!("docker at {}", instance.url().await?);
//!
//! instance.remove().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Lifecycle**: Create, Start, Stop/Kill, Remove, Restart, GetIP
//! - **Derived State**: no in-memory running flag; the device node decides
//! - **Bounded Waits**: IP discovery and teardown never loop forever
//! - **Clean Failure**: a failed Start releases what it allocated

mod config;
pub mod discovery;
mod disk;
mod error;
mod host;
mod instance;
pub mod precheck;
mod provision;
mod reachability;
mod resources;
mod teardown;

pub use config::{
    MachineSettings, MachineSettingsBuilder, DEFAULT_BRIDGE, DEFAULT_CPUS, DEFAULT_DHCP_RANGE,
    DEFAULT_DISK_MIB, DEFAULT_ENGINE_PORT, DEFAULT_MEMORY_MIB, DEFAULT_SSH_PORT, DEFAULT_SSH_USER,
    DEFAULT_SUBNET, MIB,
};
pub use discovery::{wait_for_ip, wait_for_lease, PollPolicy};
pub use disk::{create_disk_image, key_bundle, FORMAT_MARKER};
pub use error::{CoreError, Result};
pub use host::{Host, Policies};
pub use instance::{Instance, InstanceState, DRIVER_NAME};
pub use provision::{BootMedia, CachedIso, KeyProvider, SshKeygen};
pub use reachability::{Reachability, TcpProbe};
pub use resources::ResourceLease;
pub use teardown::Teardown;
