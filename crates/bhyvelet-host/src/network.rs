//! Host network interface operations.

use crate::command::{execute, privileged};
use crate::error::{HostError, Result};
use async_trait::async_trait;

/// Operations on host network interfaces needed to wire a guest to a bridge.
#[async_trait]
pub trait NetworkHost: Send + Sync {
    /// Names of every interface currently present on the host.
    async fn interface_names(&self) -> Result<Vec<String>>;

    /// Create interface `name` (e.g. `tap3`).
    async fn create_interface(&self, name: &str) -> Result<()>;

    /// Add `member` to `bridge`.
    async fn add_bridge_member(&self, bridge: &str, member: &str) -> Result<()>;

    /// Mark interface `name` administratively up.
    async fn set_up(&self, name: &str) -> Result<()>;

    /// Assign an IPv4 address in CIDR form (`192.168.99.1/24`) to `name`.
    async fn set_address(&self, name: &str, cidr: &str) -> Result<()>;

    /// Destroy interface `name`.
    async fn destroy_interface(&self, name: &str) -> Result<()>;
}

/// [`NetworkHost`] backed by `getifaddrs(3)` and FreeBSD `ifconfig(8)`.
#[derive(Debug, Clone)]
pub struct Ifconfig {
    elevate: bool,
}

impl Ifconfig {
    /// `elevate` runs mutating `ifconfig` calls through `sudo`.
    pub fn new(elevate: bool) -> Self {
        Self { elevate }
    }

    async fn ifconfig(&self, args: &[&str]) -> Result<()> {
        let mut cmd = privileged(self.elevate, "ifconfig");
        cmd.args(args);
        execute(&mut cmd).await?;
        Ok(())
    }
}

#[async_trait]
impl NetworkHost for Ifconfig {
    async fn interface_names(&self) -> Result<Vec<String>> {
        let addrs = nix::ifaddrs::getifaddrs()
            .map_err(|e| HostError::Io(std::io::Error::from(e)))?;
        let mut names: Vec<String> = Vec::new();
        for addr in addrs {
            if !names.contains(&addr.interface_name) {
                names.push(addr.interface_name);
            }
        }
        tracing::trace!(count = names.len(), "enumerated host interfaces");
        Ok(names)
    }

    async fn create_interface(&self, name: &str) -> Result<()> {
        self.ifconfig(&[name, "create"]).await
    }

    async fn add_bridge_member(&self, bridge: &str, member: &str) -> Result<()> {
        self.ifconfig(&[bridge, "addm", member]).await
    }

    async fn set_up(&self, name: &str) -> Result<()> {
        self.ifconfig(&[name, "up"]).await
    }

    async fn set_address(&self, name: &str, cidr: &str) -> Result<()> {
        self.ifconfig(&[name, "inet", cidr]).await
    }

    async fn destroy_interface(&self, name: &str) -> Result<()> {
        self.ifconfig(&[name, "destroy"]).await
    }
}
