//! Machine settings.
//!
//! Settings are resolved once, when the instance is defined, and persisted
//! with it. The MAC address lives here so it survives stop/start.

use crate::error::CoreError;
use bhyvelet_host::MacAddress;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Default disk size in MiB.
pub const DEFAULT_DISK_MIB: u64 = 16384;
/// Default guest memory in MiB.
pub const DEFAULT_MEMORY_MIB: u64 = 1024;
pub const DEFAULT_CPUS: u32 = 1;
pub const DEFAULT_BRIDGE: &str = "bridge0";
pub const DEFAULT_SUBNET: &str = "192.168.99.1/24";
pub const DEFAULT_DHCP_RANGE: &str = "192.168.99.100,192.168.99.254";
pub const DEFAULT_SSH_USER: &str = "docker";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_ENGINE_PORT: u16 = 2376;

/// GRUB device the guest boots from.
pub const DEFAULT_BOOT_ROOT: &str = "cd0";

/// Immutable settings of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSettings {
    /// Operator-chosen instance name.
    pub name: String,
    /// Per-instance directory holding every file-backed resource.
    pub store_dir: PathBuf,
    /// Disk image size in bytes.
    pub disk_size: u64,
    pub memory_mib: u64,
    pub cpus: u32,
    pub bridge: String,
    /// Address assigned to the bridge, CIDR form.
    pub subnet: String,
    /// `start,end` of the DHCP pool.
    pub dhcp_range: String,
    /// Generated once, stable for the instance's lifetime.
    pub mac: MacAddress,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub engine_port: u16,
    pub boot_root: String,
}

impl MachineSettings {
    /// Create a new settings builder for instance `name` stored under
    /// `store_root/name`.
    pub fn builder(
        name: impl Into<String>,
        store_root: impl AsRef<Path>,
    ) -> MachineSettingsBuilder {
        let name = name.into();
        let store_dir = store_root.as_ref().join(&name);
        MachineSettingsBuilder {
            settings: PartialSettings {
                name,
                store_dir,
                ..PartialSettings::default()
            },
        }
    }

    pub fn disk_path(&self) -> PathBuf {
        self.store_dir.join("guest.img")
    }

    pub fn iso_path(&self) -> PathBuf {
        self.store_dir.join("boot.iso")
    }

    pub fn device_map_path(&self) -> PathBuf {
        self.store_dir.join("device.map")
    }

    /// dnsmasq lease file for this instance's DHCP server.
    pub fn lease_file(&self) -> PathBuf {
        self.store_dir.join("bhyve.leases")
    }

    pub fn dhcp_pid_file(&self) -> PathBuf {
        self.store_dir.join("dnsmasq.pid")
    }

    pub fn console_log(&self) -> PathBuf {
        self.store_dir.join("console.log")
    }

    pub fn console_pid_file(&self) -> PathBuf {
        self.store_dir.join("nmdm.pid")
    }

    /// Private key path; the public half is `id_rsa.pub`.
    pub fn ssh_key_path(&self) -> PathBuf {
        self.store_dir.join("id_rsa")
    }

    pub fn record_path(&self) -> PathBuf {
        self.store_dir.join("machine.json")
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.is_empty() {
            return Err(CoreError::Config("name is required".into()));
        }
        if self.name.contains('/') || self.name == "." || self.name == ".." {
            return Err(CoreError::Config(format!(
                "name {:?} is not a valid directory name",
                self.name
            )));
        }
        if self.disk_size == 0 {
            return Err(CoreError::Config("disk_size must be > 0".into()));
        }
        if self.memory_mib == 0 {
            return Err(CoreError::Config("memory_mib must be > 0".into()));
        }
        if self.cpus == 0 {
            return Err(CoreError::Config("cpus must be > 0".into()));
        }
        if self.bridge.is_empty() {
            return Err(CoreError::Config("bridge is required".into()));
        }
        parse_subnet(&self.subnet)?;
        parse_dhcp_range(&self.dhcp_range)?;
        if !self.mac.is_unicast() || !self.mac.is_locally_administered() {
            return Err(CoreError::Config(format!(
                "MAC {} must be unicast and locally administered",
                self.mac
            )));
        }
        Ok(())
    }
}

fn parse_subnet(subnet: &str) -> Result<(Ipv4Addr, u8), CoreError> {
    let invalid = || CoreError::Config(format!("subnet {subnet:?} is not an IPv4 CIDR"));
    let (addr, len) = subnet.split_once('/').ok_or_else(invalid)?;
    let addr = addr.parse().map_err(|_| invalid())?;
    let len: u8 = len.parse().map_err(|_| invalid())?;
    if len > 32 {
        return Err(invalid());
    }
    Ok((addr, len))
}

fn parse_dhcp_range(range: &str) -> Result<(Ipv4Addr, Ipv4Addr), CoreError> {
    let invalid = || CoreError::Config(format!("DHCP range {range:?} is not start,end"));
    let (start, end) = range.split_once(',').ok_or_else(invalid)?;
    let start: Ipv4Addr = start.trim().parse().map_err(|_| invalid())?;
    let end: Ipv4Addr = end.trim().parse().map_err(|_| invalid())?;
    if start > end {
        return Err(invalid());
    }
    Ok((start, end))
}

#[derive(Debug)]
struct PartialSettings {
    name: String,
    store_dir: PathBuf,
    disk_size: u64,
    memory_mib: u64,
    cpus: u32,
    bridge: String,
    subnet: String,
    dhcp_range: String,
    mac: Option<MacAddress>,
    ssh_user: String,
    ssh_port: u16,
    engine_port: u16,
    boot_root: String,
}

impl Default for PartialSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            store_dir: PathBuf::new(),
            disk_size: DEFAULT_DISK_MIB * MIB,
            memory_mib: DEFAULT_MEMORY_MIB,
            cpus: DEFAULT_CPUS,
            bridge: DEFAULT_BRIDGE.into(),
            subnet: DEFAULT_SUBNET.into(),
            dhcp_range: DEFAULT_DHCP_RANGE.into(),
            mac: None,
            ssh_user: DEFAULT_SSH_USER.into(),
            ssh_port: DEFAULT_SSH_PORT,
            engine_port: DEFAULT_ENGINE_PORT,
            boot_root: DEFAULT_BOOT_ROOT.into(),
        }
    }
}

/// Builder for [`MachineSettings`].
#[derive(Debug)]
pub struct MachineSettingsBuilder {
    settings: PartialSettings,
}

impl MachineSettingsBuilder {
    /// Set disk size in MiB.
    pub fn disk_mib(mut self, mib: u64) -> Self {
        self.settings.disk_size = mib.saturating_mul(MIB);
        self
    }

    /// Set disk size in bytes.
    pub fn disk_size(mut self, bytes: u64) -> Self {
        self.settings.disk_size = bytes;
        self
    }

    /// Set memory in MiB.
    pub fn memory_mib(mut self, mib: u64) -> Self {
        self.settings.memory_mib = mib;
        self
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.settings.cpus = cpus;
        self
    }

    pub fn bridge(mut self, bridge: impl Into<String>) -> Self {
        self.settings.bridge = bridge.into();
        self
    }

    pub fn subnet(mut self, subnet: impl Into<String>) -> Self {
        self.settings.subnet = subnet.into();
        self
    }

    pub fn dhcp_range(mut self, range: impl Into<String>) -> Self {
        self.settings.dhcp_range = range.into();
        self
    }

    /// Use a fixed MAC instead of generating one.
    pub fn mac(mut self, mac: MacAddress) -> Self {
        self.settings.mac = Some(mac);
        self
    }

    pub fn ssh_user(mut self, user: impl Into<String>) -> Self {
        self.settings.ssh_user = user.into();
        self
    }

    pub fn ssh_port(mut self, port: u16) -> Self {
        self.settings.ssh_port = port;
        self
    }

    pub fn engine_port(mut self, port: u16) -> Self {
        self.settings.engine_port = port;
        self
    }

    /// Build the settings, generating the MAC if none was given.
    pub fn build(self) -> Result<MachineSettings, CoreError> {
        let s = self.settings;
        let mac = match s.mac {
            Some(mac) => mac,
            None => MacAddress::generate()?,
        };
        let settings = MachineSettings {
            name: s.name,
            store_dir: s.store_dir,
            disk_size: s.disk_size,
            memory_mib: s.memory_mib,
            cpus: s.cpus,
            bridge: s.bridge,
            subnet: s.subnet,
            dhcp_range: s.dhcp_range,
            mac,
            ssh_user: s.ssh_user,
            ssh_port: s.ssh_port,
            engine_port: s.engine_port,
            boot_root: s.boot_root,
        };
        settings.validate()?;
        Ok(settings)
    }
}
