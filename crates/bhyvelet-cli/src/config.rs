//! Configuration for the CLI.
//!
//! Configuration is loaded from environment variables with the same defaults
//! the core settings builder uses.

use bhyvelet_core::{
    MachineSettings, DEFAULT_BRIDGE, DEFAULT_CPUS, DEFAULT_DHCP_RANGE, DEFAULT_DISK_MIB,
    DEFAULT_MEMORY_MIB, DEFAULT_SUBNET,
};
use std::path::PathBuf;

/// Per-invocation overrides from command-line flags.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub disk_mib: Option<u64>,
    pub memory_mib: Option<u64>,
    pub cpus: Option<u32>,
}

/// Configuration for the bhyvelet CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliConfig {
    /// Disk size in MiB (default: 16384).
    pub disk_mib: u64,
    /// Guest memory in MiB (default: 1024).
    pub memory_mib: u64,
    /// vCPU count (default: 1).
    pub cpus: u32,
    /// Bridge the guest taps join.
    pub bridge: String,
    /// Bridge address, CIDR form.
    pub subnet: String,
    /// DHCP pool, `start,end`.
    pub dhcp_range: String,
    /// Cached boot image copied into new instances.
    pub boot_iso: PathBuf,
    /// Root directory for per-instance store directories.
    pub store: PathBuf,
    /// Run privileged tools through `sudo` (default: true).
    pub sudo: bool,
}

/// Invalid environment value.
#[derive(Debug, thiserror::Error)]
#[error("invalid value {value:?} for {var}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl CliConfig {
    fn defaults(home: PathBuf) -> Self {
        Self {
            disk_mib: DEFAULT_DISK_MIB,
            memory_mib: DEFAULT_MEMORY_MIB,
            cpus: DEFAULT_CPUS,
            bridge: DEFAULT_BRIDGE.into(),
            subnet: DEFAULT_SUBNET.into(),
            dhcp_range: DEFAULT_DHCP_RANGE.into(),
            boot_iso: home.join(".docker/machine/cache/boot2docker.iso"),
            store: home.join(".bhyvelet/machines"),
            sudo: true,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `BHYVE_DISK_SIZE` | `16384` (MiB) |
    /// | `BHYVE_MEM_SIZE` | `1024` (MiB) |
    /// | `BHYVE_CPUS` | `1` |
    /// | `BHYVE_BRIDGE` | `bridge0` |
    /// | `BHYVE_SUBNET` | `192.168.99.1/24` |
    /// | `BHYVE_DHCPRANGE` | `192.168.99.100,192.168.99.254` |
    /// | `BHYVE_BOOT_ISO` | `~/.docker/machine/cache/boot2docker.iso` |
    /// | `BHYVELET_STORE` | `~/.bhyvelet/machines` |
    /// | `BHYVELET_SUDO` | `true` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`CliConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let home = lookup("HOME").map(PathBuf::from).unwrap_or_default();
        let default = Self::defaults(home);

        fn number<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            var: &'static str,
            default: T,
        ) -> Result<T, ConfigError> {
            match lookup(var) {
                Some(value) => value.trim().parse().map_err(|_| ConfigError { var, value }),
                None => Ok(default),
            }
        }

        Ok(Self {
            disk_mib: number(&lookup, "BHYVE_DISK_SIZE", default.disk_mib)?,
            memory_mib: number(&lookup, "BHYVE_MEM_SIZE", default.memory_mib)?,
            cpus: number(&lookup, "BHYVE_CPUS", default.cpus)?,
            bridge: lookup("BHYVE_BRIDGE").unwrap_or(default.bridge),
            subnet: lookup("BHYVE_SUBNET").unwrap_or(default.subnet),
            dhcp_range: lookup("BHYVE_DHCPRANGE").unwrap_or(default.dhcp_range),
            boot_iso: lookup("BHYVE_BOOT_ISO")
                .map(PathBuf::from)
                .unwrap_or(default.boot_iso),
            store: lookup("BHYVELET_STORE")
                .map(PathBuf::from)
                .unwrap_or(default.store),
            sudo: lookup("BHYVELET_SUDO")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(default.sudo),
        })
    }

    /// Store directory of instance `name`.
    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.store.join(name)
    }

    /// Settings for a new instance `name`.
    pub fn settings(
        &self,
        name: &str,
        overrides: &Overrides,
    ) -> bhyvelet_core::Result<MachineSettings> {
        MachineSettings::builder(name, &self.store)
            .disk_mib(overrides.disk_mib.unwrap_or(self.disk_mib))
            .memory_mib(overrides.memory_mib.unwrap_or(self.memory_mib))
            .cpus(overrides.cpus.unwrap_or(self.cpus))
            .bridge(&self.bridge)
            .subnet(&self.subnet)
            .dhcp_range(&self.dhcp_range)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = CliConfig::from_lookup(lookup(&[("HOME", "/home/alice")])).unwrap();
        assert_eq!(config.disk_mib, 16384);
        assert_eq!(config.memory_mib, 1024);
        assert_eq!(config.cpus, 1);
        assert_eq!(config.bridge, "bridge0");
        assert_eq!(config.dhcp_range, "192.168.99.100,192.168.99.254");
        assert_eq!(
            config.boot_iso,
            PathBuf::from("/home/alice/.docker/machine/cache/boot2docker.iso")
        );
        assert_eq!(config.store, PathBuf::from("/home/alice/.bhyvelet/machines"));
        assert!(config.sudo);
    }

    #[test]
    fn test_config_overrides() {
        let config = CliConfig::from_lookup(lookup(&[
            ("BHYVE_DISK_SIZE", "20000"),
            ("BHYVE_CPUS", "4"),
            ("BHYVE_BRIDGE", "bridge1"),
            ("BHYVELET_STORE", "/var/db/bhyvelet"),
            ("BHYVELET_SUDO", "0"),
        ]))
        .unwrap();
        assert_eq!(config.disk_mib, 20000);
        assert_eq!(config.cpus, 4);
        assert_eq!(config.bridge, "bridge1");
        assert_eq!(config.instance_dir("dev"), PathBuf::from("/var/db/bhyvelet/dev"));
        assert!(!config.sudo);
    }

    #[test]
    fn test_config_rejects_garbage_numbers() {
        let err = CliConfig::from_lookup(lookup(&[("BHYVE_MEM_SIZE", "lots")])).unwrap_err();
        assert_eq!(err.var, "BHYVE_MEM_SIZE");
    }

    #[test]
    fn test_settings_disk_in_bytes() {
        let config = CliConfig::from_lookup(lookup(&[("BHYVELET_STORE", "/s")])).unwrap();
        let settings = config
            .settings(
                "dev",
                &Overrides {
                    disk_mib: Some(2),
                    ..Overrides::default()
                },
            )
            .unwrap();
        assert_eq!(settings.disk_size, 2 * 1024 * 1024);
        assert_eq!(settings.store_dir, PathBuf::from("/s/dev"));
        assert_eq!(settings.memory_mib, 1024);
    }
}
