//! The instance lifecycle: Create, Start, Stop/Kill, Remove, Restart, GetIP.
//!
//! Nothing here tracks "running" in memory. The hypervisor's device node is
//! probed every time, and [`InstanceState`] is derived from it and from the
//! presence of the disk image.

use crate::config::MachineSettings;
use crate::discovery::wait_for_lease;
use crate::disk::{create_disk_image, key_bundle};
use crate::error::{CoreError, Result};
use crate::host::Host;
use crate::resources::ResourceLease;
use bhyvelet_host::{allocate_tap, find_console_device, lookup, BootSpec, LaunchSpec, VmIdentity};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

/// Name this driver reports to callers.
pub const DRIVER_NAME: &str = "bhyve";

/// Derived lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// No disk image.
    Absent,
    /// Disk image exists, no VM.
    Created,
    /// The hypervisor's device node exists.
    Running,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "Absent"),
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
        }
    }
}

/// On-disk form of an instance, `machine.json`.
#[derive(Debug, Serialize, Deserialize)]
struct MachineRecord {
    settings: MachineSettings,
    #[serde(default)]
    resources: ResourceLease,
}

/// One managed VM.
///
/// Lifecycle methods take `&mut self`; concurrent use from several processes
/// must be serialized by the caller.
#[derive(Debug)]
pub struct Instance {
    settings: MachineSettings,
    resources: ResourceLease,
    ip: Option<IpAddr>,
    host: Host,
}

impl Instance {
    /// A new, not yet created instance.
    pub fn new(settings: MachineSettings, host: Host) -> Self {
        Self {
            settings,
            resources: ResourceLease::default(),
            ip: None,
            host,
        }
    }

    /// Load a previously created instance from its `machine.json`.
    pub async fn open(store_dir: &Path, host: Host) -> Result<Self> {
        let path = store_dir.join("machine.json");
        let data = tokio::fs::read(&path)
            .await
            .map_err(CoreError::resource(&path))?;
        let record: MachineRecord = serde_json::from_slice(&data)?;
        tracing::debug!(
            instance = %record.settings.name,
            path = %path.display(),
            "instance loaded"
        );
        Ok(Self {
            settings: record.settings,
            resources: record.resources,
            ip: None,
            host,
        })
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &MachineSettings {
        &self.settings
    }

    pub fn resources(&self) -> &ResourceLease {
        &self.resources
    }

    pub fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn ssh_user(&self) -> &str {
        &self.settings.ssh_user
    }

    /// Hypervisor name for the current user; recomputed on every call.
    pub fn identity(&self) -> Result<VmIdentity> {
        Ok(VmIdentity::for_current_user(&self.settings.name)?)
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.host.hypervisor.is_present(&self.identity()?).await?)
    }

    /// Current state, derived from the disk image and the device node.
    pub async fn state(&self) -> Result<InstanceState> {
        if self.is_running().await? {
            return Ok(InstanceState::Running);
        }
        let disk = self.settings.disk_path();
        let exists = tokio::fs::try_exists(&disk)
            .await
            .map_err(CoreError::resource(&disk))?;
        Ok(if exists {
            InstanceState::Created
        } else {
            InstanceState::Absent
        })
    }

    fn expect_state(expected: InstanceState, actual: InstanceState) -> Result<()> {
        if expected != actual {
            return Err(CoreError::InvalidState { expected, actual });
        }
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let record = MachineRecord {
            settings: self.settings.clone(),
            resources: self.resources.clone(),
        };
        let path = self.settings.record_path();
        let data = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(&path, data)
            .await
            .map_err(CoreError::resource(&path))?;
        tracing::trace!(path = %path.display(), "instance record saved");
        Ok(())
    }

    /// Provision the store directory, boot media, and disk image, then start.
    pub async fn create(&mut self) -> Result<()> {
        Self::expect_state(InstanceState::Absent, self.state().await?)?;
        let start = std::time::Instant::now();
        tracing::info!(
            instance = %self.settings.name,
            disk_size = self.settings.disk_size,
            memory_mib = self.settings.memory_mib,
            cpus = self.settings.cpus,
            "creating instance"
        );

        let dir = &self.settings.store_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(CoreError::resource(dir))?;

        self.host.boot_media.provision(&self.settings.iso_path()).await?;

        let public_key = self.host.keys.public_key(&self.settings.ssh_key_path()).await?;
        let disk = self.settings.disk_path();
        let bundle = key_bundle(&public_key).map_err(CoreError::resource(&disk))?;
        create_disk_image(&disk, self.settings.disk_size, &bundle).await?;
        self.save().await?;

        tracing::debug!(
            instance = %self.settings.name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "instance provisioned"
        );
        self.start().await
    }

    /// Boot the guest and wait until it is reachable.
    ///
    /// Resources still recorded from an earlier run are released first, and
    /// Start fails if that release fails. On failure every resource
    /// allocated so far is released before the error is returned.
    pub async fn start(&mut self) -> Result<()> {
        Self::expect_state(InstanceState::Created, self.state().await?)?;
        let identity = self.identity()?;
        let start = std::time::Instant::now();
        tracing::info!(instance = %self.settings.name, %identity, "starting instance");

        // Records left by a teardown that failed part way must be released
        // before new ones overwrite them.
        if !self.resources.is_empty() {
            tracing::info!(instance = %self.settings.name, "releasing resources from previous run");
            self.release(&identity).await?;
            self.save().await?;
        }

        match self.boot(&identity).await {
            Ok(ip) => {
                self.ip = Some(ip);
                self.save().await?;
                tracing::info!(
                    instance = %self.settings.name,
                    %ip,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "instance running"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    instance = %self.settings.name,
                    error = %e,
                    "start failed, releasing resources"
                );
                if let Err(release) = self.release(&identity).await {
                    tracing::warn!(
                        instance = %self.settings.name,
                        error = %release,
                        "release after failed start"
                    );
                }
                if let Err(save) = self.save().await {
                    tracing::warn!(
                        instance = %self.settings.name,
                        error = %save,
                        "saving record after failed start"
                    );
                }
                Err(e)
            }
        }
    }

    async fn boot(&mut self, identity: &VmIdentity) -> Result<IpAddr> {
        let settings = &self.settings;
        let device_map = settings.device_map_path();
        let iso = settings.iso_path();
        let disk = settings.disk_path();
        tokio::fs::write(&device_map, BootSpec::device_map_contents(&iso, &disk))
            .await
            .map_err(CoreError::resource(&device_map))?;

        self.host
            .hypervisor
            .load_guest(&BootSpec {
                identity: identity.clone(),
                device_map,
                memory_mib: settings.memory_mib,
                root: settings.boot_root.clone(),
            })
            .await?;

        let console =
            find_console_device(self.host.devices.as_ref(), &self.host.policies.console).await?;
        self.resources.record_console_device(console);

        let tap = match allocate_tap(self.host.network.as_ref(), &self.settings.bridge).await {
            Ok(tap) => tap,
            Err(e) => {
                if let Some(created) = e.created {
                    self.resources.record_network_device(created);
                }
                return Err(e.source.into());
            }
        };
        self.resources.record_network_device(&tap);
        self.save().await?;

        let settings = &self.settings;
        let pid = self
            .host
            .console
            .spawn(&console, &settings.console_log(), &settings.console_pid_file())
            .await?;
        self.resources.record_console_pid(pid);

        let settings = &self.settings;
        self.host
            .hypervisor
            .launch(&LaunchSpec {
                identity: identity.clone(),
                cpus: settings.cpus,
                memory_mib: settings.memory_mib,
                tap,
                mac: settings.mac,
                disk,
                iso,
                console,
            })
            .await?;

        let ip = wait_for_lease(
            &settings.lease_file(),
            &settings.mac,
            &self.host.policies.discovery,
        )
        .await?;
        self.host
            .reachability
            .wait(SocketAddr::new(ip, settings.ssh_port))
            .await?;
        Ok(ip)
    }

    async fn release(&mut self, identity: &VmIdentity) -> Result<()> {
        let pid_file = self.settings.console_pid_file();
        self.host
            .teardown()
            .run(identity, &mut self.resources, &mut self.ip, &pid_file)
            .await
    }

    /// Destroy the VM and release its resources. Same as [`Instance::stop`].
    pub async fn kill(&mut self) -> Result<()> {
        let identity = self.identity()?;
        tracing::info!(instance = %self.settings.name, %identity, "stopping instance");
        let result = self.release(&identity).await;
        if tokio::fs::try_exists(&self.settings.store_dir)
            .await
            .unwrap_or(false)
        {
            self.save().await?;
        }
        result
    }

    /// Alias of [`Instance::kill`]; the guest gets no shutdown request.
    pub async fn stop(&mut self) -> Result<()> {
        self.kill().await
    }

    /// Kill, then delete the disk image.
    pub async fn remove(&mut self) -> Result<()> {
        if let Err(e) = self.kill().await {
            tracing::debug!(
                instance = %self.settings.name,
                error = %e,
                "kill before remove failed, perhaps already dead"
            );
        }

        let disk = self.settings.disk_path();
        match tokio::fs::remove_file(&disk).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CoreError::Resource {
                    path: disk,
                    source: e,
                })
            }
        }
        tracing::info!(instance = %self.settings.name, "instance removed");
        Ok(())
    }

    /// Stop if running, then start.
    pub async fn restart(&mut self) -> Result<()> {
        if self.is_running().await? {
            self.stop().await?;
        }
        self.start().await
    }

    /// Guest address; requires a running VM.
    ///
    /// Uses the cached address when there is one, otherwise does a single
    /// lease lookup and caches the result.
    pub async fn get_ip(&mut self) -> Result<IpAddr> {
        if !self.is_running().await? {
            return Err(CoreError::NotRunning(self.settings.name.clone()));
        }
        if let Some(ip) = self.ip {
            return Ok(ip);
        }
        let ip = lookup(&self.settings.lease_file(), &self.settings.mac).await?;
        self.ip = Some(ip);
        Ok(ip)
    }

    /// Hostname for SSH; the guest's address.
    pub async fn ssh_hostname(&mut self) -> Result<String> {
        Ok(self.get_ip().await?.to_string())
    }

    /// Docker engine endpoint, `tcp://<ip>:<engine_port>`.
    pub async fn url(&mut self) -> Result<String> {
        let ip = self.get_ip().await?;
        Ok(format!(
            "tcp://{}",
            SocketAddr::new(ip, self.settings.engine_port)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(InstanceState::Absent.to_string(), "Absent");
        assert_eq!(InstanceState::Created.to_string(), "Created");
        assert_eq!(InstanceState::Running.to_string(), "Running");
    }

    #[test]
    fn test_expect_state() {
        assert!(Instance::expect_state(InstanceState::Created, InstanceState::Created).is_ok());
        let err =
            Instance::expect_state(InstanceState::Absent, InstanceState::Running).unwrap_err();
        assert_eq!(err.to_string(), "invalid state: expected Absent, got Running");
    }

    #[test]
    fn test_record_without_resources() {
        let settings = MachineSettings::builder("vm", "/s").build().unwrap();
        let json = serde_json::json!({ "settings": settings });
        let record: MachineRecord = serde_json::from_value(json).unwrap();
        assert!(record.resources.is_empty());
    }
}
