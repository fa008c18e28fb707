//! bhyve process control and the bounded destroy loop.

use crate::command::{execute, privileged};
use crate::console::ConsoleDevice;
use crate::error::Result;
use crate::identity::{MacAddress, VmIdentity};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything bhyve needs to boot one guest.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub identity: VmIdentity,
    pub cpus: u32,
    pub memory_mib: u64,
    pub tap: String,
    pub mac: MacAddress,
    pub disk: PathBuf,
    pub iso: PathBuf,
    pub console: ConsoleDevice,
}

/// Inputs for loading the guest kernel with `grub-bhyve`.
#[derive(Debug, Clone)]
pub struct BootSpec {
    pub identity: VmIdentity,
    pub device_map: PathBuf,
    pub memory_mib: u64,
    /// GRUB device to boot from, as named in the device map.
    pub root: String,
}

impl BootSpec {
    /// Contents of a `device.map` mapping the boot media and the disk.
    pub fn device_map_contents(iso: &Path, disk: &Path) -> String {
        format!("(hd0) {}\n(cd0) {}\n", disk.display(), iso.display())
    }
}

/// Arguments for `bhyve(8)` implementing `spec`.
pub fn bhyve_args(spec: &LaunchSpec) -> Vec<String> {
    vec![
        "-A".into(),
        "-H".into(),
        "-P".into(),
        "-s".into(),
        "0:0,hostbridge".into(),
        "-s".into(),
        "1:0,lpc".into(),
        "-s".into(),
        format!("2:0,virtio-net,{},mac={}", spec.tap, spec.mac),
        "-s".into(),
        format!("3:0,virtio-blk,{}", spec.disk.display()),
        "-s".into(),
        "4:0,virtio-rnd".into(),
        "-s".into(),
        format!("5:0,ahci-cd,{}", spec.iso.display()),
        "-l".into(),
        format!("com1,{}", spec.console.guest_end().display()),
        "-c".into(),
        spec.cpus.to_string(),
        "-m".into(),
        format!("{}M", spec.memory_mib),
        spec.identity.to_string(),
    ]
}

/// The hypervisor as seen from the host.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Whether the runtime device node for `identity` exists. This is the
    /// only authoritative "is it running" signal.
    async fn is_present(&self, identity: &VmIdentity) -> Result<bool>;

    /// Issue one destroy request for `identity`.
    async fn destroy(&self, identity: &VmIdentity) -> Result<()>;

    /// Load the guest kernel into a fresh VM.
    async fn load_guest(&self, boot: &BootSpec) -> Result<()>;

    /// Launch the guest. Returns once the launcher has handed off to a
    /// detached process; says nothing about guest readiness.
    async fn launch(&self, spec: &LaunchSpec) -> Result<()>;
}

/// FreeBSD bhyve driven through `bhyvectl`, `grub-bhyve`, and `daemon`.
#[derive(Debug, Clone)]
pub struct Bhyve {
    vmm_dir: PathBuf,
    elevate: bool,
}

impl Bhyve {
    pub fn new(elevate: bool) -> Self {
        Self {
            vmm_dir: PathBuf::from("/dev/vmm"),
            elevate,
        }
    }

    /// Look for device nodes under `dir` instead of `/dev/vmm`.
    pub fn with_vmm_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.vmm_dir = dir.into();
        self
    }

    pub fn node_path(&self, identity: &VmIdentity) -> PathBuf {
        self.vmm_dir.join(identity.as_str())
    }
}

#[async_trait]
impl Hypervisor for Bhyve {
    async fn is_present(&self, identity: &VmIdentity) -> Result<bool> {
        let present = tokio::fs::try_exists(self.node_path(identity)).await?;
        debug!(%identity, present, "checked vmm node");
        Ok(present)
    }

    async fn destroy(&self, identity: &VmIdentity) -> Result<()> {
        let mut cmd = privileged(self.elevate, "bhyvectl");
        cmd.arg("--destroy").arg(format!("--vm={identity}"));
        execute(&mut cmd).await?;
        Ok(())
    }

    async fn load_guest(&self, boot: &BootSpec) -> Result<()> {
        let mut cmd = privileged(self.elevate, "grub-bhyve");
        cmd.arg("-m")
            .arg(&boot.device_map)
            .args(["-r", boot.root.as_str()])
            .arg("-M")
            .arg(format!("{}M", boot.memory_mib))
            .arg(boot.identity.as_str());
        execute(&mut cmd).await?;
        info!(identity = %boot.identity, "guest kernel loaded");
        Ok(())
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        let mut cmd = privileged(self.elevate, "daemon");
        cmd.arg("-t")
            .arg(format!("bhyve: {}", spec.identity))
            .arg("-f")
            .arg("bhyve")
            .args(bhyve_args(spec));
        let output = execute(&mut cmd).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(identity = %spec.identity, stderr = %stderr.trim(), "bhyve launcher output");
        }
        info!(identity = %spec.identity, tap = %spec.tap, "bhyve launched");
        Ok(())
    }
}

/// Bounds for [`destroy_until_gone`].
#[derive(Debug, Clone)]
pub struct DestroyPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for DestroyPolicy {
    fn default() -> Self {
        Self {
            attempts: 16,
            interval: Duration::from_millis(100),
        }
    }
}

/// Result of the destroy loop. The caller decides what `StillPresent` means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// The node is gone; `attempts` destroy requests were issued.
    Destroyed { attempts: u32 },
    /// The node survived every attempt.
    StillPresent { attempts: u32 },
}

/// Issue destroy requests until the VM's device node disappears or the
/// attempt budget runs out.
///
/// A destroy request that fails while the node has meanwhile vanished counts
/// as success; one that fails with the node still present is returned.
pub async fn destroy_until_gone(
    hv: &dyn Hypervisor,
    identity: &VmIdentity,
    policy: &DestroyPolicy,
) -> Result<DestroyOutcome> {
    let mut attempts = 0;
    while attempts < policy.attempts {
        if !hv.is_present(identity).await? {
            debug!(%identity, attempts, "vmm node absent");
            return Ok(DestroyOutcome::Destroyed { attempts });
        }
        attempts += 1;
        if let Err(e) = hv.destroy(identity).await {
            if !hv.is_present(identity).await? {
                debug!(%identity, error = %e, "destroy failed but node is gone");
                return Ok(DestroyOutcome::Destroyed { attempts });
            }
            return Err(e);
        }
        tokio::time::sleep(policy.interval).await;
    }

    if hv.is_present(identity).await? {
        warn!(%identity, attempts, "vmm node survived destroy attempts");
        Ok(DestroyOutcome::StillPresent { attempts })
    } else {
        Ok(DestroyOutcome::Destroyed { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Node disappears after `destroys_needed` destroy calls.
    struct Sticky {
        destroys_needed: u32,
        destroys: AtomicU32,
        fail_destroy: bool,
    }

    impl Sticky {
        fn new(destroys_needed: u32) -> Self {
            Self {
                destroys_needed,
                destroys: AtomicU32::new(0),
                fail_destroy: false,
            }
        }
    }

    #[async_trait]
    impl Hypervisor for Sticky {
        async fn is_present(&self, _identity: &VmIdentity) -> Result<bool> {
            Ok(self.destroys.load(Ordering::SeqCst) < self.destroys_needed)
        }
        async fn destroy(&self, _identity: &VmIdentity) -> Result<()> {
            if self.fail_destroy {
                return Err(HostError::Io(std::io::Error::other("bhyvectl exploded")));
            }
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn load_guest(&self, _boot: &BootSpec) -> Result<()> {
            Ok(())
        }
        async fn launch(&self, _spec: &LaunchSpec) -> Result<()> {
            Ok(())
        }
    }

    fn identity() -> VmIdentity {
        VmIdentity::derive("tester", "vm")
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_absent_is_noop() {
        let hv = Sticky::new(0);
        let outcome = destroy_until_gone(&hv, &identity(), &DestroyPolicy::default())
            .await
            .unwrap();
        assert_eq!(outcome, DestroyOutcome::Destroyed { attempts: 0 });
        assert_eq!(hv.destroys.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_retries_until_gone() {
        let hv = Sticky::new(3);
        let outcome = destroy_until_gone(&hv, &identity(), &DestroyPolicy::default())
            .await
            .unwrap();
        assert_eq!(outcome, DestroyOutcome::Destroyed { attempts: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_reports_survivor() {
        let hv = Sticky::new(u32::MAX);
        let start = tokio::time::Instant::now();
        let outcome = destroy_until_gone(&hv, &identity(), &DestroyPolicy::default())
            .await
            .unwrap();
        assert_eq!(outcome, DestroyOutcome::StillPresent { attempts: 16 });
        assert_eq!(start.elapsed(), Duration::from_millis(1600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_error_with_node_present() {
        let hv = Sticky {
            fail_destroy: true,
            ..Sticky::new(1)
        };
        let err = destroy_until_gone(&hv, &identity(), &DestroyPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Io(_)));
    }

    #[tokio::test]
    async fn test_bhyve_node_probe() {
        let dir = tempfile::tempdir().unwrap();
        let hv = Bhyve::new(false).with_vmm_dir(dir.path());
        let id = identity();
        assert!(!hv.is_present(&id).await.unwrap());

        std::fs::write(hv.node_path(&id), b"").unwrap();
        assert!(hv.is_present(&id).await.unwrap());
    }

    #[test]
    fn test_bhyve_args() {
        let spec = LaunchSpec {
            identity: identity(),
            cpus: 2,
            memory_mib: 1024,
            tap: "tap3".into(),
            mac: MacAddress::new([0x02, 0x68, 0x79, 0xaa, 0xbb, 0xcc]),
            disk: PathBuf::from("/m/guest.img"),
            iso: PathBuf::from("/m/boot.iso"),
            console: ConsoleDevice::new(4),
        };
        let args = bhyve_args(&spec);
        assert!(args.contains(&"2:0,virtio-net,tap3,mac=02:68:79:aa:bb:cc".to_string()));
        assert!(args.contains(&"3:0,virtio-blk,/m/guest.img".to_string()));
        assert!(args.contains(&"5:0,ahci-cd,/m/boot.iso".to_string()));
        assert!(args.contains(&"com1,/dev/nmdm4A".to_string()));
        assert!(args.contains(&"1024M".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("bhyvelet-tester-vm"));
    }

    #[test]
    fn test_device_map() {
        let map =
            BootSpec::device_map_contents(Path::new("/m/boot.iso"), Path::new("/m/guest.img"));
        assert_eq!(map, "(hd0) /m/guest.img\n(cd0) /m/boot.iso\n");
    }
}
