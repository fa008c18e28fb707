//! Reverse of Start: destroy the VM, then release what it held.
//!
//! Fails loudly: a VM that survives the destroy loop stops teardown before
//! its tap is touched, and the caller gets [`CoreError::TeardownIncomplete`].

use crate::error::{CoreError, Result};
use crate::resources::ResourceLease;
use bhyvelet_host::{
    destroy_until_gone, ConsoleLogger, DestroyOutcome, DestroyPolicy, Hypervisor, NetworkHost,
    VmIdentity,
};
use std::net::IpAddr;
use std::path::Path;

/// Host collaborators teardown needs.
pub struct Teardown<'a> {
    pub hypervisor: &'a dyn Hypervisor,
    pub network: &'a dyn NetworkHost,
    pub console: &'a dyn ConsoleLogger,
    pub policy: &'a DestroyPolicy,
}

impl Teardown<'_> {
    /// Tear down `identity` and release everything recorded in `lease`.
    ///
    /// Running it again after success is a no-op.
    pub async fn run(
        &self,
        identity: &VmIdentity,
        lease: &mut ResourceLease,
        ip: &mut Option<IpAddr>,
        console_pid_file: &Path,
    ) -> Result<()> {
        match destroy_until_gone(self.hypervisor, identity, self.policy).await? {
            DestroyOutcome::Destroyed { attempts } => {
                tracing::debug!(%identity, attempts, "VM destroyed");
            }
            DestroyOutcome::StillPresent { attempts } => {
                return Err(CoreError::TeardownIncomplete {
                    identity: identity.to_string(),
                    attempts,
                });
            }
        }

        if let Some(tap) = lease.network_device() {
            self.network.destroy_interface(tap).await?;
            tracing::debug!(%identity, tap, "tap destroyed");
            lease.release_network_device();
        }

        *ip = None;

        self.stop_console_logger(lease, console_pid_file).await?;
        lease.release_console_device();

        tracing::info!(%identity, "teardown complete");
        Ok(())
    }

    /// Only the pid recorded at spawn time is signalled. A pid file on its
    /// own may be left over from an earlier boot and is just removed.
    async fn stop_console_logger(&self, lease: &mut ResourceLease, pid_file: &Path) -> Result<()> {
        if let Some(pid) = lease.console_pid() {
            self.console.terminate(pid).await?;
        }
        lease.release_console_pid();

        match tokio::fs::remove_file(pid_file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %pid_file.display(), error = %e, "failed to remove pid file");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bhyvelet_host::{BootSpec, ConsoleDevice, HostError, LaunchSpec};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeHv {
        present: AtomicBool,
        immortal: bool,
        destroys: AtomicU32,
    }

    #[async_trait]
    impl Hypervisor for FakeHv {
        async fn is_present(&self, _identity: &VmIdentity) -> bhyvelet_host::Result<bool> {
            Ok(self.present.load(Ordering::SeqCst))
        }
        async fn destroy(&self, _identity: &VmIdentity) -> bhyvelet_host::Result<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            if !self.immortal {
                self.present.store(false, Ordering::SeqCst);
            }
            Ok(())
        }
        async fn load_guest(&self, _boot: &BootSpec) -> bhyvelet_host::Result<()> {
            Ok(())
        }
        async fn launch(&self, _spec: &LaunchSpec) -> bhyvelet_host::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeNet {
        destroyed: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl NetworkHost for FakeNet {
        async fn interface_names(&self) -> bhyvelet_host::Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn create_interface(&self, _name: &str) -> bhyvelet_host::Result<()> {
            Ok(())
        }
        async fn add_bridge_member(
            &self,
            _bridge: &str,
            _member: &str,
        ) -> bhyvelet_host::Result<()> {
            Ok(())
        }
        async fn set_up(&self, _name: &str) -> bhyvelet_host::Result<()> {
            Ok(())
        }
        async fn set_address(&self, _name: &str, _cidr: &str) -> bhyvelet_host::Result<()> {
            Ok(())
        }
        async fn destroy_interface(&self, name: &str) -> bhyvelet_host::Result<()> {
            if self.fail {
                return Err(HostError::Io(std::io::Error::other("ifconfig busy")));
            }
            self.destroyed.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeConsole {
        terminated: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl ConsoleLogger for FakeConsole {
        async fn spawn(
            &self,
            _device: &ConsoleDevice,
            _log_path: &Path,
            _pid_path: &Path,
        ) -> bhyvelet_host::Result<u32> {
            Ok(1)
        }
        async fn terminate(&self, pid: u32) -> bhyvelet_host::Result<()> {
            self.terminated.lock().unwrap().push(pid);
            Ok(())
        }
    }

    fn held() -> ResourceLease {
        let mut lease = ResourceLease::default();
        lease.record_network_device("tap4");
        lease.record_console_device(ConsoleDevice::new(2));
        lease.record_console_pid(321);
        lease
    }

    fn identity() -> VmIdentity {
        VmIdentity::derive("tester", "vm")
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("nmdm.pid");
        std::fs::write(&pid_file, "321\n").unwrap();

        let hv = FakeHv::default();
        hv.present.store(true, Ordering::SeqCst);
        let net = FakeNet::default();
        let console = FakeConsole::default();
        let policy = DestroyPolicy::default();
        let teardown = Teardown {
            hypervisor: &hv,
            network: &net,
            console: &console,
            policy: &policy,
        };

        let mut lease = held();
        let mut ip = Some("10.0.0.5".parse().unwrap());
        teardown
            .run(&identity(), &mut lease, &mut ip, &pid_file)
            .await
            .unwrap();

        assert!(lease.is_empty());
        assert_eq!(ip, None);
        assert_eq!(net.destroyed.lock().unwrap().as_slice(), ["tap4"]);
        assert_eq!(console.terminated.lock().unwrap().as_slice(), [321]);
        assert!(!pid_file.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_teardown_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("nmdm.pid");
        let hv = FakeHv::default();
        hv.present.store(true, Ordering::SeqCst);
        let net = FakeNet::default();
        let console = FakeConsole::default();
        let policy = DestroyPolicy::default();
        let teardown = Teardown {
            hypervisor: &hv,
            network: &net,
            console: &console,
            policy: &policy,
        };

        let mut lease = held();
        let mut ip = None;
        teardown
            .run(&identity(), &mut lease, &mut ip, &pid_file)
            .await
            .unwrap();
        teardown
            .run(&identity(), &mut lease, &mut ip, &pid_file)
            .await
            .unwrap();

        assert_eq!(hv.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(net.destroyed.lock().unwrap().len(), 1);
        assert_eq!(console.terminated.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecorded_pid_file_is_not_signalled() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("nmdm.pid");
        std::fs::write(&pid_file, "1\n").unwrap();

        let hv = FakeHv::default();
        let net = FakeNet::default();
        let console = FakeConsole::default();
        let policy = DestroyPolicy::default();
        let teardown = Teardown {
            hypervisor: &hv,
            network: &net,
            console: &console,
            policy: &policy,
        };

        let mut lease = ResourceLease::default();
        let mut ip = None;
        teardown
            .run(&identity(), &mut lease, &mut ip, &pid_file)
            .await
            .unwrap();

        assert!(console.terminated.lock().unwrap().is_empty());
        assert!(!pid_file.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_surviving_vm_keeps_tap() {
        let dir = tempfile::tempdir().unwrap();
        let hv = FakeHv {
            immortal: true,
            ..FakeHv::default()
        };
        hv.present.store(true, Ordering::SeqCst);
        let net = FakeNet::default();
        let console = FakeConsole::default();
        let policy = DestroyPolicy::default();
        let teardown = Teardown {
            hypervisor: &hv,
            network: &net,
            console: &console,
            policy: &policy,
        };

        let mut lease = held();
        let mut ip = None;
        let err = teardown
            .run(&identity(), &mut lease, &mut ip, &dir.path().join("nmdm.pid"))
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::TeardownIncomplete { attempts: 16, .. }));
        assert_eq!(lease.network_device(), Some("tap4"));
        assert!(net.destroyed.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tap_failure_keeps_record() {
        let dir = tempfile::tempdir().unwrap();
        let hv = FakeHv::default();
        let net = FakeNet {
            fail: true,
            ..FakeNet::default()
        };
        let console = FakeConsole::default();
        let policy = DestroyPolicy::default();
        let teardown = Teardown {
            hypervisor: &hv,
            network: &net,
            console: &console,
            policy: &policy,
        };

        let mut lease = held();
        let mut ip = None;
        assert!(teardown
            .run(&identity(), &mut lease, &mut ip, &dir.path().join("nmdm.pid"))
            .await
            .is_err());
        assert_eq!(lease.network_device(), Some("tap4"));
        assert_eq!(lease.console_pid(), Some(321));
    }
}
