//! The set of host collaborators an instance drives.

use crate::discovery::PollPolicy;
use crate::provision::{BootMedia, CachedIso, KeyProvider, SshKeygen};
use crate::reachability::{Reachability, TcpProbe};
use crate::teardown::Teardown;
use bhyvelet_host::{
    Bhyve, ConsoleLogger, ConsolePolicy, DaemonConsoleLogger, DestroyPolicy, DeviceProbe, Fstat,
    Hypervisor, Ifconfig, NetworkHost,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Retry bounds for every polling loop in the lifecycle.
#[derive(Debug, Clone, Default)]
pub struct Policies {
    pub destroy: DestroyPolicy,
    pub console: ConsolePolicy,
    pub discovery: PollPolicy,
}

/// Host collaborators, shared by every instance in the process.
#[derive(Clone)]
pub struct Host {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub network: Arc<dyn NetworkHost>,
    pub devices: Arc<dyn DeviceProbe>,
    pub console: Arc<dyn ConsoleLogger>,
    pub reachability: Arc<dyn Reachability>,
    pub boot_media: Arc<dyn BootMedia>,
    pub keys: Arc<dyn KeyProvider>,
    pub policies: Policies,
}

impl Host {
    /// The real FreeBSD host. `elevate` runs privileged tools through
    /// `sudo`; `boot_iso` is the cached image copied into new instances.
    pub fn system(elevate: bool, boot_iso: impl Into<PathBuf>) -> Self {
        Self {
            hypervisor: Arc::new(Bhyve::new(elevate)),
            network: Arc::new(Ifconfig::new(elevate)),
            devices: Arc::new(Fstat),
            console: Arc::new(DaemonConsoleLogger::new(elevate)),
            reachability: Arc::new(TcpProbe::default()),
            boot_media: Arc::new(CachedIso::new(boot_iso)),
            keys: Arc::new(SshKeygen),
            policies: Policies::default(),
        }
    }

    pub(crate) fn teardown(&self) -> Teardown<'_> {
        Teardown {
            hypervisor: self.hypervisor.as_ref(),
            network: self.network.as_ref(),
            console: self.console.as_ref(),
            policy: &self.policies.destroy,
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}
