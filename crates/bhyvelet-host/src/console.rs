//! Serial console devices and the console logger helper.
//!
//! Each guest gets an `nmdm(4)` null-modem pair: bhyve opens the `A` end as
//! `com1`, and a host-side logger process reads the `B` end into
//! `console.log`.

use crate::command::{execute, privileged};
use crate::error::{HostError, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, trace, warn};

/// Upper bound on nmdm indices probed before giving up.
pub const MAX_CONSOLE_DEVICES: u32 = 100;

/// Answers "is any process holding this device open?".
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// `Ok(true)` if held, `Ok(false)` if free, `Err` if the check itself
    /// was inconclusive.
    async fn is_device_busy(&self, path: &Path) -> Result<bool>;
}

/// [`DeviceProbe`] backed by `fstat(1)`.
#[derive(Debug, Clone, Default)]
pub struct Fstat;

impl Fstat {
    /// `fstat <path>` prints a header line followed by one line per holder.
    pub fn holders(output: &str) -> usize {
        output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .skip(1)
            .count()
    }
}

#[async_trait]
impl DeviceProbe for Fstat {
    async fn is_device_busy(&self, path: &Path) -> Result<bool> {
        if !tokio::fs::try_exists(path).await? {
            // nmdm nodes are created on first open; no node means no holder.
            return Ok(false);
        }
        let output = execute(Command::new("fstat").arg(path)).await?;
        let holders = Self::holders(&String::from_utf8_lossy(&output.stdout));
        trace!(path = %path.display(), holders, "probed device");
        Ok(holders > 0)
    }
}

/// One nmdm null-modem pair, `/dev/nmdm<N>A` + `/dev/nmdm<N>B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleDevice {
    pub index: u32,
}

impl ConsoleDevice {
    pub fn new(index: u32) -> Self {
        Self { index }
    }

    /// Base path without the end suffix, e.g. `/dev/nmdm3`.
    pub fn path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/nmdm{}", self.index))
    }

    /// End handed to the hypervisor.
    pub fn guest_end(&self) -> PathBuf {
        PathBuf::from(format!("/dev/nmdm{}A", self.index))
    }

    /// End read by the console logger.
    pub fn host_end(&self) -> PathBuf {
        PathBuf::from(format!("/dev/nmdm{}B", self.index))
    }
}

/// Bounds for console device probing.
#[derive(Debug, Clone)]
pub struct ConsolePolicy {
    /// Number of indices to try, starting at 0.
    pub max_devices: u32,
    /// Extra probes of one index after an inconclusive answer.
    pub inconclusive_retries: u32,
    /// Pause before re-probing an inconclusive index.
    pub retry_delay: Duration,
}

impl Default for ConsolePolicy {
    fn default() -> Self {
        Self {
            max_devices: MAX_CONSOLE_DEVICES,
            inconclusive_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Probe one end, retrying inconclusive answers. `None` means still
/// inconclusive after every retry.
async fn probe_end(probe: &dyn DeviceProbe, path: &Path, policy: &ConsolePolicy) -> Option<bool> {
    for attempt in 0..=policy.inconclusive_retries {
        match probe.is_device_busy(path).await {
            Ok(busy) => return Some(busy),
            Err(e) => {
                debug!(path = %path.display(), attempt, error = %e, "inconclusive device probe");
                if attempt < policy.inconclusive_retries {
                    tokio::time::sleep(policy.retry_delay).await;
                }
            }
        }
    }
    None
}

/// Find the first nmdm pair with no holder on either end.
///
/// An index whose probe stays inconclusive is skipped, never assumed free.
pub async fn find_console_device(
    probe: &dyn DeviceProbe,
    policy: &ConsolePolicy,
) -> Result<ConsoleDevice> {
    for index in 0..policy.max_devices {
        let device = ConsoleDevice::new(index);
        let mut free = true;
        for end in [device.guest_end(), device.host_end()] {
            match probe_end(probe, &end, policy).await {
                Some(false) => {}
                Some(true) => {
                    trace!(device = %end.display(), "device busy");
                    free = false;
                    break;
                }
                None => {
                    warn!(device = %end.display(), "skipping device after inconclusive probes");
                    free = false;
                    break;
                }
            }
        }
        if free {
            debug!(device = %device.path().display(), "selected console device");
            return Ok(device);
        }
    }
    Err(HostError::Exhausted {
        kind: "nmdm",
        probed: policy.max_devices,
    })
}

/// Starts and stops the host-side process that records guest console output.
#[async_trait]
pub trait ConsoleLogger: Send + Sync {
    /// Start logging `device` into `log_path`, returning the helper's pid.
    /// The pid is also written to `pid_path`.
    async fn spawn(&self, device: &ConsoleDevice, log_path: &Path, pid_path: &Path) -> Result<u32>;

    /// Terminate a helper. A pid that no longer exists is not an error.
    async fn terminate(&self, pid: u32) -> Result<()>;
}

/// Runs `cu(1)` on the `B` end under `daemon(8)`, which owns the pid file
/// and redirects output to the log.
#[derive(Debug, Clone)]
pub struct DaemonConsoleLogger {
    elevate: bool,
    program: String,
    pid_wait: Duration,
}

impl DaemonConsoleLogger {
    pub fn new(elevate: bool) -> Self {
        Self {
            elevate,
            program: "daemon".into(),
            pid_wait: Duration::from_secs(2),
        }
    }

    async fn clear_pid_file(pid_path: &Path) -> Result<()> {
        match tokio::fs::remove_file(pid_path).await {
            Ok(()) => {
                debug!(path = %pid_path.display(), "removed stale pid file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a pid file written by `daemon -p`.
    pub async fn read_pid(pid_path: &Path) -> Result<Option<u32>> {
        match tokio::fs::read_to_string(pid_path).await {
            Ok(contents) => contents
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| HostError::Parse {
                    command: format!("read {}", pid_path.display()),
                    output: contents,
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ConsoleLogger for DaemonConsoleLogger {
    async fn spawn(&self, device: &ConsoleDevice, log_path: &Path, pid_path: &Path) -> Result<u32> {
        // Only a pid written by this daemon(8) run may be trusted.
        Self::clear_pid_file(pid_path).await?;

        let mut cmd = privileged(self.elevate, &self.program);
        cmd.arg("-f")
            .arg("-p")
            .arg(pid_path)
            .arg("-o")
            .arg(log_path)
            .args(["cu", "-s", "115200", "-l"])
            .arg(device.host_end());
        execute(&mut cmd).await?;

        // daemon(8) forks before writing the pid file.
        let deadline = tokio::time::Instant::now() + self.pid_wait;
        loop {
            if let Some(pid) = Self::read_pid(pid_path).await? {
                info!(pid, device = %device.host_end().display(), "console logger started");
                return Ok(pid);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HostError::Parse {
                    command: "daemon".into(),
                    output: format!("no pid written to {}", pid_path.display()),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn terminate(&self, pid: u32) -> Result<()> {
        let raw = i32::try_from(pid).map_err(|_| HostError::Parse {
            command: "kill".into(),
            output: pid.to_string(),
        })?;
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => {
                info!(pid, "console logger terminated");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(pid, "console logger already gone");
                Ok(())
            }
            Err(Errno::EPERM) if self.elevate => {
                execute(privileged(true, "kill").arg(pid.to_string())).await?;
                Ok(())
            }
            Err(e) => Err(HostError::Io(std::io::Error::from(e))),
        }
    }
}
