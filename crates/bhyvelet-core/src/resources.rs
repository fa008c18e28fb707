//! Host resources held by a running instance.

use bhyvelet_host::ConsoleDevice;
use serde::{Deserialize, Serialize};

/// Ephemeral resources allocated by Start and released by teardown.
///
/// Each resource is recorded as soon as it exists and released only once
/// it is gone from the host, so a failed teardown can be retried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLease {
    network_device: Option<String>,
    console_device: Option<ConsoleDevice>,
    console_pid: Option<u32>,
}

impl ResourceLease {
    /// Tap interface attached to the bridge.
    pub fn network_device(&self) -> Option<&str> {
        self.network_device.as_deref()
    }

    pub fn record_network_device(&mut self, name: impl Into<String>) {
        self.network_device = Some(name.into());
    }

    pub fn release_network_device(&mut self) -> Option<String> {
        self.network_device.take()
    }

    pub fn console_device(&self) -> Option<ConsoleDevice> {
        self.console_device
    }

    pub fn record_console_device(&mut self, device: ConsoleDevice) {
        self.console_device = Some(device);
    }

    pub fn release_console_device(&mut self) -> Option<ConsoleDevice> {
        self.console_device.take()
    }

    /// Pid of the console logger helper.
    pub fn console_pid(&self) -> Option<u32> {
        self.console_pid
    }

    pub fn record_console_pid(&mut self, pid: u32) {
        self.console_pid = Some(pid);
    }

    pub fn release_console_pid(&mut self) -> Option<u32> {
        self.console_pid.take()
    }

    /// Nothing is held.
    pub fn is_empty(&self) -> bool {
        self.network_device.is_none() && self.console_device.is_none() && self.console_pid.is_none()
    }
}
