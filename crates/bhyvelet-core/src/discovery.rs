//! Bounded polling for the guest's DHCP-assigned address.

use crate::error::{CoreError, Result};
use bhyvelet_host::MacAddress;
use std::future::Future;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// How often and how long to poll.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(2),
        }
    }
}

/// Call `lookup` until it yields an address or `policy.attempts` calls have
/// failed, sleeping `policy.interval` between calls.
pub async fn wait_for_ip<F, Fut>(mut lookup: F, policy: &PollPolicy) -> Result<IpAddr>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bhyvelet_host::Result<IpAddr>>,
{
    let start = tokio::time::Instant::now();
    tracing::info!(attempts = policy.attempts, "waiting for guest address");

    for attempt in 1..=policy.attempts {
        match lookup().await {
            Ok(ip) => {
                tracing::info!(
                    %ip,
                    attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "guest address found"
                );
                return Ok(ip);
            }
            Err(e) => {
                tracing::debug!(attempt, max = policy.attempts, error = %e, "no address yet");
            }
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    let waited = start.elapsed();
    tracing::warn!(
        attempts = policy.attempts,
        waited_ms = waited.as_millis() as u64,
        "gave up waiting for guest address"
    );
    Err(CoreError::Timeout {
        attempts: policy.attempts,
        waited,
    })
}

/// [`wait_for_ip`] against the lease file at `lease_file`.
pub async fn wait_for_lease(
    lease_file: &Path,
    mac: &MacAddress,
    policy: &PollPolicy,
) -> Result<IpAddr> {
    wait_for_ip(|| bhyvelet_host::lookup(lease_file, mac), policy).await
}
