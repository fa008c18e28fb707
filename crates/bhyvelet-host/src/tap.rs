//! Tap interface allocation.
//!
//! The next tap is one past the highest-numbered tap already on the host, so
//! taps belonging to other running guests are never reused. Enumeration and
//! creation are not atomic: two allocations racing on the same host can pick
//! the same number, and the loser fails at create time.

use crate::error::HostError;
use crate::network::NetworkHost;
use thiserror::Error;

/// Interface name prefix for tap devices.
pub const TAP_PREFIX: &str = "tap";

/// Numeric suffix of a `tapN` interface name.
pub fn tap_index(name: &str) -> Option<u32> {
    let suffix = name.strip_prefix(TAP_PREFIX)?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Pick the next tap name given the interfaces currently on the host.
pub fn next_tap_name<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    let next = names
        .into_iter()
        .filter_map(tap_index)
        .max()
        .map_or(0, |max| max + 1);
    format!("{TAP_PREFIX}{next}")
}

/// Tap allocation failed part way through.
#[derive(Debug, Error)]
#[error("tap allocation failed: {source}")]
pub struct TapAllocationError {
    /// Interface that was created before the failure, which the caller owns
    /// and must destroy.
    pub created: Option<String>,
    #[source]
    pub source: HostError,
}

/// Create the next free tap, attach it to `bridge`, and bring it up.
pub async fn allocate_tap(
    net: &dyn NetworkHost,
    bridge: &str,
) -> std::result::Result<String, TapAllocationError> {
    let existing = net
        .interface_names()
        .await
        .map_err(|source| TapAllocationError {
            created: None,
            source,
        })?;
    let name = next_tap_name(existing.iter().map(String::as_str));
    tracing::debug!(tap = %name, bridge, "allocating tap");

    net.create_interface(&name)
        .await
        .map_err(|source| TapAllocationError {
            created: None,
            source,
        })?;

    let partial = |source| TapAllocationError {
        created: Some(name.clone()),
        source,
    };
    net.add_bridge_member(bridge, &name).await.map_err(partial)?;
    net.set_up(&name).await.map_err(partial)?;

    tracing::info!(tap = %name, bridge, "tap allocated");
    Ok(name)
}
