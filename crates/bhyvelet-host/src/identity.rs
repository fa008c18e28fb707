//! VM identity and MAC address generation.

use crate::error::{HostError, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix of every VM name this crate hands to bhyve.
pub const IDENTITY_PREFIX: &str = "bhyvelet-";

/// Locally-administered, unicast organizational prefix for guest MACs.
pub const MAC_PREFIX: [u8; 3] = [0x02, 0x68, 0x79];

/// Name of a VM in the hypervisor's runtime namespace (`/dev/vmm/<name>`).
///
/// A pure function of the current user and the instance name, so it is
/// recomputed whenever needed and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VmIdentity(String);

impl VmIdentity {
    /// Derive the identity for `user` and instance `name`.
    pub fn derive(user: &str, name: &str) -> Self {
        let raw = format!("{IDENTITY_PREFIX}{user}-{name}");
        let safe = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        Self(safe)
    }

    /// Derive the identity for the user running this process.
    pub fn for_current_user(name: &str) -> Result<Self> {
        Ok(Self::derive(&current_username()?, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve the login name of the current user.
///
/// Looks up the real uid in the password database first and falls back to
/// `$USER` / `$LOGNAME` for uids without an entry (common in jails).
pub fn current_username() -> Result<String> {
    let uid = nix::unistd::getuid();
    match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => return Ok(user.name),
        Ok(None) => tracing::debug!(%uid, "uid has no passwd entry"),
        Err(e) => tracing::debug!(%uid, error = %e, "passwd lookup failed"),
    }

    ["USER", "LOGNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|name| !name.is_empty())
        .ok_or_else(|| HostError::Identity(format!("uid {uid} has no user name")))
}

/// A guest MAC address, rendered lowercase and colon-separated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Generate a MAC under [`MAC_PREFIX`] with three bytes from the OS CSPRNG.
    pub fn generate() -> Result<Self> {
        let mut tail = [0u8; 3];
        OsRng
            .try_fill_bytes(&mut tail)
            .map_err(|e| HostError::Randomness(e.to_string()))?;
        Ok(Self::with_prefix(tail))
    }

    fn with_prefix(tail: [u8; 3]) -> Self {
        let [a, b, c] = MAC_PREFIX;
        Self([a, b, c, tail[0], tail[1], tail[2]])
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Error returned when a string is not a colon-separated MAC address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0:?}")]
pub struct MacParseError(String);

impl FromStr for MacAddress {
    type Err = MacParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| MacParseError(s.to_string()))?;
            if part.len() != 2 {
                return Err(MacParseError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(MacParseError(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = MacParseError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}
