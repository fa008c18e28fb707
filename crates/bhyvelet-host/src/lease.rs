//! DHCP lease file lookup.
//!
//! The lease file belongs to a dnsmasq process outside our control and
//! changes underneath us, so nothing is cached: every lookup re-reads it.
//! Lines are positional, `<expiry> <mac> <ip> <hostname> <client-id>`.

use crate::error::{HostError, Result};
use crate::identity::MacAddress;
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::path::Path;

/// One line of a dnsmasq lease file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Lease expiry; `None` for infinite leases or an unparsable field.
    pub expires: Option<DateTime<Utc>>,
    pub mac: String,
    pub ip: IpAddr,
    /// Client hostname; `None` when dnsmasq wrote `*`.
    pub hostname: Option<String>,
}

/// Parse `line` as a lease for `mac`.
///
/// The line must textually contain the MAC; the IP is the field right after
/// the MAC field. Returns `None` for non-matching or malformed lines.
pub fn parse_record(line: &str, mac: &MacAddress) -> Option<LeaseRecord> {
    let needle = mac.to_string();
    if !line.to_ascii_lowercase().contains(&needle) {
        return None;
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    let mac_at = fields
        .iter()
        .position(|f| f.to_ascii_lowercase().contains(&needle))?;
    let ip = fields.get(mac_at + 1)?.parse().ok()?;
    let expires = mac_at
        .checked_sub(1)
        .and_then(|i| fields[i].parse::<i64>().ok())
        .filter(|&secs| secs > 0)
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    let hostname = fields
        .get(mac_at + 2)
        .filter(|h| **h != "*")
        .map(|h| h.to_string());

    Some(LeaseRecord {
        expires,
        mac: fields[mac_at].to_string(),
        ip,
        hostname,
    })
}

/// Resolve `mac` to an IP from the lease file at `path`.
///
/// A missing or empty file resolves the same as a file without a match:
/// [`HostError::NotFound`].
pub async fn lookup(path: &Path, mac: &MacAddress) -> Result<IpAddr> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::trace!(path = %path.display(), "lease file absent");
            String::new()
        }
        Err(e) => return Err(e.into()),
    };

    contents
        .lines()
        .find_map(|line| parse_record(line, mac))
        .map(|record| {
            tracing::debug!(%mac, ip = %record.ip, "lease found");
            record.ip
        })
        .ok_or_else(|| HostError::NotFound {
            mac: mac.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LINE: &str = "1620000000 aa:bb:cc:dd:ee:ff 10.0.0.5 host1 *";

    fn mac() -> MacAddress {
        "aa:bb:cc:dd:ee:ff".parse().unwrap()
    }

    #[test]
    fn test_parse_record_fields() {
        let record = parse_record(LINE, &mac()).unwrap();
        assert_eq!(record.ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(record.hostname.as_deref(), Some("host1"));
        assert_eq!(record.expires.unwrap().timestamp(), 1_620_000_000);
    }

    #[test]
    fn test_parse_record_anonymous_infinite() {
        let record = parse_record("0 aa:bb:cc:dd:ee:ff 10.0.0.9 * 01:aa:bb", &mac()).unwrap();
        assert_eq!(record.expires, None);
        assert_eq!(record.hostname, None);
    }

    #[test]
    fn test_parse_record_rejects_other_mac_and_bad_ip() {
        let other: MacAddress = "aa:bb:cc:dd:ee:00".parse().unwrap();
        assert!(parse_record(LINE, &other).is_none());
        assert!(parse_record("1620000000 aa:bb:cc:dd:ee:ff", &mac()).is_none());
        assert!(parse_record("1620000000 aa:bb:cc:dd:ee:ff not-an-ip h *", &mac()).is_none());
    }

    #[tokio::test]
    async fn test_lookup_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bhyve.leases");
        tokio::fs::write(
            &path,
            format!("1620000001 02:68:79:00:00:01 10.0.0.4 other *\n{LINE}\n"),
        )
        .await
        .unwrap();

        let ip = lookup(&path, &mac()).await.unwrap();
        assert_eq!(ip.to_string(), "10.0.0.5");
    }

    #[tokio::test]
    async fn test_lookup_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bhyve.leases");
        tokio::fs::write(&path, LINE.to_uppercase()).await.unwrap();
        assert_eq!(lookup(&path, &mac()).await.unwrap().to_string(), "10.0.0.5");
    }

    #[tokio::test]
    async fn test_lookup_other_mac_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bhyve.leases");
        tokio::fs::write(&path, LINE).await.unwrap();

        let err = lookup(&path, &"02:68:79:12:34:56".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_lookup_empty_or_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.leases");
        assert!(lookup(&missing, &mac()).await.unwrap_err().is_not_found());

        let empty = dir.path().join("empty.leases");
        tokio::fs::write(&empty, "").await.unwrap();
        assert!(lookup(&empty, &mac()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_lookup_rereads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bhyve.leases");
        tokio::fs::write(&path, "").await.unwrap();
        assert!(lookup(&path, &mac()).await.is_err());

        tokio::fs::write(&path, LINE).await.unwrap();
        assert!(lookup(&path, &mac()).await.is_ok());
    }
}
