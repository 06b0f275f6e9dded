//! Network buckets used to limit how many servers share an address range.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address range a connected server is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetworkBucket {
    Onion,
    Supernet(String),
}

impl fmt::Display for NetworkBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkBucket::Onion => f.write_str("onion"),
            NetworkBucket::Supernet(net) => f.write_str(net),
        }
    }
}

/// Bucket for a server reached at `remote`. Loopback and unknown addresses are
/// exempt from bucketing.
pub fn bucket_for(host: &str, remote: Option<IpAddr>) -> Option<NetworkBucket> {
    if host.ends_with(".onion") {
        return Some(NetworkBucket::Onion);
    }
    let ip = remote?.to_canonical();
    if ip.is_loopback() {
        return None;
    }
    let net = match ip {
        IpAddr::V4(v4) => {
            let [a, b, _, _] = v4.octets();
            format!("{}/16", Ipv4Addr::new(a, b, 0, 0))
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            format!("{}/48", Ipv6Addr::new(s[0], s[1], s[2], 0, 0, 0, 0, 0))
        }
    };
    Some(NetworkBucket::Supernet(net))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_slash16() {
        let bucket = bucket_for("example.com", Some("203.0.113.7".parse().unwrap()));
        assert_eq!(bucket, Some(NetworkBucket::Supernet("203.0.0.0/16".into())));
        assert_eq!(
            bucket_for("other.example.com", Some("203.0.42.1".parse().unwrap())),
            bucket
        );
    }

    #[test]
    fn test_ipv6_slash48() {
        let bucket = bucket_for("example.com", Some("2001:db8:1:2::5".parse().unwrap()));
        assert_eq!(bucket, Some(NetworkBucket::Supernet("2001:db8:1::/48".into())));
    }

    #[test]
    fn test_exemptions() {
        assert_eq!(bucket_for("localhost", Some("127.0.0.1".parse().unwrap())), None);
        assert_eq!(bucket_for("localhost", Some("::1".parse().unwrap())), None);
        assert_eq!(bucket_for("example.com", None), None);
        assert_eq!(
            bucket_for("abcdefghijklmnop.onion", Some("127.0.0.1".parse().unwrap())),
            Some(NetworkBucket::Onion)
        );
    }

    #[test]
    fn test_mapped_ipv4_is_canonicalized() {
        let bucket = bucket_for("example.com", Some("::ffff:198.51.100.9".parse().unwrap()));
        assert_eq!(bucket, Some(NetworkBucket::Supernet("198.51.0.0/16".into())));
    }
}
