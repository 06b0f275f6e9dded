//! Electrum server addresses in `host:port:protocol` form.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServerAddrError {
    #[error("host must not be empty")]
    EmptyHost,

    #[error("invalid host: {0}")]
    InvalidHost(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid network protocol: {0}")]
    InvalidProtocol(String),

    #[error("expected host:port:protocol, got {0}")]
    Format(String),
}

/// Transport used to reach a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    /// Plaintext TCP (`t`).
    Tcp,
    /// TLS over TCP (`s`).
    #[default]
    Tls,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "t",
            Protocol::Tls => "s",
        }
    }
}

impl FromStr for Protocol {
    type Err = ServerAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "t" => Ok(Protocol::Tcp),
            "s" => Ok(Protocol::Tls),
            other => Err(ServerAddrError::InvalidProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A server endpoint. Equality and hashing are by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddr {
    host: String,
    port: u16,
    protocol: Protocol,
}

impl ServerAddr {
    /// Validates the host and canonicalizes IP literals. Brackets around IPv6
    /// literals are stripped.
    pub fn new(host: &str, port: u16, protocol: Protocol) -> Result<Self, ServerAddrError> {
        if host.is_empty() {
            return Err(ServerAddrError::EmptyHost);
        }
        let host = host
            .strip_prefix('[')
            .and_then(|inner| inner.strip_suffix(']'))
            .unwrap_or(host);
        let host = match host.parse::<IpAddr>() {
            Ok(ip) => ip.to_string(),
            Err(_) if is_valid_hostname(host) => host.to_ascii_lowercase(),
            Err(_) => return Err(ServerAddrError::InvalidHost(host.to_string())),
        };
        if port == 0 {
            return Err(ServerAddrError::InvalidPort(port.to_string()));
        }
        Ok(Self {
            host,
            port,
            protocol,
        })
    }

    /// Lenient parse: `host:port` defaults to TLS. Returns `None` when the input
    /// cannot be interpreted.
    pub fn from_str_with_inference(s: &str) -> Option<Self> {
        if s.is_empty() {
            return None;
        }
        let items: Vec<&str> = s.rsplitn(3, ':').collect();
        match items.as_slice() {
            [port, host] => Self::new(host, port.parse().ok()?, Protocol::default()).ok(),
            [protocol, port, host] => {
                Self::new(host, port.parse().ok()?, protocol.parse().ok()?).ok()
            }
            _ => None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    pub fn is_onion(&self) -> bool {
        self.host.ends_with(".onion")
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn net_addr_str(&self) -> String {
        match self.host.parse::<Ipv6Addr>() {
            Ok(_) => format!("[{}]:{}", self.host, self.port),
            Err(_) => format!("{}:{}", self.host, self.port),
        }
    }
}

impl FromStr for ServerAddr {
    type Err = ServerAddrError;

    /// Strict `host:port:protocol` parse; splits from the right so IPv6 hosts survive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let items: Vec<&str> = s.rsplitn(3, ':').collect();
        let [protocol, port, host] = items.as_slice() else {
            return Err(ServerAddrError::Format(s.to_string()));
        };
        let port = port.parse().map_err(|_| ServerAddrError::InvalidPort(port.to_string()))?;
        Self::new(host, port, protocol.parse()?)
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.net_addr_str(), self.protocol)
    }
}

impl TryFrom<String> for ServerAddr {
    type Error = ServerAddrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServerAddr> for String {
    fn from(addr: ServerAddr) -> Self {
        addr.to_string()
    }
}

fn is_valid_hostname(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let addr: ServerAddr = "electrum.example.org:50002:s".parse().unwrap();
        assert_eq!(addr.host(), "electrum.example.org");
        assert_eq!(addr.port(), 50002);
        assert_eq!(addr.protocol(), Protocol::Tls);
        assert_eq!(addr.to_string(), "electrum.example.org:50002:s");
    }

    #[test]
    fn test_ipv6_literals() {
        let bracketed: ServerAddr = "[2001:db8::0001]:50001:t".parse().unwrap();
        assert_eq!(bracketed.host(), "2001:db8::1");
        assert_eq!(bracketed.to_string(), "[2001:db8::1]:50001:t");

        let bare: ServerAddr = "2001:db8::1:50001:t".parse().unwrap();
        assert_eq!(bare, bracketed);
    }

    #[test]
    fn test_rejects_invalid() {
        assert_eq!(ServerAddr::from_str("host:50002:x"), Err(ServerAddrError::InvalidProtocol("x".into())));
        assert!(matches!(ServerAddr::from_str("host:port:s"), Err(ServerAddrError::InvalidPort(_))));
        assert!(matches!(ServerAddr::from_str(":50002:s"), Err(ServerAddrError::EmptyHost)));
        assert!(matches!(ServerAddr::from_str("bad host:1:s"), Err(ServerAddrError::InvalidHost(_))));
        assert!(matches!(ServerAddr::from_str("host:s"), Err(ServerAddrError::Format(_))));
    }

    #[test]
    fn test_inference_defaults_to_tls() {
        let addr = ServerAddr::from_str_with_inference("example.com:50002").unwrap();
        assert_eq!(addr.protocol(), Protocol::Tls);
        assert_eq!(
            ServerAddr::from_str_with_inference("example.com:50001:t").unwrap().protocol(),
            Protocol::Tcp
        );
        assert!(ServerAddr::from_str_with_inference("").is_none());
        assert!(ServerAddr::from_str_with_inference("example.com").is_none());
    }

    #[test]
    fn test_serde_as_string() {
        let addr: ServerAddr = "127.0.0.1:50001:t".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"127.0.0.1:50001:t\"");
        assert_eq!(serde_json::from_str::<ServerAddr>(&json).unwrap(), addr);
    }
}
