use anyhow::{Result, anyhow};
use hyper::HeaderMap;
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};

/// Peer addresses allowed to open a connection. An unset list admits everyone.
#[derive(Clone, Debug, Default)]
pub struct Admission {
    allowed: Option<Vec<IpNet>>,
}

impl Admission {
    /// Parses each entry as a single address or a CIDR range.
    pub fn from_config(entries: Option<&[String]>) -> Result<Self> {
        let Some(entries) = entries else {
            return Ok(Self::default());
        };

        Ok(Self {
            allowed: Some(parse_nets(entries, "allowed_ips")?),
        })
    }

    #[must_use]
    pub fn is_allowed(&self, peer: IpAddr) -> bool {
        self.allowed
            .as_ref()
            .is_none_or(|nets| nets.iter().any(|net| net.contains(&peer)))
    }
}

/// Proxies whose `X-Forwarded-For` header names the real client. An unset
/// list trusts no one.
#[derive(Clone, Debug, Default)]
pub struct TrustedProxies {
    nets: Vec<IpNet>,
}

impl TrustedProxies {
    pub fn from_config(entries: Option<&[String]>) -> Result<Self> {
        let nets = match entries {
            Some(entries) => parse_nets(entries, "trusted_proxies")?,
            None => Vec::new(),
        };
        Ok(Self { nets })
    }

    #[must_use]
    pub fn contains(&self, peer: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&peer))
    }
}

/// Parses each entry as a single address or a CIDR range.
fn parse_nets(entries: &[String], setting: &str) -> Result<Vec<IpNet>> {
    entries
        .iter()
        .map(|entry| {
            entry
                .parse::<IpAddr>()
                .map(IpNet::from)
                .or_else(|_| entry.parse::<IpNet>())
                .map_err(|_| anyhow!("Invalid IP address or CIDR in {setting}: {entry}"))
        })
        .collect()
}

/// Parses the original client IP from an X-Forwarded-For value.
/// Format: "client, proxy1, proxy2, ..." - returns the leftmost entry.
#[must_use]
pub fn parse_original_client_ip(xff_header: &str) -> Option<String> {
    xff_header
        .split(',')
        .next()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// Address to attribute a request to in logs. `X-Forwarded-For` is only
/// believed when the peer itself is a trusted proxy.
#[must_use]
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trusted: &TrustedProxies) -> String {
    if !trusted.contains(peer.ip()) {
        return peer.ip().to_string();
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_original_client_ip)
        .unwrap_or_else(|| peer.ip().to_string())
}
