use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, Result};

static PROXY_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}:[0-9]{1,6}$")
        .expect("proxy address pattern is valid")
});

/// Check that an address has the `ip:port` shape handed out by the allocator
pub fn is_valid_proxy_address(address: &str) -> bool {
    PROXY_ADDRESS.is_match(address.trim())
}

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProxyProtocol {
    Http,
    Socks4,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "HTTP",
            ProxyProtocol::Socks4 => "SOCKS4",
            ProxyProtocol::Socks5 => "SOCKS5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "HTTP" => Some(ProxyProtocol::Http),
            "SOCKS4" => Some(ProxyProtocol::Socks4),
            "SOCKS5" => Some(ProxyProtocol::Socks5),
            _ => None,
        }
    }

    /// URL scheme understood by the HTTP client's proxy support
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks5 => "socks5",
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, ProxyProtocol::Socks4 | ProxyProtocol::Socks5)
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A proxy handed out by the allocator.
///
/// Identity is the address; two descriptors with the same address are the
/// same proxy even if the user agent differs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    #[serde(rename = "proxy")]
    pub address: String,
    #[serde(rename = "proxytype")]
    pub protocol: ProxyProtocol,
    #[serde(rename = "uagent")]
    pub user_agent: String,
}

impl ProxyDescriptor {
    /// Build a descriptor, rejecting addresses that are not `ip:port`
    pub fn new(
        address: impl Into<String>,
        protocol: ProxyProtocol,
        user_agent: impl Into<String>,
    ) -> Result<Self> {
        let address = address.into().trim().to_string();
        if !is_valid_proxy_address(&address) {
            return Err(FetchError::InvalidProxyAddress(address));
        }

        Ok(Self {
            address,
            protocol,
            user_agent: user_agent.into(),
        })
    }

    pub fn is_valid(&self) -> bool {
        is_valid_proxy_address(&self.address)
    }

    /// Proxy URL for the HTTP client
    pub fn url(&self) -> String {
        format!("{}://{}", self.protocol.scheme(), self.address)
    }
}

impl PartialEq for ProxyDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for ProxyDescriptor {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_protocol_parsing() {
        assert_eq!(ProxyProtocol::from_str("HTTP"), Some(ProxyProtocol::Http));
        assert_eq!(ProxyProtocol::from_str("socks4"), Some(ProxyProtocol::Socks4));
        assert_eq!(ProxyProtocol::from_str(" SOCKS5 "), Some(ProxyProtocol::Socks5));
        assert_eq!(ProxyProtocol::from_str("https"), None);

        assert!(ProxyProtocol::Socks4.is_socks());
        assert!(!ProxyProtocol::Http.is_socks());
        assert_eq!(ProxyProtocol::Socks5.to_string(), "SOCKS5");
    }

    #[test]
    fn test_proxy_address_shape() {
        assert!(is_valid_proxy_address("10.0.0.1:3128"));
        assert!(is_valid_proxy_address(" 10.0.0.1:3128\n"));
        assert!(!is_valid_proxy_address(""));
        assert!(!is_valid_proxy_address("10.0.0.1"));
        assert!(!is_valid_proxy_address("proxy.example:3128"));
        assert!(!is_valid_proxy_address("10.0.0.1:1234567"));
        assert!(!is_valid_proxy_address("junk 10.0.0.1:3128"));
    }

    #[test]
    fn test_descriptor_rejects_malformed_address() {
        let err = ProxyDescriptor::new("", ProxyProtocol::Http, "ua").unwrap_err();
        assert!(matches!(err, FetchError::InvalidProxyAddress(_)));

        let proxy = ProxyDescriptor::new("1.2.3.4:80 ", ProxyProtocol::Http, "ua").unwrap();
        assert_eq!(proxy.address, "1.2.3.4:80");
    }

    #[test]
    fn test_descriptor_url_and_identity() {
        let a = ProxyDescriptor::new("1.2.3.4:1080", ProxyProtocol::Socks5, "ua-1").unwrap();
        let b = ProxyDescriptor::new("1.2.3.4:1080", ProxyProtocol::Socks5, "ua-2").unwrap();
        assert_eq!(a.url(), "socks5://1.2.3.4:1080");
        assert_eq!(a, b);
    }

    #[test]
    fn test_descriptor_json_layout() {
        let proxy = ProxyDescriptor::new("1.2.3.4:8080", ProxyProtocol::Http, "Mozilla").unwrap();
        let json = serde_json::to_value(&proxy).unwrap();
        assert_eq!(json["proxy"], "1.2.3.4:8080");
        assert_eq!(json["proxytype"], "HTTP");
        assert_eq!(json["uagent"], "Mozilla");
    }
}
