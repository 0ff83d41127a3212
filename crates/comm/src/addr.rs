//! Endpoint addressing.
use std::fmt;
use std::net::SocketAddr;

/// An endpoint address accepted by all substrate APIs.
///
/// Either a concrete socket address or a proxy name that resolves through
/// the proxy map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommAddress {
    Inet(SocketAddr),
    Proxy(String),
}

impl CommAddress {
    pub fn is_proxy(&self) -> bool {
        matches!(self, Self::Proxy(_))
    }

    /// The concrete endpoint, if this address is one.
    pub fn inet(&self) -> Option<SocketAddr> {
        match self {
            Self::Inet(addr) => Some(*addr),
            Self::Proxy(_) => None,
        }
    }
}

impl From<SocketAddr> for CommAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::Inet(addr)
    }
}

impl From<&str> for CommAddress {
    fn from(proxy: &str) -> Self {
        Self::Proxy(proxy.to_owned())
    }
}

impl fmt::Display for CommAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{addr}"),
            Self::Proxy(name) => write!(f, "proxy:{name}"),
        }
    }
}
