use bytes::Bytes;
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::Arc;

use super::{GroupAddress, UriAddress};

/// Ports at or below this value belong to pure clients: nodes without a
/// listening endpoint that can only receive responses over the session they
/// opened themselves.
pub const MAX_CLIENT_PORT: u16 = 1023;

/// Target of an outbound call, in increasing order of indirection.
///
/// `Ipv4` is a concrete endpoint; `Group` picks one of several replicas by
/// per-operation policy; `Uri` goes through partition resolution first.
#[derive(Clone, Default)]
pub enum RpcAddress {
    #[default]
    Invalid,
    Ipv4(SocketAddrV4),
    Group(Arc<GroupAddress>),
    Uri(Arc<UriAddress>),
}

impl RpcAddress {
    pub fn is_invalid(&self) -> bool {
        matches!(self, RpcAddress::Invalid)
    }

    pub fn port(&self) -> u16 {
        match self {
            RpcAddress::Ipv4(addr) => addr.port(),
            _ => 0,
        }
    }

    pub fn ipv4(&self) -> Option<SocketAddrV4> {
        match self {
            RpcAddress::Ipv4(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn group(&self) -> Option<&Arc<GroupAddress>> {
        match self {
            RpcAddress::Group(group) => Some(group),
            _ => None,
        }
    }

    pub fn uri(&self) -> Option<&Arc<UriAddress>> {
        match self {
            RpcAddress::Uri(uri) => Some(uri),
            _ => None,
        }
    }
}

impl From<SocketAddrV4> for RpcAddress {
    fn from(addr: SocketAddrV4) -> Self {
        RpcAddress::Ipv4(addr)
    }
}

impl PartialEq for RpcAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RpcAddress::Invalid, RpcAddress::Invalid) => true,
            (RpcAddress::Ipv4(a), RpcAddress::Ipv4(b)) => a == b,
            (RpcAddress::Group(a), RpcAddress::Group(b)) => Arc::ptr_eq(a, b),
            (RpcAddress::Uri(a), RpcAddress::Uri(b)) => a.uri() == b.uri(),
            _ => false,
        }
    }
}

impl fmt::Display for RpcAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcAddress::Invalid => f.write_str("invalid"),
            RpcAddress::Ipv4(addr) => write!(f, "{addr}"),
            RpcAddress::Group(group) => write!(f, "group:{}", group.name()),
            RpcAddress::Uri(uri) => write!(f, "{}", uri.uri()),
        }
    }
}

impl fmt::Debug for RpcAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Encode an endpoint for the body of a redirect response.
pub fn encode_redirect_address(addr: SocketAddrV4) -> Bytes {
    Bytes::from(rmp_serde::to_vec(&addr).expect("socket address always encodes"))
}

/// Decode the endpoint carried in a redirect response body.
pub fn decode_redirect_address(body: &Bytes) -> Result<SocketAddrV4, rmp_serde::decode::Error> {
    rmp_serde::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ep(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port)
    }

    #[test]
    fn display_and_kind_accessors() {
        assert_eq!(RpcAddress::Invalid.to_string(), "invalid");
        assert!(RpcAddress::Invalid.is_invalid());

        let addr = RpcAddress::Ipv4(ep(7000));
        assert_eq!(addr.to_string(), "10.0.0.1:7000");
        assert_eq!(addr.port(), 7000);
        assert_eq!(addr.ipv4(), Some(ep(7000)));
        assert!(addr.group().is_none());
    }

    #[test]
    fn equality_by_kind() {
        assert_eq!(RpcAddress::Ipv4(ep(7000)), RpcAddress::Ipv4(ep(7000)));
        assert_ne!(RpcAddress::Ipv4(ep(7000)), RpcAddress::Ipv4(ep(7001)));
        assert_ne!(RpcAddress::Ipv4(ep(7000)), RpcAddress::Invalid);

        let group = Arc::new(GroupAddress::new("meta"));
        assert_eq!(
            RpcAddress::Group(Arc::clone(&group)),
            RpcAddress::Group(group)
        );
    }

    #[test]
    fn redirect_payload_round_trip() {
        let body = encode_redirect_address(ep(8000));
        assert_eq!(decode_redirect_address(&body).unwrap(), ep(8000));
        assert!(decode_redirect_address(&Bytes::from_static(b"junk")).is_err());
    }
}
