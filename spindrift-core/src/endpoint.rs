//! Endpoint values for transport-agnostic socket addressing.
//!
//! An endpoint is either an IP endpoint (address plus port), a local
//! (Unix domain) name, or undefined. The textual forms are canonical:
//! `<address>:<port>` for IPv4, `[<address>]:<port>` for IPv6, and a
//! filesystem path (or `@name` abstract name) for local endpoints.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, ErrorKind};
use crate::transport::{Transport, TransportMode};

/// The name of a local (Unix domain) socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalEndpoint {
    /// A name bound in the filesystem.
    Path(PathBuf),
    /// An abstract name, on platforms that support the abstract namespace.
    Abstract(String),
}

impl LocalEndpoint {
    /// The filesystem path of this name, if it has one.
    #[must_use]
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(path) => Some(path),
            Self::Abstract(_) => None,
        }
    }
}

impl fmt::Display for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Abstract(name) => write!(f, "@{name}"),
        }
    }
}

/// A transport endpoint address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// An IP address and port.
    Ip(SocketAddr),
    /// A local (Unix domain) name.
    Local(LocalEndpoint),
    /// The endpoint is not defined.
    #[default]
    Undefined,
}

impl Endpoint {
    /// Parse an endpoint from its canonical textual form.
    ///
    /// Accepted forms:
    /// - `127.0.0.1:5555` (IPv4)
    /// - `[::1]:5555` (IPv6)
    /// - `/tmp/service.sock` (local path)
    /// - `@service` (abstract local name)
    ///
    /// Anything else is rejected with an invalid-format error.
    pub fn parse(s: &str) -> Result<Self, Error> {
        s.parse()
    }

    /// The IP socket address, if this is an IP endpoint.
    #[must_use]
    pub const fn ip(&self) -> Option<&SocketAddr> {
        match self {
            Self::Ip(addr) => Some(addr),
            _ => None,
        }
    }

    /// The local name, if this is a local endpoint.
    #[must_use]
    pub const fn local(&self) -> Option<&LocalEndpoint> {
        match self {
            Self::Local(name) => Some(name),
            _ => None,
        }
    }

    /// True if this is an IP endpoint.
    #[must_use]
    pub const fn is_ip(&self) -> bool {
        matches!(self, Self::Ip(_))
    }

    /// True if this is a local endpoint.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// True if this endpoint is undefined.
    #[must_use]
    pub const fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// The transport implied by this endpoint in the specified `mode`.
    #[must_use]
    pub fn transport(&self, mode: TransportMode) -> Transport {
        match (self, mode) {
            (Self::Ip(addr), TransportMode::Stream) => match addr.ip() {
                IpAddr::V4(_) => Transport::TcpIpv4,
                IpAddr::V6(_) => Transport::TcpIpv6,
            },
            (Self::Ip(addr), TransportMode::Datagram) => match addr.ip() {
                IpAddr::V4(_) => Transport::UdpIpv4,
                IpAddr::V6(_) => Transport::UdpIpv6,
            },
            (Self::Local(_), TransportMode::Stream) => Transport::LocalStream,
            (Self::Local(_), TransportMode::Datagram) => Transport::LocalDatagram,
            _ => Transport::Undefined,
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::new(ErrorKind::Invalid));
        }
        if let Some(name) = s.strip_prefix('@') {
            if name.is_empty() {
                return Err(Error::new(ErrorKind::Invalid));
            }
            return Ok(Self::Local(LocalEndpoint::Abstract(name.to_string())));
        }
        if s.starts_with('/') || s.starts_with("./") {
            return Ok(Self::Local(LocalEndpoint::Path(PathBuf::from(s))));
        }
        s.parse::<SocketAddr>()
            .map(Self::Ip)
            .map_err(|_| Error::new(ErrorKind::Invalid))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Local(name) => write!(f, "{name}"),
            Self::Undefined => f.write_str("undefined"),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

impl From<LocalEndpoint> for Endpoint {
    fn from(name: LocalEndpoint) -> Self {
        Self::Local(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ipv4() {
        let endpoint = Endpoint::parse("127.0.0.1:5555").unwrap();
        assert!(endpoint.is_ip());
        assert_eq!(endpoint.to_string(), "127.0.0.1:5555");
    }

    #[test]
    fn parse_ipv6() {
        let endpoint = Endpoint::parse("[::1]:5555").unwrap();
        assert!(endpoint.is_ip());
        assert_eq!(endpoint.to_string(), "[::1]:5555");
    }

    #[test]
    fn parse_local_path() {
        let endpoint = Endpoint::parse("/tmp/service.sock").unwrap();
        assert!(endpoint.is_local());
        assert_eq!(endpoint.to_string(), "/tmp/service.sock");
    }

    #[test]
    fn parse_abstract_name() {
        let endpoint = Endpoint::parse("@service").unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Local(LocalEndpoint::Abstract("service".to_string()))
        );
        assert_eq!(endpoint.to_string(), "@service");
    }

    #[test]
    fn parse_format_round_trip() {
        for text in ["127.0.0.1:0", "10.1.2.3:65535", "[::1]:80", "/run/x.sock"] {
            let endpoint = Endpoint::parse(text).unwrap();
            assert_eq!(endpoint.to_string(), text);
        }
    }

    #[test]
    fn rejects_non_canonical_forms() {
        assert!(Endpoint::parse("").is_err());
        assert!(Endpoint::parse("@").is_err());
        assert!(Endpoint::parse("127.0.0.1").is_err());
        assert!(Endpoint::parse("::1:80").is_err());
        assert!(Endpoint::parse("host.example.com:80").is_err());
    }

    #[test]
    fn transport_derivation() {
        let v4 = Endpoint::parse("127.0.0.1:1").unwrap();
        assert_eq!(v4.transport(TransportMode::Stream), Transport::TcpIpv4);
        assert_eq!(v4.transport(TransportMode::Datagram), Transport::UdpIpv4);

        let v6 = Endpoint::parse("[::1]:1").unwrap();
        assert_eq!(v6.transport(TransportMode::Stream), Transport::TcpIpv6);

        let local = Endpoint::parse("/tmp/x.sock").unwrap();
        assert_eq!(
            local.transport(TransportMode::Datagram),
            Transport::LocalDatagram
        );

        assert_eq!(
            Endpoint::Undefined.transport(TransportMode::Stream),
            Transport::Undefined
        );
    }
}
