//! Transport tags: protocol family plus socket mode.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, ErrorKind};

/// The protocol family of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportFamily {
    /// Internet protocol version 4.
    Ipv4,
    /// Internet protocol version 6.
    Ipv6,
    /// Local (Unix domain) sockets.
    Local,
    /// The family is not defined.
    Undefined,
}

/// The mode of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportMode {
    /// Connection-oriented byte streams.
    Stream,
    /// Connectionless datagrams.
    Datagram,
    /// The mode is not defined.
    Undefined,
}

/// A transport: the combination of protocol family and socket mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Transport {
    /// TCP over IPv4.
    TcpIpv4,
    /// TCP over IPv6.
    TcpIpv6,
    /// UDP over IPv4.
    UdpIpv4,
    /// UDP over IPv6.
    UdpIpv6,
    /// Connection-oriented local sockets.
    LocalStream,
    /// Connectionless local sockets.
    LocalDatagram,
    /// The transport is not defined.
    #[default]
    Undefined,
}

impl Transport {
    /// The protocol family of this transport.
    #[must_use]
    pub const fn family(&self) -> TransportFamily {
        match self {
            Self::TcpIpv4 | Self::UdpIpv4 => TransportFamily::Ipv4,
            Self::TcpIpv6 | Self::UdpIpv6 => TransportFamily::Ipv6,
            Self::LocalStream | Self::LocalDatagram => TransportFamily::Local,
            Self::Undefined => TransportFamily::Undefined,
        }
    }

    /// The socket mode of this transport.
    #[must_use]
    pub const fn mode(&self) -> TransportMode {
        match self {
            Self::TcpIpv4 | Self::TcpIpv6 | Self::LocalStream => TransportMode::Stream,
            Self::UdpIpv4 | Self::UdpIpv6 | Self::LocalDatagram => TransportMode::Datagram,
            Self::Undefined => TransportMode::Undefined,
        }
    }

    /// True for local (Unix domain) transports.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self.family(), TransportFamily::Local)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::TcpIpv4 => "tcp-ipv4",
            Self::TcpIpv6 => "tcp-ipv6",
            Self::UdpIpv4 => "udp-ipv4",
            Self::UdpIpv6 => "udp-ipv6",
            Self::LocalStream => "local-stream",
            Self::LocalDatagram => "local-datagram",
            Self::Undefined => "undefined",
        };
        f.write_str(text)
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp-ipv4" => Ok(Self::TcpIpv4),
            "tcp-ipv6" => Ok(Self::TcpIpv6),
            "udp-ipv4" => Ok(Self::UdpIpv4),
            "udp-ipv6" => Ok(Self::UdpIpv6),
            "local-stream" => Ok(Self::LocalStream),
            "local-datagram" => Ok(Self::LocalDatagram),
            "undefined" => Ok(Self::Undefined),
            _ => Err(Error::new(ErrorKind::Invalid)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_and_mode() {
        assert_eq!(Transport::TcpIpv4.family(), TransportFamily::Ipv4);
        assert_eq!(Transport::TcpIpv4.mode(), TransportMode::Stream);
        assert_eq!(Transport::UdpIpv6.family(), TransportFamily::Ipv6);
        assert_eq!(Transport::UdpIpv6.mode(), TransportMode::Datagram);
        assert_eq!(Transport::LocalDatagram.family(), TransportFamily::Local);
        assert!(Transport::LocalStream.is_local());
        assert!(!Transport::TcpIpv6.is_local());
    }

    #[test]
    fn text_round_trip() {
        for transport in [
            Transport::TcpIpv4,
            Transport::TcpIpv6,
            Transport::UdpIpv4,
            Transport::UdpIpv6,
            Transport::LocalStream,
            Transport::LocalDatagram,
            Transport::Undefined,
        ] {
            let text = transport.to_string();
            assert_eq!(text.parse::<Transport>().unwrap(), transport);
        }
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!("sctp-ipv4".parse::<Transport>().is_err());
    }
}
