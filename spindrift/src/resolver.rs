//! The name resolution interface.
//!
//! Resolution itself is an external collaborator; sockets and the
//! engine only know this trait. The default provider delegates to the
//! platform resolver, blocking the calling thread.

use std::net::{IpAddr, ToSocketAddrs};

use spindrift_core::endpoint::Endpoint;
use spindrift_core::error::{Error, ErrorKind, Result};
use spindrift_core::transport::TransportFamily;
use spindrift_mux::config::ResolverConfig;

/// Resolves names to addresses and endpoints.
pub trait Resolve: Send + Sync {
    /// The IP addresses a name resolves to.
    fn get_ip_address(&self, name: &str) -> Result<Vec<IpAddr>>;

    /// Resolve `authority` — an endpoint in canonical text form, or a
    /// `name:port` pair — to a concrete endpoint.
    fn get_endpoint(&self, authority: &str) -> Result<Endpoint>;
}

/// The default provider: the platform resolver, called synchronously.
#[derive(Debug, Clone, Default)]
pub struct SystemResolver {
    config: ResolverConfig,
}

impl SystemResolver {
    /// Create a system resolver with the specified `config`.
    #[must_use]
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    fn prefers(&self, address: &IpAddr) -> bool {
        match self.config.prefer {
            TransportFamily::Ipv4 => address.is_ipv4(),
            TransportFamily::Ipv6 => address.is_ipv6(),
            _ => true,
        }
    }
}

impl Resolve for SystemResolver {
    fn get_ip_address(&self, name: &str) -> Result<Vec<IpAddr>> {
        if !self.config.enabled {
            return Err(Error::new(ErrorKind::NotImplemented));
        }
        let addresses: Vec<IpAddr> = (name, 0u16)
            .to_socket_addrs()?
            .map(|addr| addr.ip())
            .collect();
        if addresses.is_empty() {
            return Err(Error::new(ErrorKind::AddressNotAvailable));
        }
        let mut preferred: Vec<IpAddr> = addresses
            .iter()
            .copied()
            .filter(|addr| self.prefers(addr))
            .collect();
        if preferred.is_empty() {
            preferred = addresses;
        }
        Ok(preferred)
    }

    fn get_endpoint(&self, authority: &str) -> Result<Endpoint> {
        if let Ok(endpoint) = Endpoint::parse(authority) {
            return Ok(endpoint);
        }
        if !self.config.enabled {
            return Err(Error::new(ErrorKind::NotImplemented));
        }
        let mut resolved = authority.to_socket_addrs()?;
        resolved
            .next()
            .map(Endpoint::Ip)
            .ok_or(Error::new(ErrorKind::AddressNotAvailable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_forms_bypass_resolution() {
        let resolver = SystemResolver::new(ResolverConfig::new().with_enabled(false));
        let endpoint = resolver.get_endpoint("127.0.0.1:80").unwrap();
        assert_eq!(endpoint, Endpoint::parse("127.0.0.1:80").unwrap());
    }

    #[test]
    fn disabled_resolver_rejects_names() {
        let resolver = SystemResolver::new(ResolverConfig::new().with_enabled(false));
        assert_eq!(
            resolver.get_ip_address("localhost").unwrap_err().kind(),
            ErrorKind::NotImplemented
        );
    }

    #[test]
    fn resolves_localhost() {
        let resolver = SystemResolver::new(ResolverConfig::new());
        let addresses = resolver.get_ip_address("localhost").unwrap();
        assert!(!addresses.is_empty());
        assert!(addresses
            .iter()
            .all(|address| address.is_loopback()));
    }
}
