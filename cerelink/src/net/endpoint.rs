//! Instrument network addresses.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

/// Subnet the instrument and its host live on.
pub const INSTRUMENT_SUBNET: [u8; 3] = [192, 168, 137];

/// Port the instrument sends to.
pub const DEFAULT_IN_PORT: u16 = 51002;

/// Port the instrument listens on.
pub const DEFAULT_OUT_PORT: u16 = 51001;

/// Hosts reserved per instance on the instrument subnet.
pub const HOSTS_PER_INSTANCE: u8 = 16;

/// An IPv4 UDP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddrV4);

impl Endpoint {
    #[must_use]
    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self(SocketAddrV4::new(ip, port))
    }

    #[must_use]
    pub const fn new_v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self::new(Ipv4Addr::new(a, b, c, d), port)
    }

    /// All interfaces (0.0.0.0).
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, port)
    }

    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new(Ipv4Addr::LOCALHOST, port)
    }

    /// Limited broadcast (255.255.255.255).
    #[must_use]
    pub const fn broadcast(port: u16) -> Self {
        Self::new(Ipv4Addr::BROADCAST, port)
    }

    /// Host address of bridge instance `instance` on the instrument subnet:
    /// `192.168.137.{1 + 16 * instance}`.
    #[must_use]
    pub const fn instrument_host(instance: u8, port: u16) -> Self {
        let [a, b, c] = INSTRUMENT_SUBNET;
        Self::new_v4(a, b, c, 1 + HOSTS_PER_INSTANCE.wrapping_mul(instance), port)
    }

    /// Default address of the instrument itself.
    #[must_use]
    pub const fn instrument(port: u16) -> Self {
        let [a, b, c] = INSTRUMENT_SUBNET;
        Self::new_v4(a, b, c, 128, port)
    }

    #[must_use]
    pub const fn ip(&self) -> Ipv4Addr {
        *self.0.ip()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    /// The same port on the numerically next IPv4 address.
    #[must_use]
    pub fn next_host(self) -> Self {
        let next = u32::from(self.ip()).wrapping_add(1);
        Self::new(Ipv4Addr::from(next), self.port())
    }

    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.0)
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.as_socket_addr()
    }
}

impl TryFrom<SocketAddr> for Endpoint {
    type Error = SocketAddr;

    /// Fails for IPv6 addresses, which the instrument does not speak.
    fn try_from(addr: SocketAddr) -> Result<Self, Self::Error> {
        match addr {
            SocketAddr::V4(v4) => Ok(Self(v4)),
            SocketAddr::V6(_) => Err(addr),
        }
    }
}

impl From<Endpoint> for IpAddr {
    fn from(ep: Endpoint) -> Self {
        IpAddr::V4(ep.ip())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
