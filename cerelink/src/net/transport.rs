//! Instrument wire transport.
//!
//! Opening follows a fixed policy:
//!
//! 1. Create the socket and apply broadcast, address reuse and the receive
//!    buffer size. A kernel buffer smaller than requested is an error.
//! 2. Try to bind `in_addr`, then each following host address, up to
//!    [`TransportConfig::bind_attempts`] addresses in total.
//! 3. If nothing binds and the startup option allows it, enable address
//!    reuse and bind loopback ([`StartupOption::Loopback`]) or any interface,
//!    sending to loopback or the broadcast address respectively.

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

use super::endpoint::{DEFAULT_IN_PORT, DEFAULT_OUT_PORT};
use super::socket::{SocketBuilder, UdpSocket};
use super::Endpoint;
use crate::packet::MAX_DATAGRAM_BYTES;
use crate::trace::{debug, info, warn};

/// Default receive buffer requested from the kernel.
pub const DEFAULT_RECV_BUFFER: usize = 8 * 1024 * 1024;

/// Addresses tried by default when binding.
pub const DEFAULT_BIND_RANGE: u32 = 16;

/// Addresses tried when scanning for the instrument.
pub const SCAN_BIND_RANGE: u32 = 130;

/// How to proceed when the configured address cannot be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupOption {
    /// Fail.
    #[default]
    None,
    /// Scan a wider range, then bind any interface and broadcast.
    AnyIp,
    /// Scan a wider range, then bind and send to loopback.
    Loopback,
    /// Instrument runs on this host: loopback addresses, default ports.
    Local,
    /// Reuse the address from the start; fall back to any interface.
    Reuse,
}

/// Errors opening the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot create UDP socket")]
    Socket(#[source] io::Error),
    #[error("cannot set socket option {option}")]
    SockOpt {
        option: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("receive buffer is {actual} bytes, {requested} requested")]
    SockMem { requested: usize, actual: usize },
    #[error("cannot bind {first} or any of the following {attempts} addresses")]
    Bind { first: Endpoint, attempts: u32 },
}

/// Transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local address the instrument sends to.
    ///
    /// **Default**: 192.168.137.1
    pub in_addr: Ipv4Addr,

    /// **Default**: 51002
    pub in_port: u16,

    /// Address of the instrument.
    ///
    /// **Default**: 192.168.137.128
    pub out_addr: Ipv4Addr,

    /// **Default**: 51001
    pub out_port: u16,

    /// **Default**: [`StartupOption::None`]
    pub startup: StartupOption,

    /// Enable `SO_BROADCAST`.
    ///
    /// **Default**: true
    pub broadcast: bool,

    /// Send without consulting the routing table. Ignored when bound to
    /// loopback.
    ///
    /// **Default**: true
    pub dont_route: bool,

    /// Kernel receive buffer in bytes. `0` leaves the OS default.
    ///
    /// **Default**: 8 MiB
    pub recv_buffer_size: usize,

    /// Addresses tried before falling back, unless the startup option
    /// widens the scan.
    ///
    /// **Default**: 16
    pub range: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            in_addr: Endpoint::instrument_host(0, DEFAULT_IN_PORT).ip(),
            in_port: DEFAULT_IN_PORT,
            out_addr: Endpoint::instrument(DEFAULT_OUT_PORT).ip(),
            out_port: DEFAULT_OUT_PORT,
            startup: StartupOption::None,
            broadcast: true,
            dont_route: true,
            recv_buffer_size: DEFAULT_RECV_BUFFER,
            range: DEFAULT_BIND_RANGE,
        }
    }
}

impl TransportConfig {
    /// Defaults for bridge instance `instance`.
    ///
    /// The address table covers instances 0 to 3; others use instance 0's.
    pub fn for_instance(instance: u32) -> Self {
        let instance = u8::try_from(instance).ok().filter(|&n| n < 4).unwrap_or(0);
        Self {
            in_addr: Endpoint::instrument_host(instance, DEFAULT_IN_PORT).ip(),
            ..Self::default()
        }
    }

    /// Both ends on 127.0.0.1 with the given ports and no buffer check.
    pub fn loopback(in_port: u16, out_port: u16) -> Self {
        Self {
            in_addr: Ipv4Addr::LOCALHOST,
            in_port,
            out_addr: Ipv4Addr::LOCALHOST,
            out_port,
            recv_buffer_size: 0,
            range: 1,
            ..Self::default()
        }
    }

    /// Number of addresses tried before falling back.
    pub fn bind_attempts(&self) -> u32 {
        match self.startup {
            StartupOption::AnyIp | StartupOption::Loopback => SCAN_BIND_RANGE,
            _ => self.range.max(1),
        }
    }

    /// Local and remote endpoints after applying the startup option.
    pub fn endpoints(&self) -> (Endpoint, Endpoint) {
        if self.startup == StartupOption::Local {
            (
                Endpoint::localhost(DEFAULT_IN_PORT),
                Endpoint::localhost(DEFAULT_OUT_PORT),
            )
        } else {
            (
                Endpoint::new(self.in_addr, self.in_port),
                Endpoint::new(self.out_addr, self.out_port),
            )
        }
    }
}

/// Raw datagram I/O towards the instrument.
pub trait Wire {
    /// Sends one datagram.
    ///
    /// # Errors
    ///
    /// Returns the OS error.
    fn send(&self, bytes: &[u8]) -> io::Result<usize>;

    /// Receives one datagram into `buf`; `Ok(0)` when nothing is pending.
    ///
    /// # Errors
    ///
    /// Returns the OS error.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// True when the far end is on this host.
    fn is_loopback(&self) -> bool {
        false
    }
}

/// UDP transport bound per [`TransportConfig`].
pub struct WireTransport {
    socket: UdpSocket,
    local: Endpoint,
    dest: Endpoint,
    dont_route: bool,
}

impl WireTransport {
    /// Opens the transport.
    ///
    /// # Errors
    ///
    /// See [`TransportError`].
    pub fn open(config: &TransportConfig) -> Result<Self, TransportError> {
        let (first, remote) = config.endpoints();
        let builder = SocketBuilder::new().map_err(TransportError::Socket)?;
        let sockopt = |option| move |source| TransportError::SockOpt { option, source };

        if config.broadcast {
            builder.set_broadcast(true).map_err(sockopt("SO_BROADCAST"))?;
        }
        if config.startup == StartupOption::Reuse {
            builder.set_reuse_addr(true).map_err(sockopt("SO_REUSEADDR"))?;
        }
        if config.recv_buffer_size > 0 {
            check_recv_buffer(&builder, config.recv_buffer_size)?;
        }

        let attempts = config.bind_attempts();
        let mut candidate = first;
        let mut bound = None;
        for _ in 0..attempts {
            match builder.bind(candidate) {
                Ok(()) => {
                    bound = Some(candidate);
                    break;
                }
                Err(_e) => {
                    debug!(addr = %candidate, error = %_e, "bind failed");
                    candidate = candidate.next_host();
                }
            }
        }

        let (local, dest) = match bound {
            Some(local) => (local, remote),
            None if config.startup == StartupOption::None => {
                return Err(TransportError::Bind { first, attempts });
            }
            None => {
                warn!(addr = %first, "cannot bind the instrument subnet, falling back");
                builder.set_reuse_addr(true).map_err(sockopt("SO_REUSEADDR"))?;
                let (local, dest) = if config.startup == StartupOption::Loopback {
                    (
                        Endpoint::localhost(first.port()),
                        Endpoint::localhost(remote.port()),
                    )
                } else {
                    (
                        Endpoint::any(first.port()),
                        Endpoint::broadcast(remote.port()),
                    )
                };
                builder
                    .bind(local)
                    .map_err(|_| TransportError::Bind { first: local, attempts: 1 })?;
                (local, dest)
            }
        };

        let socket = builder.finish().map_err(sockopt("O_NONBLOCK"))?;
        let local = socket.local_addr().unwrap_or(local);
        info!(%local, %dest, "transport open");
        Ok(Self {
            socket,
            local,
            dest,
            dont_route: config.dont_route && !local.ip().is_loopback(),
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Endpoint {
        self.local
    }

    /// Where datagrams are sent.
    pub fn destination(&self) -> Endpoint {
        self.dest
    }
}

fn check_recv_buffer(builder: &SocketBuilder, requested: usize) -> Result<(), TransportError> {
    let sockopt = |source| TransportError::SockOpt {
        option: "SO_RCVBUF",
        source,
    };
    builder.set_recv_buffer_size(requested).map_err(sockopt)?;
    let reported = builder.recv_buffer_size().map_err(sockopt)?;
    let actual = if cfg!(target_os = "linux") {
        reported / 2
    } else {
        reported
    };
    if actual < requested {
        return Err(TransportError::SockMem { requested, actual });
    }
    Ok(())
}

impl Wire for WireTransport {
    fn send(&self, bytes: &[u8]) -> io::Result<usize> {
        debug_assert!(bytes.len() <= MAX_DATAGRAM_BYTES);
        if self.dont_route {
            self.socket.send_to_direct(bytes, self.dest)
        } else {
            self.socket.send_to(bytes, self.dest)
        }
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.socket.try_recv_from(buf)?.map_or(0, |(n, _)| n))
    }

    fn is_loopback(&self) -> bool {
        self.local.ip().is_loopback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn free_port() -> u16 {
        UdpSocket::bind(Endpoint::localhost(0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn recv_timeout(wire: &impl Wire, buf: &mut [u8]) -> usize {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let n = wire.recv(buf).unwrap();
            if n > 0 {
                return n;
            }
            assert!(Instant::now() < deadline, "no datagram");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn default_config_targets_instrument_subnet() {
        let config = TransportConfig::default();
        let (local, remote) = config.endpoints();
        assert_eq!(local.to_string(), "192.168.137.1:51002");
        assert_eq!(remote.to_string(), "192.168.137.128:51001");
        assert_eq!(config.bind_attempts(), DEFAULT_BIND_RANGE);
        assert_eq!(
            TransportConfig::for_instance(2).in_addr,
            Ipv4Addr::new(192, 168, 137, 33)
        );
        assert_eq!(TransportConfig::for_instance(9).in_addr, config.in_addr);
    }

    #[test]
    fn startup_options_change_addresses_and_range() {
        let mut config = TransportConfig {
            startup: StartupOption::Local,
            in_port: 1,
            ..TransportConfig::default()
        };
        assert_eq!(
            config.endpoints(),
            (
                Endpoint::localhost(DEFAULT_IN_PORT),
                Endpoint::localhost(DEFAULT_OUT_PORT)
            )
        );
        config.startup = StartupOption::AnyIp;
        assert_eq!(config.bind_attempts(), SCAN_BIND_RANGE);
        config.startup = StartupOption::Loopback;
        assert_eq!(config.bind_attempts(), SCAN_BIND_RANGE);
    }

    #[test]
    fn loopback_transport_exchanges_datagrams() {
        let in_port = free_port();
        let instrument = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let out_port = instrument.local_addr().unwrap().port();

        let wire = WireTransport::open(&TransportConfig::loopback(in_port, out_port)).unwrap();
        assert_eq!(wire.local_addr(), Endpoint::localhost(in_port));
        assert!(wire.is_loopback());
        assert!(!wire.dont_route);

        let mut buf = [0u8; 64];
        assert_eq!(wire.recv(&mut buf).unwrap(), 0);

        wire.send(b"to instrument").unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let n = loop {
            if let Some((n, _)) = instrument.try_recv_from(&mut buf).unwrap() {
                break n;
            }
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(&buf[..n], b"to instrument");

        instrument
            .send_to(b"from instrument", Endpoint::localhost(in_port))
            .unwrap();
        let n = recv_timeout(&wire, &mut buf);
        assert_eq!(&buf[..n], b"from instrument");
    }

    #[test]
    fn fallback_to_any_interface_keeps_direct_sends() {
        let config = TransportConfig {
            in_addr: Ipv4Addr::new(203, 0, 113, 7),
            in_port: free_port(),
            startup: StartupOption::AnyIp,
            recv_buffer_size: 0,
            ..TransportConfig::default()
        };
        let wire = WireTransport::open(&config).unwrap();
        assert_eq!(wire.local_addr().ip(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(wire.destination(), Endpoint::broadcast(config.out_port));
        assert!(!wire.is_loopback());
        assert!(wire.dont_route);
    }

    #[test]
    fn bind_failure_without_fallback_is_an_error() {
        let taken = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = TransportConfig::loopback(port, 1);

        match WireTransport::open(&config) {
            Err(TransportError::Bind { first, attempts }) => {
                assert_eq!(first, Endpoint::localhost(port));
                assert_eq!(attempts, 1);
            }
            other => panic!("expected bind error, got {:?}", other.map(|w| w.local_addr())),
        }
    }
}
