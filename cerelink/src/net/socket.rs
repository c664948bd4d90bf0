//! Non-blocking UDP socket for the instrument link.
//!
//! [`SocketBuilder`] owns a raw socket while options are applied and binds
//! are attempted; [`SocketBuilder::finish`] turns it into a non-blocking
//! [`UdpSocket`] backed by mio.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::os::fd::{AsFd, OwnedFd};

use mio::net::UdpSocket as MioUdpSocket;
use rustix::net::{AddressFamily, SendFlags, SocketType, sockopt};

use super::Endpoint;

/// An unbound IPv4 datagram socket being configured.
pub struct SocketBuilder {
    fd: OwnedFd,
}

impl SocketBuilder {
    /// Creates the socket.
    ///
    /// # Errors
    ///
    /// Returns the OS error if no socket can be created.
    pub fn new() -> io::Result<Self> {
        let fd = rustix::net::socket(AddressFamily::INET, SocketType::DGRAM, None)?;
        Ok(Self { fd })
    }

    /// Allows sending to broadcast addresses.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the option is rejected.
    pub fn set_broadcast(&self, on: bool) -> io::Result<()> {
        Ok(sockopt::set_socket_broadcast(&self.fd, on)?)
    }

    /// Allows binding an address another socket already uses.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the option is rejected.
    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        Ok(sockopt::set_socket_reuseaddr(&self.fd, on)?)
    }

    /// Requests a kernel receive buffer of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the option is rejected.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        Ok(sockopt::set_socket_recv_buffer_size(&self.fd, size)?)
    }

    /// Receive buffer size as reported by the kernel.
    ///
    /// Linux reports twice the usable size.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the option cannot be read.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(sockopt::socket_recv_buffer_size(&self.fd)?)
    }

    /// Binds to `endpoint`. A failed bind leaves the socket unbound, so the
    /// caller may try another address.
    ///
    /// # Errors
    ///
    /// Returns the OS error, typically `EADDRNOTAVAIL` or `EADDRINUSE`.
    pub fn bind(&self, endpoint: Endpoint) -> io::Result<()> {
        Ok(rustix::net::bind(&self.fd, &SocketAddr::from(endpoint))?)
    }

    /// Switches to non-blocking mode and hands the socket to mio.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mode cannot be changed.
    pub fn finish(self) -> io::Result<UdpSocket> {
        let std_socket = std::net::UdpSocket::from(self.fd);
        std_socket.set_nonblocking(true)?;
        Ok(UdpSocket {
            inner: MioUdpSocket::from_std(std_socket),
        })
    }
}

/// A bound, non-blocking UDP socket.
pub struct UdpSocket {
    inner: MioUdpSocket,
}

impl UdpSocket {
    /// Binds a plain socket with default options.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., address in use).
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioUdpSocket::bind(endpoint.into())?;
        Ok(Self { inner })
    }

    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved or is IPv6.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        let addr = self.inner.local_addr()?;
        Endpoint::try_from(addr)
            .map_err(|addr| io::Error::new(ErrorKind::Unsupported, format!("IPv6 address {addr}")))
    }

    /// Sends one datagram.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, including `WouldBlock`.
    pub fn send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize> {
        self.inner.send_to(buf, dest.into())
    }

    /// Sends one datagram, bypassing the routing table (`MSG_DONTROUTE`).
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, including `WouldBlock`.
    pub fn send_to_direct(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize> {
        Ok(rustix::net::sendto(
            self.inner.as_fd(),
            buf,
            SendFlags::DONTROUTE,
            &SocketAddr::from(dest),
        )?)
    }

    /// Receives one datagram, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// # Errors
    ///
    /// Returns any I/O error other than `WouldBlock`.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.inner.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}
