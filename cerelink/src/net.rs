//! Network side of the bridge: addresses, the UDP socket and the
//! instrument transport built on it.

pub mod endpoint;
pub mod socket;
pub mod transport;

pub use endpoint::Endpoint;
pub use socket::UdpSocket;
pub use transport::{StartupOption, TransportConfig, TransportError, Wire, WireTransport};
