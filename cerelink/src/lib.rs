//! Bridge between a neural-recording instrument and the processes of one
//! host.
//!
//! The instrument talks UDP. One process per instrument owns the link and
//! runs the [`NetworkDispatcher`](dispatcher::NetworkDispatcher), which
//! publishes every inbound packet to a shared-memory receive ring and drains
//! a shared transmit ring back to the wire. Any number of other processes
//! attach to the same rings: they read with private cursors and queue
//! commands without talking to the dispatcher directly.
//!
//! Start with [`Bridge::spawn`]; it picks the owner or client role on its
//! own.

pub mod bridge;
pub mod dispatcher;
pub mod event;
pub mod ipc;
pub mod link;
pub mod mirror;
pub mod net;
pub mod packet;
pub mod reliable;
pub mod session;

mod trace;

pub use bridge::{Bridge, BridgeConfig, BridgeError};
pub use event::{Listener, Listeners, NetEvent};
pub use packet::Packet;
pub use trace::init_tracing;
