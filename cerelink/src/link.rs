//! Connection to one instrument.
//!
//! [`InstrumentLink`] owns the wire, the reliable command pool that sits on
//! top of it and access to the local loopback path. Packets queued on the
//! XmtLocal ring come back through [`InstrumentLink::recv_loopback`] as if
//! the instrument had sent them; the dispatcher tags them so they bypass
//! reply matching.

use std::io;

use thiserror::Error;

use crate::ipc::RingChannel;
use crate::net::{TransportConfig, TransportError, Wire, WireTransport};
use crate::packet::{Packet, runflags, runlevel};
use crate::reliable::{ReliabilityConfig, ReliableCommandChannel, SendError, SlotMode};
use crate::trace::info;

/// Errors from link operations.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("cannot open instrument transport")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Send(#[from] SendError),
}

impl LinkError {
    /// True when the command was refused because every request slot is
    /// busy.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Send(SendError::Rejected(_)))
    }
}

/// Transport plus reliability for one instrument.
pub struct InstrumentLink<W: Wire = WireTransport> {
    wire: W,
    commands: ReliableCommandChannel,
}

impl InstrumentLink<WireTransport> {
    /// Opens the UDP transport.
    ///
    /// # Errors
    ///
    /// [`LinkError::Transport`] when no socket can be set up.
    pub fn open(transport: &TransportConfig, reliability: ReliabilityConfig) -> Result<Self, LinkError> {
        let wire = WireTransport::open(transport)?;
        info!(local = %wire.local_addr(), remote = %wire.destination(), "instrument link open");
        Ok(Self::new(wire, reliability))
    }
}

impl<W: Wire> InstrumentLink<W> {
    /// Wraps an already open wire.
    pub fn new(wire: W, reliability: ReliabilityConfig) -> Self {
        Self {
            wire,
            commands: ReliableCommandChannel::new(reliability),
        }
    }

    /// Releases the wire.
    pub fn close(self) -> W {
        self.wire
    }

    pub fn wire(&self) -> &W {
        &self.wire
    }

    /// Sends `packet` as a command awaiting a reply.
    ///
    /// # Errors
    ///
    /// [`LinkError::Send`] when the pool is full or the wire failed.
    pub fn send(&mut self, packet: &Packet) -> Result<usize, LinkError> {
        Ok(self.commands.send(&self.wire, packet)?)
    }

    /// Asks the instrument to hard-reset into standby.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn standby(&mut self) -> Result<usize, LinkError> {
        self.send(&Packet::set_runlevel(runlevel::HARDRESET, 0, runflags::NONE))
    }

    /// Asks the instrument to shut down.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn shutdown(&mut self) -> Result<usize, LinkError> {
        self.send(&Packet::set_runlevel(runlevel::SHUTDOWN, 0, runflags::NONE))
    }

    /// One datagram from the wire; `Ok(0)` when none is pending.
    ///
    /// # Errors
    ///
    /// Returns the OS error.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.wire.recv(buf)
    }

    /// Next packet queued on the loopback ring, removed from it.
    pub fn recv_loopback(&self, ring: RingChannel<'_>) -> Option<Packet> {
        ring.take_next()
    }

    /// Offers an inbound packet to the pending commands.
    pub fn check_for_reply(&mut self, incoming: &Packet) {
        self.commands.check_for_reply(incoming);
    }

    /// Drives command timeouts. True if a command just ran out of retries.
    pub fn tick(&mut self) -> bool {
        self.commands.tick(&self.wire)
    }

    /// True if a command slot is free.
    pub fn ok_to_send(&self) -> bool {
        self.commands.ok_to_send()
    }

    pub fn mode(&self) -> SlotMode {
        self.commands.mode()
    }

    /// Drops every pending command and applies new timing.
    pub fn reset(&mut self, reliability: ReliabilityConfig) {
        self.commands.reset(reliability);
    }

    pub fn reliability(&self) -> &ReliabilityConfig {
        self.commands.config()
    }

    /// True when the instrument is reached over loopback.
    pub fn is_loopback(&self) -> bool {
        self.wire.is_loopback()
    }
}
