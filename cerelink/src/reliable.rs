//! Command/acknowledgment layer over the unreliable wire.
//!
//! Each outgoing command occupies one [`PendingRequestSlot`] until a
//! matching reply arrives. Unanswered commands are resent every
//! `reply_timeout_ticks` dispatcher ticks; once `max_retries` is used up the
//! slot reports failure a single time and stays occupied until
//! [`ReliableCommandChannel::reset`].
//!
//! A reply matches when its type equals the command type with the command
//! bit (`0x80`) cleared and its `chid` is the same. Channel-set commands
//! (`type & 0xC0 == 0xC0`) carrying a payload additionally need the same
//! embedded channel, so two outstanding channel commands do not satisfy
//! each other.

use std::io;

use crate::net::Wire;
use crate::packet::Packet;
use crate::trace::{debug, error};

/// Reliability timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliabilityConfig {
    /// Commands that may await a reply at once.
    ///
    /// **Default**: 6
    pub pool_size: usize,

    /// Ticks to wait for a reply before resending.
    ///
    /// **Default**: 15 (150 ms at the standard tick)
    pub reply_timeout_ticks: u32,

    /// Sends per command, the first one included.
    ///
    /// **Default**: 10
    pub max_retries: u32,
}

impl ReliabilityConfig {
    /// # Panics
    ///
    /// Panics if any value is zero.
    fn new_validated(pool_size: usize, reply_timeout_ticks: u32, max_retries: u32) -> Self {
        assert!(pool_size > 0, "pool_size must be > 0");
        assert!(reply_timeout_ticks > 0, "reply_timeout_ticks must be > 0");
        assert!(max_retries > 0, "max_retries must be > 0");
        Self {
            pool_size,
            reply_timeout_ticks,
            max_retries,
        }
    }

    /// Directly attached instrument.
    pub fn standard() -> Self {
        Self::new_validated(6, 15, 10)
    }

    /// Instruments that answer slowly: playback servers and headstage
    /// processors.
    pub fn high_latency() -> Self {
        Self::new_validated(6, 10, 10)
    }

    /// Custom timing.
    ///
    /// # Panics
    ///
    /// Panics if any value is zero.
    pub fn custom(pool_size: usize, reply_timeout_ticks: u32, max_retries: u32) -> Self {
        Self::new_validated(pool_size, reply_timeout_ticks, max_retries)
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self::standard()
    }
}

/// Rejected command.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Every slot is awaiting a reply.
    #[error("all {0} request slots await a reply")]
    Rejected(usize),
    #[error("wire send failed")]
    Io(#[from] io::Error),
}

/// State of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlotMode {
    OkToSend,
    WaitingForReply,
}

/// One outstanding command.
#[derive(Debug, Clone)]
pub struct PendingRequestSlot {
    mode: SlotMode,
    packet: Option<Packet>,
    ticks_left: i64,
    retries_left: i64,
    max_ticks: u32,
    max_retries: u32,
    resends: u32,
    failed: bool,
}

impl PendingRequestSlot {
    fn new(config: &ReliabilityConfig) -> Self {
        Self {
            mode: SlotMode::OkToSend,
            packet: None,
            ticks_left: i64::from(config.reply_timeout_ticks),
            retries_left: i64::from(config.max_retries),
            max_ticks: config.reply_timeout_ticks,
            max_retries: config.max_retries,
            resends: 0,
            failed: false,
        }
    }

    pub fn mode(&self) -> SlotMode {
        self.mode
    }

    /// The command being waited on.
    pub fn packet(&self) -> Option<&Packet> {
        self.packet.as_ref()
    }

    /// Resends since the command was stored.
    pub fn resends(&self) -> u32 {
        self.resends
    }

    /// True once retries ran out.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn ok_to_send(&self) -> bool {
        self.mode == SlotMode::OkToSend
    }

    fn store(&mut self, packet: Packet) {
        self.packet = Some(packet);
        self.mode = SlotMode::WaitingForReply;
        self.ticks_left = i64::from(self.max_ticks);
        self.retries_left = i64::from(self.max_retries);
        self.resends = 0;
        self.failed = false;
    }

    /// Clears the slot if `incoming` answers the stored command.
    pub fn check_for_reply(&mut self, incoming: &Packet) -> bool {
        if self.mode != SlotMode::WaitingForReply {
            return false;
        }
        let Some(out) = &self.packet else {
            return false;
        };
        if !is_reply(out, incoming) {
            return false;
        }
        self.mode = SlotMode::OkToSend;
        self.failed = false;
        true
    }

    /// Advances the timeout. Returns true exactly once, when retries run out.
    fn tick<W: Wire>(&mut self, wire: &W) -> bool {
        if self.mode != SlotMode::WaitingForReply || self.failed {
            return false;
        }
        self.ticks_left -= 1;
        if self.ticks_left > 0 {
            return false;
        }
        self.retries_left -= 1;
        if self.retries_left > 0 {
            if let Some(packet) = &self.packet {
                debug!(
                    pkt_type = packet.pkt_type(),
                    chid = packet.chid(),
                    "resending command"
                );
                if let Err(_e) = wire.send(&packet.to_bytes()) {
                    debug!(error = %_e, "resend failed");
                }
            }
            self.resends += 1;
            self.ticks_left = i64::from(self.max_ticks);
            false
        } else {
            self.failed = true;
            true
        }
    }
}

/// True when `incoming` answers the command `out`.
pub fn is_reply(out: &Packet, incoming: &Packet) -> bool {
    if incoming.pkt_type() != out.reply_type() || incoming.chid() != out.chid() {
        return false;
    }
    if out.is_channel_set_family() && out.dlen() != 0 {
        return incoming.embedded_channel() == out.embedded_channel();
    }
    true
}

/// Fixed pool of [`PendingRequestSlot`]s.
#[derive(Debug, Clone)]
pub struct ReliableCommandChannel {
    slots: Vec<PendingRequestSlot>,
    config: ReliabilityConfig,
}

impl ReliableCommandChannel {
    pub fn new(config: ReliabilityConfig) -> Self {
        Self {
            slots: (0..config.pool_size)
                .map(|_| PendingRequestSlot::new(&config))
                .collect(),
            config,
        }
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    /// Frees every slot and applies new timing.
    pub fn reset(&mut self, config: ReliabilityConfig) {
        *self = Self::new(config);
    }

    /// Stores `packet` in the first free slot and sends it.
    ///
    /// # Errors
    ///
    /// [`SendError::Rejected`] if no slot is free; nothing is sent.
    /// [`SendError::Io`] if the wire refused the datagram; the slot stays
    /// occupied and the command is retried on timeout.
    pub fn send<W: Wire>(&mut self, wire: &W, packet: &Packet) -> Result<usize, SendError> {
        let pool = self.slots.len();
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.ok_to_send())
            .ok_or(SendError::Rejected(pool))?;
        slot.store(packet.clone());
        Ok(wire.send(&packet.to_bytes())?)
    }

    /// Offers an inbound packet to every waiting slot.
    pub fn check_for_reply(&mut self, incoming: &Packet) {
        for slot in &mut self.slots {
            slot.check_for_reply(incoming);
        }
    }

    /// Drives every slot's timeout. True if a slot ran out of retries on
    /// this tick.
    pub fn tick<W: Wire>(&mut self, wire: &W) -> bool {
        let mut failed = false;
        for slot in &mut self.slots {
            if slot.tick(wire) {
                if let Some(_packet) = slot.packet() {
                    error!(
                        pkt_type = _packet.pkt_type(),
                        chid = _packet.chid(),
                        "instrument never answered command"
                    );
                }
                failed = true;
            }
        }
        failed
    }

    /// True if at least one slot is free.
    pub fn ok_to_send(&self) -> bool {
        self.slots.iter().any(PendingRequestSlot::ok_to_send)
    }

    /// `WaitingForReply` if any slot is busy.
    pub fn mode(&self) -> SlotMode {
        self.slots
            .iter()
            .map(PendingRequestSlot::mode)
            .max()
            .unwrap_or(SlotMode::OkToSend)
    }

    pub fn slots(&self) -> &[PendingRequestSlot] {
        &self.slots
    }
}

impl Default for ReliableCommandChannel {
    fn default() -> Self {
        Self::new(ReliabilityConfig::standard())
    }
}
