//! Instrument packet format.
//!
//! Every message exchanged with the instrument, and every entry in a
//! [`RingChannel`](crate::ipc::ring::RingChannel), is a packet: an 8-byte
//! header followed by `dlen` 32-bit payload words.
//!
//! ```text
//! ┌───────────────────┬──────────┬─────────┬─────────┬──────────────────────┐
//! │ time (4)          │ chid (2) │ type(1) │ dlen(1) │ payload (dlen * 4)   │
//! └───────────────────┴──────────┴─────────┴─────────┴──────────────────────┘
//! ```
//!
//! All fields are little-endian. Several packets may share one datagram;
//! [`packets`] walks them in order.
//!
//! # Zero time
//!
//! The first word of a packet doubles as the "published" marker inside the
//! shared rings, so it can never be zero there. [`PacketHeader::publish_word`]
//! rewrites a zero `time` to 1. Decoding never alters `time`.

use std::num::NonZeroU32;

use thiserror::Error;

/// Header size in 32-bit words.
pub const HEADER_WORDS: usize = 2;

/// Header size in bytes.
pub const HEADER_SIZE: usize = HEADER_WORDS * 4;

/// Largest payload a header can describe.
pub const MAX_PAYLOAD_WORDS: usize = u8::MAX as usize;

/// Largest packet in words.
pub const MAX_PACKET_WORDS: usize = HEADER_WORDS + MAX_PAYLOAD_WORDS;

/// Largest datagram the instrument sends.
pub const MAX_DATAGRAM_BYTES: usize = 58080;

/// Channel id of the system/configuration namespace.
pub const CONFIG_CHID: u16 = 0x8000;

/// Packet type codes handled by the bridge.
///
/// Commands have the high bit set; the instrument answers with the same code
/// and the bit cleared.
pub mod packet_type {
    pub const SYSHEARTBEAT: u8 = 0x00;
    pub const SYSPROTOCOLMONITOR: u8 = 0x01;
    pub const REPCONFIGALL: u8 = 0x08;
    pub const SYSREP: u8 = 0x10;
    pub const SYSREPSPKLEN: u8 = 0x11;
    pub const SYSREPRUNLEV: u8 = 0x12;
    pub const PROCREP: u8 = 0x21;
    pub const BANKREP: u8 = 0x22;
    pub const FILTREP: u8 = 0x23;
    pub const ADAPTFILTREP: u8 = 0x25;
    pub const REFELECFILTREP: u8 = 0x26;
    pub const LNCREP: u8 = 0x28;
    pub const GROUPREP: u8 = 0x30;
    pub const NMREP: u8 = 0x32;
    pub const CHANREP: u8 = 0x40;
    pub const SS_MODELREP: u8 = 0x51;
    pub const SS_DETECTREP: u8 = 0x52;
    pub const SS_STATUSREP: u8 = 0x57;
    pub const FS_BASISREP: u8 = 0x5B;
    pub const NPLAYREP: u8 = 0x5C;
    pub const REPFILECFG: u8 = 0x61;
    pub const REQCONFIGALL: u8 = 0x88;
    pub const SYSSETRUNLEV: u8 = 0x92;

    /// Mask selecting a reply family (`CHANREP*`, `SYSREP*`).
    pub const FAMILY_MASK: u8 = 0xF0;

    /// Bits that mark the channel-set family.
    pub const CHANNEL_SET_MASK: u8 = 0xC0;

    /// Bit distinguishing a command from its reply.
    pub const COMMAND_BIT: u8 = 0x80;
}

/// Instrument run levels carried in system info packets.
pub mod runlevel {
    pub const STARTUP: u32 = 10;
    pub const HARDRESET: u32 = 20;
    pub const STANDBY: u32 = 30;
    pub const RESET: u32 = 40;
    pub const RUNNING: u32 = 50;
    pub const STRESSED: u32 = 60;
    pub const ERROR: u32 = 70;
    pub const SHUTDOWN: u32 = 80;
}

/// Run flags carried next to the run level.
pub mod runflags {
    pub const NONE: u32 = 0;
    /// Recording is locked after the reset.
    pub const LOCK: u32 = 1;
}

/// Payload length of a system info packet.
pub const SYSINFO_DLEN: u8 = 6;

/// Errors while decoding packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// The buffer ends before the declared packet does.
    #[error("truncated packet: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    /// A payload longer than a header can describe.
    #[error("payload of {0} words exceeds 255")]
    PayloadTooLong(usize),
}

/// Fixed 8-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Instrument clock tick.
    pub time: u32,
    /// Channel id; [`CONFIG_CHID`] for configuration traffic.
    pub chid: u16,
    /// Packet type code, see [`packet_type`].
    pub pkt_type: u8,
    /// Number of payload words.
    pub dlen: u8,
}

impl PacketHeader {
    /// Packet length in words, header included.
    #[inline]
    pub const fn len_words(&self) -> usize {
        HEADER_WORDS + self.dlen as usize
    }

    /// Packet length in bytes, header included.
    #[inline]
    pub const fn len_bytes(&self) -> usize {
        self.len_words() * 4
    }

    /// Packs `chid`, `type` and `dlen` into the second header word.
    #[inline]
    pub const fn second_word(&self) -> u32 {
        self.chid as u32 | (self.pkt_type as u32) << 16 | (self.dlen as u32) << 24
    }

    /// Rebuilds a header from its two words.
    #[inline]
    pub const fn from_words(first: u32, second: u32) -> Self {
        Self {
            time: first,
            chid: (second & 0xFFFF) as u16,
            pkt_type: ((second >> 16) & 0xFF) as u8,
            dlen: (second >> 24) as u8,
        }
    }

    /// The first word as written into a shared ring: `time`, with 0 mapped to 1.
    #[inline]
    pub const fn publish_word(&self) -> NonZeroU32 {
        match NonZeroU32::new(self.time) {
            Some(word) => word,
            None => NonZeroU32::MIN,
        }
    }

    /// Decodes a header from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let mut reader = WordReader::new(buf);
        let first = reader.take_u32()?;
        let second = reader.take_u32()?;
        Ok(Self::from_words(first, second))
    }
}

/// A complete packet: header plus payload words.
///
/// `dlen` always equals the payload length; constructors enforce it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: PacketHeader,
    payload: Vec<u32>,
}

impl Packet {
    /// Builds a packet, deriving `dlen` from the payload.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::PayloadTooLong`] for payloads over 255 words.
    pub fn new(time: u32, chid: u16, pkt_type: u8, payload: Vec<u32>) -> Result<Self, PacketError> {
        let dlen = u8::try_from(payload.len())
            .map_err(|_| PacketError::PayloadTooLong(payload.len()))?;
        Ok(Self {
            header: PacketHeader {
                time,
                chid,
                pkt_type,
                dlen,
            },
            payload,
        })
    }

    /// A system command asking the instrument to move to `level`.
    pub fn set_runlevel(level: u32, resetque: u32, flags: u32) -> Self {
        // sysfreq, spikelen, spikepre, resetque, runlevel, runflags
        let payload = vec![0, 0, 0, resetque, level, flags];
        Self {
            header: PacketHeader {
                time: 1,
                chid: CONFIG_CHID,
                pkt_type: packet_type::SYSSETRUNLEV,
                dlen: SYSINFO_DLEN,
            },
            payload,
        }
    }

    /// Asks the instrument to report its whole configuration.
    pub fn request_config_all() -> Self {
        Self {
            header: PacketHeader {
                time: 1,
                chid: CONFIG_CHID,
                pkt_type: packet_type::REQCONFIGALL,
                dlen: 0,
            },
            payload: Vec::new(),
        }
    }

    #[inline]
    pub const fn header(&self) -> &PacketHeader {
        &self.header
    }

    #[inline]
    pub fn payload(&self) -> &[u32] {
        &self.payload
    }

    #[inline]
    pub const fn time(&self) -> u32 {
        self.header.time
    }

    #[inline]
    pub fn set_time(&mut self, time: u32) {
        self.header.time = time;
    }

    #[inline]
    pub const fn chid(&self) -> u16 {
        self.header.chid
    }

    #[inline]
    pub const fn pkt_type(&self) -> u8 {
        self.header.pkt_type
    }

    #[inline]
    pub const fn dlen(&self) -> u8 {
        self.header.dlen
    }

    #[inline]
    pub const fn len_words(&self) -> usize {
        self.header.len_words()
    }

    #[inline]
    pub const fn len_bytes(&self) -> usize {
        self.header.len_bytes()
    }

    /// Payload word `index`, if present.
    #[inline]
    pub fn word(&self, index: usize) -> Option<u32> {
        self.payload.get(index).copied()
    }

    /// The channel field of channel-addressed configuration packets.
    ///
    /// Always the first payload word.
    #[inline]
    pub fn embedded_channel(&self) -> Option<u32> {
        self.word(0)
    }

    /// True for the `0xC0` family whose replies are told apart by channel.
    #[inline]
    pub const fn is_channel_set_family(&self) -> bool {
        self.header.pkt_type & packet_type::CHANNEL_SET_MASK == packet_type::CHANNEL_SET_MASK
    }

    /// Type code the instrument uses to answer this packet.
    #[inline]
    pub const fn reply_type(&self) -> u8 {
        self.header.pkt_type & !packet_type::COMMAND_BIT
    }

    /// Appends the wire encoding to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.len_bytes());
        buf.extend_from_slice(&self.header.time.to_le_bytes());
        buf.extend_from_slice(&self.header.second_word().to_le_bytes());
        for word in &self.payload {
            buf.extend_from_slice(&word.to_le_bytes());
        }
    }

    /// Wire encoding in a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len_bytes());
        self.encode(&mut buf);
        buf
    }

    /// Decodes one packet from the front of `buf`.
    ///
    /// Returns the packet and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// [`PacketError::Truncated`] if the declared length runs past `buf`.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), PacketError> {
        let header = PacketHeader::decode(buf)?;
        let need = header.len_bytes();
        if buf.len() < need {
            return Err(PacketError::Truncated {
                need,
                have: buf.len(),
            });
        }

        let mut reader = WordReader::new(&buf[HEADER_SIZE..need]);
        let mut payload = Vec::with_capacity(header.dlen as usize);
        for _ in 0..header.dlen {
            payload.push(reader.take_u32()?);
        }
        Ok((Self { header, payload }, need))
    }

    /// Rebuilds a packet from its words, header first.
    ///
    /// # Errors
    ///
    /// [`PacketError::Truncated`] if `words` is shorter than the header says.
    pub fn from_words(words: &[u32]) -> Result<Self, PacketError> {
        if words.len() < HEADER_WORDS {
            return Err(PacketError::Truncated {
                need: HEADER_SIZE,
                have: words.len() * 4,
            });
        }
        let header = PacketHeader::from_words(words[0], words[1]);
        let end = header.len_words();
        if words.len() < end {
            return Err(PacketError::Truncated {
                need: header.len_bytes(),
                have: words.len() * 4,
            });
        }
        Ok(Self {
            header,
            payload: words[HEADER_WORDS..end].to_vec(),
        })
    }
}

/// Iterates the packets packed into one datagram.
///
/// Yields an error for a packet whose declared size exceeds the bytes left
/// and stops there; the remainder of the datagram cannot be framed.
pub fn packets(datagram: &[u8]) -> Packets<'_> {
    Packets {
        buf: datagram,
        failed: false,
    }
}

/// Iterator returned by [`packets`].
pub struct Packets<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl Iterator for Packets<'_> {
    type Item = Result<Packet, PacketError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }
        match Packet::decode(self.buf) {
            Ok((packet, used)) => {
                self.buf = &self.buf[used..];
                Some(Ok(packet))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

struct WordReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> WordReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn take_u32(&mut self) -> Result<u32, PacketError> {
        if self.remaining() < 4 {
            return Err(PacketError::Truncated {
                need: self.cursor + 4,
                have: self.buf.len(),
            });
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(&self.buf[self.cursor..self.cursor + 4]);
        self.cursor += 4;
        Ok(u32::from_le_bytes(arr))
    }
}
