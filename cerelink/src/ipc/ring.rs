//! Shared-memory packet rings.
//!
//! A [`RingRegion`] is a header plus a flat array of 32-bit words. Packets are
//! stored back to back; when the next packet would start past
//! `last_valid_index` the head wraps to 0. The `reserve` words after
//! `last_valid_index` guarantee a maximum-size packet written at any legal
//! head still fits.
//!
//! # Publication
//!
//! A packet's first word is its `time`, which is never zero once published
//! (see [`PacketHeader::publish_word`]). Writers store every other word first
//! and the first word last with `Release`, so a reader that loads a non-zero
//! first word with `Acquire` sees the whole packet.
//!
//! # Modes
//!
//! | Mode | Writers | Readers | Tail |
//! |------|---------|---------|------|
//! | [`RingMode::Broadcast`] | one | any number | private [`ReaderCursor`] per reader |
//! | [`RingMode::Bounded`] | any number | one | shared `tailindex` in the header |
//!
//! Broadcast writers never wait for readers; a reader lapped by more than one
//! wrap is told so by [`RingChannel::check_for_data`] and skips ahead.
//! Bounded writers claim space with a compare-and-swap on `headindex` and
//! refuse claims that would run into the shared tail. The single consumer
//! zeroes each packet it removes, which is what makes "first word zero" mean
//! "not yet published" the next time round.
//!
//! ```text
//!  0                      tail                head      last_valid   bufferlen
//!  │                       │▓▓▓▓▓▓▓▓▓▓▓▓▓▓▓▓▓▓▓▓│             │ reserve │
//!  └───────────────────────┴────────────────────┴─────────────┴─────────┘
//!                           unread packets
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use super::shmem::{Segment, SharedMemorySafe};
use crate::packet::{HEADER_WORDS, MAX_PACKET_WORDS, Packet, PacketHeader};

const INIT_MAGIC: u32 = 0x5249_4E47; // "RING"

/// Claim attempts made by [`RingChannel::claim_and_publish`].
pub const CLAIM_ATTEMPTS: u32 = 3;

/// Sleep between failed claim attempts.
pub const CLAIM_BACKOFF: Duration = Duration::from_millis(10);

/// Errors publishing into a ring.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingError {
    /// No room (or lost every race for it); retry later.
    #[error("ring has no room after {attempts} claim attempt(s)")]
    ResourceExhausted { attempts: u32 },
    /// Another writer moved the head of a single-writer ring.
    #[error("head of a broadcast ring moved under its writer")]
    WriterConflict,
}

/// Who may write and who may read a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RingMode {
    /// One writer, many independent readers (the receive buffer).
    Broadcast = 1,
    /// Many writers, one reader (the transmit buffers).
    Bounded = 2,
}

/// How far behind the writer a reader is, in quarters of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LevelOfConcern {
    Low,
    Medium,
    High,
    Critical,
}

impl LevelOfConcern {
    fn from_quarters(quarters: u64) -> Self {
        match quarters {
            0 => Self::Low,
            1 => Self::Medium,
            2 => Self::High,
            _ => Self::Critical,
        }
    }
}

/// Result of [`RingChannel::check_for_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    /// Reader is within one wrap of the writer.
    Pending {
        packets: u32,
        concern: LevelOfConcern,
    },
    /// Reader was lapped; its cursor has been moved to the current head.
    DataLost,
}

/// Ring bookkeeping at the start of the shared region.
#[repr(C)]
pub struct RingHeader {
    init: AtomicU32,
    mode: AtomicU32,
    bufferlen: AtomicU32,
    last_valid_index: AtomicU32,
    headindex: AtomicU32,
    headwrap: AtomicU32,
    tailindex: AtomicU32,
    tailwrap: AtomicU32,
    received: AtomicU32,
    transmitted: AtomicU32,
    lasttime: AtomicU32,
}

/// Header plus `N` words of packet storage.
#[repr(C)]
pub struct RingRegion<const N: usize> {
    header: RingHeader,
    words: [AtomicU32; N],
}

// SAFETY: repr(C), atomics only, all-zero is the "uninitialized" state that
// initialize() and is_initialized() expect.
unsafe impl SharedMemorySafe for RingHeader {}
unsafe impl<const N: usize> SharedMemorySafe for RingRegion<N> {}

impl<const N: usize> RingRegion<N> {
    /// Borrowed view used for every ring operation.
    pub fn channel(&self) -> RingChannel<'_> {
        RingChannel {
            header: &self.header,
            words: &self.words,
        }
    }
}

/// Anything that can hand out a [`RingChannel`].
///
/// Lets sessions hold rings of different capacities behind one type.
pub trait RingStore: Send + Sync {
    fn ring(&self) -> RingChannel<'_>;
}

impl<const N: usize> RingStore for Segment<RingRegion<N>> {
    fn ring(&self) -> RingChannel<'_> {
        (**self).channel()
    }
}

/// A reader's private position in a broadcast ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderCursor {
    pub tailindex: u32,
    pub tailwrap: u32,
    pub processed: u32,
    pub lasttime: u32,
}

impl ReaderCursor {
    /// A cursor that starts at the writer's current head.
    pub fn begin_now(ring: RingChannel<'_>) -> Self {
        let mut cursor = Self::default();
        ring.resync_to_head(&mut cursor);
        cursor
    }
}

/// Operations on one ring.
#[derive(Clone, Copy)]
pub struct RingChannel<'a> {
    header: &'a RingHeader,
    words: &'a [AtomicU32],
}

impl<'a> RingChannel<'a> {
    /// Sets up an all-zero region. Only the creator calls this, once.
    ///
    /// # Panics
    ///
    /// Panics if `reserve` is smaller than a maximum-size packet or leaves no
    /// usable space.
    pub fn initialize(&self, mode: RingMode, reserve: usize) {
        assert!(
            reserve >= MAX_PACKET_WORDS,
            "reserve must hold a maximum-size packet"
        );
        assert!(reserve < self.words.len(), "reserve exceeds ring capacity");
        let len = u32::try_from(self.words.len()).unwrap_or(u32::MAX);

        let h = self.header;
        h.mode.store(mode as u32, Ordering::Relaxed);
        h.bufferlen.store(len, Ordering::Relaxed);
        h.last_valid_index
            .store(len - reserve as u32, Ordering::Relaxed);
        h.headindex.store(0, Ordering::Relaxed);
        h.headwrap.store(0, Ordering::Relaxed);
        h.tailindex.store(0, Ordering::Relaxed);
        h.tailwrap.store(0, Ordering::Relaxed);
        h.received.store(0, Ordering::Relaxed);
        h.transmitted.store(0, Ordering::Relaxed);
        h.lasttime.store(0, Ordering::Relaxed);
        h.init.store(INIT_MAGIC, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.header.init.load(Ordering::Acquire) == INIT_MAGIC
    }

    /// Waits for the creator to finish [`initialize`](Self::initialize).
    pub fn wait_for_init(&self, timeout: Duration) -> bool {
        let start = minstant::Instant::now();
        loop {
            if self.is_initialized() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn mode(&self) -> RingMode {
        if self.header.mode.load(Ordering::Relaxed) == RingMode::Bounded as u32 {
            RingMode::Bounded
        } else {
            RingMode::Broadcast
        }
    }

    /// Capacity in words.
    pub fn bufferlen(&self) -> u32 {
        self.header.bufferlen.load(Ordering::Relaxed)
    }

    pub fn last_valid_index(&self) -> u32 {
        self.header.last_valid_index.load(Ordering::Relaxed)
    }

    pub fn headindex(&self) -> u32 {
        self.header.headindex.load(Ordering::Acquire)
    }

    pub fn headwrap(&self) -> u32 {
        self.header.headwrap.load(Ordering::Acquire)
    }

    /// Shared tail of a bounded ring.
    pub fn tailindex(&self) -> u32 {
        self.header.tailindex.load(Ordering::Acquire)
    }

    pub fn tailwrap(&self) -> u32 {
        self.header.tailwrap.load(Ordering::Acquire)
    }

    /// Packets published so far.
    pub fn received(&self) -> u32 {
        self.header.received.load(Ordering::Acquire)
    }

    /// Packets removed by the consumer of a bounded ring.
    pub fn transmitted(&self) -> u32 {
        self.header.transmitted.load(Ordering::Acquire)
    }

    /// Time of the newest packet in a broadcast ring.
    pub fn lasttime(&self) -> u32 {
        self.header.lasttime.load(Ordering::Acquire)
    }

    fn reserve(&self) -> u32 {
        self.bufferlen() - self.last_valid_index()
    }

    /// Offset following a packet of `quadlets` words at `index`, and whether
    /// that wraps.
    fn advance(&self, index: u32, quadlets: u32) -> (u32, bool) {
        let next = index + quadlets;
        if next > self.last_valid_index() {
            (0, true)
        } else {
            (next, false)
        }
    }

    /// Publishes `packet`, retrying contention up to [`CLAIM_ATTEMPTS`] times.
    ///
    /// # Errors
    ///
    /// [`RingError::ResourceExhausted`] when every attempt failed; the ring
    /// is untouched and the caller may retry.
    pub fn claim_and_publish(&self, packet: &Packet) -> Result<(), RingError> {
        self.publish_with(packet, CLAIM_ATTEMPTS, CLAIM_BACKOFF)
    }

    /// Single attempt, no sleeping.
    ///
    /// # Errors
    ///
    /// See [`claim_and_publish`](Self::claim_and_publish).
    pub fn try_publish(&self, packet: &Packet) -> Result<(), RingError> {
        self.publish_with(packet, 1, Duration::ZERO)
    }

    fn publish_with(&self, packet: &Packet, attempts: u32, backoff: Duration) -> Result<(), RingError> {
        match self.mode() {
            RingMode::Broadcast => self.publish_broadcast(packet),
            RingMode::Bounded => {
                for attempt in 1..=attempts {
                    if self.try_claim(packet) {
                        return Ok(());
                    }
                    if attempt < attempts {
                        thread::sleep(backoff);
                    }
                }
                Err(RingError::ResourceExhausted { attempts })
            }
        }
    }

    fn try_claim(&self, packet: &Packet) -> bool {
        let h = self.header;
        let quadlets = packet.len_words() as u32;

        // Tail first: it only moves towards head, so a stale value is the
        // conservative one.
        let tail = h.tailindex.load(Ordering::Acquire);
        let head = h.headindex.load(Ordering::Acquire);
        let (next, wraps) = self.advance(head, quadlets);

        let room = if wraps {
            // Writing [head, head + quadlets) is safe only while every unread
            // packet lies before head; the new head 0 must stay behind tail.
            tail > 0 && tail <= head
        } else if tail > head {
            next < tail
        } else {
            true
        };
        if !room {
            return false;
        }

        if h.headindex
            .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        if wraps {
            h.headwrap.fetch_add(1, Ordering::AcqRel);
        }

        self.write_packet(head as usize, packet);
        h.received.fetch_add(1, Ordering::Release);
        true
    }

    fn publish_broadcast(&self, packet: &Packet) -> Result<(), RingError> {
        let h = self.header;
        let quadlets = packet.len_words() as u32;
        let head = h.headindex.load(Ordering::Acquire);
        let (next, wraps) = self.advance(head, quadlets);

        // Written and counted before head moves, so a reader that resyncs to
        // head never lands on a slot still being filled.
        self.write_packet(head as usize, packet);
        h.lasttime.store(packet.time(), Ordering::Release);
        h.received.fetch_add(1, Ordering::Release);

        h.headindex
            .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
            .map_err(|_| RingError::WriterConflict)?;
        if wraps {
            h.headwrap.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn write_packet(&self, at: usize, packet: &Packet) {
        let header = packet.header();
        self.words[at + 1].store(header.second_word(), Ordering::Relaxed);
        for (offset, word) in packet.payload().iter().enumerate() {
            self.words[at + HEADER_WORDS + offset].store(*word, Ordering::Relaxed);
        }
        self.words[at].store(header.publish_word().get(), Ordering::Release);
    }

    /// Reads the packet starting at `at`, if its first word is set.
    fn read_packet(&self, at: usize) -> Option<Packet> {
        let first = self.words.get(at)?.load(Ordering::Acquire);
        if first == 0 {
            return None;
        }
        let second = self.words.get(at + 1)?.load(Ordering::Relaxed);
        let header = PacketHeader::from_words(first, second);
        let end = at + header.len_words();
        if end > self.words.len() {
            return None;
        }
        let payload = self.words[at + HEADER_WORDS..end]
            .iter()
            .map(|word| word.load(Ordering::Relaxed))
            .collect();
        Packet::new(header.time, header.chid, header.pkt_type, payload).ok()
    }

    /// Next packet for a private reader of a broadcast ring.
    ///
    /// Returns `None` when the reader has caught up with the writer.
    pub fn try_read_next(&self, cursor: &mut ReaderCursor) -> Option<Packet> {
        if cursor.processed == self.received() {
            return None;
        }
        let packet = self.read_packet(cursor.tailindex as usize)?;

        let (next, wraps) = self.advance(cursor.tailindex, packet.len_words() as u32);
        cursor.tailindex = next;
        if wraps {
            cursor.tailwrap = cursor.tailwrap.wrapping_add(1);
        }
        cursor.processed = cursor.processed.wrapping_add(1);
        cursor.lasttime = packet.time();
        Some(packet)
    }

    /// Reports the reader's backlog, or resyncs it when it has been lapped.
    ///
    /// Lapped means the writer is on a later wrap and within `reserve` words
    /// of the reader's position, or at least two wraps ahead.
    pub fn check_for_data(&self, cursor: &mut ReaderCursor) -> DataStatus {
        let headwrap = self.headwrap();
        let head = self.headindex();

        let lapped = (headwrap != cursor.tailwrap
            && head.saturating_add(self.reserve()) >= cursor.tailindex)
            || headwrap > cursor.tailwrap.saturating_add(1);
        if lapped {
            self.resync_to_head(cursor);
            return DataStatus::DataLost;
        }

        let bufferlen = u64::from(self.bufferlen().max(1));
        let diff = if head >= cursor.tailindex {
            u64::from(head - cursor.tailindex)
        } else {
            bufferlen - u64::from(cursor.tailindex - head)
        };
        DataStatus::Pending {
            packets: self.received().wrapping_sub(cursor.processed),
            concern: LevelOfConcern::from_quarters(diff * 4 / bufferlen),
        }
    }

    /// Moves `cursor` to the writer's head, dropping the unread backlog.
    pub fn resync_to_head(&self, cursor: &mut ReaderCursor) {
        // headwrap before head before received: the writer bumps them in the
        // opposite order.
        cursor.tailwrap = self.headwrap();
        cursor.tailindex = self.headindex();
        cursor.processed = self.received();
        cursor.lasttime = self.lasttime();
    }

    /// Oldest unconsumed packet of a bounded ring, left in place.
    pub fn peek_next(&self) -> Option<Packet> {
        self.read_packet(self.tailindex() as usize)
    }

    /// Removes the oldest packet of a bounded ring. Returns false if empty.
    ///
    /// Only the ring's single consumer may call this.
    pub fn consume_next(&self) -> bool {
        let h = self.header;
        let tail = h.tailindex.load(Ordering::Acquire);
        let (Some(first), Some(second)) = (
            self.words.get(tail as usize),
            self.words.get(tail as usize + 1),
        ) else {
            return false;
        };
        if first.load(Ordering::Acquire) == 0 {
            return false;
        }
        let second = second.load(Ordering::Relaxed);
        let quadlets = PacketHeader::from_words(1, second).len_words();

        let end = (tail as usize + quadlets).min(self.words.len());
        for word in &self.words[tail as usize..end] {
            word.store(0, Ordering::Relaxed);
        }

        let (next, wraps) = self.advance(tail, quadlets as u32);
        if wraps {
            h.tailwrap.fetch_add(1, Ordering::AcqRel);
        }
        h.tailindex.store(next, Ordering::Release);
        h.transmitted.fetch_add(1, Ordering::Release);
        true
    }

    /// [`peek_next`](Self::peek_next) followed by
    /// [`consume_next`](Self::consume_next).
    pub fn take_next(&self) -> Option<Packet> {
        let packet = self.peek_next()?;
        self.consume_next();
        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Arc;

    use proptest::prelude::*;

    use crate::packet::MAX_PAYLOAD_WORDS;

    const SMALL: usize = 1024;

    fn ring<const N: usize>(mode: RingMode) -> Segment<RingRegion<N>> {
        let segment = Segment::<RingRegion<N>>::private();
        segment.ring().initialize(mode, MAX_PACKET_WORDS + 1);
        segment
    }

    fn pkt(time: u32, payload: Vec<u32>) -> Packet {
        Packet::new(time, 1, 0x01, payload).unwrap()
    }

    #[test]
    fn initialize_sets_geometry() {
        let segment = ring::<SMALL>(RingMode::Bounded);
        let ring = segment.ring();
        assert!(ring.is_initialized());
        assert!(ring.wait_for_init(Duration::ZERO));
        assert_eq!(ring.mode(), RingMode::Bounded);
        assert_eq!(ring.bufferlen(), SMALL as u32);
        assert_eq!(ring.last_valid_index(), (SMALL - MAX_PACKET_WORDS - 1) as u32);
    }

    #[test]
    fn uninitialized_ring_times_out() {
        let segment = Segment::<RingRegion<SMALL>>::private();
        assert!(!segment.ring().wait_for_init(Duration::from_millis(5)));
    }

    #[test]
    fn bounded_publish_then_take() {
        let segment = ring::<SMALL>(RingMode::Bounded);
        let ring = segment.ring();
        let a = pkt(10, vec![1, 2, 3]);
        let b = pkt(11, vec![]);

        ring.claim_and_publish(&a).unwrap();
        ring.claim_and_publish(&b).unwrap();
        assert_eq!(ring.received(), 2);
        assert_eq!(ring.headindex(), 7);

        assert_eq!(ring.peek_next(), Some(a.clone()));
        assert_eq!(ring.take_next(), Some(a));
        assert_eq!(ring.take_next(), Some(b));
        assert_eq!(ring.take_next(), None);
        assert_eq!(ring.transmitted(), 2);
        assert_eq!(ring.tailindex(), ring.headindex());
    }

    #[test]
    fn zero_time_is_published_as_one() {
        let segment = ring::<SMALL>(RingMode::Bounded);
        let ring = segment.ring();
        ring.claim_and_publish(&pkt(0, vec![5])).unwrap();
        let read = ring.take_next().unwrap();
        assert_eq!(read.time(), 1);
        assert_eq!(read.payload(), &[5]);
    }

    #[test]
    fn consumed_slots_are_zeroed() {
        let segment = ring::<SMALL>(RingMode::Bounded);
        let ring = segment.ring();
        ring.claim_and_publish(&pkt(3, vec![7, 7])).unwrap();
        assert!(ring.consume_next());
        assert!(!ring.consume_next());
        assert_eq!(ring.peek_next(), None);
        for word in &segment.words[..4] {
            assert_eq!(word.load(Ordering::Relaxed), 0);
        }
    }

    #[test]
    fn bounded_ring_refuses_to_overrun_tail() {
        let segment = ring::<SMALL>(RingMode::Bounded);
        let ring = segment.ring();
        let big = pkt(1, vec![0; 100]);

        let mut published = 0;
        while ring.try_publish(&big).is_ok() {
            published += 1;
            assert!(published < 100, "ring never filled");
        }
        assert_eq!(
            ring.try_publish(&big),
            Err(RingError::ResourceExhausted { attempts: 1 })
        );

        // Freeing the oldest packet makes room again after the wrap.
        assert!(ring.consume_next());
        ring.try_publish(&big).unwrap();
        for _ in 0..published {
            assert_eq!(ring.take_next(), Some(big.clone()));
        }
        assert_eq!(ring.take_next(), None);
    }

    #[test]
    fn claim_and_publish_reports_exhaustion_after_retries() {
        let segment = ring::<SMALL>(RingMode::Bounded);
        let ring = segment.ring();
        let big = pkt(1, vec![0; 200]);
        while ring.try_publish(&big).is_ok() {}

        let start = std::time::Instant::now();
        assert_eq!(
            ring.claim_and_publish(&big),
            Err(RingError::ResourceExhausted {
                attempts: CLAIM_ATTEMPTS
            })
        );
        assert!(start.elapsed() >= CLAIM_BACKOFF * (CLAIM_ATTEMPTS - 1));
    }

    #[test]
    fn broadcast_round_trip() {
        let segment = ring::<SMALL>(RingMode::Broadcast);
        let ring = segment.ring();
        let mut cursor = ReaderCursor::default();

        let sent: Vec<_> = (1..=5).map(|t| pkt(t, vec![t; t as usize])).collect();
        for packet in &sent {
            ring.claim_and_publish(packet).unwrap();
        }
        assert_eq!(ring.lasttime(), 5);

        let got: Vec<_> = std::iter::from_fn(|| ring.try_read_next(&mut cursor)).collect();
        assert_eq!(got, sent);
        assert_eq!(cursor.processed, 5);
        assert_eq!(cursor.lasttime, 5);
        assert_eq!(ring.try_read_next(&mut cursor), None);
    }

    #[test]
    fn independent_readers_see_the_same_sequence() {
        let segment = ring::<SMALL>(RingMode::Broadcast);
        let ring = segment.ring();
        let mut first = ReaderCursor::default();
        let mut second = ReaderCursor::default();

        let mut seen_first = Vec::new();
        let mut seen_second = Vec::new();
        // Enough traffic to wrap several times; both readers keep up.
        for round in 0..40u32 {
            for i in 0..5 {
                let time = round * 10 + i + 1;
                ring.claim_and_publish(&pkt(time, vec![time; (time % 17) as usize]))
                    .unwrap();
            }
            seen_first.extend(std::iter::from_fn(|| ring.try_read_next(&mut first)));
            if round % 2 == 1 {
                seen_second.extend(std::iter::from_fn(|| ring.try_read_next(&mut second)));
            }
        }
        seen_second.extend(std::iter::from_fn(|| ring.try_read_next(&mut second)));

        assert!(ring.headwrap() >= 2);
        assert_eq!(seen_first.len(), 200);
        assert_eq!(seen_first, seen_second);
        assert_eq!(first, second);
    }

    #[test]
    fn lapped_reader_loses_data_and_resyncs() {
        let segment = ring::<SMALL>(RingMode::Broadcast);
        let ring = segment.ring();
        let mut cursor = ReaderCursor::begin_now(ring);

        let mut time = 1;
        while ring.headwrap() < 2 {
            ring.claim_and_publish(&pkt(time, vec![0; 8])).unwrap();
            time += 1;
        }

        assert_eq!(ring.check_for_data(&mut cursor), DataStatus::DataLost);
        assert_eq!(cursor.tailindex, ring.headindex());
        assert_eq!(cursor.tailwrap, ring.headwrap());
        assert_eq!(cursor.processed, ring.received());
        assert_eq!(cursor.lasttime, time - 1);
        assert_eq!(ring.try_read_next(&mut cursor), None);

        ring.claim_and_publish(&pkt(time, vec![1])).unwrap();
        assert_eq!(ring.try_read_next(&mut cursor), Some(pkt(time, vec![1])));
    }

    #[test]
    fn backlog_reports_level_of_concern() {
        let segment = ring::<SMALL>(RingMode::Broadcast);
        let ring = segment.ring();
        let mut cursor = ReaderCursor::default();
        assert_eq!(
            ring.check_for_data(&mut cursor),
            DataStatus::Pending {
                packets: 0,
                concern: LevelOfConcern::Low
            }
        );

        // 10-word packets; 30 of them put head at 300 of 1024.
        for t in 1..=30 {
            ring.claim_and_publish(&pkt(t, vec![0; 8])).unwrap();
        }
        assert_eq!(
            ring.check_for_data(&mut cursor),
            DataStatus::Pending {
                packets: 30,
                concern: LevelOfConcern::Medium
            }
        );
    }

    #[test]
    fn concurrent_producers_never_tear_packets() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 500;

        let segment = Arc::new(ring::<8192>(RingMode::Bounded));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let segment = Arc::clone(&segment);
                thread::spawn(move || {
                    let ring = segment.ring();
                    for seq in 0..PER_PRODUCER {
                        let len = (seq % 40) as usize;
                        let tag = producer << 16 | seq;
                        let packet = pkt(tag + 1, vec![tag; len]);
                        while ring.try_publish(&packet).is_err() {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let ring = segment.ring();
        let mut seen = HashSet::new();
        while seen.len() < (PRODUCERS * PER_PRODUCER) as usize {
            match ring.take_next() {
                Some(packet) => {
                    let tag = packet.time() - 1;
                    assert_eq!(packet.payload().len(), ((tag & 0xFFFF) % 40) as usize);
                    assert!(packet.payload().iter().all(|&w| w == tag), "torn packet");
                    assert!(seen.insert(tag), "duplicate packet {tag:#x}");
                }
                None => thread::yield_now(),
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ring.take_next(), None);
        assert_eq!(ring.transmitted(), PRODUCERS * PER_PRODUCER);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Publish(usize),
        Consume,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0..=MAX_PAYLOAD_WORDS).prop_map(Op::Publish),
            3 => (0..24usize).prop_map(Op::Publish),
            4 => Just(Op::Consume),
        ]
    }

    /// Checks `cursor` and drains everything it reports, comparing against
    /// `published`. Returns true when the reader was lapped.
    fn follow(
        ring: RingChannel<'_>,
        cursor: &mut ReaderCursor,
        next: &mut usize,
        published: &[Packet],
    ) -> Result<bool, TestCaseError> {
        let unread_words: usize = published[*next..].iter().map(Packet::len_words).sum();
        match ring.check_for_data(cursor) {
            DataStatus::DataLost => {
                // Only a reader more than a wrap behind is dropped.
                prop_assert!(unread_words >= SMALL / 4, "lapped with {} unread words", unread_words);
                *next = published.len();
                prop_assert_eq!(ring.try_read_next(cursor), None);
                Ok(true)
            }
            DataStatus::Pending { packets, .. } => {
                prop_assert_eq!(packets as usize, published.len() - *next);
                while let Some(packet) = ring.try_read_next(cursor) {
                    prop_assert!(*next < published.len(), "read past the writer");
                    prop_assert_eq!(&packet, &published[*next]);
                    *next += 1;
                }
                prop_assert_eq!(*next, published.len());
                Ok(false)
            }
        }
    }

    proptest! {
        #[test]
        fn broadcast_readers_follow_or_are_told_they_were_lapped(
            lens in prop::collection::vec(
                prop_oneof![1 => 0..=MAX_PAYLOAD_WORDS, 2 => 0..24usize],
                1..400,
            ),
            pace in 1..60usize,
        ) {
            let segment = ring::<SMALL>(RingMode::Broadcast);
            let ring = segment.ring();
            let mut published = Vec::new();
            let mut fast = ReaderCursor::begin_now(ring);
            let mut slow = ReaderCursor::begin_now(ring);
            let (mut fast_next, mut slow_next) = (0, 0);

            for (seq, len) in lens.into_iter().enumerate() {
                let time = seq as u32 + 1;
                let packet = pkt(time, vec![time; len]);
                ring.claim_and_publish(&packet).unwrap();
                published.push(packet);
                prop_assert!(ring.headindex() <= ring.last_valid_index());

                prop_assert!(!follow(ring, &mut fast, &mut fast_next, &published)?);
                if (seq + 1) % pace == 0 {
                    follow(ring, &mut slow, &mut slow_next, &published)?;
                }
            }
            follow(ring, &mut slow, &mut slow_next, &published)?;

            prop_assert_eq!(fast.processed, ring.received());
            prop_assert_eq!(fast.tailindex, ring.headindex());
            prop_assert_eq!(fast.tailwrap, ring.headwrap());
            // Lapped or not, a drained reader ends where the writer is.
            prop_assert_eq!(slow, fast);
        }

        #[test]
        fn bounded_ring_never_overwrites_unread_packets(ops in prop::collection::vec(op(), 1..300)) {
            let segment = ring::<700>(RingMode::Bounded);
            let ring = segment.ring();
            let mut model = VecDeque::new();
            let mut time = 1u32;

            for op in ops {
                match op {
                    Op::Publish(len) => {
                        let packet = pkt(time, vec![time; len]);
                        time += 1;
                        if ring.try_publish(&packet).is_ok() {
                            model.push_back(packet);
                        } else {
                            // Refused only when unread packets are in the way.
                            prop_assert!(!model.is_empty());
                        }
                    }
                    Op::Consume => {
                        prop_assert_eq!(ring.take_next(), model.pop_front());
                    }
                }
                let head = ring.headindex();
                prop_assert!(head <= ring.last_valid_index());
                if !model.is_empty() {
                    prop_assert_ne!(head, ring.tailindex());
                }
            }
            while let Some(expected) = model.pop_front() {
                prop_assert_eq!(ring.take_next(), Some(expected));
            }
            prop_assert_eq!(ring.take_next(), None);
        }
    }
}
