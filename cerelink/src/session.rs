//! Shared memory of one instrument connection, and the per-process registry
//! of open connections.
//!
//! Every instance `n` owns five named objects:
//!
//! | Object | Contents |
//! |--------|----------|
//! | `/cbRECbuffer{n}` | receive ring, broadcast mode |
//! | `/XmtGlobal{n}` | commands for the instrument, bounded mode |
//! | `/XmtLocal{n}` | packets looped back into the receive path, bounded mode |
//! | `/cbSTATUSbuffer{n}` | [`StatusBlock`] |
//! | `/cbSIGNALevent{n}` | [`SignalBlock`] |
//!
//! The suffix is omitted for instance 0.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::ipc::ring::{DataStatus, ReaderCursor, RingChannel, RingError, RingMode, RingRegion};
use crate::ipc::shmem::{self, Segment, SharedMemorySafe, ShmError, ShmPath};
use crate::ipc::signal::{SignalBlock, StatusBlock, WaitOutcome};
use crate::ipc::RingStore;
use crate::packet::{MAX_DATAGRAM_BYTES, MAX_PACKET_WORDS, Packet};
use crate::trace::{debug, info};

/// Receive ring capacity in words.
pub const REC_BUFFER_WORDS: usize = 1 << 22;

/// Words past `last_valid_index` of the receive ring: one full datagram.
pub const REC_BUFFER_RESERVE: usize = MAX_DATAGRAM_BYTES / 4;

/// Global transmit ring: room for 500 maximum-size packets.
pub const XMT_GLOBAL_WORDS: usize = MAX_PACKET_WORDS * 500;

/// Local loopback ring: room for 200 maximum-size packets.
pub const XMT_LOCAL_WORDS: usize = MAX_PACKET_WORDS * 200;

/// Words past `last_valid_index` of the transmit rings.
pub const XMT_RESERVE: usize = MAX_PACKET_WORDS + 1;

/// How long an opener waits for the creator to finish initialization.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(1);

pub type RecBuffer = RingRegion<REC_BUFFER_WORDS>;
pub type XmtGlobal = RingRegion<XMT_GLOBAL_WORDS>;
pub type XmtLocal = RingRegion<XMT_LOCAL_WORDS>;

/// Errors setting up or finding a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error("instance {0} is already open in this process")]
    AlreadyOpen(u32),
}

/// Names of the shared objects of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNames {
    pub rec: ShmPath,
    pub xmt_global: ShmPath,
    pub xmt_local: ShmPath,
    pub status: ShmPath,
    pub signal: ShmPath,
}

impl SessionNames {
    /// # Errors
    ///
    /// Never fails for the built-in base names; the `Result` comes from
    /// [`ShmPath::new`].
    pub fn for_instance(instance: u32) -> Result<Self, ShmError> {
        Self::with_prefix("", instance)
    }

    /// Names with `prefix` inserted after the leading slash, so tests and
    /// side-by-side installations do not collide.
    ///
    /// # Errors
    ///
    /// [`ShmError::InvalidPath`] if `prefix` contains a slash or makes a
    /// name too long.
    pub fn with_prefix(prefix: &str, instance: u32) -> Result<Self, ShmError> {
        let name = |base: &str| {
            if instance == 0 {
                ShmPath::new(format!("/{prefix}{base}"))
            } else {
                ShmPath::new(format!("/{prefix}{base}{instance}"))
            }
        };
        Ok(Self {
            rec: name("cbRECbuffer")?,
            xmt_global: name("XmtGlobal")?,
            xmt_local: name("XmtLocal")?,
            status: name("cbSTATUSbuffer")?,
            signal: name("cbSIGNALevent")?,
        })
    }

    fn all(&self) -> [&ShmPath; 5] {
        [&self.rec, &self.xmt_global, &self.xmt_local, &self.status, &self.signal]
    }

    /// Removes leftovers of a bridge that died without cleaning up.
    ///
    /// # Errors
    ///
    /// The first failure other than "not found".
    pub fn unlink_all(&self) -> Result<(), ShmError> {
        for path in self.all() {
            shmem::unlink(path)?;
        }
        Ok(())
    }
}

/// Who owns the shared objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// This process created them and runs the dispatcher.
    Standalone,
    /// Another process's bridge owns them.
    Client,
}

/// The rings and blocks of one instance.
pub struct SessionMemory {
    rec: Segment<RecBuffer>,
    xmt_global: Segment<XmtGlobal>,
    xmt_local: Segment<XmtLocal>,
    status: Segment<StatusBlock>,
    signal: Segment<SignalBlock>,
}

impl SessionMemory {
    /// Creates and initializes the named objects.
    ///
    /// # Errors
    ///
    /// [`ShmError`] if any object exists already or cannot be mapped.
    pub fn create(names: &SessionNames) -> Result<Self, SessionError> {
        let memory = Self {
            rec: Segment::create(&names.rec)?,
            xmt_global: Segment::create(&names.xmt_global)?,
            xmt_local: Segment::create(&names.xmt_local)?,
            status: Segment::create(&names.status)?,
            signal: Segment::create(&names.signal)?,
        };
        memory.initialize();
        info!(rec = %names.rec, "session memory created");
        Ok(memory)
    }

    /// Attaches to objects created by another process.
    ///
    /// # Errors
    ///
    /// [`ShmError`] if an object is missing or has the wrong size, or
    /// [`ShmError::InitTimeout`] if a ring never finishes initialization.
    pub fn open(names: &SessionNames) -> Result<Self, SessionError> {
        let memory = Self {
            rec: Segment::open(&names.rec)?,
            xmt_global: Segment::open(&names.xmt_global)?,
            xmt_local: Segment::open(&names.xmt_local)?,
            status: Segment::open(&names.status)?,
            signal: Segment::open(&names.signal)?,
        };
        wait_ready(&memory.rec, &names.rec)?;
        wait_ready(&memory.xmt_global, &names.xmt_global)?;
        wait_ready(&memory.xmt_local, &names.xmt_local)?;
        debug!(rec = %names.rec, "session memory attached");
        Ok(memory)
    }

    /// Process-local memory, for an embedded bridge and for tests.
    pub fn private() -> Self {
        let memory = Self {
            rec: Segment::private(),
            xmt_global: Segment::private(),
            xmt_local: Segment::private(),
            status: Segment::private(),
            signal: Segment::private(),
        };
        memory.initialize();
        memory
    }

    fn initialize(&self) {
        self.rec.ring().initialize(RingMode::Broadcast, REC_BUFFER_RESERVE);
        self.xmt_global.ring().initialize(RingMode::Bounded, XMT_RESERVE);
        self.xmt_local.ring().initialize(RingMode::Bounded, XMT_RESERVE);
    }

    /// True when this handle created the objects.
    pub fn is_owner(&self) -> bool {
        self.rec.is_owner()
    }

    /// Receive ring.
    pub fn rec(&self) -> RingChannel<'_> {
        self.rec.ring()
    }

    /// Ring drained to the instrument.
    pub fn xmt_global(&self) -> RingChannel<'_> {
        self.xmt_global.ring()
    }

    /// Ring looped back into the receive path.
    pub fn xmt_local(&self) -> RingChannel<'_> {
        self.xmt_local.ring()
    }

    pub fn status(&self) -> &StatusBlock {
        &self.status
    }

    pub fn signal(&self) -> &SignalBlock {
        &self.signal
    }

    /// Queues `packet` for the instrument, stamped with the newest receive
    /// time.
    ///
    /// # Errors
    ///
    /// [`RingError::ResourceExhausted`] if the ring stays full.
    pub fn send_packet(&self, packet: &Packet) -> Result<(), RingError> {
        let mut packet = packet.clone();
        packet.set_time(self.rec().lasttime());
        self.xmt_global().claim_and_publish(&packet)
    }

    /// Queues `packet` to reappear on the receive ring without touching the
    /// wire.
    ///
    /// # Errors
    ///
    /// [`RingError::ResourceExhausted`] if the ring stays full.
    pub fn send_loopback_packet(&self, packet: &Packet) -> Result<(), RingError> {
        self.xmt_local().claim_and_publish(packet)
    }

    /// A reader positioned at the current end of the receive ring.
    pub fn reader(&self) -> ReaderCursor {
        ReaderCursor::begin_now(self.rec())
    }

    pub fn read_next(&self, cursor: &mut ReaderCursor) -> Option<Packet> {
        self.rec().try_read_next(cursor)
    }

    pub fn check_for_data(&self, cursor: &mut ReaderCursor) -> DataStatus {
        self.rec().check_for_data(cursor)
    }

    /// Blocks until the dispatcher signals new data or `timeout` passes.
    pub fn wait_for_data(&self, last_seen: u32, timeout: Duration) -> WaitOutcome {
        self.signal.wait_for_data(last_seen, timeout)
    }
}

fn wait_ready<T>(segment: &Segment<T>, path: &ShmPath) -> Result<(), ShmError>
where
    T: SharedMemorySafe,
    Segment<T>: RingStore,
{
    if segment.ring().wait_for_init(INIT_TIMEOUT) {
        Ok(())
    } else {
        Err(ShmError::InitTimeout {
            path: path.to_string(),
        })
    }
}

/// Opaque id of a session in a [`SessionRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u32);

/// One connection as seen by this process.
pub struct InstrumentSession {
    instance: u32,
    role: SessionRole,
    memory: Arc<SessionMemory>,
    cursor: ReaderCursor,
}

impl InstrumentSession {
    pub fn new(instance: u32, role: SessionRole, memory: Arc<SessionMemory>) -> Self {
        let cursor = memory.reader();
        Self {
            instance,
            role,
            memory,
            cursor,
        }
    }

    /// Attaches as a client when the objects exist, otherwise creates them.
    ///
    /// # Errors
    ///
    /// [`SessionError::Shm`] when neither works.
    pub fn open(instance: u32, names: &SessionNames) -> Result<Self, SessionError> {
        match SessionMemory::open(names) {
            Ok(memory) => Ok(Self::new(instance, SessionRole::Client, Arc::new(memory))),
            Err(SessionError::Shm(e)) if e.is_not_found() => {
                let memory = SessionMemory::create(names)?;
                Ok(Self::new(instance, SessionRole::Standalone, Arc::new(memory)))
            }
            Err(e) => Err(e),
        }
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn memory(&self) -> &Arc<SessionMemory> {
        &self.memory
    }

    /// # Errors
    ///
    /// See [`SessionMemory::send_packet`].
    pub fn send_packet(&self, packet: &Packet) -> Result<(), RingError> {
        self.memory.send_packet(packet)
    }

    /// Next packet for this session's reader.
    pub fn read_next(&mut self) -> Option<Packet> {
        self.memory.read_next(&mut self.cursor)
    }

    pub fn check_for_data(&mut self) -> DataStatus {
        self.memory.check_for_data(&mut self.cursor)
    }

    /// Skips everything not yet read.
    pub fn begin_now(&mut self) {
        self.cursor = self.memory.reader();
    }
}

/// Open sessions of this process, keyed by handle.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionHandle, InstrumentSession>,
    next: u32,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `instance` under its standard names.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyOpen`] if this registry holds the instance,
    /// otherwise see [`InstrumentSession::open`].
    pub fn open(&mut self, instance: u32) -> Result<SessionHandle, SessionError> {
        let names = SessionNames::for_instance(instance)?;
        self.open_named(instance, &names)
    }

    /// Opens `instance` under explicit names.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_named(&mut self, instance: u32, names: &SessionNames) -> Result<SessionHandle, SessionError> {
        if self.sessions.values().any(|s| s.instance == instance) {
            return Err(SessionError::AlreadyOpen(instance));
        }
        let session = InstrumentSession::open(instance, names)?;
        Ok(self.insert(session))
    }

    /// Takes ownership of an already built session.
    pub fn insert(&mut self, session: InstrumentSession) -> SessionHandle {
        let handle = SessionHandle(self.next);
        self.next = self.next.wrapping_add(1);
        self.sessions.insert(handle, session);
        handle
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&InstrumentSession> {
        self.sessions.get(&handle)
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut InstrumentSession> {
        self.sessions.get_mut(&handle)
    }

    /// Removes the session; its shared objects are released when the last
    /// reference to its memory goes away.
    pub fn close(&mut self, handle: SessionHandle) -> Option<InstrumentSession> {
        self.sessions.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::packet_type;

    fn unique_prefix(tag: &str) -> String {
        format!("cerelink-test-{tag}-{}-", std::process::id())
    }

    #[test]
    fn names_carry_instance_suffix_after_zero() {
        let zero = SessionNames::for_instance(0).unwrap();
        assert_eq!(zero.rec.as_str(), "/cbRECbuffer");
        assert_eq!(zero.signal.as_str(), "/cbSIGNALevent");
        let two = SessionNames::for_instance(2).unwrap();
        assert_eq!(two.xmt_global.as_str(), "/XmtGlobal2");
        assert_eq!(two.status.as_str(), "/cbSTATUSbuffer2");
        assert!(SessionNames::with_prefix("bad/prefix", 0).is_err());
    }

    #[test]
    fn private_memory_is_ready_to_use() {
        let memory = SessionMemory::private();
        assert!(memory.is_owner());
        assert_eq!(memory.rec().mode(), RingMode::Broadcast);
        assert_eq!(memory.xmt_global().mode(), RingMode::Bounded);
        assert_eq!(
            memory.rec().last_valid_index() as usize,
            REC_BUFFER_WORDS - REC_BUFFER_RESERVE
        );
    }

    #[test]
    fn sent_packets_take_the_latest_receive_time() {
        let memory = SessionMemory::private();
        memory
            .rec()
            .claim_and_publish(&Packet::new(777, 1, 0, vec![]).unwrap())
            .unwrap();

        memory
            .send_packet(&Packet::new(5, 0x8000, packet_type::REQCONFIGALL, vec![]).unwrap())
            .unwrap();
        assert_eq!(memory.xmt_global().take_next().unwrap().time(), 777);

        // Before anything was received the stamp is 0, published as 1.
        let fresh = SessionMemory::private();
        fresh.send_packet(&Packet::request_config_all()).unwrap();
        assert_eq!(fresh.xmt_global().take_next().unwrap().time(), 1);
    }

    #[test]
    fn session_reader_starts_at_current_head() {
        let memory = Arc::new(SessionMemory::private());
        memory
            .rec()
            .claim_and_publish(&Packet::new(1, 1, 0, vec![1]).unwrap())
            .unwrap();

        let mut session = InstrumentSession::new(0, SessionRole::Standalone, Arc::clone(&memory));
        assert_eq!(session.read_next(), None);

        memory
            .rec()
            .claim_and_publish(&Packet::new(2, 1, 0, vec![2]).unwrap())
            .unwrap();
        assert_eq!(session.read_next().unwrap().time(), 2);
        assert_eq!(
            session.check_for_data(),
            DataStatus::Pending {
                packets: 0,
                concern: crate::ipc::LevelOfConcern::Low
            }
        );
    }

    #[test]
    fn second_open_attaches_as_client() {
        let names = SessionNames::with_prefix(&unique_prefix("attach"), 0).unwrap();
        let _ = names.unlink_all();

        let owner = match InstrumentSession::open(0, &names) {
            Ok(session) => session,
            Err(SessionError::Shm(e)) if e.is_access_denied() => {
                eprintln!("skipping: shared memory not permitted");
                return;
            }
            Err(e) => panic!("open failed: {e}"),
        };
        assert_eq!(owner.role(), SessionRole::Standalone);

        let client = InstrumentSession::open(0, &names).unwrap();
        assert_eq!(client.role(), SessionRole::Client);
        assert!(!client.memory().is_owner());

        client
            .send_packet(&Packet::request_config_all())
            .unwrap();
        let queued = owner.memory().xmt_global().take_next().unwrap();
        assert_eq!(queued.pkt_type(), packet_type::REQCONFIGALL);

        drop(client);
        drop(owner);
        assert!(matches!(
            SessionMemory::open(&names),
            Err(SessionError::Shm(e)) if e.is_not_found()
        ));
    }

    #[test]
    fn registry_tracks_sessions_by_handle() {
        let mut registry = SessionRegistry::new();
        let a = registry.insert(InstrumentSession::new(
            0,
            SessionRole::Standalone,
            Arc::new(SessionMemory::private()),
        ));
        let b = registry.insert(InstrumentSession::new(
            1,
            SessionRole::Standalone,
            Arc::new(SessionMemory::private()),
        ));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(b).unwrap().instance(), 1);

        let names = SessionNames::with_prefix(&unique_prefix("dup"), 0).unwrap();
        assert!(matches!(
            registry.open_named(0, &names),
            Err(SessionError::AlreadyOpen(0))
        ));

        assert!(registry.close(a).is_some());
        assert!(registry.get(a).is_none());
        assert!(registry.close(a).is_none());
        assert_eq!(registry.len(), 1);
    }
}
