//! Events and packets delivered to the owning application.

use std::fmt;
use std::sync::Arc;

use crate::mirror::{InstInfo, MirrorEvent};
use crate::packet::Packet;
use crate::trace::debug;

/// Connection milestones and failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// Bridge start-up began.
    Init,
    /// No listener was registered.
    ListenerErr,
    /// Shared memory could not be set up.
    CbErr(String),
    /// The instrument transport could not be opened.
    NetOpenErr(String),
    /// Attached to another process's bridge.
    NetClient,
    /// This process owns the bridge.
    NetStandalone,
    /// Instrument info changed.
    InstInfo(InstInfo),
    /// Bring-up: asked the instrument to run.
    InstConnecting,
    /// Bring-up: instrument was not running, hard reset requested.
    InstHardReset,
    /// Bring-up: configuration requested.
    InstConfig,
    /// Bring-up: finished.
    InstRun,
    /// A command was never answered.
    PcToNspLost,
    /// No packets arrived during a heartbeat interval.
    LinkFailure,
    /// A reader fell far behind and skipped ahead.
    Critical,
    /// The bridge loop ended.
    Close,
    /// Someone hard-reset the instrument.
    Reset,
    /// Instrument restarted with recording locked.
    LockedReset,
}

impl From<MirrorEvent> for NetEvent {
    fn from(event: MirrorEvent) -> Self {
        match event {
            MirrorEvent::InstInfo(info) => Self::InstInfo(info),
            MirrorEvent::Reset => Self::Reset,
            MirrorEvent::LockedReset => Self::LockedReset,
        }
    }
}

impl fmt::Display for NetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CbErr(reason) => write!(f, "shared memory error: {reason}"),
            Self::NetOpenErr(reason) => write!(f, "cannot open instrument link: {reason}"),
            Self::InstInfo(info) => write!(f, "instrument info {:#06x}", info.bits()),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Receiver of bridge output.
///
/// Called from the bridge thread; implementations must not block.
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &NetEvent);

    /// Every inbound packet, after it has been published to the receive
    /// ring.
    fn on_packet(&self, _packet: &Packet) {}
}

/// Registered listeners.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Vec<Arc<dyn Listener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn Listener>) {
        self.inner.push(listener);
    }

    /// Removes `listener`, compared by identity.
    pub fn remove(&mut self, listener: &Arc<dyn Listener>) {
        self.inner.retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn emit(&self, event: &NetEvent) {
        debug!(%event, "event");
        for listener in &self.inner {
            listener.on_event(event);
        }
    }

    pub fn deliver(&self, packet: &Packet) {
        for listener in &self.inner {
            listener.on_packet(packet);
        }
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.inner.len())
            .finish()
    }
}
