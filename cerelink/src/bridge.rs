//! Runs a bridge on its own thread.
//!
//! [`Bridge::spawn`] decides the role of this process. If another process
//! already owns the shared memory of the instance, it attaches as a client
//! and follows the receive ring. Otherwise it creates the memory, opens the
//! instrument link and runs the [`NetworkDispatcher`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use cerelink::bridge::{Bridge, BridgeConfig};
//! use cerelink::event::{Listener, Listeners, NetEvent};
//!
//! struct Print;
//! impl Listener for Print {
//!     fn on_event(&self, event: &NetEvent) {
//!         eprintln!("{event}");
//!     }
//! }
//!
//! let mut listeners = Listeners::new();
//! listeners.add(Arc::new(Print));
//! let bridge = Bridge::spawn(BridgeConfig::default(), listeners)?;
//! // ...
//! bridge.shutdown();
//! # Ok::<(), cerelink::bridge::BridgeError>(())
//! ```

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::dispatcher::{ClientMonitor, DispatcherConfig, NetworkDispatcher};
use crate::event::{Listeners, NetEvent};
use crate::link::{InstrumentLink, LinkError};
use crate::mirror::InstInfo;
use crate::net::{StartupOption, TransportConfig};
use crate::reliable::ReliabilityConfig;
use crate::session::{InstrumentSession, SessionError, SessionMemory, SessionNames, SessionRole};
use crate::trace::{debug, error, info};

/// Where the session memory lives.
#[derive(Debug, Clone, Default)]
pub enum MemorySource {
    /// The standard names of the configured instance.
    #[default]
    Instance,
    /// Explicit names.
    Named(SessionNames),
    /// Process memory; nothing outside this process can attach.
    Private,
}

/// Configuration of a bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Instrument connection index.
    pub instance: u32,
    pub memory: MemorySource,
    pub transport: TransportConfig,
    /// Timing used unless the instrument needs the high-latency preset.
    pub reliability: ReliabilityConfig,
    pub dispatcher: DispatcherConfig,
}

impl BridgeConfig {
    /// Defaults for instance `instance`, including its instrument address.
    pub fn for_instance(instance: u32) -> Self {
        Self {
            instance,
            memory: MemorySource::Instance,
            transport: TransportConfig::for_instance(instance),
            reliability: ReliabilityConfig::standard(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::for_instance(0)
    }
}

/// Errors starting a bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no listener registered")]
    NoListener,
    #[error("shared memory setup failed: {0}")]
    Session(#[from] SessionError),
    #[error("instrument link failed: {0}")]
    Link(#[from] LinkError),
    #[error("failed to spawn bridge thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Handle to a running bridge.
///
/// Dropping the handle signals shutdown without waiting. Use
/// [`Bridge::shutdown`] to wait for the thread.
pub struct Bridge {
    shutdown_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    role: SessionRole,
    memory: Arc<SessionMemory>,
}

impl Bridge {
    /// Sets up memory and, when standalone, the instrument link, then starts
    /// the bridge thread.
    ///
    /// Every outcome is also reported to `listeners`.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::NoListener`] if `listeners` is empty
    /// - [`BridgeError::Session`] if shared memory cannot be opened or created
    /// - [`BridgeError::Link`] if the transport cannot be opened
    /// - [`BridgeError::Spawn`] if the thread cannot be started
    pub fn spawn(config: BridgeConfig, listeners: Listeners) -> Result<Self, BridgeError> {
        info!(instance = config.instance, "bridge starting");
        listeners.emit(&NetEvent::Init);
        if listeners.is_empty() {
            error!("no listener registered");
            listeners.emit(&NetEvent::ListenerErr);
            return Err(BridgeError::NoListener);
        }

        let (role, memory) = match open_memory(&config) {
            Ok(opened) => opened,
            Err(err) => {
                listeners.emit(&NetEvent::CbErr(err.to_string()));
                return Err(err.into());
            }
        };

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown_flag);
        let handle = match role {
            SessionRole::Client => {
                listeners.emit(&NetEvent::NetClient);
                listeners.emit(&NetEvent::InstInfo(InstInfo::from_bits(
                    memory.status().inst_info(),
                )));
                let mut monitor =
                    ClientMonitor::new(Arc::clone(&memory), listeners, &config.dispatcher);
                thread::Builder::new()
                    .name("cerelink-client".into())
                    .spawn(move || {
                        info!("client monitor started");
                        monitor.run(&flag);
                        info!("client monitor exiting");
                    })
                    .map_err(BridgeError::Spawn)?
            }
            SessionRole::Standalone => {
                listeners.emit(&NetEvent::NetStandalone);
                let link = match open_link(&config, &memory) {
                    Ok(link) => link,
                    Err(err) => {
                        listeners.emit(&NetEvent::NetOpenErr(err.to_string()));
                        return Err(err.into());
                    }
                };
                let mut dispatcher = NetworkDispatcher::new(
                    config.dispatcher.clone(),
                    link,
                    Arc::clone(&memory),
                    listeners,
                );
                thread::Builder::new()
                    .name("cerelink-net".into())
                    .spawn(move || {
                        info!("dispatcher started");
                        dispatcher.run(&flag);
                        drop(dispatcher.into_link().close());
                        info!("dispatcher exiting");
                    })
                    .map_err(BridgeError::Spawn)?
            }
        };

        Ok(Self {
            shutdown_flag,
            handle: Some(handle),
            role,
            memory,
        })
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Shared memory of the session, for queueing commands and reading.
    pub fn memory(&self) -> &Arc<SessionMemory> {
        &self.memory
    }

    /// True once the bridge thread has returned, e.g. after the link was
    /// lost.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stops the bridge thread and waits for it.
    pub fn shutdown(mut self) {
        info!("bridge shutdown initiated");
        self.shutdown_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            debug!("waiting for bridge thread to exit");
            let _ = handle.join();
        }
        info!("bridge shutdown complete");
    }

    /// Flag the bridge thread polls, for external signal handling.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }
}

fn open_memory(config: &BridgeConfig) -> Result<(SessionRole, Arc<SessionMemory>), SessionError> {
    let names = match &config.memory {
        MemorySource::Private => {
            return Ok((SessionRole::Standalone, Arc::new(SessionMemory::private())));
        }
        MemorySource::Named(names) => names.clone(),
        MemorySource::Instance => SessionNames::for_instance(config.instance)?,
    };
    let session = InstrumentSession::open(config.instance, &names)?;
    Ok((session.role(), Arc::clone(session.memory())))
}

fn open_link(config: &BridgeConfig, memory: &SessionMemory) -> Result<InstrumentLink, LinkError> {
    // A previous run may have found the instrument on this host or slow to
    // answer.
    let inst_info = InstInfo::from_bits(memory.status().inst_info());
    let mut transport = config.transport.clone();
    if inst_info.contains(InstInfo::LOCAL) {
        transport.startup = StartupOption::Local;
    }
    let reliability = if config.dispatcher.high_latency || inst_info.is_high_latency() {
        ReliabilityConfig::high_latency()
    } else {
        config.reliability
    };
    debug!(?reliability, startup = ?transport.startup, "opening instrument link");
    InstrumentLink::open(&transport, reliability)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::event::tests::Recorder;
    use crate::packet::Packet;

    fn loopback_config() -> BridgeConfig {
        let mut config = BridgeConfig {
            memory: MemorySource::Private,
            ..BridgeConfig::default()
        };
        config.transport = TransportConfig::loopback(0, 9);
        config
    }

    fn recording() -> (Listeners, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut listeners = Listeners::new();
        listeners.add(recorder.clone());
        (listeners, recorder)
    }

    #[test]
    fn refuses_to_start_without_listeners() {
        let err = Bridge::spawn(loopback_config(), Listeners::new()).err().unwrap();
        assert!(matches!(err, BridgeError::NoListener));
    }

    #[test]
    fn standalone_bridge_runs_until_shutdown() {
        let (listeners, recorder) = recording();
        let bridge = Bridge::spawn(loopback_config(), listeners).unwrap();
        assert_eq!(bridge.role(), SessionRole::Standalone);
        assert!(bridge.memory().is_owner());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while bridge.memory().status().ticks() < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(bridge.memory().status().ticks() >= 3);
        assert!(!bridge.is_finished());
        bridge.shutdown();

        let events = recorder.events();
        assert_eq!(events[..3], [NetEvent::Init, NetEvent::NetStandalone, NetEvent::InstConnecting]);
        assert_eq!(events.last(), Some(&NetEvent::Close));
    }

    #[test]
    fn bad_transport_is_reported() {
        let (listeners, recorder) = recording();
        let mut config = loopback_config();
        config.transport.in_addr = std::net::Ipv4Addr::new(203, 0, 113, 7);
        config.transport.startup = StartupOption::None;
        config.transport.range = 1;

        let err = Bridge::spawn(config, listeners).err().unwrap();
        assert!(matches!(err, BridgeError::Link(_)));
        assert!(matches!(recorder.events().last(), Some(NetEvent::NetOpenErr(_))));
    }

    #[test]
    fn queued_commands_reach_the_wire() {
        let instrument = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        instrument
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut config = loopback_config();
        config.transport = TransportConfig::loopback(0, instrument.local_addr().unwrap().port());
        config.dispatcher.bringup_ticks = 0;

        let (listeners, _recorder) = recording();
        let bridge = Bridge::spawn(config, listeners).unwrap();
        bridge
            .memory()
            .send_packet(&Packet::request_config_all())
            .unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = instrument.recv_from(&mut buf).unwrap();
        let (packet, _) = Packet::decode(&buf[..len]).unwrap();
        assert_eq!(packet, Packet::request_config_all());
        bridge.shutdown();
    }
}
