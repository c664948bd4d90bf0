//! The bridge loops.
//!
//! [`NetworkDispatcher`] runs in the process that owns the instrument link.
//! Every tick it:
//!
//! 1. walks the bring-up sequence during the first five seconds,
//! 2. ages pending commands ([`InstrumentLink::tick`]),
//! 3. checks the heartbeat every 250 ticks,
//! 4. moves up to 1024 datagrams from the wire (or the loopback ring) into
//!    the receive ring, updating the [`ConfigMirror`] and the listeners,
//! 5. drains up to 4 queued commands to the wire,
//! 6. wakes client processes.
//!
//! [`ClientMonitor`] runs instead when another process owns the link: it
//! follows the receive ring and reports what it reads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use minstant::Instant;

use crate::event::{Listeners, NetEvent};
use crate::ipc::{DataStatus, LevelOfConcern, ReaderCursor, WaitOutcome};
use crate::link::InstrumentLink;
use crate::mirror::{ConfigMirror, InstInfo};
use crate::net::{Wire, WireTransport};
use crate::packet::{MAX_DATAGRAM_BYTES, Packet, packets, runflags, runlevel};
use crate::session::SessionMemory;
use crate::trace::{debug, info, warn};

/// Bring-up: ask the instrument to run.
const CONNECT_TICK: u32 = 1;
/// Bring-up: hard-reset unless already running.
const HARDRESET_TICK: u32 = 50;
/// Bring-up: request the whole configuration.
const CONFIG_TICK: u32 = 100;
/// Bring-up: soft-reset into running unless already running.
const RUN_TICK: u32 = 200;

/// How long a client waits for the dispatcher's signal.
pub const CLIENT_WAIT: Duration = Duration::from_millis(250);

/// Consecutive silent waits after which a client polls anyway.
const MISSED_SIGNAL_LIMIT: u32 = 25;

/// Timing and limits of the bridge loops.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Period of one tick.
    pub tick_period: Duration,
    /// Ticks during which the bring-up sequence runs.
    pub bringup_ticks: u32,
    /// Ticks between heartbeat checks.
    pub heartbeat_interval: u32,
    /// Receives per tick.
    pub burst_limit: usize,
    /// Commands sent per tick.
    pub drain_limit: usize,
    /// Packets a client processes per wake-up.
    pub client_batch: u32,
    /// Use the high-latency reliability timing.
    pub high_latency: bool,
    /// Raise [`NetEvent::LinkFailure`] when heartbeats stop.
    pub check_heartbeat: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(10),
            bringup_ticks: 500,
            heartbeat_interval: 250,
            burst_limit: 1024,
            drain_limit: 4,
            client_batch: 5000,
            high_latency: false,
            check_heartbeat: true,
        }
    }
}

/// Tick loop of the process that owns the instrument link.
pub struct NetworkDispatcher<W: Wire = WireTransport> {
    config: DispatcherConfig,
    link: InstrumentLink<W>,
    memory: Arc<SessionMemory>,
    mirror: ConfigMirror,
    listeners: Listeners,
    buf: Vec<u8>,
    ticks: u32,
    recent: u32,
    last_received: u32,
    bringup_runlevel: u32,
    done: bool,
}

impl<W: Wire> NetworkDispatcher<W> {
    pub fn new(
        config: DispatcherConfig,
        link: InstrumentLink<W>,
        memory: Arc<SessionMemory>,
        listeners: Listeners,
    ) -> Self {
        Self {
            config,
            link,
            memory,
            mirror: ConfigMirror::new(true),
            listeners,
            buf: vec![0; MAX_DATAGRAM_BYTES],
            ticks: 0,
            recent: 0,
            last_received: 0,
            bringup_runlevel: runlevel::SHUTDOWN,
            done: false,
        }
    }

    /// Ticks until `shutdown` is set or the link is lost, then emits
    /// [`NetEvent::Close`].
    pub fn run(&mut self, shutdown: &AtomicBool) {
        let period = self.config.tick_period;
        let mut deadline = Instant::now();
        while !self.done && !shutdown.load(Ordering::Relaxed) {
            self.tick();

            deadline = deadline + period;
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline.duration_since(now));
            } else {
                // Overran; do not try to catch up with a burst of ticks.
                deadline = now;
            }
        }
        info!(ticks = self.ticks, "dispatcher stopped");
        self.listeners.emit(&NetEvent::Close);
    }

    /// One pass of the loop.
    pub fn tick(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);
        if self.done {
            return;
        }

        if self.ticks < self.config.bringup_ticks {
            self.bring_up();
        }

        if self.link.tick() {
            self.listeners.emit(&NetEvent::PcToNspLost);
            self.done = true;
        }

        if self.config.check_heartbeat && !self.mirror.inst_info().contains(InstInfo::NPLAY) {
            self.check_heartbeat();
        }

        self.receive_burst();
        self.drain_commands();

        self.memory.signal().notify();
        let status = self.memory.status();
        status.set_ticks(self.ticks);
        status.set_inst_info(self.mirror.inst_info().bits());
        status.set_runlevel(self.mirror.runlevel().unwrap_or(0));
    }

    fn bring_up(&mut self) {
        match self.ticks {
            CONNECT_TICK => {
                info!("connecting to instrument");
                self.listeners.emit(&NetEvent::InstConnecting);
                self.queue(Packet::set_runlevel(runlevel::RUNNING, 0, runflags::NONE));
            }
            HARDRESET_TICK => {
                self.bringup_runlevel = self.mirror.runlevel().unwrap_or(runlevel::SHUTDOWN);
                if self.bringup_runlevel != runlevel::RUNNING {
                    info!(runlevel = self.bringup_runlevel, "instrument not running, hard reset");
                    self.listeners.emit(&NetEvent::InstHardReset);
                    self.queue(Packet::set_runlevel(runlevel::HARDRESET, 0, runflags::NONE));
                }
            }
            CONFIG_TICK => {
                info!("requesting configuration");
                self.listeners.emit(&NetEvent::InstConfig);
                self.queue(Packet::request_config_all());
            }
            RUN_TICK => {
                info!("bring-up finished");
                self.listeners.emit(&NetEvent::InstRun);
                if self.bringup_runlevel != runlevel::RUNNING {
                    self.queue(Packet::set_runlevel(runlevel::RESET, 0, runflags::NONE));
                }
            }
            _ => {}
        }
    }

    fn queue(&self, packet: Packet) {
        if let Err(_err) = self.memory.send_packet(&packet) {
            warn!(error = %_err, pkt_type = packet.pkt_type(), "command not queued");
        }
    }

    fn check_heartbeat(&mut self) {
        if self.ticks.checked_rem(self.config.heartbeat_interval) != Some(0) {
            return;
        }
        let received = self.memory.rec().received();
        if received != self.last_received {
            self.last_received = received;
        } else {
            warn!(ticks = self.ticks, "no packets since last heartbeat check");
            self.listeners.emit(&NetEvent::LinkFailure);
        }
    }

    fn receive_burst(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        for _ in 0..self.config.burst_limit {
            let len = match self.link.recv(&mut buf) {
                Ok(len) => len,
                Err(_err) => {
                    warn!(error = %_err, "receive failed");
                    0
                }
            };
            if len > 0 {
                self.process_datagram(&buf[..len]);
                continue;
            }

            let Some(mut packet) = self.link.recv_loopback(self.memory.xmt_local()) else {
                break;
            };
            // Keep looped-back packets in time order with the wire.
            packet.set_time(self.memory.rec().lasttime());
            self.accept(&packet);
        }
        self.buf = buf;
    }

    fn process_datagram(&mut self, datagram: &[u8]) {
        for item in packets(datagram) {
            match item {
                Ok(packet) => {
                    self.recent = self.recent.wrapping_add(1);
                    self.link.check_for_reply(&packet);
                    self.accept(&packet);
                }
                Err(_err) => {
                    warn!(error = %_err, len = datagram.len(), "dropping rest of datagram");
                    break;
                }
            }
        }
    }

    fn accept(&mut self, packet: &Packet) {
        if let Err(_err) = self.memory.rec().claim_and_publish(packet) {
            warn!(error = %_err, "packet not published");
        }
        if let Some(event) = self.mirror.process(packet, self.link.is_loopback()) {
            self.listeners.emit(&event.into());
        }
        self.listeners.deliver(packet);
    }

    fn drain_commands(&mut self) {
        let xmt = self.memory.xmt_global();
        for _ in 0..self.config.drain_limit {
            let Some(packet) = xmt.peek_next() else {
                break;
            };
            // The budget is spent even when the pool is full.
            if !self.link.ok_to_send() {
                continue;
            }
            if let Err(_err) = self.link.send(&packet) {
                warn!(error = %_err, pkt_type = packet.pkt_type(), "command send failed");
            }
            xmt.consume_next();
        }
    }

    /// True once the link has been lost.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Packets received from the wire, loopback excluded.
    pub fn recent_packets(&self) -> u32 {
        self.recent
    }

    pub fn mirror(&self) -> &ConfigMirror {
        &self.mirror
    }

    pub fn link(&self) -> &InstrumentLink<W> {
        &self.link
    }

    pub fn memory(&self) -> &Arc<SessionMemory> {
        &self.memory
    }

    /// Gives back the link, for a clean close.
    pub fn into_link(self) -> InstrumentLink<W> {
        self.link
    }
}

/// Follows the receive ring of a bridge owned by another process.
pub struct ClientMonitor {
    memory: Arc<SessionMemory>,
    mirror: ConfigMirror,
    listeners: Listeners,
    cursor: ReaderCursor,
    batch: u32,
}

impl ClientMonitor {
    /// A monitor that starts reading at the ring's current head.
    pub fn new(memory: Arc<SessionMemory>, listeners: Listeners, config: &DispatcherConfig) -> Self {
        let cursor = memory.reader();
        Self {
            memory,
            mirror: ConfigMirror::new(false),
            listeners,
            cursor,
            batch: config.client_batch,
        }
    }

    /// Waits for the owner's signal and polls until `shutdown` is set, then
    /// emits [`NetEvent::Close`].
    pub fn run(&mut self, shutdown: &AtomicBool) {
        let mut seen = self.memory.signal().sequence();
        let mut waiting = true;
        let mut missed = 0;
        while !shutdown.load(Ordering::Relaxed) {
            match self.memory.wait_for_data(seen, CLIENT_WAIT) {
                WaitOutcome::Signalled(sequence) => {
                    seen = sequence;
                    missed = 0;
                    waiting = true;
                    self.poll();
                }
                WaitOutcome::TimedOut if !waiting => {
                    missed = 0;
                    waiting = true;
                    self.poll();
                }
                WaitOutcome::TimedOut => {
                    missed += 1;
                    if missed > MISSED_SIGNAL_LIMIT {
                        debug!("owner silent, polling without signal");
                        waiting = false;
                    }
                }
            }
        }
        self.listeners.emit(&NetEvent::Close);
    }

    /// Processes what is pending. Returns the number of packets handled.
    pub fn poll(&mut self) -> u32 {
        let pending = match self.memory.check_for_data(&mut self.cursor) {
            DataStatus::Pending {
                concern: LevelOfConcern::Critical,
                ..
            }
            | DataStatus::DataLost => {
                self.catch_up();
                return 0;
            }
            DataStatus::Pending { packets, .. } => packets.min(self.batch),
        };

        let local = InstInfo::from_bits(self.memory.status().inst_info()).contains(InstInfo::LOCAL);
        for handled in 0..pending {
            let Some(packet) = self.memory.read_next(&mut self.cursor) else {
                self.catch_up();
                return handled;
            };
            if let Some(event) = self.mirror.process(&packet, local) {
                self.listeners.emit(&event.into());
            }
            self.listeners.deliver(&packet);
        }
        pending
    }

    fn catch_up(&mut self) {
        warn!("client fell behind, skipping to newest data");
        self.memory.rec().resync_to_head(&mut self.cursor);
        self.listeners.emit(&NetEvent::Critical);
    }

    pub fn mirror(&self) -> &ConfigMirror {
        &self.mirror
    }
}
