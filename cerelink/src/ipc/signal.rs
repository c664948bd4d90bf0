//! Cross-process "new data" signal and instrument status block.
//!
//! The dispatcher bumps [`SignalBlock`]'s sequence once per tick after it has
//! published that tick's packets. Readers remember the last sequence they saw
//! and wait for it to change.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use super::shmem::SharedMemorySafe;

/// Iterations spent spinning before [`SignalBlock::wait_for_data`] sleeps.
const SPIN_LIMIT: u32 = 64;

/// Sleep between polls once spinning gave up.
const POLL_INTERVAL: Duration = Duration::from_micros(500);

/// Outcome of [`SignalBlock::wait_for_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The sequence moved on; carries the value now current.
    Signalled(u32),
    TimedOut,
}

/// Shared wake-up counter.
#[repr(C)]
pub struct SignalBlock {
    sequence: AtomicU32,
}

// SAFETY: repr(C), a single atomic; zero is a valid starting sequence.
unsafe impl SharedMemorySafe for SignalBlock {}

impl SignalBlock {
    /// Wakes every waiter.
    pub fn notify(&self) {
        self.sequence.fetch_add(1, Ordering::Release);
    }

    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Blocks until the sequence differs from `last_seen` or `timeout` passes.
    pub fn wait_for_data(&self, last_seen: u32, timeout: Duration) -> WaitOutcome {
        let start = minstant::Instant::now();
        let mut spins = 0;
        loop {
            let current = self.sequence();
            if current != last_seen {
                return WaitOutcome::Signalled(current);
            }
            if start.elapsed() >= timeout {
                return WaitOutcome::TimedOut;
            }
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Instrument state published by the dispatcher for every attached process.
#[repr(C)]
pub struct StatusBlock {
    ticks: AtomicU32,
    inst_info: AtomicU32,
    runlevel: AtomicU32,
}

// SAFETY: repr(C), atomics only, zero means "nothing known yet".
unsafe impl SharedMemorySafe for StatusBlock {}

impl StatusBlock {
    /// Dispatcher ticks since the link came up.
    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn set_ticks(&self, ticks: u32) {
        self.ticks.store(ticks, Ordering::Relaxed);
    }

    /// [`InstInfo`](crate::mirror::InstInfo) bits.
    pub fn inst_info(&self) -> u32 {
        self.inst_info.load(Ordering::Acquire)
    }

    pub fn set_inst_info(&self, bits: u32) {
        self.inst_info.store(bits, Ordering::Release);
    }

    /// Last run level the instrument reported.
    pub fn runlevel(&self) -> u32 {
        self.runlevel.load(Ordering::Acquire)
    }

    pub fn set_runlevel(&self, level: u32) {
        self.runlevel.store(level, Ordering::Release);
    }
}
