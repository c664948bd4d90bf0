//! Process-local copy of the instrument configuration.
//!
//! The instrument reports its configuration as packets on [`CONFIG_CHID`].
//! The standalone bridge keeps the latest report of each kind so local
//! consumers can query state without a round trip, and keeps the most recent
//! spike packets of every streaming channel in a [`SpikeCache`].
//!
//! A client (attached to another process's bridge) runs the same code with
//! storage disabled: it still raises run-level events.

use crate::packet::{CONFIG_CHID, Packet, packet_type, runflags, runlevel};
use crate::trace::warn;

/// Channels with a channel report.
pub const MAX_CHANS: usize = 284;
pub const MAX_BANKS: usize = 14;
pub const MAX_GROUPS: usize = 8;
pub const MAX_FILTS: usize = 32;

/// Channel ids below this get a spike cache line.
pub const SPIKE_CACHE_LINES: usize = 272;

/// Packets kept per spike cache line.
pub const SPIKE_CACHE_PACKETS: usize = 400;

/// Sort models per channel: five units, one spare, one noise.
pub const SORT_UNIT_SLOTS: usize = 7;

/// Sort unit number reserved for the noise model.
pub const NOISE_UNIT: u32 = 255;

/// Bytes of processor identification text in a processor report.
pub const PROC_IDENT_BYTES: usize = 64;

/// Channel capability bit for analog inputs, in payload word
/// [`CHANCAPS_WORD`] of a channel report.
pub const CHAN_AINP: u32 = 0x0000_0100;

/// Payload index of the capability word: after chan, proc, bank and term.
pub const CHANCAPS_WORD: usize = 4;

/// Recording state values a file report must carry to be kept.
pub mod file_options {
    pub const REC: u32 = 2;
    pub const STOP: u32 = 3;
}

/// Playback server flag marking its main configuration packet.
pub const NPLAY_FLAG_MAIN: u32 = 0x03;

/// Packets earlier than this are part of the instrument's own boot reset.
const BOOT_RESET_TIME: u32 = 500;

/// What is known about the connected instrument, as bit flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct InstInfo(u32);

impl InstInfo {
    /// Configuration has been mirrored.
    pub const READY: u32 = 0x01;
    /// Instrument runs on this host.
    pub const LOCAL: u32 = 0x02;
    /// Playback server.
    pub const NPLAY: u32 = 0x04;
    pub const CEREPLEX: u32 = 0x08;
    pub const EMULATOR: u32 = 0x10;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    /// Instruments that need the high-latency reply timeout.
    pub const fn is_high_latency(self) -> bool {
        self.0 & (Self::NPLAY | Self::CEREPLEX) != 0
    }
}

/// Noteworthy change caused by a configuration packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorEvent {
    /// A system report changed the instrument info.
    InstInfo(InstInfo),
    /// The instrument was hard-reset by someone else.
    Reset,
    /// The instrument restarted with recording locked.
    LockedReset,
}

/// Recent spike packets of one channel, overwritten in ring order.
#[derive(Debug, Clone, Default)]
pub struct SpikeCacheLine {
    packets: Vec<Packet>,
    head: usize,
    valid: u32,
}

impl SpikeCacheLine {
    fn push(&mut self, packet: &Packet) {
        if self.packets.len() < SPIKE_CACHE_PACKETS {
            self.packets.push(packet.clone());
        } else {
            self.packets[self.head] = packet.clone();
        }
        self.head = (self.head + 1) % SPIKE_CACHE_PACKETS;
        self.valid = self.valid.wrapping_add(1);
    }

    fn invalidate(&mut self) {
        self.valid = 0;
    }

    /// Packets written since the line was last invalidated.
    pub fn valid(&self) -> u32 {
        self.valid
    }

    /// Slot the next packet goes to.
    pub fn head(&self) -> usize {
        self.head
    }

    /// The most recent packets, oldest first, limited to those still valid.
    pub fn recent(&self) -> impl Iterator<Item = &Packet> {
        let len = self.packets.len();
        let keep = len.min(self.valid as usize);
        let start = (self.head + len - keep) % len.max(1);
        (0..keep).map(move |i| &self.packets[(start + i) % len])
    }
}

/// Spike cache lines for channel ids `1..SPIKE_CACHE_LINES`.
#[derive(Debug, Clone)]
pub struct SpikeCache {
    lines: Vec<SpikeCacheLine>,
}

impl Default for SpikeCache {
    fn default() -> Self {
        Self {
            lines: vec![SpikeCacheLine::default(); SPIKE_CACHE_LINES - 1],
        }
    }
}

impl SpikeCache {
    /// True for channel ids that have a cache line.
    pub fn accepts(chid: u16) -> bool {
        chid > 0 && usize::from(chid) < SPIKE_CACHE_LINES
    }

    /// Stores `packet` in its channel's line. Returns false for other ids.
    pub fn push(&mut self, packet: &Packet) -> bool {
        if !Self::accepts(packet.chid()) {
            return false;
        }
        self.lines[usize::from(packet.chid()) - 1].push(packet);
        true
    }

    /// Line for channel `chan` (1-based).
    pub fn line(&self, chan: usize) -> Option<&SpikeCacheLine> {
        chan.checked_sub(1).and_then(|i| self.lines.get(i))
    }

    fn invalidate(&mut self, chan: usize) {
        if let Some(line) = chan.checked_sub(1).and_then(|i| self.lines.get_mut(i)) {
            line.invalidate();
        }
    }
}

/// Latest configuration reports, by kind.
#[derive(Debug, Clone)]
pub struct ConfigMirror {
    standalone: bool,
    sysinfo: Option<Packet>,
    chaninfo: Vec<Option<Packet>>,
    groupinfo: Vec<Option<Packet>>,
    filtinfo: Vec<Option<Packet>>,
    bankinfo: Vec<Option<Packet>>,
    procinfo: Option<Packet>,
    adaptinfo: Option<Packet>,
    refelecinfo: Option<Packet>,
    lnc: Option<Packet>,
    sort_models: Vec<[Option<Packet>; SORT_UNIT_SLOTS]>,
    sort_detect: Option<Packet>,
    sort_status: Option<Packet>,
    basis: Vec<Option<Packet>>,
    fileinfo: Option<Packet>,
    nm: Option<Packet>,
    nplay: Option<Packet>,
    spikes: SpikeCache,
    runlevel: Option<u32>,
    inst_info: InstInfo,
}

impl ConfigMirror {
    /// Mirror that stores reports (`standalone`) or only raises events.
    pub fn new(standalone: bool) -> Self {
        Self {
            standalone,
            sysinfo: None,
            chaninfo: vec![None; MAX_CHANS],
            groupinfo: vec![None; MAX_GROUPS],
            filtinfo: vec![None; MAX_FILTS],
            bankinfo: vec![None; MAX_BANKS],
            procinfo: None,
            adaptinfo: None,
            refelecinfo: None,
            lnc: None,
            sort_models: vec![Default::default(); MAX_CHANS],
            sort_detect: None,
            sort_status: None,
            basis: vec![None; MAX_CHANS],
            fileinfo: None,
            nm: None,
            nplay: None,
            spikes: SpikeCache::default(),
            runlevel: None,
            inst_info: InstInfo::default(),
        }
    }

    pub fn is_standalone(&self) -> bool {
        self.standalone
    }

    /// Applies one inbound packet.
    ///
    /// `local` tells whether the instrument is reached over loopback.
    pub fn process(&mut self, packet: &Packet, local: bool) -> Option<MirrorEvent> {
        if packet.chid() == CONFIG_CHID {
            return self.process_config(packet, local);
        }
        if self.standalone {
            self.spikes.push(packet);
        }
        None
    }

    fn process_config(&mut self, packet: &Packet, local: bool) -> Option<MirrorEvent> {
        let pkt_type = packet.pkt_type();
        let family = pkt_type & packet_type::FAMILY_MASK;

        if family == packet_type::CHANREP {
            self.store_channel(packet);
            return None;
        }
        if family == packet_type::SYSREP {
            return self.process_sysrep(packet, local);
        }
        if !self.standalone {
            return None;
        }

        let word = |i| packet.word(i).map_or(0, |w| w as usize);
        match pkt_type {
            packet_type::GROUPREP => store_keyed(&mut self.groupinfo, word(1), packet),
            packet_type::FILTREP => store_keyed(&mut self.filtinfo, word(1), packet),
            packet_type::BANKREP => store_keyed(&mut self.bankinfo, word(1), packet),
            packet_type::PROCREP => self.procinfo = Some(packet.clone()),
            packet_type::ADAPTFILTREP => self.adaptinfo = Some(packet.clone()),
            packet_type::REFELECFILTREP => self.refelecinfo = Some(packet.clone()),
            packet_type::LNCREP => self.lnc = Some(packet.clone()),
            packet_type::SS_MODELREP => self.store_sort_model(packet),
            packet_type::SS_DETECTREP => self.sort_detect = Some(packet.clone()),
            packet_type::SS_STATUSREP => self.sort_status = Some(packet.clone()),
            packet_type::FS_BASISREP => store_keyed(&mut self.basis, word(0), packet),
            packet_type::REPFILECFG => {
                let options = packet.word(0).unwrap_or(0);
                if options == file_options::REC || options == file_options::STOP {
                    self.fileinfo = Some(packet.clone());
                }
            }
            packet_type::NMREP => self.nm = Some(packet.clone()),
            packet_type::NPLAYREP => {
                let flags = packet.word(4).unwrap_or(0) >> 16;
                if flags == NPLAY_FLAG_MAIN {
                    self.nplay = Some(packet.clone());
                }
            }
            _ => {}
        }
        None
    }

    fn store_channel(&mut self, packet: &Packet) {
        if !self.standalone {
            return;
        }
        let chan = packet.embedded_channel().unwrap_or(0) as usize;
        if chan == 0 || chan > MAX_CHANS {
            return;
        }
        self.chaninfo[chan - 1] = Some(packet.clone());
        let analog_input = packet
            .word(CHANCAPS_WORD)
            .is_some_and(|caps| caps & CHAN_AINP == CHAN_AINP);
        if packet.pkt_type() == packet_type::CHANREP && analog_input {
            self.spikes.invalidate(chan);
        }
    }

    fn store_sort_model(&mut self, packet: &Packet) {
        let chan = packet.word(0).unwrap_or(u32::MAX) as usize;
        let unit = match packet.word(1) {
            Some(NOISE_UNIT) => SORT_UNIT_SLOTS - 1,
            Some(unit) => unit as usize,
            None => return,
        };
        match self.sort_models.get_mut(chan).and_then(|units| units.get_mut(unit)) {
            Some(slot) => *slot = Some(packet.clone()),
            None => warn!(chan, unit, "sort model out of range"),
        }
    }

    fn process_sysrep(&mut self, packet: &Packet, local: bool) -> Option<MirrorEvent> {
        if self.standalone {
            self.sysinfo = Some(packet.clone());
        }
        let level = packet.word(4);
        let previous = self.runlevel;
        if level.is_some() {
            self.runlevel = level;
        }

        match packet.pkt_type() {
            packet_type::SYSREP => {
                let info = self.compute_inst_info(local);
                if info != self.inst_info {
                    self.inst_info = info;
                    return Some(MirrorEvent::InstInfo(info));
                }
                None
            }
            packet_type::SYSREPRUNLEV if level != previous => match level {
                Some(runlevel::HARDRESET)
                    if !self.standalone || packet.time() > BOOT_RESET_TIME =>
                {
                    Some(MirrorEvent::Reset)
                }
                Some(runlevel::RUNNING)
                    if packet.word(5).unwrap_or(0) & runflags::LOCK != 0 =>
                {
                    Some(MirrorEvent::LockedReset)
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Instrument info derived from what has been mirrored.
    pub fn compute_inst_info(&self, local: bool) -> InstInfo {
        let ident = self.processor_ident();
        let kind = if ident.contains("Cereplex") {
            InstInfo::CEREPLEX
        } else if ident.contains("Emulator") {
            InstInfo::EMULATOR
        } else {
            InstInfo::NPLAY
        };

        let mut bits = 0;
        if local {
            bits |= InstInfo::LOCAL | kind;
        }
        if self.nplay.is_some() {
            bits |= kind;
        }
        if self.sysinfo.is_some() || !self.standalone {
            bits |= InstInfo::READY;
        }
        InstInfo(bits)
    }

    /// Identification text from the processor report, up to the first NUL.
    pub fn processor_ident(&self) -> String {
        let Some(proc) = &self.procinfo else {
            return String::new();
        };
        let bytes: Vec<u8> = proc
            .payload()
            .iter()
            .skip(2)
            .flat_map(|word| word.to_le_bytes())
            .take(PROC_IDENT_BYTES)
            .take_while(|&b| b != 0)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Current instrument info.
    pub fn inst_info(&self) -> InstInfo {
        self.inst_info
    }

    /// Last reported run level.
    pub fn runlevel(&self) -> Option<u32> {
        self.runlevel
    }

    pub fn sysinfo(&self) -> Option<&Packet> {
        self.sysinfo.as_ref()
    }

    /// Channel report for `chan` (1-based).
    pub fn chaninfo(&self, chan: usize) -> Option<&Packet> {
        keyed(&self.chaninfo, chan)
    }

    pub fn groupinfo(&self, group: usize) -> Option<&Packet> {
        keyed(&self.groupinfo, group)
    }

    pub fn filtinfo(&self, filt: usize) -> Option<&Packet> {
        keyed(&self.filtinfo, filt)
    }

    pub fn bankinfo(&self, bank: usize) -> Option<&Packet> {
        keyed(&self.bankinfo, bank)
    }

    pub fn procinfo(&self) -> Option<&Packet> {
        self.procinfo.as_ref()
    }

    pub fn adaptinfo(&self) -> Option<&Packet> {
        self.adaptinfo.as_ref()
    }

    pub fn refelecinfo(&self) -> Option<&Packet> {
        self.refelecinfo.as_ref()
    }

    pub fn lnc(&self) -> Option<&Packet> {
        self.lnc.as_ref()
    }

    /// Sort model of `unit` on `chan`; unit [`NOISE_UNIT`] is the noise model.
    pub fn sort_model(&self, chan: usize, unit: u32) -> Option<&Packet> {
        let slot = if unit == NOISE_UNIT {
            SORT_UNIT_SLOTS - 1
        } else {
            unit as usize
        };
        self.sort_models.get(chan)?.get(slot)?.as_ref()
    }

    pub fn sort_detect(&self) -> Option<&Packet> {
        self.sort_detect.as_ref()
    }

    pub fn sort_status(&self) -> Option<&Packet> {
        self.sort_status.as_ref()
    }

    /// Feature-space basis of `chan` (1-based).
    pub fn basis(&self, chan: usize) -> Option<&Packet> {
        keyed(&self.basis, chan)
    }

    pub fn fileinfo(&self) -> Option<&Packet> {
        self.fileinfo.as_ref()
    }

    pub fn nm(&self) -> Option<&Packet> {
        self.nm.as_ref()
    }

    pub fn nplay(&self) -> Option<&Packet> {
        self.nplay.as_ref()
    }

    pub fn spikes(&self) -> &SpikeCache {
        &self.spikes
    }
}

/// Stores `packet` at 1-based `index`, ignoring 0 and out-of-range indices.
fn store_keyed(table: &mut [Option<Packet>], index: usize, packet: &Packet) {
    if let Some(slot) = index.checked_sub(1).and_then(|i| table.get_mut(i)) {
        *slot = Some(packet.clone());
    }
}

fn keyed(table: &[Option<Packet>], index: usize) -> Option<&Packet> {
    table.get(index.checked_sub(1)?)?.as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::SYSINFO_DLEN;

    fn config(time: u32, pkt_type: u8, payload: Vec<u32>) -> Packet {
        Packet::new(time, CONFIG_CHID, pkt_type, payload).unwrap()
    }

    fn sysinfo(pkt_type: u8, time: u32, level: u32, flags: u32) -> Packet {
        let payload = vec![30000, 48, 10, 0, level, flags];
        assert_eq!(payload.len(), SYSINFO_DLEN as usize);
        config(time, pkt_type, payload)
    }

    fn ident_words(text: &str) -> Vec<u32> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(PROC_IDENT_BYTES, 0);
        bytes
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn channel_reports_are_stored_by_channel() {
        let mut mirror = ConfigMirror::new(true);
        mirror.process(&config(5, 0x40, vec![7, 1, 2]), false);
        mirror.process(&config(5, 0x47, vec![MAX_CHANS as u32, 9]), false);
        mirror.process(&config(5, 0x40, vec![0]), false);
        mirror.process(&config(5, 0x40, vec![MAX_CHANS as u32 + 1]), false);

        assert_eq!(mirror.chaninfo(7).unwrap().word(1), Some(1));
        assert_eq!(mirror.chaninfo(MAX_CHANS).unwrap().pkt_type(), 0x47);
        assert_eq!(mirror.chaninfo(0), None);
        assert_eq!(mirror.chaninfo(1), None);
    }

    #[test]
    fn client_mirror_stores_nothing() {
        let mut mirror = ConfigMirror::new(false);
        mirror.process(&config(5, 0x40, vec![7]), false);
        mirror.process(&config(5, packet_type::GROUPREP, vec![1, 1]), false);
        mirror.process(&Packet::new(1, 3, 0, vec![1]).unwrap(), false);
        assert_eq!(mirror.chaninfo(7), None);
        assert_eq!(mirror.groupinfo(1), None);
        assert_eq!(mirror.spikes().line(3).unwrap().valid(), 0);
    }

    #[test]
    fn keyed_reports_use_their_index_word() {
        let mut mirror = ConfigMirror::new(true);
        mirror.process(&config(1, packet_type::GROUPREP, vec![1, 5, 0]), false);
        mirror.process(&config(1, packet_type::FILTREP, vec![1, 32]), false);
        mirror.process(&config(1, packet_type::BANKREP, vec![1, 15]), false);
        mirror.process(&config(1, packet_type::FS_BASISREP, vec![0, 3]), false);
        mirror.process(&config(1, packet_type::FS_BASISREP, vec![12, 3]), false);

        assert!(mirror.groupinfo(5).is_some());
        assert!(mirror.filtinfo(32).is_some());
        assert!(mirror.bankinfo(14).is_none());
        assert!(mirror.basis(12).is_some());
        assert!(mirror.basis.iter().filter(|b| b.is_some()).count() == 1);
    }

    #[test]
    fn sort_models_put_noise_in_last_slot() {
        let mut mirror = ConfigMirror::new(true);
        mirror.process(&config(1, packet_type::SS_MODELREP, vec![4, 2]), false);
        mirror.process(&config(1, packet_type::SS_MODELREP, vec![4, NOISE_UNIT]), false);
        mirror.process(&config(1, packet_type::SS_MODELREP, vec![4, 9]), false);
        mirror.process(&config(1, packet_type::SS_MODELREP, vec![9999, 1]), false);

        assert!(mirror.sort_model(4, 2).is_some());
        assert_eq!(mirror.sort_model(4, NOISE_UNIT).unwrap().word(1), Some(NOISE_UNIT));
        assert!(mirror.sort_model(4, 9).is_none());
    }

    #[test]
    fn file_and_nplay_reports_are_filtered() {
        let mut mirror = ConfigMirror::new(true);
        mirror.process(&config(1, packet_type::REPFILECFG, vec![1]), false);
        assert!(mirror.fileinfo().is_none());
        mirror.process(&config(1, packet_type::REPFILECFG, vec![file_options::REC]), false);
        assert!(mirror.fileinfo().is_some());

        mirror.process(&config(1, packet_type::NPLAYREP, vec![0, 0, 0, 0, 0x01 << 16]), false);
        assert!(mirror.nplay().is_none());
        mirror.process(
            &config(1, packet_type::NPLAYREP, vec![0, 0, 0, 0, NPLAY_FLAG_MAIN << 16 | 7]),
            false,
        );
        assert!(mirror.nplay().is_some());
    }

    #[test]
    fn sysrep_reports_inst_info_changes_once() {
        let mut mirror = ConfigMirror::new(true);
        let rep = sysinfo(packet_type::SYSREP, 10, runlevel::RUNNING, 0);
        assert_eq!(
            mirror.process(&rep, false),
            Some(MirrorEvent::InstInfo(InstInfo::from_bits(InstInfo::READY)))
        );
        assert_eq!(mirror.process(&rep, false), None);
        assert_eq!(mirror.runlevel(), Some(runlevel::RUNNING));

        let local = mirror.process(&rep, true);
        assert_eq!(
            local,
            Some(MirrorEvent::InstInfo(InstInfo::from_bits(
                InstInfo::READY | InstInfo::LOCAL | InstInfo::NPLAY
            )))
        );
        assert!(mirror.inst_info().is_high_latency());
    }

    #[test]
    fn processor_ident_selects_instrument_kind() {
        let mut mirror = ConfigMirror::new(true);
        let mut payload = vec![1, 0];
        payload.extend(ident_words("Cereplex-E 1.0"));
        mirror.process(&config(1, packet_type::PROCREP, payload), false);
        assert_eq!(mirror.processor_ident(), "Cereplex-E 1.0");

        let info = mirror.compute_inst_info(true);
        assert!(info.contains(InstInfo::CEREPLEX));
        assert!(!info.contains(InstInfo::NPLAY));
        assert!(info.is_high_latency());
    }

    #[test]
    fn run_level_events_fire_on_transitions_only() {
        let mut mirror = ConfigMirror::new(true);
        let running = sysinfo(packet_type::SYSREPRUNLEV, 1000, runlevel::RUNNING, 0);
        assert_eq!(mirror.process(&running, false), None);

        let boot_reset = sysinfo(packet_type::SYSREPRUNLEV, 100, runlevel::HARDRESET, 0);
        assert_eq!(mirror.process(&boot_reset, false), None);

        mirror.process(&running, false);
        let reset = sysinfo(packet_type::SYSREPRUNLEV, 1000, runlevel::HARDRESET, 0);
        assert_eq!(mirror.process(&reset, false), Some(MirrorEvent::Reset));
        assert_eq!(mirror.process(&reset, false), None);

        let locked = sysinfo(packet_type::SYSREPRUNLEV, 2000, runlevel::RUNNING, runflags::LOCK);
        assert_eq!(mirror.process(&locked, false), Some(MirrorEvent::LockedReset));
        assert_eq!(mirror.process(&locked, false), None);
    }

    #[test]
    fn client_reports_every_hard_reset_transition() {
        let mut mirror = ConfigMirror::new(false);
        let reset = sysinfo(packet_type::SYSREPRUNLEV, 1, runlevel::HARDRESET, 0);
        assert_eq!(mirror.process(&reset, false), Some(MirrorEvent::Reset));
        assert!(mirror.sysinfo().is_none());
    }

    #[test]
    fn spike_cache_wraps_per_channel() {
        let mut mirror = ConfigMirror::new(true);
        for time in 1..=(SPIKE_CACHE_PACKETS as u32 + 5) {
            mirror.process(&Packet::new(time, 3, 0, vec![time]).unwrap(), false);
        }
        mirror.process(&Packet::new(1, SPIKE_CACHE_LINES as u16, 0, vec![]).unwrap(), false);

        let line = mirror.spikes().line(3).unwrap();
        assert_eq!(line.valid(), SPIKE_CACHE_PACKETS as u32 + 5);
        assert_eq!(line.head(), 5);
        let recent: Vec<u32> = line.recent().map(Packet::time).collect();
        assert_eq!(recent.len(), SPIKE_CACHE_PACKETS);
        assert_eq!(recent[0], 6);
        assert_eq!(*recent.last().unwrap(), SPIKE_CACHE_PACKETS as u32 + 5);
        assert!(mirror.spikes().line(SPIKE_CACHE_LINES).is_none());
    }

    #[test]
    fn channel_report_invalidates_spike_cache() {
        let mut mirror = ConfigMirror::new(true);
        mirror.process(&Packet::new(1, 9, 0, vec![]).unwrap(), false);
        mirror.process(&Packet::new(2, 9, 0, vec![]).unwrap(), false);
        assert_eq!(mirror.spikes().line(9).unwrap().recent().count(), 2);

        let analog = vec![9, 1, 1, 9, CHAN_AINP | 0x3];
        mirror.process(&config(3, 0x41, analog.clone()), false);
        assert_eq!(mirror.spikes().line(9).unwrap().valid(), 2);
        mirror.process(&config(3, packet_type::CHANREP, analog), false);
        assert_eq!(mirror.spikes().line(9).unwrap().valid(), 0);
        assert_eq!(mirror.spikes().line(9).unwrap().recent().count(), 0);
    }

    #[test]
    fn non_analog_channel_report_keeps_spike_cache() {
        let mut mirror = ConfigMirror::new(true);
        mirror.process(&Packet::new(1, 9, 0, vec![]).unwrap(), false);

        // Digital input caps, then a report too short to carry caps at all.
        mirror.process(&config(2, packet_type::CHANREP, vec![9, 1, 1, 9, 0x0401]), false);
        mirror.process(&config(3, packet_type::CHANREP, vec![9]), false);
        assert_eq!(mirror.spikes().line(9).unwrap().valid(), 1);
        assert!(mirror.chaninfo(9).is_some());
    }
}
