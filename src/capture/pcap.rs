//! Capture-file replay.
//!
//! The capture is mapped read-only and never copied; payload slices
//! handed to handlers point straight into the mapping. Replay walks the
//! file packet by packet, decodes link/network/transport headers in
//! place, and dispatches UDP payloads by destination port.
//!
//! In TIMED mode each packet gets an absolute delivery target derived
//! from the first packet's capture timestamp and the monotonic clock at
//! replay start, so scheduling error never accumulates across a long
//! file. FLOOD mode delivers in large batches, yielding to the reactor
//! between batches so live sources and timers still run.

use crate::capture::pcap_format::{self, Dialect};
use crate::capture::{
    PacketHandler, PacketStatus, PacketTimestamp, PcapConfig, ReplayMode, SharedHandler,
};
use crate::error::{Error, Result};
use crate::protocol::{self, LinkType};
use crate::reactor::{monotonic_ns, Reactor};
use crate::telemetry::ReplayStats;
use std::cell::RefCell;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr;
use std::rc::Rc;
use std::slice;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, info};

const PORT_TABLE_SIZE: usize = 1 << 16;

/// Read-only private mapping of the capture file. Shared by `Rc` so a
/// payload slice can outlive a borrow of the replay state while a
/// handler runs.
struct CaptureMap {
    base: *const u8,
    len: usize,
    _file: File,
}

impl CaptureMap {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < 4 {
            return Err(Error::Format("capture shorter than a magic number".into()));
        }

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::last_os());
        }
        // Replay reads the file front to back exactly once.
        unsafe {
            libc::madvise(base, len, libc::MADV_SEQUENTIAL | libc::MADV_WILLNEED);
        }

        Ok(Self {
            base: base as *const u8,
            len,
            _file: file,
        })
    }

    fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base, self.len) }
    }
}

impl Drop for CaptureMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// A pcapng interface as seen by replay.
#[derive(Debug, Clone, Copy)]
struct InterfaceInfo {
    link_type: u32,
    ts_divisor: u64,
}

/// What a single step decided, computed under the state borrow and acted
/// on after it is released so handlers run re-entrant-safe.
enum StepAction {
    /// End of file or malformed tail; `finished` is set.
    Finished,
    /// TIMED mode hit a packet scheduled in the future; the cursor was
    /// not advanced.
    Wait { delay: Duration },
    /// Cursor advanced past one packet; `None` when it was dropped
    /// (parse failure, truncated capture, or no subscriber).
    Delivered(Option<Dispatch>),
}

struct Dispatch {
    map: Rc<CaptureMap>,
    payload_offset: usize,
    payload_len: usize,
    handler: SharedHandler,
    ts: PacketTimestamp,
}

struct ReplayCore {
    map: Option<Rc<CaptureMap>>,
    cursor: usize,
    /// Where `rewind` puts the cursor: 24 for legacy, 0 for pcapng.
    data_start: usize,
    dialect: Option<Dialect>,
    legacy_link_type: u32,
    interfaces: Vec<InterfaceInfo>,
    ports: Vec<Option<SharedHandler>>,
    first_packet: bool,
    pcap_start: PacketTimestamp,
    wall_start_ns: u64,
    finished: bool,
    stats: Rc<ReplayStats>,
}

impl ReplayCore {
    fn new(stats: Rc<ReplayStats>) -> Self {
        Self {
            map: None,
            cursor: 0,
            data_start: 0,
            dialect: None,
            legacy_link_type: 0,
            interfaces: Vec::new(),
            ports: vec![None; PORT_TABLE_SIZE],
            first_packet: true,
            pcap_start: PacketTimestamp::default(),
            wall_start_ns: 0,
            finished: false,
            stats,
        }
    }

    /// Advances replay by (at most) one packet. See `StepAction`.
    fn advance(&mut self, mode: ReplayMode, speed_multiplier: f64) -> StepAction {
        let map = match &self.map {
            Some(map) => map.clone(),
            None => return StepAction::Finished,
        };
        match self.dialect {
            Some(Dialect::Legacy {
                byte_swapped,
                nanosecond,
            }) => self.advance_legacy(&map, byte_swapped, nanosecond, mode, speed_multiplier),
            Some(Dialect::NextGen { byte_swapped }) => {
                self.advance_next_gen(&map, byte_swapped, mode, speed_multiplier)
            }
            None => StepAction::Finished,
        }
    }

    fn advance_legacy(
        &mut self,
        map: &Rc<CaptureMap>,
        byte_swapped: bool,
        nanosecond: bool,
        mode: ReplayMode,
        speed_multiplier: f64,
    ) -> StepAction {
        let data = map.data();
        let record = match pcap_format::parse_legacy_record(data, self.cursor, byte_swapped) {
            Some(record) => record,
            None => {
                self.finished = true;
                debug!("capture EOF at offset {}", self.cursor);
                return StepAction::Finished;
            }
        };

        let ts = PacketTimestamp {
            sec: i64::from(record.ts_sec),
            nsec: i64::from(record.ts_sub) * if nanosecond { 1 } else { 1000 },
        };

        if mode == ReplayMode::Timed {
            if let Some(delay) = self.delay_until_target(ts, speed_multiplier) {
                return StepAction::Wait { delay };
            }
        }

        let frame_start = self.cursor + pcap_format::LEGACY_RECORD_LEN;
        let frame_end = frame_start + record.cap_len as usize;
        if frame_end > data.len() {
            // The record claims more bytes than the file holds.
            self.finished = true;
            return StepAction::Finished;
        }

        let dispatch = self.decode_frame(
            map,
            frame_start,
            record.cap_len,
            record.orig_len,
            LinkType::from_dlt(self.legacy_link_type),
            ts,
        );
        self.cursor = frame_end;
        StepAction::Delivered(dispatch)
    }

    fn advance_next_gen(
        &mut self,
        map: &Rc<CaptureMap>,
        mut byte_swapped: bool,
        mode: ReplayMode,
        speed_multiplier: f64,
    ) -> StepAction {
        let data = map.data();

        // Consume non-packet blocks until an Enhanced Packet Block (or
        // the end of the mapping) is reached; one step delivers at most
        // one packet.
        loop {
            let header = match pcap_format::parse_block_header(data, self.cursor, byte_swapped) {
                Some(header) => header,
                None => {
                    self.finished = true;
                    debug!("capture EOF at offset {}", self.cursor);
                    return StepAction::Finished;
                }
            };
            let total_len = header.total_len as usize;
            if total_len < pcap_format::BLOCK_HEADER_LEN || self.cursor + total_len > data.len() {
                self.finished = true;
                return StepAction::Finished;
            }
            let block = &data[self.cursor..self.cursor + total_len];

            match header.block_type {
                pcap_format::BLOCK_SECTION_HEADER => {
                    // A new section may change byte order (the type field
                    // is palindromic, so it was read correctly even
                    // before the switch) and restarts interface numbering.
                    if self.cursor + 12 > data.len() {
                        self.finished = true;
                        return StepAction::Finished;
                    }
                    match pcap_format::read_u32(data, self.cursor + 8, false) {
                        pcap_format::BYTE_ORDER_MAGIC => byte_swapped = false,
                        pcap_format::BYTE_ORDER_MAGIC_SWAPPED => byte_swapped = true,
                        _ => {
                            self.finished = true;
                            return StepAction::Finished;
                        }
                    }
                    self.dialect = Some(Dialect::NextGen { byte_swapped });
                    self.interfaces.clear();
                    let total_len =
                        pcap_format::read_u32(data, self.cursor + 4, byte_swapped) as usize;
                    if total_len < pcap_format::BLOCK_HEADER_LEN
                        || self.cursor + total_len > data.len()
                    {
                        self.finished = true;
                        return StepAction::Finished;
                    }
                    self.cursor += total_len;
                }
                pcap_format::BLOCK_INTERFACE_DESCRIPTION => {
                    let body_end = total_len.saturating_sub(4);
                    if body_end > pcap_format::BLOCK_HEADER_LEN {
                        if let Some(idb) = pcap_format::parse_interface_description(
                            &block[pcap_format::BLOCK_HEADER_LEN..body_end],
                            byte_swapped,
                        ) {
                            self.interfaces.push(InterfaceInfo {
                                link_type: idb.link_type,
                                ts_divisor: idb.ts_divisor,
                            });
                        }
                    }
                    self.cursor += total_len;
                }
                pcap_format::BLOCK_ENHANCED_PACKET => {
                    let packet = match pcap_format::parse_enhanced_packet(block, byte_swapped) {
                        Some(packet) => packet,
                        None => {
                            // Malformed packet block: skip it silently.
                            self.stats.packets_dropped.inc();
                            self.cursor += total_len;
                            return StepAction::Delivered(None);
                        }
                    };

                    // An EPB naming an interface no IDB has described yet
                    // is a per-packet drop, not a stream error.
                    let iface = match self.interfaces.get(packet.interface_id as usize) {
                        Some(iface) => *iface,
                        None => {
                            self.stats.packets_dropped.inc();
                            self.cursor += total_len;
                            return StepAction::Delivered(None);
                        }
                    };

                    let ts = pcap_format::split_timestamp(packet.ts_raw, iface.ts_divisor);

                    if mode == ReplayMode::Timed {
                        if let Some(delay) = self.delay_until_target(ts, speed_multiplier) {
                            return StepAction::Wait { delay };
                        }
                    }

                    let dispatch = self.decode_frame(
                        map,
                        self.cursor + packet.data_offset,
                        packet.cap_len,
                        packet.orig_len,
                        LinkType::from_dlt(iface.link_type),
                        ts,
                    );
                    self.cursor += total_len;
                    return StepAction::Delivered(dispatch);
                }
                _ => {
                    self.cursor += total_len;
                }
            }
        }
    }

    /// Locates the UDP payload inside a captured frame and pairs it with
    /// the subscribed handler. `None` is a silent drop: captures with
    /// truncated frames (`cap_len != orig_len`), non-UDP traffic, parse
    /// failures, and unsubscribed ports all fall out here.
    fn decode_frame(
        &self,
        map: &Rc<CaptureMap>,
        frame_offset: usize,
        cap_len: u32,
        orig_len: u32,
        link_type: LinkType,
        ts: PacketTimestamp,
    ) -> Option<Dispatch> {
        if cap_len != orig_len {
            self.stats.packets_dropped.inc();
            return None;
        }

        let data = map.data();
        let frame = &data[frame_offset..frame_offset + cap_len as usize];
        let datagram = match protocol::decode_udp(link_type, frame) {
            Some(datagram) => datagram,
            None => {
                self.stats.packets_dropped.inc();
                return None;
            }
        };

        let handler = self.ports[datagram.dst_port as usize].as_ref()?.clone();
        let payload_offset = datagram.payload.as_ptr() as usize - data.as_ptr() as usize;
        Some(Dispatch {
            map: map.clone(),
            payload_offset,
            payload_len: datagram.payload.len(),
            handler,
            ts,
        })
    }

    /// TIMED pacing: how long until this packet's delivery target, or
    /// `None` when it is due now. The first delivered packet anchors the
    /// capture-to-wall mapping.
    fn delay_until_target(
        &mut self,
        ts: PacketTimestamp,
        speed_multiplier: f64,
    ) -> Option<Duration> {
        if self.first_packet {
            self.pcap_start = ts;
            self.wall_start_ns = monotonic_ns();
            self.first_packet = false;
            return None;
        }

        let mut delta_sec = ts.sec - self.pcap_start.sec;
        let mut delta_nsec = ts.nsec - self.pcap_start.nsec;
        if delta_nsec < 0 {
            delta_nsec += 1_000_000_000;
            delta_sec -= 1;
        }
        let mut delta_ns = delta_sec * 1_000_000_000 + delta_nsec;
        if speed_multiplier != 1.0 && speed_multiplier > 0.0 {
            delta_ns = (delta_ns as f64 / speed_multiplier) as i64;
        }

        let target_ns = self.wall_start_ns.saturating_add_signed(delta_ns);
        let now_ns = monotonic_ns();
        if target_ns > now_ns {
            Some(Duration::from_nanos(target_ns - now_ns))
        } else {
            None
        }
    }
}

pub struct PcapReplayer {
    reactor: Rc<Reactor>,
    core: Rc<RefCell<ReplayCore>>,
    config: PcapConfig,
    owner: ThreadId,
    stats: Rc<ReplayStats>,
}

impl PcapReplayer {
    pub fn new(reactor: &Rc<Reactor>, config: PcapConfig) -> Result<Self> {
        if config.base.batch_size == 0 || config.flood_batch_limit == 0 {
            return Err(Error::InvalidArg("batch sizes must be non-zero"));
        }
        let stats = Rc::new(ReplayStats::default());
        Ok(Self {
            reactor: reactor.clone(),
            core: Rc::new(RefCell::new(ReplayCore::new(stats.clone()))),
            config,
            owner: thread::current().id(),
            stats,
        })
    }

    /// Maps the capture and detects its dialect. Replaces any previously
    /// opened capture.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<()> {
        self.check_thread();
        let path = path.as_ref();
        let map = CaptureMap::open(path)?;
        let dialect = pcap_format::detect(map.data())?;

        let mut core = self.core.borrow_mut();
        match dialect {
            Dialect::Legacy { byte_swapped, .. } => {
                let header = pcap_format::parse_legacy_header(map.data(), byte_swapped)?;
                core.legacy_link_type = header.link_type;
                core.data_start = pcap_format::LEGACY_HEADER_LEN;
            }
            Dialect::NextGen { .. } => {
                // Block iteration handles the section header itself.
                core.data_start = 0;
            }
        }
        info!(
            path = %path.display(),
            bytes = map.data().len(),
            ?dialect,
            "capture mapped"
        );
        core.dialect = Some(dialect);
        core.cursor = core.data_start;
        core.interfaces.clear();
        core.finished = false;
        core.first_packet = true;
        core.map = Some(Rc::new(map));
        Ok(())
    }

    /// Puts the cursor back on the first packet so the capture can be
    /// replayed again.
    pub fn rewind(&self) {
        self.check_thread();
        let mut core = self.core.borrow_mut();
        core.cursor = core.data_start;
        core.interfaces.clear();
        core.finished = false;
        core.first_packet = true;
    }

    /// Registers a handler for UDP packets addressed to `port`. The port
    /// doubles as the subscription id.
    pub fn subscribe(&self, port: u16, handler: PacketHandler) -> Result<u16> {
        self.check_thread();
        let mut core = self.core.borrow_mut();
        if core.ports[port as usize].is_some() {
            return Err(Error::AddrInUse { port });
        }
        core.ports[port as usize] = Some(Rc::new(RefCell::new(handler)));
        Ok(port)
    }

    pub fn unsubscribe(&self, port: u16) -> Result<()> {
        self.check_thread();
        self.core.borrow_mut().ports[port as usize]
            .take()
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    /// Begins replay. In TIMED and FLOOD modes the first batch is
    /// scheduled as a zero-delay deferred task; in STEP mode the caller
    /// drives delivery one `step()` at a time.
    pub fn start(&self) {
        self.check_thread();
        {
            let mut core = self.core.borrow_mut();
            if core.map.is_none() {
                return;
            }
            core.first_packet = true;
        }
        if self.config.mode == ReplayMode::Step {
            return;
        }

        let reactor = self.reactor.clone();
        let core = self.core.clone();
        let config = self.config;
        self.reactor
            .run_in_loop(move || process_batch(&reactor, &core, config));
    }

    /// Delivers at most one packet. Returns false at end of file or, in
    /// TIMED mode, when the next packet is not yet due (a continuation
    /// timer is scheduled in that case).
    pub fn step(&self) -> bool {
        self.check_thread();
        step_once(&self.reactor, &self.core, self.config)
    }

    pub fn is_finished(&self) -> bool {
        self.core.borrow().finished
    }

    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    fn check_thread(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "PcapReplayer accessed from wrong thread"
        );
    }
}

/// One replay step. The state borrow is released before the handler runs
/// so handlers may subscribe, rewind, or schedule freely.
fn step_once(
    reactor: &Rc<Reactor>,
    core: &Rc<RefCell<ReplayCore>>,
    config: PcapConfig,
) -> bool {
    let action = {
        let mut state = core.borrow_mut();
        if state.finished {
            return false;
        }
        state.advance(config.mode, config.speed_multiplier)
    };

    match action {
        StepAction::Finished => false,
        StepAction::Wait { delay } => {
            let reactor_for_batch = reactor.clone();
            let core = core.clone();
            let _ = reactor.run_after(delay, move || {
                process_batch(&reactor_for_batch, &core, config)
            });
            false
        }
        StepAction::Delivered(None) => true,
        StepAction::Delivered(Some(dispatch)) => {
            let data = dispatch.map.data();
            let payload =
                &data[dispatch.payload_offset..dispatch.payload_offset + dispatch.payload_len];
            let stats = core.borrow().stats.clone();
            stats.packets_delivered.inc();
            stats.bytes_delivered.add(payload.len() as u64);
            (dispatch.handler.borrow_mut())(payload, PacketStatus::OK, dispatch.ts);
            true
        }
    }
}

/// Replays up to one batch worth of packets, then arranges its own
/// continuation: FLOOD yields through the deferred queue so the reactor
/// stays responsive, TIMED continues immediately only when the batch
/// limit cut it short (a future-packet wait has already armed a timer).
fn process_batch(reactor: &Rc<Reactor>, core: &Rc<RefCell<ReplayCore>>, config: PcapConfig) {
    let limit = if config.mode == ReplayMode::Flood {
        config.flood_batch_limit
    } else {
        config.base.batch_size
    };

    let mut processed = 0;
    while processed < limit {
        if !step_once(reactor, core, config) {
            return;
        }
        processed += 1;
    }

    if core.borrow().finished {
        return;
    }
    match config.mode {
        ReplayMode::Flood => {
            let reactor_for_batch = reactor.clone();
            let core = core.clone();
            reactor.run_in_loop(move || process_batch(&reactor_for_batch, &core, config));
        }
        ReplayMode::Timed => {
            let reactor_for_batch = reactor.clone();
            let core = core.clone();
            let _ = reactor.run_after(Duration::ZERO, move || {
                process_batch(&reactor_for_batch, &core, config)
            });
        }
        ReplayMode::Step => {}
    }
}
