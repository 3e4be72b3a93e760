//! Packet sources
//!
//! Two interchangeable sources feed the reactor:
//! - `UdpReceiver`: live kernel sockets drained in batches via `recvmmsg`
//! - `PcapReplayer`: memory-mapped capture files replayed by timestamp
//!
//! Both dispatch payloads to per-port handler closures with the same
//! signature, so consuming code does not care where packets came from.

mod arena;
mod pcap_format;

pub mod pcap;
pub mod udp;

pub use pcap::PcapReplayer;
pub use udp::UdpReceiver;

use std::cell::RefCell;
use std::rc::Rc;

/// Delivery status bits for a dispatched packet. `OK` is zero; further
/// bits beyond `TRUNCATED` are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketStatus(u32);

impl PacketStatus {
    pub const OK: Self = Self(0);
    pub const TRUNCATED: Self = Self(1);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_truncated(self) -> bool {
        self.0 & Self::TRUNCATED.0 != 0
    }
}

/// Packet timestamp: kernel receive time for live sockets (`{0, 0}` when
/// the ancillary message was absent), capture time for replayed files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketTimestamp {
    pub sec: i64,
    pub nsec: i64,
}

/// Per-port packet callback. The payload slice points into the source's
/// receive buffer or file mapping and is valid only for the duration of
/// the call; handlers must copy what they keep.
pub type PacketHandler = Box<dyn FnMut(&[u8], PacketStatus, PacketTimestamp)>;

/// Handler shared between a receiver's port table and the reactor's
/// dispatch records.
pub(crate) type SharedHandler = Rc<RefCell<PacketHandler>>;

/// Tuning for the batched receive path.
#[derive(Debug, Clone, Copy)]
pub struct ReceiverConfig {
    /// Per-receiver cap on subscribed sockets.
    pub max_fds: usize,
    /// Datagrams pulled per `recvmmsg` call.
    pub batch_size: usize,
    /// Capacity of one packet slot; larger datagrams are truncated.
    pub buffer_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_fds: 128,
            batch_size: 64,
            buffer_size: 2048,
        }
    }
}

/// How the replayer schedules packet delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayMode {
    /// Deliver no earlier than the capture timestamps dictate.
    #[default]
    Timed,
    /// Deliver as fast as possible, yielding to the reactor between
    /// batches.
    Flood,
    /// Deliver one packet per explicit `step()` call.
    Step,
}

/// Tuning for capture replay.
#[derive(Debug, Clone, Copy)]
pub struct PcapConfig {
    pub base: ReceiverConfig,
    pub mode: ReplayMode,
    /// Timestamp-delta divisor in TIMED mode; 2.0 replays twice as fast.
    pub speed_multiplier: f64,
    /// Packets per flood batch before yielding to the reactor.
    pub flood_batch_limit: usize,
}

impl Default for PcapConfig {
    fn default() -> Self {
        Self {
            base: ReceiverConfig::default(),
            mode: ReplayMode::Timed,
            speed_multiplier: 1.0,
            flood_batch_limit: 10_000,
        }
    }
}
