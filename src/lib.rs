//! udpflow - batched UDP ingestion for Linux
//!
//! A single-threaded reactor multiplexing socket readiness and monotonic
//! timers, with two interchangeable packet sources: live UDP sockets
//! drained with `recvmmsg`, and memory-mapped pcap/pcapng captures
//! replayed at original pace, scaled speed, or as fast as possible.

pub mod capture;
pub mod config;
pub mod error;
pub mod protocol;
pub mod reactor;
pub mod telemetry;

pub use capture::{
    PacketHandler, PacketStatus, PacketTimestamp, PcapConfig, PcapReplayer, ReceiverConfig,
    ReplayMode, UdpReceiver,
};
pub use error::{Error, Result};
pub use reactor::{Reactor, TimerId};
