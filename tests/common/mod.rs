//! Shared fixtures: byte-exact frame and capture builders plus a
//! self-cleaning temp file wrapper.

#![allow(dead_code)]

use std::path::PathBuf;
use udpflow::{PacketStatus, PacketTimestamp};

/// Capture file written to the OS temp directory, removed on drop.
pub struct TempCapture {
    pub path: PathBuf,
}

impl TempCapture {
    pub fn write(name: &str, bytes: &[u8]) -> Self {
        let path = std::env::temp_dir().join(format!(
            "udpflow-test-{}-{}.pcap",
            std::process::id(),
            name
        ));
        std::fs::write(&path, bytes).expect("failed to write temp capture");
        Self { path }
    }
}

impl Drop for TempCapture {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One delivered packet as recorded by a test handler.
pub type Delivery = (Vec<u8>, PacketStatus, PacketTimestamp);

/// Emits `v` the way a capture writer of the given byte order would.
fn put_u32(out: &mut Vec<u8>, v: u32, swapped: bool) {
    let v = if swapped { v.swap_bytes() } else { v };
    out.extend_from_slice(&v.to_ne_bytes());
}

fn put_u16(out: &mut Vec<u8>, v: u16, swapped: bool) {
    let v = if swapped { v.swap_bytes() } else { v };
    out.extend_from_slice(&v.to_ne_bytes());
}

/// UDP-over-IPv4-over-Ethernet frame to `dst_port`.
pub fn udp_frame(dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]); // dst MAC
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]); // src MAC
    frame.extend_from_slice(&0x0800u16.to_be_bytes()); // IPv4

    let total_len = (20 + 8 + payload.len()) as u16;
    frame.extend_from_slice(&[0x45, 0x00]);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0x12, 0x34, 0x00, 0x00, 64, 17, 0, 0]);
    frame.extend_from_slice(&[192, 168, 0, 1]);
    frame.extend_from_slice(&[192, 168, 0, 2]);

    frame.extend_from_slice(&40_000u16.to_be_bytes()); // src port
    frame.extend_from_slice(&dst_port.to_be_bytes());
    frame.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes()); // checksum
    frame.extend_from_slice(payload);
    frame
}

/// Same datagram behind a Linux cooked v1 pseudo-header (DLT 113).
pub fn sll_udp_frame(dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&0u16.to_be_bytes()); // packet type: host
    frame.extend_from_slice(&1u16.to_be_bytes()); // ARPHRD_ETHER
    frame.extend_from_slice(&6u16.to_be_bytes()); // address length
    frame.extend_from_slice(&[0u8; 8]); // address + padding
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    // Reuse the Ethernet builder's L3/L4 part.
    let eth = udp_frame(dst_port, payload);
    frame.extend_from_slice(&eth[14..]);
    frame
}

/// One legacy capture record: timestamp plus the captured frame. The
/// sub-second field is microseconds or nanoseconds depending on the
/// file's magic.
pub struct LegacyPacket {
    pub ts_sec: u32,
    pub ts_sub: u32,
    pub frame: Vec<u8>,
    /// Defaults to the frame length; set differently to fake a capture
    /// that truncated the frame.
    pub orig_len: Option<u32>,
}

impl LegacyPacket {
    pub fn new(ts_sec: u32, ts_sub: u32, frame: Vec<u8>) -> Self {
        Self {
            ts_sec,
            ts_sub,
            frame,
            orig_len: None,
        }
    }
}

pub const DLT_ETHERNET: u32 = 1;
pub const DLT_LINUX_SLL: u32 = 113;

/// Builds a complete legacy pcap file.
pub fn legacy_pcap(
    nanosecond: bool,
    swapped: bool,
    link_type: u32,
    packets: &[LegacyPacket],
) -> Vec<u8> {
    let magic: u32 = if nanosecond { 0xA1B2_3C4D } else { 0xA1B2_C3D4 };
    let mut out = Vec::new();
    put_u32(&mut out, magic, swapped);
    put_u16(&mut out, 2, swapped); // version major
    put_u16(&mut out, 4, swapped); // version minor
    put_u32(&mut out, 0, swapped); // thiszone
    put_u32(&mut out, 0, swapped); // sigfigs
    put_u32(&mut out, 65_535, swapped); // snaplen
    put_u32(&mut out, link_type, swapped);

    for packet in packets {
        let cap_len = packet.frame.len() as u32;
        put_u32(&mut out, packet.ts_sec, swapped);
        put_u32(&mut out, packet.ts_sub, swapped);
        put_u32(&mut out, cap_len, swapped);
        put_u32(&mut out, packet.orig_len.unwrap_or(cap_len), swapped);
        out.extend_from_slice(&packet.frame);
    }
    out
}

/// One pcapng packet: 64-bit timestamp in interface resolution ticks.
pub struct NgPacket {
    pub interface_id: u32,
    pub ts_raw: u64,
    pub frame: Vec<u8>,
}

/// Builds a pcapng file with one Section Header, one Interface
/// Description (optionally carrying `if_tsresol`), and one Enhanced
/// Packet Block per packet.
pub fn pcapng(link_type: u32, tsresol: Option<u8>, packets: &[NgPacket]) -> Vec<u8> {
    let swapped = false;
    let mut out = Vec::new();

    // Section Header Block
    let shb_len = 28u32;
    put_u32(&mut out, 0x0A0D_0D0A, swapped);
    put_u32(&mut out, shb_len, swapped);
    put_u32(&mut out, 0x1A2B_3C4D, swapped); // byte-order magic
    put_u16(&mut out, 1, swapped); // version major
    put_u16(&mut out, 0, swapped); // version minor
    out.extend_from_slice(&u64::MAX.to_ne_bytes()); // section length: unknown
    put_u32(&mut out, shb_len, swapped);

    // Interface Description Block
    let options_len = if tsresol.is_some() { 8 + 4 } else { 0 };
    let idb_len = (8 + 8 + options_len + 4) as u32;
    put_u32(&mut out, 0x0000_0001, swapped);
    put_u32(&mut out, idb_len, swapped);
    put_u16(&mut out, link_type as u16, swapped);
    put_u16(&mut out, 0, swapped); // reserved
    put_u32(&mut out, 65_535, swapped); // snap len
    if let Some(resol) = tsresol {
        put_u16(&mut out, 9, swapped); // if_tsresol
        put_u16(&mut out, 1, swapped);
        out.extend_from_slice(&[resol, 0, 0, 0]); // value + pad
        put_u16(&mut out, 0, swapped); // opt_endofopt
        put_u16(&mut out, 0, swapped);
    }
    put_u32(&mut out, idb_len, swapped);

    // Enhanced Packet Blocks
    for packet in packets {
        let cap_len = packet.frame.len() as u32;
        let padded = (cap_len as usize + 3) & !3;
        let epb_len = (8 + 20 + padded + 4) as u32;
        put_u32(&mut out, 0x0000_0006, swapped);
        put_u32(&mut out, epb_len, swapped);
        put_u32(&mut out, packet.interface_id, swapped);
        put_u32(&mut out, (packet.ts_raw >> 32) as u32, swapped);
        put_u32(&mut out, packet.ts_raw as u32, swapped);
        put_u32(&mut out, cap_len, swapped);
        put_u32(&mut out, cap_len, swapped);
        out.extend_from_slice(&packet.frame);
        out.resize(out.len() + (padded - cap_len as usize), 0);
        put_u32(&mut out, epb_len, swapped);
    }
    out
}
