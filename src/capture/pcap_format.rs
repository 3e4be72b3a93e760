//! Capture-file dialects.
//!
//! Decoders for the legacy pcap container (microsecond and nanosecond
//! flavors, either endianness) and the pcapng block container (Section
//! Header, Interface Description and Enhanced Packet blocks; everything
//! else is skipped by length). All multi-byte fields are read through
//! `read_u16`/`read_u32`, which undo the writer's byte order when the
//! magic said the file is swapped relative to this host.

use crate::capture::PacketTimestamp;
use crate::error::{Error, Result};

pub(crate) const MAGIC_LEGACY_US: u32 = 0xA1B2_C3D4;
pub(crate) const MAGIC_LEGACY_US_SWAPPED: u32 = 0xD4C3_B2A1;
pub(crate) const MAGIC_LEGACY_NS: u32 = 0xA1B2_3C4D;
pub(crate) const MAGIC_LEGACY_NS_SWAPPED: u32 = 0x4D3C_2B1A;
pub(crate) const MAGIC_NEXT_GEN: u32 = 0x0A0D_0D0A;

pub(crate) const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;
pub(crate) const BYTE_ORDER_MAGIC_SWAPPED: u32 = 0x4D3C_2B1A;

pub(crate) const LEGACY_HEADER_LEN: usize = 24;
pub(crate) const LEGACY_RECORD_LEN: usize = 16;

pub(crate) const BLOCK_HEADER_LEN: usize = 8;
pub(crate) const BLOCK_SECTION_HEADER: u32 = 0x0A0D_0D0A;
pub(crate) const BLOCK_INTERFACE_DESCRIPTION: u32 = 0x0000_0001;
pub(crate) const BLOCK_ENHANCED_PACKET: u32 = 0x0000_0006;

/// Detected container dialect. `byte_swapped` means the writer's
/// byte order differs from this host's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    Legacy {
        byte_swapped: bool,
        nanosecond: bool,
    },
    NextGen {
        byte_swapped: bool,
    },
}

pub(crate) fn read_u16(data: &[u8], offset: usize, swapped: bool) -> u16 {
    let raw = u16::from_ne_bytes([data[offset], data[offset + 1]]);
    if swapped {
        raw.swap_bytes()
    } else {
        raw
    }
}

pub(crate) fn read_u32(data: &[u8], offset: usize, swapped: bool) -> u32 {
    let raw = u32::from_ne_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]);
    if swapped {
        raw.swap_bytes()
    } else {
        raw
    }
}

/// Classifies a capture by its first 32-bit magic. For pcapng the byte
/// order lives in the Section Header body (offset 8), not in the magic
/// itself, whose byte sequence reads the same either way.
pub(crate) fn detect(data: &[u8]) -> Result<Dialect> {
    if data.len() < 4 {
        return Err(Error::Format("capture shorter than a magic number".into()));
    }
    let magic = read_u32(data, 0, false);
    match magic {
        MAGIC_LEGACY_US => Ok(Dialect::Legacy {
            byte_swapped: false,
            nanosecond: false,
        }),
        MAGIC_LEGACY_US_SWAPPED => Ok(Dialect::Legacy {
            byte_swapped: true,
            nanosecond: false,
        }),
        MAGIC_LEGACY_NS => Ok(Dialect::Legacy {
            byte_swapped: false,
            nanosecond: true,
        }),
        MAGIC_LEGACY_NS_SWAPPED => Ok(Dialect::Legacy {
            byte_swapped: true,
            nanosecond: true,
        }),
        MAGIC_NEXT_GEN => {
            if data.len() < 12 {
                return Err(Error::Format("section header block truncated".into()));
            }
            match read_u32(data, 8, false) {
                BYTE_ORDER_MAGIC => Ok(Dialect::NextGen {
                    byte_swapped: false,
                }),
                BYTE_ORDER_MAGIC_SWAPPED => Ok(Dialect::NextGen { byte_swapped: true }),
                other => Err(Error::Format(format!(
                    "unknown byte-order magic {other:#010x}"
                ))),
            }
        }
        other => Err(Error::Format(format!("unknown capture magic {other:#010x}"))),
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LegacyHeader {
    pub link_type: u32,
}

/// Decodes the 24-byte legacy file header
/// `{magic, ver_major, ver_minor, thiszone, sigfigs, snaplen, network}`.
/// Only the link type matters for replay.
pub(crate) fn parse_legacy_header(data: &[u8], byte_swapped: bool) -> Result<LegacyHeader> {
    if data.len() < LEGACY_HEADER_LEN {
        return Err(Error::Format("legacy capture shorter than its header".into()));
    }
    Ok(LegacyHeader {
        link_type: read_u32(data, 20, byte_swapped),
    })
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LegacyRecord {
    pub ts_sec: u32,
    /// Microseconds or nanoseconds, per the file's magic.
    pub ts_sub: u32,
    pub cap_len: u32,
    pub orig_len: u32,
}

/// Decodes the 16-byte per-packet record at `offset`, or `None` when the
/// mapping ends first.
pub(crate) fn parse_legacy_record(
    data: &[u8],
    offset: usize,
    byte_swapped: bool,
) -> Option<LegacyRecord> {
    if offset + LEGACY_RECORD_LEN > data.len() {
        return None;
    }
    Some(LegacyRecord {
        ts_sec: read_u32(data, offset, byte_swapped),
        ts_sub: read_u32(data, offset + 4, byte_swapped),
        cap_len: read_u32(data, offset + 8, byte_swapped),
        orig_len: read_u32(data, offset + 12, byte_swapped),
    })
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockHeader {
    pub block_type: u32,
    pub total_len: u32,
}

pub(crate) fn parse_block_header(
    data: &[u8],
    offset: usize,
    byte_swapped: bool,
) -> Option<BlockHeader> {
    if offset + BLOCK_HEADER_LEN > data.len() {
        return None;
    }
    Some(BlockHeader {
        block_type: read_u32(data, offset, byte_swapped),
        total_len: read_u32(data, offset + 4, byte_swapped),
    })
}

/// One pcapng capture interface: its link layer and how to convert the
/// 64-bit packet timestamps into seconds.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InterfaceDescription {
    pub link_type: u32,
    pub ts_divisor: u64,
}

/// Ticks per second when no `if_tsresol` option is present.
const DEFAULT_TS_DIVISOR: u64 = 1_000_000;

/// Parses an Interface Description Block body (the block minus its
/// 8-byte header and 4-byte trailing length): `{link_type:u16, _:u16,
/// snap_len:u32}` followed by a 32-bit-aligned option list. Option 9
/// (`if_tsresol`, length 1) selects the timestamp resolution: high bit
/// set means 2^(v & 0x7F) ticks per second, otherwise 10^v.
pub(crate) fn parse_interface_description(
    body: &[u8],
    byte_swapped: bool,
) -> Option<InterfaceDescription> {
    if body.len() < 8 {
        return None;
    }
    let link_type = read_u16(body, 0, byte_swapped) as u32;
    let mut ts_divisor = DEFAULT_TS_DIVISOR;

    let mut offset = 8;
    while offset + 4 <= body.len() {
        let code = read_u16(body, offset, byte_swapped);
        let len = read_u16(body, offset + 2, byte_swapped) as usize;
        if code == 0 {
            break;
        }
        if offset + 4 + len > body.len() {
            break;
        }
        if code == 9 && len == 1 {
            let v = body[offset + 4];
            ts_divisor = if v & 0x80 != 0 {
                1u64.checked_shl(u32::from(v & 0x7F))
                    .unwrap_or(DEFAULT_TS_DIVISOR)
            } else {
                10u64
                    .checked_pow(u32::from(v))
                    .unwrap_or(DEFAULT_TS_DIVISOR)
            };
        }
        // Option values are padded to 32-bit boundaries.
        offset += 4 + ((len + 3) & !3);
    }

    Some(InterfaceDescription {
        link_type,
        ts_divisor,
    })
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct EnhancedPacket {
    pub interface_id: u32,
    pub ts_raw: u64,
    pub cap_len: u32,
    pub orig_len: u32,
    /// Packet bytes relative to the block start.
    pub data_offset: usize,
}

/// Parses an Enhanced Packet Block given the full block slice
/// (header included): `{interface_id, ts_high, ts_low, cap_len,
/// orig_len}` then `cap_len` packet bytes.
pub(crate) fn parse_enhanced_packet(block: &[u8], byte_swapped: bool) -> Option<EnhancedPacket> {
    const BODY_OFFSET: usize = BLOCK_HEADER_LEN;
    const DATA_OFFSET: usize = BODY_OFFSET + 20;
    if block.len() < DATA_OFFSET {
        return None;
    }
    let interface_id = read_u32(block, BODY_OFFSET, byte_swapped);
    let ts_high = read_u32(block, BODY_OFFSET + 4, byte_swapped);
    let ts_low = read_u32(block, BODY_OFFSET + 8, byte_swapped);
    let cap_len = read_u32(block, BODY_OFFSET + 12, byte_swapped);
    let orig_len = read_u32(block, BODY_OFFSET + 16, byte_swapped);

    if DATA_OFFSET + cap_len as usize > block.len() {
        return None;
    }

    Some(EnhancedPacket {
        interface_id,
        ts_raw: (u64::from(ts_high) << 32) | u64::from(ts_low),
        cap_len,
        orig_len,
        data_offset: DATA_OFFSET,
    })
}

/// Splits a raw interface-resolution timestamp into whole seconds and
/// nanoseconds.
pub(crate) fn split_timestamp(ts_raw: u64, ts_divisor: u64) -> PacketTimestamp {
    let divisor = ts_divisor.max(1);
    let sec = ts_raw / divisor;
    let rem = ts_raw % divisor;
    let nsec = (u128::from(rem) * 1_000_000_000 / u128::from(divisor)) as u64;
    PacketTimestamp {
        sec: sec as i64,
        nsec: nsec as i64,
    }
}
