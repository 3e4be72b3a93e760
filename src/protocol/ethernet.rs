//! Ethernet frame parsing

use super::ETHERTYPE_VLAN;
use crate::{Error, Result};

/// Minimum Ethernet frame size (without FCS)
pub const HEADER_SIZE: usize = 14;
/// Header size with a single 802.1Q tag
pub const TAGGED_HEADER_SIZE: usize = 18;

/// Parsed Ethernet frame (zero-copy reference)
#[derive(Debug)]
pub struct Frame<'a> {
    buffer: &'a [u8],
    vlan_id: Option<u16>,
    payload_offset: usize,
}

impl<'a> Frame<'a> {
    /// Parse an Ethernet frame from a buffer. A single 802.1Q tag is
    /// stepped over; the effective EtherType is then the tag's inner one.
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("frame too short"));
        }

        let ethertype = u16::from_be_bytes([buffer[12], buffer[13]]);
        let (vlan_id, payload_offset) = if ethertype == ETHERTYPE_VLAN {
            if buffer.len() < TAGGED_HEADER_SIZE {
                return Err(Error::Parse("VLAN frame too short"));
            }
            let tci = u16::from_be_bytes([buffer[14], buffer[15]]);
            (Some(tci & 0x0FFF), TAGGED_HEADER_SIZE)
        } else {
            (None, HEADER_SIZE)
        };

        Ok(Self {
            buffer,
            vlan_id,
            payload_offset,
        })
    }

    pub fn dst_mac(&self) -> [u8; 6] {
        self.buffer[0..6].try_into().unwrap()
    }

    pub fn src_mac(&self) -> [u8; 6] {
        self.buffer[6..12].try_into().unwrap()
    }

    /// The EtherType governing the payload; for tagged frames this is
    /// the inner type at offset 16, not the tag marker.
    pub fn ethertype(&self) -> u16 {
        let offset = if self.vlan_id.is_some() { 16 } else { 12 };
        u16::from_be_bytes([self.buffer[offset], self.buffer[offset + 1]])
    }

    pub fn vlan_id(&self) -> Option<u16> {
        self.vlan_id
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buffer[self.payload_offset..]
    }
}
