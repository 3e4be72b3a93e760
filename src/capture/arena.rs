//! Receive-slot arena backing the batched read path.
//!
//! One anonymous mapping holds `batch_size` slots, each starting on a
//! 64-byte boundary so payloads land cache-line aligned. Huge pages are
//! tried first (the mapping is rounded up to the 2 MiB huge-page size),
//! with plain pages as the fallback.

use crate::error::{Error, Result};
use std::ptr;
use std::slice;
use tracing::debug;

const CACHE_LINE: usize = 64;
const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

pub(crate) struct PacketArena {
    base: *mut u8,
    mapped_len: usize,
    stride: usize,
    slot_capacity: usize,
    slots: usize,
}

impl PacketArena {
    pub fn new(slots: usize, slot_capacity: usize) -> Result<Self> {
        if slots == 0 || slot_capacity == 0 {
            return Err(Error::InvalidArg("batch_size and buffer_size must be non-zero"));
        }

        let stride = (slot_capacity + CACHE_LINE - 1) & !(CACHE_LINE - 1);
        let total = slots * stride;
        let mapped_len = (total + HUGE_PAGE_SIZE - 1) & !(HUGE_PAGE_SIZE - 1);

        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let mut base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_len,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            debug!("huge page allocation failed, falling back to regular pages");
            base = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    mapped_len,
                    prot,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                return Err(Error::last_os());
            }
        }

        Ok(Self {
            base: base as *mut u8,
            mapped_len,
            stride,
            slot_capacity,
            slots,
        })
    }

    /// Start of slot `i`, 64-byte aligned. The kernel writes here during
    /// a batched receive; dispatch reads from it afterwards. The two
    /// never overlap because everything runs on one thread.
    pub fn slot_ptr(&self, i: usize) -> *mut u8 {
        debug_assert!(i < self.slots);
        unsafe { self.base.add(i * self.stride) }
    }

    /// Slot `i` as a slice of `len` bytes, capped at the slot capacity.
    /// Bytes beyond a previous shorter datagram are stale, which is why
    /// the cap matters for truncated reads.
    pub fn slot(&self, i: usize, len: usize) -> &[u8] {
        let len = len.min(self.slot_capacity);
        unsafe { slice::from_raw_parts(self.slot_ptr(i), len) }
    }

    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }
}

impl Drop for PacketArena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.mapped_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_cache_line_aligned() {
        let arena = PacketArena::new(4, 100).unwrap();
        for i in 0..4 {
            assert_eq!(arena.slot_ptr(i) as usize % CACHE_LINE, 0);
        }
    }

    #[test]
    fn test_slot_len_capped_at_capacity() {
        let arena = PacketArena::new(2, 100).unwrap();
        assert_eq!(arena.slot(0, 150).len(), 100);
        assert_eq!(arena.slot(0, 40).len(), 40);
    }

    #[test]
    fn test_zero_config_rejected() {
        assert!(PacketArena::new(0, 2048).is_err());
        assert!(PacketArena::new(64, 0).is_err());
    }

    #[test]
    fn test_slots_do_not_overlap() {
        let arena = PacketArena::new(2, 64);
        let arena = arena.unwrap();
        unsafe {
            arena.slot_ptr(0).write_bytes(0xAA, 64);
            arena.slot_ptr(1).write_bytes(0xBB, 64);
        }
        assert!(arena.slot(0, 64).iter().all(|&b| b == 0xAA));
        assert!(arena.slot(1, 64).iter().all(|&b| b == 0xBB));
    }
}
