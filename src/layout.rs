// src/layout.rs

use std::sync::atomic::AtomicU32;

/// Alignment granularity for frames and for the separation of the two ring
/// offsets. Fixed at 64 bytes; both peers must be compiled with the same
/// value.
pub const CACHE_LINE: u32 = 64;

/// Size of the on-ring frame header: payload length (u32 LE) + stream id
/// (u32 LE).
pub const FRAME_HEADER_SIZE: u32 = 8;

/// Length-field value marking a padding frame. The reader resumes at
/// offset 0 when it sees this.
pub const PADDING_MARKER: u32 = u32::MAX;

/// Smallest usable data area a ring will accept.
pub const MIN_DATA_AREA: u32 = 4 * CACHE_LINE;

/// Shared ring header, placed at offset 0 of the segment (128 bytes).
///
/// Only the two offsets live in shared memory. Each occupies its own cache
/// line so the reader and writer never contend on the same line. The data
/// pointer and size are per-process state (see `Channel`); no pointer
/// stored here would be valid in both processes.
#[repr(C, align(64))]
pub struct ChannelHeader {
    /// Owned by the reader; the writer only loads it.
    pub read_offset: AtomicU32,
    _pad0: [u8; 60],
    /// Owned by the writer; the reader only loads it.
    pub write_offset: AtomicU32,
    _pad1: [u8; 60],
}

/// Size of the shared header, already a cache-line multiple.
pub const CHANNEL_HEADER_SIZE: u32 = std::mem::size_of::<ChannelHeader>() as u32;

// Compile-time layout checks
const _: () = {
    assert!(std::mem::size_of::<ChannelHeader>() == 128);
    assert!(std::mem::align_of::<ChannelHeader>() == 64);
    assert!(CHANNEL_HEADER_SIZE % CACHE_LINE == 0);
    assert!(MIN_DATA_AREA % CACHE_LINE == 0);
};

/// Round `n` up to the next cache-line multiple.
#[inline]
pub const fn align_up(n: u32) -> u32 {
    (n + (CACHE_LINE - 1)) & !(CACHE_LINE - 1)
}

/// Total bytes one record occupies in the data area.
#[inline]
pub const fn frame_len(payload_len: u32) -> u32 {
    align_up(FRAME_HEADER_SIZE + payload_len)
}
