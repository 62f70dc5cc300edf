// src/channel.rs

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::error::{ChannelError, Corruption};
use crate::frame::{Frame, StreamId};
use crate::layout::{
    frame_len, ChannelHeader, CACHE_LINE, CHANNEL_HEADER_SIZE, FRAME_HEADER_SIZE, MIN_DATA_AREA,
    PADDING_MARKER,
};

/// Per-process view of one SPSC ring placed at the start of a shared
/// segment.
///
/// Exactly one process writes and exactly one process reads over the
/// channel's lifetime; which is which is fixed by the embedder. All
/// operations are wait-free. Cross-process synchronization is carried
/// entirely by the two offsets in the shared [`ChannelHeader`]: the writer
/// publishes a record with a release store to `write_offset`, the reader
/// reclaims space with a release store to `read_offset`, and each side
/// acquire-loads the offset it does not own.
///
/// Records are framed as an 8-byte header (payload length, stream id, both
/// u32 little-endian) followed by the payload, rounded up to a cache-line
/// multiple. A length of [`PADDING_MARKER`] at the tail tells the reader to
/// resume at offset 0. The writer keeps at least one cache line free so
/// `read_offset == write_offset` always means "empty".
pub struct Channel {
    header: NonNull<ChannelHeader>,
    data: NonNull<u8>,
    size: u32,
}

// Safety: the raw pointers target shared memory; the SPSC protocol above
// is what makes cross-process access sound, and a Channel value itself is
// confined to one side of it.
unsafe impl Send for Channel {}

impl Channel {
    /// Initialize a ring in `segment_len` bytes at `base` and return the
    /// writer-side view. Must run once, before the peer attaches.
    ///
    /// # Safety
    /// - `base` must be valid for reads and writes of `segment_len` bytes
    ///   for the lifetime of every `Channel` attached to it, and be mapped
    ///   at the same address in both peers.
    /// - `base` must be cache-line aligned (any page-aligned mapping is).
    /// - No other `Channel` may be using the region yet.
    pub unsafe fn initialize(base: NonNull<u8>, segment_len: usize) -> Result<Channel, ChannelError> {
        let channel = Self::attach(base, segment_len)?;
        let header = channel.header();
        header.read_offset.store(0, Ordering::Relaxed);
        header.write_offset.store(0, Ordering::Release);
        Ok(channel)
    }

    /// Attach to a ring previously initialized at `base`, without touching
    /// the offsets. Used by the reader side (and by a writer re-deriving
    /// its view after fork).
    ///
    /// # Safety
    /// Same contract as [`Channel::initialize`], and the region must hold a
    /// ring initialized by the writer before any record is exchanged.
    pub unsafe fn attach(base: NonNull<u8>, segment_len: usize) -> Result<Channel, ChannelError> {
        debug_assert_eq!(base.as_ptr() as usize % CACHE_LINE as usize, 0);

        let header_len = CHANNEL_HEADER_SIZE as usize;
        let data_len = segment_len.saturating_sub(header_len);
        if data_len < MIN_DATA_AREA as usize || data_len % CACHE_LINE as usize != 0 {
            return Err(ChannelError::RegionTooSmall {
                size: data_len,
                min: MIN_DATA_AREA,
            });
        }
        let size = u32::try_from(data_len)
            .map_err(|_| ChannelError::RegionTooLarge { size: data_len })?;

        Ok(Channel {
            header: base.cast::<ChannelHeader>(),
            data: NonNull::new_unchecked(base.as_ptr().add(header_len)),
            size,
        })
    }

    #[inline]
    fn header(&self) -> &ChannelHeader {
        unsafe { self.header.as_ref() }
    }

    /// Usable data area size in bytes.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Largest payload `write` can ever accept.
    #[inline]
    pub fn max_payload(&self) -> u32 {
        self.size - FRAME_HEADER_SIZE
    }

    /// Current `(read_offset, write_offset)`, for diagnostics.
    pub fn offsets(&self) -> (u32, u32) {
        let header = self.header();
        (
            header.read_offset.load(Ordering::Acquire),
            header.write_offset.load(Ordering::Acquire),
        )
    }

    /// Largest contiguous free span in bytes.
    ///
    /// One cache line of the reported span is never usable: the writer
    /// keeps it free to disambiguate full from empty.
    pub fn available_write(&self) -> u32 {
        let header = self.header();
        let r = header.read_offset.load(Ordering::Acquire);
        let w = header.write_offset.load(Ordering::Acquire);

        if w >= r {
            (self.size - w).max(r)
        } else {
            r - w
        }
    }

    /// Append one record. Returns `Ok(false)` when the ring has no room;
    /// the caller retries after the reader catches up.
    pub fn write(&self, id: StreamId, payload: &[u8]) -> Result<bool, ChannelError> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|&len| len <= self.max_payload())
            .ok_or(ChannelError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload(),
            })?;
        let frame = frame_len(len);

        let header = self.header();
        let r = header.read_offset.load(Ordering::Acquire);
        let mut w = header.write_offset.load(Ordering::Relaxed);

        if w < r {
            // Wrapped: free span is r - w, minus the reserved line.
            if r - w < frame + CACHE_LINE {
                return Ok(false);
            }
        } else if w == self.size {
            // Unnormalised end offset; behave as wrapped-at-0.
            if r < frame + CACHE_LINE {
                return Ok(false);
            }
            w = 0;
        } else if self.size - w < frame {
            // Tail too short: pad it out and wrap.
            if r < frame + CACHE_LINE {
                return Ok(false);
            }
            unsafe { self.store_frame_header(w, PADDING_MARKER, 0) };
            w = 0;
        } else if self.size - w == frame && r == 0 {
            // An exact-tail write would land write_offset on read_offset
            // and the ring would read as empty.
            return Ok(false);
        }

        unsafe {
            self.store_frame_header(w, len, id.get());
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.data.as_ptr().add((w + FRAME_HEADER_SIZE) as usize),
                payload.len(),
            );
        }

        let mut new_w = w + frame;
        if new_w > self.size {
            return Err(Corruption::OffsetOutOfRange {
                offset: new_w,
                size: self.size,
            }
            .into());
        }
        if new_w == self.size {
            new_w = 0;
        }
        header.write_offset.store(new_w, Ordering::Release);
        Ok(true)
    }

    /// Non-destructive peek at the next record.
    ///
    /// Skips a padding marker by resuming at offset 0. Returns `Ok(None)`
    /// on an empty ring and `Err(ChannelError::Corrupt(..))` when the
    /// shared state violates the protocol. A peer that died mid-write can
    /// leave the ring in that state, and it cannot be drained further.
    pub fn peek(&self) -> Result<Option<Frame<'_>>, ChannelError> {
        let header = self.header();
        let r = header.read_offset.load(Ordering::Relaxed);
        let w = header.write_offset.load(Ordering::Acquire);

        if r == w {
            return Ok(None);
        }

        let mut offset = r;
        let (mut len, mut raw_id) = unsafe { self.load_frame_header(offset) };

        if len == PADDING_MARKER {
            offset = 0;
            if w == 0 {
                tracing::error!(read_offset = r, "padding marker with empty ring after wrap");
                return Err(Corruption::PaddingWithoutData.into());
            }
            let (next_len, next_id) = unsafe { self.load_frame_header(0) };
            if next_len == PADDING_MARKER {
                tracing::error!(read_offset = r, "consecutive padding markers");
                return Err(Corruption::ConsecutivePadding.into());
            }
            len = next_len;
            raw_id = next_id;
        }

        if offset as u64 + FRAME_HEADER_SIZE as u64 + len as u64 > self.size as u64 {
            tracing::error!(offset, len, size = self.size, "frame exceeds data area");
            return Err(Corruption::FrameOutOfBounds {
                offset,
                len,
                size: self.size,
            }
            .into());
        }

        let id = StreamId::new(raw_id).ok_or(Corruption::ZeroStreamId { offset })?;
        let payload = unsafe {
            std::slice::from_raw_parts(
                self.data.as_ptr().add((offset + FRAME_HEADER_SIZE) as usize),
                len as usize,
            )
        };

        Ok(Some(Frame { offset, id, payload }))
    }

    /// Release the record returned by the latest [`Channel::peek`], making
    /// its bytes reclaimable by the writer.
    pub fn consume(&self, frame: Frame<'_>) -> Result<(), ChannelError> {
        let frame_bytes = frame_len(frame.payload.len() as u32);
        let new_r = frame.offset as u64 + frame_bytes as u64;
        if new_r > self.size as u64 {
            return Err(Corruption::OffsetOutOfRange {
                offset: frame.offset,
                size: self.size,
            }
            .into());
        }

        let mut new_r = new_r as u32;
        if new_r == self.size {
            new_r = 0;
        }
        self.header().read_offset.store(new_r, Ordering::Release);
        Ok(())
    }

    #[inline]
    unsafe fn store_frame_header(&self, offset: u32, len: u32, raw_id: u32) {
        let p = self.data.as_ptr().add(offset as usize) as *mut u32;
        p.write(len.to_le());
        p.add(1).write(raw_id.to_le());
    }

    #[inline]
    unsafe fn load_frame_header(&self, offset: u32) -> (u32, u32) {
        let p = self.data.as_ptr().add(offset as usize) as *const u32;
        (u32::from_le(p.read()), u32::from_le(p.add(1).read()))
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (r, w) = self.offsets();
        f.debug_struct("Channel")
            .field("size", &self.size)
            .field("read_offset", &r)
            .field("write_offset", &w)
            .finish()
    }
}

// Static assertions: a Channel must be movable to the thread that drives it
static_assertions::assert_impl_all!(Channel: Send);
