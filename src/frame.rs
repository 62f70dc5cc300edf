// src/frame.rs

use std::fmt;
use std::num::NonZeroU32;

/// Identifier of one logical stream within a router.
///
/// Id 0 is reserved on the wire (padding frames) and is unrepresentable
/// here; id 1 is the control stream by convention.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(NonZeroU32);

impl StreamId {
    /// The control / new-stream-announcement stream.
    pub const CONTROL: StreamId = StreamId(NonZeroU32::MIN);

    /// First id handed out by the router's allocator.
    pub(crate) const FIRST_DYNAMIC: u32 = 2;

    /// Create a stream id. Returns `None` for the reserved value 0.
    pub fn new(raw: u32) -> Option<StreamId> {
        NonZeroU32::new(raw).map(StreamId)
    }

    /// The raw wire value.
    #[inline]
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One record peeked from a ring, valid until consumed.
///
/// The payload borrows the ring's data area directly; handlers that need
/// the bytes past the call must copy them.
#[derive(Debug)]
pub struct Frame<'ring> {
    pub(crate) offset: u32,
    pub(crate) id: StreamId,
    pub(crate) payload: &'ring [u8],
}

impl<'ring> Frame<'ring> {
    /// Stream the record belongs to.
    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// The record's payload bytes, in place in the ring.
    #[inline]
    pub fn payload(&self) -> &'ring [u8] {
        self.payload
    }

    /// Offset of the frame header within the data area.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }
}
