//! Error types for the ring, the router, and the control stream.

use core::fmt;

/// Errors surfaced by [`Channel`](crate::channel::Channel) operations.
///
/// Transient pressure (ring full) is not an error; `write` reports it as
/// `Ok(false)`. Everything here is either a programming error or ring
/// corruption, and a corrupt ring cannot be safely drained further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The data area left after the shared header is too small or not a
    /// cache-line multiple.
    RegionTooSmall { size: usize, min: u32 },
    /// The data area does not fit the ring's 32-bit offsets.
    RegionTooLarge { size: usize },
    /// Payload can never fit in this ring.
    PayloadTooLarge { len: usize, max: u32 },
    /// The shared state violates the ring protocol.
    Corrupt(Corruption),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegionTooSmall { size, min } => {
                write!(f, "data area of {size} bytes is below the {min}-byte minimum")
            }
            Self::RegionTooLarge { size } => {
                write!(f, "data area of {size} bytes exceeds the 32-bit offset range")
            }
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload of {len} bytes exceeds ring maximum {max}")
            }
            Self::Corrupt(c) => write!(f, "ring corrupted: {c}"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<Corruption> for ChannelError {
    fn from(c: Corruption) -> Self {
        Self::Corrupt(c)
    }
}

/// The specific protocol violation found in shared state.
///
/// Any of these can be produced by a peer that crashed mid-write or by a
/// misbehaving peer; the ring is poisoned either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// A padding marker at the tail was followed by another padding marker
    /// at offset 0.
    ConsecutivePadding,
    /// A padding marker was present but the ring held no record after the
    /// wrap.
    PaddingWithoutData,
    /// A frame's declared payload runs past the end of the data area.
    FrameOutOfBounds { offset: u32, len: u32, size: u32 },
    /// An offset landed outside the data area.
    OffsetOutOfRange { offset: u32, size: u32 },
    /// A live (non-padding) frame carried the reserved stream id 0.
    ZeroStreamId { offset: u32 },
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConsecutivePadding => write!(f, "consecutive padding markers"),
            Self::PaddingWithoutData => write!(f, "padding marker with no record after wrap"),
            Self::FrameOutOfBounds { offset, len, size } => {
                write!(f, "frame at {offset} with {len}-byte payload exceeds data area of {size}")
            }
            Self::OffsetOutOfRange { offset, size } => {
                write!(f, "offset {offset} outside data area of {size}")
            }
            Self::ZeroStreamId { offset } => {
                write!(f, "live frame at {offset} carries reserved stream id 0")
            }
        }
    }
}

impl std::error::Error for Corruption {}

/// Errors surfaced by [`Router`](crate::router::Router) operations.
#[derive(Debug)]
pub enum RouterError {
    /// An underlying ring failed.
    Channel(ChannelError),
    /// The requested stream id is already bound to a handler.
    StreamBound { id: u32 },
    /// Both `on_read` and `on_error` of a handler faulted on the same
    /// frame. The frame was consumed; the router should not be driven
    /// further.
    HandlerAbort { id: u32 },
    /// The outbound ring was full while writing a control-stream message.
    /// The handshake cannot block forever; callers prearrange with
    /// `available_write`.
    ControlBackpressure,
    /// The notifier file descriptor failed.
    Io(std::io::Error),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(e) => write!(f, "channel error: {e}"),
            Self::StreamBound { id } => write!(f, "stream id {id} already has a handler"),
            Self::HandlerAbort { id } => {
                write!(f, "handler for stream {id} faulted in both on_read and on_error")
            }
            Self::ControlBackpressure => {
                write!(f, "outbound ring full on the control stream")
            }
            Self::Io(e) => write!(f, "notifier I/O error: {e}"),
        }
    }
}

impl std::error::Error for RouterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Channel(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ChannelError> for RouterError {
    fn from(e: ChannelError) -> Self {
        Self::Channel(e)
    }
}

impl From<std::io::Error> for RouterError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Errors decoding control-stream payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// A new-stream announcement was not exactly 4 bytes.
    BadAnnouncementLength { len: usize },
    /// An announcement named a reserved id (0 or the control stream).
    ReservedId { id: u32 },
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadAnnouncementLength { len } => {
                write!(f, "announcement is {len} bytes, expected 4")
            }
            Self::ReservedId { id } => write!(f, "announcement names reserved id {id}"),
        }
    }
}

impl std::error::Error for ControlError {}
