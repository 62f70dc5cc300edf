//! Cross-process message passing over fork-inherited shared memory.
//!
//! The substrate is a lock-free SPSC byte ring ([`Channel`]) placed at the
//! start of a shared [`Segment`], carrying variable-sized framed records
//! addressed by [`StreamId`]. A [`Router`] pairs one ring per direction,
//! demultiplexes inbound records to registered [`StreamHandler`]s, and
//! detects peer exit through an out-of-band [`Notifier`] fd. The hot path
//! makes no kernel transitions.

pub mod layout;
pub mod segment;
pub mod notifier;
pub mod frame;
pub mod channel;
pub mod error;
pub mod control;
pub mod router;

pub use channel::Channel;
pub use control::{AnnouncementHandler, NewStreamAnnouncement};
pub use error::{ChannelError, ControlError, Corruption, RouterError};
pub use frame::{Frame, StreamId};
pub use notifier::Notifier;
pub use router::{Drain, Router, RouterMetrics, StreamContext, StreamHandler};
pub use segment::Segment;
