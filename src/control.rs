// src/control.rs

use crate::error::ControlError;
use crate::frame::StreamId;
use crate::router::{StreamContext, StreamHandler};

/// A new-stream announcement carried on [`StreamId::CONTROL`].
///
/// The wire form is exactly 4 bytes: the announced id as a little-endian
/// u32. Ids 0 and 1 are reserved and never announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewStreamAnnouncement {
    id: StreamId,
}

impl NewStreamAnnouncement {
    pub fn new(id: StreamId) -> NewStreamAnnouncement {
        NewStreamAnnouncement { id }
    }

    /// The announced stream id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn encode(&self) -> [u8; 4] {
        self.id.get().to_le_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<NewStreamAnnouncement, ControlError> {
        let bytes: [u8; 4] = payload
            .try_into()
            .map_err(|_| ControlError::BadAnnouncementLength { len: payload.len() })?;
        let raw = u32::from_le_bytes(bytes);
        match StreamId::new(raw) {
            Some(id) if id != StreamId::CONTROL => Ok(NewStreamAnnouncement { id }),
            _ => Err(ControlError::ReservedId { id: raw }),
        }
    }
}

/// Ready-made control-stream handler that installs a handler for every
/// announced id.
///
/// Which handler gets installed is the embedder's policy, expressed as the
/// factory closure; the router core takes no position on it. Register one
/// of these at [`StreamId::CONTROL`] on the receiving side.
pub struct AnnouncementHandler<F> {
    factory: F,
}

impl<F> AnnouncementHandler<F>
where
    F: FnMut(StreamId) -> Box<dyn StreamHandler>,
{
    pub fn new(factory: F) -> AnnouncementHandler<F> {
        AnnouncementHandler { factory }
    }
}

impl<F> StreamHandler for AnnouncementHandler<F>
where
    F: FnMut(StreamId) -> Box<dyn StreamHandler>,
{
    fn on_read(&mut self, ctx: &mut StreamContext<'_>, payload: &[u8]) {
        match NewStreamAnnouncement::decode(payload) {
            Ok(announcement) => {
                let id = announcement.id();
                tracing::debug!(stream_id = id.get(), "peer announced new stream");
                ctx.install(id, (self.factory)(id));
            }
            Err(error) => {
                tracing::warn!(%error, len = payload.len(), "malformed announcement dropped");
            }
        }
    }
}
