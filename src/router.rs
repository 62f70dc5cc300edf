// src/router.rs

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::channel::Channel;
use crate::control::NewStreamAnnouncement;
use crate::error::{ChannelError, RouterError};
use crate::frame::StreamId;
use crate::notifier::Notifier;

/// Per-stream callback pair.
///
/// `on_read` receives every record for the stream, in ring order; a
/// zero-length payload is the stream-close convention and the router
/// unregisters the handler after delivering it. A panic in `on_read` is
/// contained and routed to `on_error` with the same bytes; a panic in
/// `on_error` aborts the router.
///
/// Payload slices point into the ring and are valid only for the duration
/// of the call; copy what must outlive it.
pub trait StreamHandler {
    fn on_read(&mut self, ctx: &mut StreamContext<'_>, payload: &[u8]);

    fn on_error(&mut self, ctx: &mut StreamContext<'_>, payload: &[u8]) {
        tracing::warn!(
            stream_id = ctx.stream.get(),
            len = payload.len(),
            "stream handler fault, record dropped"
        );
    }
}

/// Capability handed to a handler while it runs.
///
/// Registry mutations are deferred: installs and removals requested here
/// take effect once the current record has been consumed, before the next
/// record is dispatched.
pub struct StreamContext<'r> {
    stream: StreamId,
    outbound: &'r Channel,
    installs: &'r mut Vec<(StreamId, Box<dyn StreamHandler>)>,
    removals: &'r mut Vec<StreamId>,
    stop: &'r mut bool,
}

impl StreamContext<'_> {
    /// The stream the current record arrived on.
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Register a handler for `id` once the current dispatch completes.
    pub fn install(&mut self, id: StreamId, handler: Box<dyn StreamHandler>) {
        self.installs.push((id, handler));
    }

    /// Remove the handler for `id` once the current dispatch completes.
    pub fn unregister(&mut self, id: StreamId) {
        self.removals.push(id);
    }

    /// Write a record on the outbound ring. Same contract as
    /// [`Channel::write`].
    pub fn write(&self, id: StreamId, payload: &[u8]) -> Result<bool, ChannelError> {
        self.outbound.write(id, payload)
    }

    /// Stop the drain loop after the current record is consumed.
    pub fn stop(&mut self) {
        *self.stop = true;
    }
}

/// Why [`Router::process_reads`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// The inbound ring is empty.
    Empty,
    /// A handler called [`StreamContext::stop`]; records may remain queued.
    Stopped,
    /// The notifier reports the peer has exited. The inbound ring is empty
    /// and will stay that way.
    PeerGone,
}

/// Duplex endpoint multiplexing logical streams over two rings.
///
/// One router lives in each process, built from the channel it writes and
/// the channel its peer writes. The router owns the handler registry and
/// the id allocator; none of that state is shared with the peer. Routers
/// are single-threaded by design: nothing here spawns or locks.
pub struct Router {
    outbound: Channel,
    inbound: Channel,
    notifier: Option<Notifier>,
    handlers: HashMap<u32, Box<dyn StreamHandler>>,
    next_id: u32,
    name: Option<String>,
    metrics: Option<Arc<RouterMetrics>>,
}

impl Router {
    /// Build a router from the channel this process writes and the channel
    /// it reads.
    pub fn new(outbound: Channel, inbound: Channel, notifier: Option<Notifier>) -> Router {
        Router {
            outbound,
            inbound,
            notifier,
            handlers: HashMap::new(),
            next_id: StreamId::FIRST_DYNAMIC,
            name: None,
            metrics: None,
        }
    }

    /// Attach a name used in log fields.
    pub fn with_name(mut self, name: impl Into<String>) -> Router {
        self.name = Some(name.into());
        self
    }

    /// Attach a metrics instance.
    pub fn set_metrics(&mut self, metrics: Arc<RouterMetrics>) {
        self.metrics = Some(metrics);
    }

    /// Allocate the next free id and bind `handler` to it.
    ///
    /// Ids start at 2 (1 is the control stream) and are never reused, even
    /// after `unregister_handler`.
    pub fn register_handler(&mut self, handler: Box<dyn StreamHandler>) -> StreamId {
        loop {
            let raw = self.next_id;
            self.next_id += 1;
            if !self.handlers.contains_key(&raw) {
                self.handlers.insert(raw, handler);
                tracing::debug!(router = ?self.name, stream_id = raw, "stream registered");
                return StreamId::new(raw).expect("next_id is always >= 2");
            }
        }
    }

    /// Bind `handler` to a specific id, typically [`StreamId::CONTROL`].
    pub fn register_handler_at(
        &mut self,
        id: StreamId,
        handler: Box<dyn StreamHandler>,
    ) -> Result<(), RouterError> {
        if self.handlers.contains_key(&id.get()) {
            return Err(RouterError::StreamBound { id: id.get() });
        }
        self.handlers.insert(id.get(), handler);
        tracing::debug!(router = ?self.name, stream_id = id.get(), "stream registered");
        Ok(())
    }

    /// Remove the handler for `id`, returning it if one was bound.
    ///
    /// Records for `id` already staged in the ring fall to the unknown-id
    /// sink when drained.
    pub fn unregister_handler(&mut self, id: StreamId) -> Option<Box<dyn StreamHandler>> {
        let removed = self.handlers.remove(&id.get());
        if removed.is_some() {
            tracing::debug!(router = ?self.name, stream_id = id.get(), "stream unregistered");
        }
        removed
    }

    /// Whether a handler is bound for `id`.
    pub fn is_registered(&self, id: StreamId) -> bool {
        self.handlers.contains_key(&id.get())
    }

    /// Append one record to the outbound ring and wake the peer.
    ///
    /// `Ok(false)` means the ring is full and the caller retries. On the
    /// control stream backpressure would stall the handshake, so it is
    /// surfaced as an error instead.
    pub fn write(&self, id: StreamId, payload: &[u8]) -> Result<bool, RouterError> {
        match self.outbound.write(id, payload)? {
            true => {
                if let Some(notifier) = &self.notifier {
                    notifier.signal()?;
                }
                Ok(true)
            }
            false if id == StreamId::CONTROL => Err(RouterError::ControlBackpressure),
            false => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_full_write();
                }
                Ok(false)
            }
        }
    }

    /// Outbound headroom in bytes, for prearranging control writes.
    pub fn available_write(&self) -> u32 {
        self.outbound.available_write()
    }

    /// Announce a new stream to the peer on the control stream.
    ///
    /// The peer's control handler decides what handler to install for the
    /// announced id; see [`AnnouncementHandler`](crate::control::AnnouncementHandler).
    pub fn announce_stream(&self, id: StreamId) -> Result<(), RouterError> {
        let bytes = NewStreamAnnouncement::new(id).encode();
        self.write(StreamId::CONTROL, &bytes)?;
        Ok(())
    }

    /// Drain the inbound ring, dispatching each record to its handler.
    ///
    /// Records are consumed even when handlers fault, so the ring keeps
    /// moving. Returns when the ring is empty, a handler stops the drain,
    /// or the peer is gone.
    pub fn process_reads(&mut self) -> Result<Drain, RouterError> {
        if let Some(notifier) = &self.notifier {
            notifier.drain()?;
        }

        let mut installs: Vec<(StreamId, Box<dyn StreamHandler>)> = Vec::new();
        let mut removals: Vec<StreamId> = Vec::new();

        loop {
            let frame = match self.inbound.peek()? {
                Some(frame) => frame,
                None => {
                    if let Some(notifier) = &self.notifier {
                        if notifier.peer_closed()? {
                            tracing::debug!(router = ?self.name, "peer exited");
                            return Ok(Drain::PeerGone);
                        }
                    }
                    return Ok(Drain::Empty);
                }
            };

            let raw_id = frame.id().get();
            let payload = frame.payload();
            let close = payload.is_empty();
            let mut stop = false;
            let mut aborted = false;

            match self.handlers.get_mut(&raw_id) {
                Some(handler) => {
                    let mut ctx = StreamContext {
                        stream: frame.id(),
                        outbound: &self.outbound,
                        installs: &mut installs,
                        removals: &mut removals,
                        stop: &mut stop,
                    };
                    let delivered =
                        catch_unwind(AssertUnwindSafe(|| handler.on_read(&mut ctx, payload)));
                    if delivered.is_err() {
                        if let Some(metrics) = &self.metrics {
                            metrics.record_handler_fault();
                        }
                        tracing::warn!(
                            router = ?self.name,
                            stream_id = raw_id,
                            len = payload.len(),
                            "on_read faulted, routing record to on_error"
                        );
                        let recovered =
                            catch_unwind(AssertUnwindSafe(|| handler.on_error(&mut ctx, payload)));
                        aborted = recovered.is_err();
                    } else if let Some(metrics) = &self.metrics {
                        metrics.record_delivery();
                    }
                }
                None => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_unknown_stream();
                    }
                    tracing::warn!(
                        router = ?self.name,
                        stream_id = raw_id,
                        len = payload.len(),
                        "record for unregistered stream discarded"
                    );
                }
            }

            self.inbound.consume(frame)?;

            if aborted {
                return Err(RouterError::HandlerAbort { id: raw_id });
            }

            if close && self.handlers.remove(&raw_id).is_some() {
                if let Some(metrics) = &self.metrics {
                    metrics.record_stream_close();
                }
                tracing::debug!(router = ?self.name, stream_id = raw_id, "stream closed by peer");
            }

            for id in removals.drain(..) {
                self.handlers.remove(&id.get());
            }
            for (id, handler) in installs.drain(..) {
                if self.handlers.contains_key(&id.get()) {
                    tracing::warn!(
                        router = ?self.name,
                        stream_id = id.get(),
                        "deferred install for an already-bound stream ignored"
                    );
                    continue;
                }
                self.handlers.insert(id.get(), handler);
            }

            if stop {
                return Ok(Drain::Stopped);
            }
        }
    }

    /// The notifier fd, for the embedder's poll loop.
    pub fn file_descriptor(&self) -> Option<RawFd> {
        self.notifier.as_ref().map(|n| n.as_raw_fd())
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("streams", &self.handlers.len())
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

/// Counters for router activity.
///
/// Useful when diagnosing a peer that floods unknown ids or a handler that
/// keeps faulting.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    /// Records delivered to a registered handler's `on_read`.
    pub deliveries: AtomicU64,
    /// Records dropped by the unknown-id sink.
    pub unknown_streams: AtomicU64,
    /// `on_read` faults routed to `on_error`.
    pub handler_faults: AtomicU64,
    /// Streams closed by a zero-length record.
    pub stream_closes: AtomicU64,
    /// Writes that found the outbound ring full.
    pub full_writes: AtomicU64,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_delivery(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_stream(&self) {
        self.unknown_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_fault(&self) {
        self.handler_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_close(&self) {
        self.stream_closes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_full_write(&self) {
        self.full_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Format a one-line summary of all counters.
    pub fn summary(&self) -> String {
        format!(
            "RouterMetrics {{ delivered: {}, unknown: {}, faults: {}, closes: {}, full_writes: {} }}",
            self.deliveries.load(Ordering::Relaxed),
            self.unknown_streams.load(Ordering::Relaxed),
            self.handler_faults.load(Ordering::Relaxed),
            self.stream_closes.load(Ordering::Relaxed),
            self.full_writes.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use std::cell::RefCell;
    use std::rc::Rc;

    const SEGMENT_LEN: usize = 4096;

    // Two segments, one ring per direction. Returns (left, right) routers
    // plus the segments that must outlive them.
    fn duplex() -> (Segment, Segment, Router, Router) {
        let seg_ab = Segment::anonymous(SEGMENT_LEN).unwrap();
        let seg_ba = Segment::anonymous(SEGMENT_LEN).unwrap();

        let a_out = unsafe { Channel::initialize(seg_ab.addr(), seg_ab.len()) }.unwrap();
        let b_in = unsafe { Channel::attach(seg_ab.addr(), seg_ab.len()) }.unwrap();
        let b_out = unsafe { Channel::initialize(seg_ba.addr(), seg_ba.len()) }.unwrap();
        let a_in = unsafe { Channel::attach(seg_ba.addr(), seg_ba.len()) }.unwrap();

        let a = Router::new(a_out, a_in, None).with_name("a");
        let b = Router::new(b_out, b_in, None).with_name("b");
        (seg_ab, seg_ba, a, b)
    }

    #[derive(Default)]
    struct Log {
        reads: Vec<Vec<u8>>,
        errors: Vec<Vec<u8>>,
    }

    struct Recorder {
        log: Rc<RefCell<Log>>,
        panic_on_read: bool,
        panic_on_error: bool,
    }

    impl Recorder {
        fn new(log: Rc<RefCell<Log>>) -> Box<Recorder> {
            Box::new(Recorder {
                log,
                panic_on_read: false,
                panic_on_error: false,
            })
        }
    }

    impl StreamHandler for Recorder {
        fn on_read(&mut self, _ctx: &mut StreamContext<'_>, payload: &[u8]) {
            if self.panic_on_read {
                panic!("on_read fault");
            }
            self.log.borrow_mut().reads.push(payload.to_vec());
        }

        fn on_error(&mut self, _ctx: &mut StreamContext<'_>, payload: &[u8]) {
            if self.panic_on_error {
                panic!("on_error fault");
            }
            self.log.borrow_mut().errors.push(payload.to_vec());
        }
    }

    fn sid(raw: u32) -> StreamId {
        StreamId::new(raw).unwrap()
    }

    #[test]
    fn ids_allocate_from_two_and_never_repeat() {
        let (_sa, _sb, mut a, _b) = duplex();
        let log = Rc::new(RefCell::new(Log::default()));

        let first = a.register_handler(Recorder::new(log.clone()));
        let second = a.register_handler(Recorder::new(log.clone()));
        assert_eq!(first.get(), 2);
        assert_eq!(second.get(), 3);

        a.unregister_handler(first);
        let third = a.register_handler(Recorder::new(log));
        assert_eq!(third.get(), 4);
    }

    #[test]
    fn register_at_rejects_bound_id() {
        let (_sa, _sb, mut a, _b) = duplex();
        let log = Rc::new(RefCell::new(Log::default()));

        a.register_handler_at(sid(7), Recorder::new(log.clone())).unwrap();
        let err = a.register_handler_at(sid(7), Recorder::new(log)).unwrap_err();
        assert!(matches!(err, RouterError::StreamBound { id: 7 }));
    }

    #[test]
    fn allocator_skips_manually_bound_ids() {
        let (_sa, _sb, mut a, _b) = duplex();
        let log = Rc::new(RefCell::new(Log::default()));

        a.register_handler_at(sid(2), Recorder::new(log.clone())).unwrap();
        let id = a.register_handler(Recorder::new(log));
        assert_eq!(id.get(), 3);
    }

    #[test]
    fn records_reach_their_handler_in_order() {
        let (_sa, _sb, a, mut b) = duplex();
        let log = Rc::new(RefCell::new(Log::default()));
        b.register_handler_at(sid(2), Recorder::new(log.clone())).unwrap();

        assert!(a.write(sid(2), b"first").unwrap());
        assert!(a.write(sid(2), b"second").unwrap());
        assert_eq!(b.process_reads().unwrap(), Drain::Empty);

        assert_eq!(log.borrow().reads, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn unknown_stream_records_are_discarded() {
        let (_sa, _sb, a, mut b) = duplex();
        let metrics = Arc::new(RouterMetrics::new());
        b.set_metrics(metrics.clone());

        assert!(a.write(sid(99), b"nobody home").unwrap());
        assert_eq!(b.process_reads().unwrap(), Drain::Empty);

        assert_eq!(metrics.unknown_streams.load(Ordering::Relaxed), 1);
        // The record was consumed regardless
        assert_eq!(b.process_reads().unwrap(), Drain::Empty);
    }

    #[test]
    fn read_fault_routes_to_on_error_and_drain_continues() {
        let (_sa, _sb, a, mut b) = duplex();
        let log = Rc::new(RefCell::new(Log::default()));
        let mut recorder = Recorder::new(log.clone());
        recorder.panic_on_read = true;
        b.register_handler_at(sid(2), recorder).unwrap();

        let log2 = Rc::new(RefCell::new(Log::default()));
        b.register_handler_at(sid(3), Recorder::new(log2.clone())).unwrap();

        assert!(a.write(sid(2), b"boom").unwrap());
        assert!(a.write(sid(3), b"fine").unwrap());
        assert_eq!(b.process_reads().unwrap(), Drain::Empty);

        assert_eq!(log.borrow().errors, vec![b"boom".to_vec()]);
        assert!(log.borrow().reads.is_empty());
        assert_eq!(log2.borrow().reads, vec![b"fine".to_vec()]);
    }

    #[test]
    fn double_fault_aborts_after_consuming() {
        let (_sa, _sb, a, mut b) = duplex();
        let log = Rc::new(RefCell::new(Log::default()));
        let mut recorder = Recorder::new(log);
        recorder.panic_on_read = true;
        recorder.panic_on_error = true;
        b.register_handler_at(sid(2), recorder).unwrap();

        assert!(a.write(sid(2), b"boom").unwrap());
        let err = b.process_reads().unwrap_err();
        assert!(matches!(err, RouterError::HandlerAbort { id: 2 }));

        // The poisoned record is gone; the ring stays live
        assert_eq!(b.process_reads().unwrap(), Drain::Empty);
    }

    #[test]
    fn zero_length_record_closes_the_stream() {
        let (_sa, _sb, a, mut b) = duplex();
        let log = Rc::new(RefCell::new(Log::default()));
        b.register_handler_at(sid(2), Recorder::new(log.clone())).unwrap();

        assert!(a.write(sid(2), b"payload").unwrap());
        assert!(a.write(sid(2), b"").unwrap());
        assert_eq!(b.process_reads().unwrap(), Drain::Empty);

        let seen = log.borrow();
        assert_eq!(seen.reads.len(), 2);
        assert!(seen.reads[1].is_empty());
        drop(seen);
        assert!(!b.is_registered(sid(2)));
    }

    #[test]
    fn stop_leaves_later_records_queued() {
        struct Stopper;
        impl StreamHandler for Stopper {
            fn on_read(&mut self, ctx: &mut StreamContext<'_>, _payload: &[u8]) {
                ctx.stop();
            }
        }

        let (_sa, _sb, a, mut b) = duplex();
        let log = Rc::new(RefCell::new(Log::default()));
        b.register_handler_at(sid(2), Box::new(Stopper)).unwrap();
        b.register_handler_at(sid(3), Recorder::new(log.clone())).unwrap();

        assert!(a.write(sid(2), b"halt").unwrap());
        assert!(a.write(sid(3), b"later").unwrap());

        assert_eq!(b.process_reads().unwrap(), Drain::Stopped);
        assert!(log.borrow().reads.is_empty());

        assert_eq!(b.process_reads().unwrap(), Drain::Empty);
        assert_eq!(log.borrow().reads, vec![b"later".to_vec()]);
    }

    #[test]
    fn handler_can_reply_through_context() {
        struct Echo;
        impl StreamHandler for Echo {
            fn on_read(&mut self, ctx: &mut StreamContext<'_>, payload: &[u8]) {
                let stream = ctx.stream();
                ctx.write(stream, payload).unwrap();
            }
        }

        let (_sa, _sb, mut a, mut b) = duplex();
        let log = Rc::new(RefCell::new(Log::default()));
        b.register_handler_at(sid(2), Box::new(Echo)).unwrap();
        a.register_handler_at(sid(2), Recorder::new(log.clone())).unwrap();

        assert!(a.write(sid(2), b"ping").unwrap());
        assert_eq!(b.process_reads().unwrap(), Drain::Empty);
        assert_eq!(a.process_reads().unwrap(), Drain::Empty);

        assert_eq!(log.borrow().reads, vec![b"ping".to_vec()]);
    }

    #[test]
    fn peer_gone_surfaces_when_ring_is_empty() {
        let seg_ab = Segment::anonymous(SEGMENT_LEN).unwrap();
        let seg_ba = Segment::anonymous(SEGMENT_LEN).unwrap();
        let b_out = unsafe { Channel::initialize(seg_ba.addr(), seg_ba.len()) }.unwrap();
        let b_in = unsafe { Channel::initialize(seg_ab.addr(), seg_ab.len()) }.unwrap();
        let (ours, theirs) = Notifier::pair().unwrap();

        let mut b = Router::new(b_out, b_in, Some(ours));
        assert_eq!(b.process_reads().unwrap(), Drain::Empty);

        drop(theirs);
        assert_eq!(b.process_reads().unwrap(), Drain::PeerGone);
    }

    #[test]
    fn control_backpressure_is_fatal() {
        let (_sa, _sb, a, _b) = duplex();

        // Saturate the outbound ring with single-line frames so not even a
        // 64-byte control frame fits
        let filler = [0u8; 56];
        while a.write(sid(5), &filler).unwrap() {}

        let err = a.announce_stream(sid(9)).unwrap_err();
        assert!(matches!(err, RouterError::ControlBackpressure));
    }

    #[test]
    fn metrics_counters_advance() {
        let (_sa, _sb, a, mut b) = duplex();
        let metrics = Arc::new(RouterMetrics::new());
        b.set_metrics(metrics.clone());

        let log = Rc::new(RefCell::new(Log::default()));
        b.register_handler_at(sid(2), Recorder::new(log)).unwrap();

        assert!(a.write(sid(2), b"one").unwrap());
        assert!(a.write(sid(77), b"stray").unwrap());
        assert!(a.write(sid(2), b"").unwrap());
        b.process_reads().unwrap();

        assert_eq!(metrics.deliveries.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.unknown_streams.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.stream_closes.load(Ordering::Relaxed), 1);
        assert!(metrics.summary().contains("delivered: 2"));
    }
}
