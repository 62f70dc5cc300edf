// End-to-end exchange between a real parent and forked child over
// anonymous shared segments.
//
// This file holds a single test so the process that calls fork() has no
// sibling test threads.

use std::cell::Cell;
use std::rc::Rc;

use forkbus::{
    AnnouncementHandler, Channel, Drain, Notifier, Router, Segment, StreamContext, StreamHandler,
    StreamId,
};

const SEGMENT_LEN: usize = 16384;
const DATA_MSGS: u32 = 200;
const ANNOUNCED_MSGS: u32 = 50;

fn sid(raw: u32) -> StreamId {
    StreamId::new(raw).unwrap()
}

struct SequenceCheck {
    expected_next: u32,
    count: Rc<Cell<u32>>,
}

impl StreamHandler for SequenceCheck {
    fn on_read(&mut self, _ctx: &mut StreamContext<'_>, payload: &[u8]) {
        let bytes: [u8; 4] = payload[..4].try_into().unwrap();
        let seq = u32::from_le_bytes(bytes);
        if seq != self.expected_next {
            // Out-of-order delivery; reported via the child's exit code
            unsafe { libc::_exit(2) };
        }
        self.expected_next += 1;
        self.count.set(self.count.get() + 1);
    }
}

fn child_main(seg_down: &Segment, seg_up: &Segment, notifier: Notifier) -> ! {
    let inbound = match unsafe { Channel::attach(seg_down.addr(), seg_down.len()) } {
        Ok(c) => c,
        Err(_) => unsafe { libc::_exit(10) },
    };
    let outbound = match unsafe { Channel::attach(seg_up.addr(), seg_up.len()) } {
        Ok(c) => c,
        Err(_) => unsafe { libc::_exit(11) },
    };
    let mut router = Router::new(outbound, inbound, Some(notifier)).with_name("child");

    let data_count = Rc::new(Cell::new(0u32));
    let announced_count = Rc::new(Cell::new(0u32));

    router
        .register_handler_at(
            sid(2),
            Box::new(SequenceCheck {
                expected_next: 0,
                count: data_count.clone(),
            }),
        )
        .unwrap();

    let announced = announced_count.clone();
    router
        .register_handler_at(
            StreamId::CONTROL,
            Box::new(AnnouncementHandler::new(move |_id| {
                Box::new(SequenceCheck {
                    expected_next: 0,
                    count: announced.clone(),
                }) as Box<dyn StreamHandler>
            })),
        )
        .unwrap();

    loop {
        match router.process_reads() {
            Ok(Drain::Empty) => {
                if data_count.get() == DATA_MSGS && announced_count.get() == ANNOUNCED_MSGS {
                    break;
                }
                unsafe { libc::sched_yield() };
            }
            Ok(Drain::Stopped) => unsafe { libc::_exit(12) },
            Ok(Drain::PeerGone) => unsafe { libc::_exit(3) },
            Err(_) => unsafe { libc::_exit(4) },
        }
    }

    // Tell the parent everything arrived intact
    match router.write(sid(2), b"done") {
        Ok(true) => unsafe { libc::_exit(0) },
        _ => unsafe { libc::_exit(5) },
    }
}

#[test]
fn forked_peers_exchange_streams() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();

    // Both rings are initialized by their writer before the fork, so the
    // child only ever attaches.
    let seg_down = Segment::anonymous(SEGMENT_LEN).unwrap();
    let seg_up = Segment::anonymous(SEGMENT_LEN).unwrap();
    let parent_out = unsafe { Channel::initialize(seg_down.addr(), seg_down.len()) }.unwrap();
    let _child_ring = unsafe { Channel::initialize(seg_up.addr(), seg_up.len()) }.unwrap();
    let parent_in = unsafe { Channel::attach(seg_up.addr(), seg_up.len()) }.unwrap();

    let (parent_end, child_end) = Notifier::pair().unwrap();

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");

    if pid == 0 {
        drop(parent_end);
        child_main(&seg_down, &seg_up, child_end);
    }
    drop(child_end);

    let mut parent = Router::new(parent_out, parent_in, Some(parent_end)).with_name("parent");

    let done = Rc::new(Cell::new(false));
    struct DoneFlag(Rc<Cell<bool>>);
    impl StreamHandler for DoneFlag {
        fn on_read(&mut self, _ctx: &mut StreamContext<'_>, payload: &[u8]) {
            if payload == b"done" {
                self.0.set(true);
            }
        }
    }
    parent
        .register_handler_at(sid(2), Box::new(DoneFlag(done.clone())))
        .unwrap();

    let retry_write = |router: &Router, id: StreamId, payload: &[u8]| {
        while !router.write(id, payload).unwrap() {
            unsafe { libc::sched_yield() };
        }
    };

    // Stream 2 is known to both sides up front; stream 7 goes through the
    // new-stream handshake.
    parent.announce_stream(sid(7)).unwrap();
    for seq in 0..DATA_MSGS {
        retry_write(&parent, sid(2), &seq.to_le_bytes());
    }
    for seq in 0..ANNOUNCED_MSGS {
        retry_write(&parent, sid(7), &seq.to_le_bytes());
    }

    // Wait for the child's acknowledgement, then for its exit
    loop {
        match parent.process_reads().unwrap() {
            Drain::Empty if done.get() => break,
            Drain::Empty | Drain::Stopped => unsafe {
                libc::sched_yield();
            },
            Drain::PeerGone => {
                assert!(done.get(), "child exited without acknowledging");
                break;
            }
        }
    }

    let mut status = 0i32;
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(waited, pid);
    assert!(libc::WIFEXITED(status), "child did not exit cleanly");
    assert_eq!(libc::WEXITSTATUS(status), 0, "child reported a failure");

    // With the child gone, the notifier reports it
    assert_eq!(parent.process_reads().unwrap(), Drain::PeerGone);
}
