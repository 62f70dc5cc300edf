// src/notifier.rs

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// One end of the out-of-band wake-up / liveness channel between peers.
///
/// The ring itself has no teardown protocol; each peer holds one end of a
/// connected non-blocking socketpair and detects the other's exit as EOF.
/// `signal` doubles as a doorbell so an embedder can park in `poll` on
/// [`Notifier::as_raw_fd`] instead of spinning on the ring.
pub struct Notifier {
    fd: OwnedFd,
}

impl Notifier {
    /// Create a connected pair, one end per peer.
    ///
    /// Both ends are non-blocking and close-on-exec. With fork inheritance
    /// each process drops the end it does not use.
    pub fn pair() -> io::Result<(Notifier, Notifier)> {
        let mut fds = [0i32; 2];

        #[cfg(target_os = "linux")]
        let kind = libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
        #[cfg(not(target_os = "linux"))]
        let kind = libc::SOCK_STREAM;

        let result = unsafe { libc::socketpair(libc::AF_UNIX, kind, 0, fds.as_mut_ptr()) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        // No SOCK_NONBLOCK / SOCK_CLOEXEC at socket creation outside Linux
        #[cfg(not(target_os = "linux"))]
        for &fd in &fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }

        let a = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let b = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        Ok((Notifier { fd: a }, Notifier { fd: b }))
    }

    /// Wrap an inherited notifier fd.
    ///
    /// # Safety
    /// `fd` must be an open descriptor for one end of a notifier pair and
    /// must not be owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Notifier {
        Notifier {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    /// Wake the peer: best-effort one-byte send.
    ///
    /// A full socket buffer or an already-dead peer both mean no wake-up is
    /// needed, so `WouldBlock` and `BrokenPipe` are not reported.
    pub fn signal(&self) -> io::Result<()> {
        let val: [u8; 1] = [1];
        let result = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                val.as_ptr() as *const libc::c_void,
                1,
                no_sigpipe_flags(),
            )
        };
        if result < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::BrokenPipe => {}
                io::ErrorKind::ConnectionReset => {}
                _ => return Err(err),
            }
        }
        Ok(())
    }

    /// Consume pending wake-ups without blocking. Returns the number of
    /// bytes drained (0 when none were pending).
    pub fn drain(&self) -> io::Result<u64> {
        let mut total = 0u64;
        let mut buf = [0u8; 64];
        loop {
            let result = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if result < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(total);
                }
                if err.kind() == io::ErrorKind::ConnectionReset {
                    return Ok(total);
                }
                return Err(err);
            }
            if result == 0 {
                // EOF; peer_closed() will report it
                return Ok(total);
            }
            total += result as u64;
            if (result as usize) < buf.len() {
                return Ok(total);
            }
        }
    }

    /// Whether the peer's end has been closed, via a zero-byte peek.
    ///
    /// Pending wake-ups are reported as "alive"; drain first when the
    /// answer must be current.
    pub fn peer_closed(&self) -> io::Result<bool> {
        let mut buf = [0u8; 1];
        let result = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                1,
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        if result == 0 {
            return Ok(true);
        }
        if result < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(false),
                io::ErrorKind::ConnectionReset => Ok(true),
                _ => Err(err),
            };
        }
        Ok(false)
    }

    /// The raw fd, for an embedder's poll/epoll/kqueue loop.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(target_os = "linux")]
fn no_sigpipe_flags() -> libc::c_int {
    libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL
}

#[cfg(not(target_os = "linux"))]
fn no_sigpipe_flags() -> libc::c_int {
    // SO_NOSIGPIPE is set per-socket on BSDs; MSG_DONTWAIT alone here
    libc::MSG_DONTWAIT
}
