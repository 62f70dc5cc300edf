// src/segment.rs

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;

/// The system page size.
pub fn page_size() -> usize {
    // _SC_PAGESIZE cannot fail on any supported platform
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// A shared memory segment hosting one ring.
///
/// Two attachment models are supported:
/// - [`Segment::anonymous`]: a `MAP_SHARED | MAP_ANONYMOUS` mapping created
///   before `fork()`. The child inherits the mapping at the same address,
///   which is what the ring protocol assumes.
/// - [`Segment::create`] / [`Segment::from_fd`]: an fd-backed mapping
///   (`memfd_create` on Linux, `shm_open` elsewhere) for embedders that
///   pass descriptors instead of forking.
///
/// The mapping is zero-filled by the kernel in both cases. The segment is
/// unmapped on drop; the ring has no teardown protocol of its own.
pub struct Segment {
    ptr: NonNull<u8>,
    len: usize,
    fd: Option<OwnedFd>,
}

// Safety: the mapping is plain shared memory; all cross-process
// synchronization happens through the atomics the ring places in it.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

fn check_len(len: usize) -> io::Result<()> {
    let page = page_size();
    if len == 0 || len % page != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("segment size {len} is not a positive multiple of the {page}-byte page"),
        ));
    }
    Ok(())
}

impl Segment {
    /// Map an anonymous shared region, to be inherited across `fork()`.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        check_len(len)?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Segment {
            ptr: NonNull::new(ptr as *mut u8).unwrap(),
            len,
            fd: None,
        })
    }

    /// Create a new fd-backed shared memory segment.
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        check_len(len)?;
        let fd = Self::create_fd(name)?;

        let result = unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        Self::map_fd(fd, len)
    }

    /// Map an existing shared memory segment from a file descriptor.
    pub fn from_fd(fd: OwnedFd, len: usize) -> io::Result<Self> {
        check_len(len)?;
        Self::map_fd(fd, len)
    }

    fn map_fd(fd: OwnedFd, len: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Segment {
            ptr: NonNull::new(ptr as *mut u8).unwrap(),
            len,
            fd: Some(fd),
        })
    }

    #[cfg(target_os = "linux")]
    fn create_fd(name: &str) -> io::Result<OwnedFd> {
        let c_name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid name"))?;

        let fd = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    #[cfg(not(target_os = "linux"))]
    fn create_fd(name: &str) -> io::Result<OwnedFd> {
        // No memfd_create outside Linux; use shm_open with a unique name
        // and unlink immediately so the segment stays anonymous.
        let unique_name = format!("/forkbus-{}-{}", std::process::id(), name);
        let c_name = CString::new(unique_name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid name"))?;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }

        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Base address of the mapping.
    #[inline]
    pub fn addr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Size of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for a live segment).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The backing file descriptor, if this segment is fd-backed.
    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Duplicate the backing fd, for handing to another process.
    ///
    /// Fails with `Unsupported` for anonymous segments; those are shared by
    /// forking, not by fd passing.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        let fd = self.fd.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "anonymous segment has no fd")
        })?;
        fd.try_clone()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

// Static assertions: Segment must be Send + Sync
static_assertions::assert_impl_all!(Segment: Send, Sync);
