use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use libc::c_void;

/// Counter-style eventfd used as a wakeup doorbell.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// Blocking eventfd: [`EventFd::wait`] sleeps until the counter is non-zero.
    pub fn new() -> io::Result<Self> {
        Self::with_flags(libc::EFD_CLOEXEC)
    }

    pub fn nonblocking() -> io::Result<Self> {
        Self::with_flags(libc::EFD_CLOEXEC | libc::EFD_NONBLOCK)
    }

    fn with_flags(flags: libc::c_int) -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, flags) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    /// Wrap a descriptor received from a peer. Writes to a descriptor that
    /// is not an eventfd simply fail.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Add one to the counter. Only performs `write(2)`, so it may be
    /// called from a signal handler.
    pub fn notify(&self) -> io::Result<()> {
        let one: u64 = 1;
        loop {
            let ret = unsafe {
                libc::write(self.fd.as_raw_fd(), &one as *const u64 as *const c_void, 8)
            };
            if ret == 8 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                // Counter saturated: the reader has a wakeup pending anyway.
                io::ErrorKind::WouldBlock => return Ok(()),
                _ => return Err(err),
            }
        }
    }

    /// Read and reset the counter, blocking if it is zero (unless the
    /// descriptor is non-blocking, in which case `WouldBlock` is returned).
    pub fn wait(&self) -> io::Result<u64> {
        let mut value: u64 = 0;
        loop {
            let ret = unsafe {
                libc::read(self.fd.as_raw_fd(), &mut value as *mut u64 as *mut c_void, 8)
            };
            if ret == 8 {
                return Ok(value);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Non-blocking drain for descriptors created with [`EventFd::nonblocking`].
    pub fn try_wait(&self) -> io::Result<Option<u64>> {
        match self.wait() {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for EventFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_notify_accumulates() {
        let efd = EventFd::nonblocking().unwrap();
        assert_eq!(efd.try_wait().unwrap(), None);
        efd.notify().unwrap();
        efd.notify().unwrap();
        assert_eq!(efd.try_wait().unwrap(), Some(2));
        assert_eq!(efd.try_wait().unwrap(), None);
    }

    #[test]
    fn test_wait_blocks_until_notified() {
        let efd = Arc::new(EventFd::new().unwrap());
        let waiter = {
            let efd = efd.clone();
            thread::spawn(move || efd.wait().unwrap())
        };
        thread::sleep(std::time::Duration::from_millis(20));
        efd.notify().unwrap();
        assert_eq!(waiter.join().unwrap(), 1);
    }

    #[test]
    fn test_cloned_descriptor_shares_counter() {
        let efd = EventFd::nonblocking().unwrap();
        let clone = EventFd::from_fd(efd.try_clone_fd().unwrap());
        clone.notify().unwrap();
        assert_eq!(efd.try_wait().unwrap(), Some(1));
    }
}
