//! `AF_UNIX` / `SOCK_SEQPACKET` plumbing with descriptor passing.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use libc::{c_void, sockaddr, sockaddr_un, socklen_t, AF_UNIX, SOCK_CLOEXEC, SOCK_SEQPACKET};

/// Descriptors accepted in one message. More than this is a protocol error
/// for every user of this module, but the control buffer leaves room so
/// extra descriptors are received (and closed) rather than leaked.
const MAX_FDS: usize = 8;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn seqpacket_socket() -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::socket(AF_UNIX, SOCK_SEQPACKET | SOCK_CLOEXEC, 0) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn unix_addr(path: &Path) -> io::Result<(sockaddr_un, socklen_t)> {
    let mut addr: sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() || bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket path too long"));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as socklen_t))
}

pub fn seqpacket_listen(path: &Path, backlog: i32) -> io::Result<OwnedFd> {
    let fd = seqpacket_socket()?;
    let (addr, len) = unix_addr(path)?;
    cvt(unsafe { libc::bind(fd.as_raw_fd(), &addr as *const _ as *const sockaddr, len) })?;
    cvt(unsafe { libc::listen(fd.as_raw_fd(), backlog) })?;
    Ok(fd)
}

pub fn seqpacket_connect(path: &Path) -> io::Result<OwnedFd> {
    let fd = seqpacket_socket()?;
    let (addr, len) = unix_addr(path)?;
    cvt(unsafe { libc::connect(fd.as_raw_fd(), &addr as *const _ as *const sockaddr, len) })?;
    Ok(fd)
}

pub fn seqpacket_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    cvt(unsafe { libc::socketpair(AF_UNIX, SOCK_SEQPACKET | SOCK_CLOEXEC, 0, fds.as_mut_ptr()) })?;
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

pub fn accept(listener: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    let fd = cvt(unsafe {
        libc::accept4(listener.as_raw_fd(), ptr::null_mut(), ptr::null_mut(), SOCK_CLOEXEC)
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Control buffer with `cmsghdr` alignment.
#[repr(C, align(8))]
struct CmsgBuffer([u8; 128]);

/// Send one message, optionally passing `pass` along with it.
pub fn send_with_fd(fd: BorrowedFd<'_>, data: &[u8], pass: Option<BorrowedFd<'_>>) -> io::Result<usize> {
    let mut iov = libc::iovec { iov_base: data.as_ptr() as *mut c_void, iov_len: data.len() };
    let mut control = CmsgBuffer([0; 128]);
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(pass) = pass {
        let fd_len = mem::size_of::<RawFd>() as u32;
        msg.msg_control = control.0.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(fd_len) } as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_len) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, pass.as_raw_fd());
        }
    }

    let ret = unsafe { libc::sendmsg(fd.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

#[derive(Debug, Default)]
pub struct Received {
    /// Payload bytes. Zero means the peer closed the connection.
    pub len: usize,
    /// Payload or control data did not fit the buffers.
    pub truncated: bool,
    pub fds: Vec<OwnedFd>,
}

/// Receive one message and every descriptor attached to it.
pub fn recv_with_fds(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<Received> {
    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut c_void, iov_len: buf.len() };
    let mut control = CmsgBuffer([0; 128]);
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = unsafe { libc::CMSG_SPACE((MAX_FDS * mem::size_of::<RawFd>()) as u32) } as _;

    let ret = loop {
        let ret = unsafe { libc::recvmsg(fd.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if ret >= 0 {
            break ret;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let mut received = Received {
        len: ret as usize,
        truncated: msg.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0,
        fds: Vec::new(),
    };

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..payload / mem::size_of::<RawFd>() {
                    let raw = ptr::read_unaligned(data.add(i));
                    received.fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(received)
}

/// `poll(2)` retrying on `EINTR`. Returns the number of ready descriptors.
pub fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    loop {
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::EventFd;
    use std::os::fd::AsFd;

    #[test]
    fn test_message_boundaries() {
        let (a, b) = seqpacket_pair().unwrap();
        send_with_fd(a.as_fd(), b"first", None).unwrap();
        send_with_fd(a.as_fd(), b"second message", None).unwrap();

        let mut buf = [0u8; 64];
        let msg = recv_with_fds(b.as_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..msg.len], b"first");
        assert!(!msg.truncated);
        assert!(msg.fds.is_empty());

        let msg = recv_with_fds(b.as_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..msg.len], b"second message");
    }

    #[test]
    fn test_descriptor_passing() {
        let (a, b) = seqpacket_pair().unwrap();
        let efd = EventFd::nonblocking().unwrap();
        send_with_fd(a.as_fd(), b"fd", Some(efd.as_fd())).unwrap();

        let mut buf = [0u8; 16];
        let mut msg = recv_with_fds(b.as_fd(), &mut buf).unwrap();
        assert_eq!(msg.fds.len(), 1);

        // The received descriptor refers to the same eventfd
        let remote = EventFd::from_fd(msg.fds.remove(0));
        remote.notify().unwrap();
        assert_eq!(efd.try_wait().unwrap(), Some(1));
    }

    #[test]
    fn test_truncation_and_eof() {
        let (a, b) = seqpacket_pair().unwrap();
        send_with_fd(a.as_fd(), &[7u8; 32], None).unwrap();
        let mut small = [0u8; 8];
        let msg = recv_with_fds(b.as_fd(), &mut small).unwrap();
        assert!(msg.truncated);

        drop(a);
        let msg = recv_with_fds(b.as_fd(), &mut small).unwrap();
        assert_eq!(msg.len, 0);
    }

    #[test]
    fn test_path_too_long() {
        let long = "/tmp/".to_string() + &"x".repeat(200);
        assert!(seqpacket_listen(Path::new(&long), 1).is_err());
    }
}
