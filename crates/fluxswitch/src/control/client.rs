//! Client side of the control protocol.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;

use fluxswitch_core::sys::{socket, EventFd};

use crate::control::messages::{Request, Response, RESPONSE_LEN};
use crate::error::ControlError;

/// What came back for one request.
#[derive(Debug)]
pub struct Reply {
    pub success: bool,
    /// The switch wakeup eventfd, after a successful `CREATE_PORT_QP`.
    pub fd: Option<OwnedFd>,
}

/// Send `request` on a connected control socket and wait for the answer.
pub fn call(sock: BorrowedFd<'_>, request: &Request, fd: Option<BorrowedFd<'_>>) -> Result<Reply, ControlError> {
    let buf = request.encode()?;
    let sent = socket::send_with_fd(sock, &buf, fd)?;
    if sent != buf.len() {
        return Err(ControlError::BadLength(sent));
    }

    let mut resp = [0u8; RESPONSE_LEN + 1];
    let received = socket::recv_with_fds(sock, &mut resp)?;
    if received.truncated {
        return Err(ControlError::Truncated);
    }
    let response = Response::decode(&resp[..received.len])?;
    Ok(Reply { success: response.success, fd: received.fds.into_iter().next() })
}

/// A connection to a running switch.
pub struct Client {
    fd: OwnedFd,
}

impl Client {
    pub fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self { fd: socket::seqpacket_connect(path.as_ref())? })
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn call(&self, request: &Request, fd: Option<BorrowedFd<'_>>) -> Result<Reply, ControlError> {
        call(self.fd.as_fd(), request, fd)
    }

    pub fn ping(&self) -> Result<bool, ControlError> {
        Ok(self.call(&Request::Ping, None)?.success)
    }

    pub fn create_port_tap(&self, path: &str) -> Result<bool, ControlError> {
        Ok(self.call(&Request::CreatePortTap { path: path.to_string() }, None)?.success)
    }

    /// Share `size` bytes of `memory` from `offset`, seen by this client at
    /// `addr`.
    pub fn memory_map(&self, memory: &File, addr: u64, size: u64, offset: u64) -> Result<bool, ControlError> {
        Ok(self.call(&Request::MemoryMap { addr, size, offset }, Some(memory.as_fd()))?.success)
    }

    pub fn event_fd(&self, events: &EventFd) -> Result<bool, ControlError> {
        Ok(self.call(&Request::EventFd, Some(events.as_fd()))?.success)
    }

    /// Attach the queue pair at `qp`. On success returns the eventfd that
    /// wakes the switch.
    pub fn create_port_qp(&self, qp: u64) -> Result<Option<EventFd>, ControlError> {
        let reply = self.call(&Request::CreatePortQp { qp }, None)?;
        if !reply.success {
            return Ok(None);
        }
        Ok(reply.fd.map(EventFd::from_fd))
    }
}

/// Anonymous shareable memory of `len` bytes to pass with `MEMORY_MAP`.
pub fn shared_memory(len: u64) -> io::Result<File> {
    let name = CString::new("fluxswitch-shmem").map_err(io::Error::other)?;
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });
    file.set_len(len)?;
    Ok(file)
}
