//! Fixed-size control messages exchanged over the seqpacket socket.
//!
//! A request is 48 bytes: the kind at offset 0 and the payload from offset
//! 8, integers little endian. A response is 8 bytes: kind `STATUS` and a
//! success byte.

use crate::error::ControlError;

pub const REQUEST_LEN: usize = 48;
pub const RESPONSE_LEN: usize = 8;
/// Room for a NUL-padded device path in `CREATE_PORT_TAP`.
pub const TAP_PATH_LEN: usize = 32;

pub const REQ_PING: u8 = 0;
pub const REQ_CREATE_PORT_TAP: u8 = 1;
pub const REQ_MEMORY_MAP: u8 = 2;
pub const REQ_CREATE_PORT_QP: u8 = 3;
pub const REQ_EVENT_FD: u8 = 4;

pub const RESP_STATUS: u8 = 0;

const PAYLOAD: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    CreatePortTap { path: String },
    /// Comes with the memory fd. `addr` is where the client sees the
    /// mapping.
    MemoryMap { addr: u64, size: u64, offset: u64 },
    /// `qp` is the client address of its `QueuePair`.
    CreatePortQp { qp: u64 },
    /// Comes with the client's eventfd.
    EventFd,
}

impl Request {
    pub fn kind(&self) -> u8 {
        match self {
            Request::Ping => REQ_PING,
            Request::CreatePortTap { .. } => REQ_CREATE_PORT_TAP,
            Request::MemoryMap { .. } => REQ_MEMORY_MAP,
            Request::CreatePortQp { .. } => REQ_CREATE_PORT_QP,
            Request::EventFd => REQ_EVENT_FD,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "PING",
            Request::CreatePortTap { .. } => "CREATE_PORT_TAP",
            Request::MemoryMap { .. } => "MEMORY_MAP",
            Request::CreatePortQp { .. } => "CREATE_PORT_QP",
            Request::EventFd => "EVENT_FD",
        }
    }

    /// Number of descriptors that must accompany the request.
    pub fn fds_expected(&self) -> usize {
        match self {
            Request::MemoryMap { .. } | Request::EventFd => 1,
            _ => 0,
        }
    }

    pub fn encode(&self) -> Result<[u8; REQUEST_LEN], ControlError> {
        let mut buf = [0u8; REQUEST_LEN];
        buf[0] = self.kind();
        match self {
            Request::Ping | Request::EventFd => {}
            Request::CreatePortTap { path } => {
                let bytes = path.as_bytes();
                if bytes.len() > TAP_PATH_LEN {
                    return Err(ControlError::NameTooLong(bytes.len()));
                }
                buf[PAYLOAD..PAYLOAD + bytes.len()].copy_from_slice(bytes);
            }
            Request::MemoryMap { addr, size, offset } => {
                put_u64(&mut buf, PAYLOAD, *addr);
                put_u64(&mut buf, PAYLOAD + 8, *size);
                put_u64(&mut buf, PAYLOAD + 16, *offset);
            }
            Request::CreatePortQp { qp } => put_u64(&mut buf, PAYLOAD, *qp),
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        if buf.len() != REQUEST_LEN {
            return Err(ControlError::BadLength(buf.len()));
        }
        let request = match buf[0] {
            REQ_PING => Request::Ping,
            REQ_CREATE_PORT_TAP => {
                let raw = &buf[PAYLOAD..PAYLOAD + TAP_PATH_LEN];
                let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                Request::CreatePortTap { path: String::from_utf8_lossy(&raw[..end]).into_owned() }
            }
            REQ_MEMORY_MAP => Request::MemoryMap {
                addr: get_u64(buf, PAYLOAD),
                size: get_u64(buf, PAYLOAD + 8),
                offset: get_u64(buf, PAYLOAD + 16),
            },
            REQ_CREATE_PORT_QP => Request::CreatePortQp { qp: get_u64(buf, PAYLOAD) },
            REQ_EVENT_FD => Request::EventFd,
            kind => return Err(ControlError::UnknownRequest(kind)),
        };
        Ok(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub success: bool,
}

impl Response {
    pub fn encode(&self) -> [u8; RESPONSE_LEN] {
        let mut buf = [0u8; RESPONSE_LEN];
        buf[0] = RESP_STATUS;
        buf[1] = u8::from(self.success);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        if buf.len() != RESPONSE_LEN {
            return Err(ControlError::BadLength(buf.len()));
        }
        if buf[0] != RESP_STATUS {
            return Err(ControlError::UnknownResponse(buf[0]));
        }
        Ok(Self { success: buf[1] != 0 })
    }
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
