use std::borrow::Cow;
use std::io;

use fluxswitch_core::{MemoryError, RingError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("another thread is already polling this switch")]
    AlreadyPolling,

    #[error("port setup failed: {0}")]
    PortSetup(String),

    #[error("memory map: {0}")]
    Memory(#[from] MemoryError),
}

/// A port's peer broke the port's protocol. Fatal to that port only: the
/// switch detaches it and keeps serving everyone else.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct PortBroken {
    reason: Cow<'static, str>,
}

impl PortBroken {
    pub fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl From<RingError> for PortBroken {
    fn from(err: RingError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<io::Error> for PortBroken {
    fn from(err: io::Error) -> Self {
        Self::new(format!("I/O failure: {err}"))
    }
}

/// A control client sent something the session protocol does not allow.
/// The session is closed; the switch and other sessions are unaffected.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("message of {0} bytes does not match the request size")]
    BadLength(usize),

    #[error("message or ancillary data truncated")]
    Truncated,

    #[error("unknown request kind {0}")]
    UnknownRequest(u8),

    #[error("unknown response kind {0}")]
    UnknownResponse(u8),

    #[error("device path of {0} bytes does not fit the request")]
    NameTooLong(usize),

    #[error("{request} expects {expected} file descriptors, got {got}")]
    UnexpectedFds { request: &'static str, expected: usize, got: usize },

    #[error("event fd already registered for this session")]
    DuplicateEventFd,

    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
}
