//! Control plane: a Unix seqpacket socket through which local clients
//! share memory, pass event fds and create ports.

pub mod client;
pub mod listener;
pub mod messages;
pub mod session;

pub use client::{call, shared_memory, Client, Reply};
pub use listener::{Listener, DEFAULT_SOCKET_PATH};
pub use messages::{Request, Response};
pub use session::Session;
