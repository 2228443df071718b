use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, OnceLock};

use fluxswitch_core::mem::{Region, RegionList};
use fluxswitch_core::sys::{socket, EventFd};
use tracing::{debug, info, warn};

use crate::control::messages::{Request, Response, REQUEST_LEN};
use crate::engine::Switch;
use crate::error::ControlError;
use crate::port::{self, EnabledPort, QueuePairPort, TapPort};

/// One connected control client: its memory, its event fd and the ports
/// it created. Everything goes away with the connection.
pub struct Session {
    id: u64,
    fd: OwnedFd,
    switch: Arc<Switch>,
    regions: RegionList,
    events: Arc<OnceLock<EventFd>>,
    taps: Vec<EnabledPort<TapPort>>,
    queue_pairs: Vec<EnabledPort<QueuePairPort>>,
}

enum Outcome {
    Failed,
    Done,
    /// Success, and this wakeup fd goes back with the response.
    DoneWithWakeup(Arc<EventFd>),
}

impl Session {
    pub fn new(id: u64, fd: OwnedFd, switch: Arc<Switch>) -> Self {
        Self {
            id,
            fd,
            switch,
            regions: RegionList::new(),
            events: Arc::new(OnceLock::new()),
            taps: Vec::new(),
            queue_pairs: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn regions(&self) -> &RegionList {
        &self.regions
    }

    pub fn port_count(&self) -> usize {
        self.taps.len() + self.queue_pairs.len()
    }

    /// Read and answer one request. `Ok(false)` means the client hung up.
    /// An error is a protocol violation and the session must be closed.
    pub fn serve(&mut self) -> Result<bool, ControlError> {
        // One spare byte so that oversized requests are seen as such.
        let mut buf = [0u8; REQUEST_LEN + 1];
        let received = socket::recv_with_fds(self.fd.as_fd(), &mut buf)?;
        if received.len == 0 && received.fds.is_empty() {
            return Ok(false);
        }
        if received.truncated {
            return Err(ControlError::Truncated);
        }

        let request = Request::decode(&buf[..received.len])?;
        let expected = request.fds_expected();
        if received.fds.len() != expected {
            return Err(ControlError::UnexpectedFds { request: request.name(), expected, got: received.fds.len() });
        }

        let outcome = self.handle(request, received.fds.into_iter().next())?;
        let response = Response { success: !matches!(outcome, Outcome::Failed) }.encode();
        let pass = match &outcome {
            Outcome::DoneWithWakeup(wakeup) => Some(wakeup.as_fd()),
            _ => None,
        };
        socket::send_with_fd(self.fd.as_fd(), &response, pass)?;
        Ok(true)
    }

    fn handle(&mut self, request: Request, fd: Option<OwnedFd>) -> Result<Outcome, ControlError> {
        let client = self.id;
        match request {
            Request::Ping => Ok(Outcome::Done),
            Request::CreatePortTap { path } => {
                info!(client, path = %path, "creating tap port");
                let port = match TapPort::open(&path, self.switch.notifier()) {
                    Ok(port) => port,
                    Err(e) => {
                        warn!(client, path = %path, error = %e, "could not open tap device");
                        return Ok(Outcome::Failed);
                    }
                };
                match port::enable(&self.switch, Arc::new(port)) {
                    Ok(enabled) => {
                        self.taps.push(enabled);
                        Ok(Outcome::Done)
                    }
                    Err(e) => {
                        warn!(client, path = %path, error = %e, "could not attach tap port");
                        Ok(Outcome::Failed)
                    }
                }
            }
            Request::MemoryMap { addr, size, offset } => {
                let file = File::from(fd.ok_or(ControlError::Truncated)?);
                // The client may write the mapping at any time; ports only
                // access it through the ring protocols.
                let region = match unsafe { Region::from_file(&file, addr, size, offset) } {
                    Ok(region) => region,
                    Err(e) => {
                        warn!(client, addr, size, offset, error = %e, "could not map client memory");
                        return Ok(Outcome::Failed);
                    }
                };
                if let Err(e) = self.regions.insert(region) {
                    warn!(client, addr, size, error = %e, "rejected memory region");
                    return Ok(Outcome::Failed);
                }
                info!(client, addr, size, "mapped client memory");
                Ok(Outcome::Done)
            }
            Request::CreatePortQp { qp } => {
                let name = format!("c{client} qp{}", self.queue_pairs.len());
                let port = match QueuePairPort::new(
                    name,
                    self.regions.clone(),
                    qp,
                    self.events.clone(),
                    self.switch.notifier(),
                ) {
                    Ok(port) => port,
                    Err(e) => {
                        warn!(client, qp, error = %e, "could not create queue pair port");
                        return Ok(Outcome::Failed);
                    }
                };
                match port::enable(&self.switch, Arc::new(port)) {
                    Ok(enabled) => {
                        let wakeup = enabled.wakeup().clone();
                        self.queue_pairs.push(enabled);
                        Ok(Outcome::DoneWithWakeup(wakeup))
                    }
                    Err(e) => {
                        warn!(client, qp, error = %e, "could not attach queue pair port");
                        Ok(Outcome::Failed)
                    }
                }
            }
            Request::EventFd => {
                let fd = fd.ok_or(ControlError::Truncated)?;
                self.events.set(EventFd::from_fd(fd)).map_err(|_| ControlError::DuplicateEventFd)?;
                debug!(client, "event fd registered");
                Ok(Outcome::Done)
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Ports go first: each one waits out a grace period, after which
        // the switch no longer touches the session's memory.
        self.queue_pairs.clear();
        self.taps.clear();
        debug!(client = self.id, regions = self.regions.len(), "session closed");
    }
}
