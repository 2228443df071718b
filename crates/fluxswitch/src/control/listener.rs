use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use fluxswitch_core::sys::{socket, EventFd};
use tracing::{debug, error, info, warn};

use crate::control::session::Session;
use crate::engine::Switch;
use crate::error::SwitchError;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/fluxswitch";

const BACKLOG: i32 = 16;

/// The control socket and the thread serving it.
pub struct Listener {
    path: PathBuf,
    stop: Arc<EventFd>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind `path` and start serving clients. With `force`, a stale socket
    /// left at `path` is removed first.
    pub fn bind(switch: Arc<Switch>, path: impl AsRef<Path>, force: bool) -> Result<Self, SwitchError> {
        let path = path.as_ref().to_path_buf();
        if force {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed stale socket"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let listener = socket::seqpacket_listen(&path, BACKLOG)?;
        let stop = Arc::new(EventFd::new()?);
        let mut control = ControlLoop { listener, stop: stop.clone(), switch, sessions: Vec::new(), next_id: 0 };
        let thread = thread::Builder::new().name("fluxswitch-control".into()).spawn(move || control.run())?;

        info!(path = %path.display(), "listening for clients");
        Ok(Self { path, stop, thread: Some(thread) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close every session and remove the socket.
    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if let Err(e) = self.stop.notify() {
            error!(error = %e, "failed to stop control thread");
            return;
        }
        let _ = thread.join();
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "could not remove socket");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

struct ControlLoop {
    listener: OwnedFd,
    stop: Arc<EventFd>,
    switch: Arc<Switch>,
    sessions: Vec<Session>,
    next_id: u64,
}

impl ControlLoop {
    fn run(&mut self) {
        loop {
            let mut fds = Vec::with_capacity(self.sessions.len() + 2);
            fds.push(pollfd(self.stop.as_raw_fd()));
            fds.push(pollfd(self.listener.as_raw_fd()));
            fds.extend(self.sessions.iter().map(|s| pollfd(s.fd().as_raw_fd())));

            if let Err(e) = socket::poll(&mut fds, -1) {
                error!(error = %e, "control poll failed");
                return;
            }
            if fds[0].revents != 0 {
                debug!(sessions = self.sessions.len(), "control thread stopping");
                self.sessions.clear();
                return;
            }

            for i in (0..self.sessions.len()).rev() {
                if fds[i + 2].revents == 0 {
                    continue;
                }
                let session = &mut self.sessions[i];
                match session.serve() {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(client = session.id(), "client disconnected");
                        self.sessions.swap_remove(i);
                    }
                    Err(e) => {
                        warn!(client = session.id(), error = %e, "protocol violation, closing session");
                        self.sessions.swap_remove(i);
                    }
                }
            }

            if fds[1].revents != 0 {
                self.accept();
            }
        }
    }

    fn accept(&mut self) {
        match socket::accept(self.listener.as_fd()) {
            Ok(fd) => {
                let id = self.next_id;
                self.next_id += 1;
                debug!(client = id, "client connected");
                self.sessions.push(Session::new(id, fd, self.switch.clone()));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

fn pollfd(fd: i32) -> libc::pollfd {
    libc::pollfd { fd, events: libc::POLLIN, revents: 0 }
}
