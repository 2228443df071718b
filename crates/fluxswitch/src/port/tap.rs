use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use fluxswitch_core::sys::{socket, tap, EventFd};
use tracing::{debug, error, trace};

use crate::error::PortBroken;
use crate::packet::{Completion, Packet};
use crate::port::Port;

/// Largest frame read from or written to the device, excluding the
/// virtio-net header.
pub const TAP_MAX_FRAME: usize = 65536;

const MAX_VNET_HEADER: usize = 16;

/// State shared with the readiness thread.
struct Watch {
    fd: OwnedFd,
    wakeup: Arc<EventFd>,
    /// Written to arm the watch or to stop the thread.
    request: EventFd,
    armed: AtomicBool,
    stop: AtomicBool,
}

impl Watch {
    fn run(&self, name: &str) {
        loop {
            if let Err(e) = self.request.wait() {
                error!(port = %name, error = %e, "tap watch failed");
                return;
            }
            if self.stop.load(Ordering::SeqCst) {
                return;
            }

            let mut fds = [
                libc::pollfd { fd: self.fd.as_raw_fd(), events: libc::POLLIN, revents: 0 },
                libc::pollfd { fd: self.request.as_raw_fd(), events: libc::POLLIN, revents: 0 },
            ];
            if let Err(e) = socket::poll(&mut fds, -1) {
                error!(port = %name, error = %e, "tap watch failed");
                return;
            }
            if fds[1].revents != 0 && self.stop.load(Ordering::SeqCst) {
                return;
            }
            if fds[0].revents != 0 {
                self.armed.store(false, Ordering::SeqCst);
                if let Err(e) = self.wakeup.notify() {
                    error!(port = %name, error = %e, "failed to wake switch");
                }
            }
        }
    }
}

/// A kernel tap (or macvtap) device.
///
/// Frames are read and written with the device's virtio-net header in
/// front. Received headers are stripped; transmitted ones are all zero,
/// meaning no offload.
pub struct TapPort {
    name: String,
    file: File,
    header_size: usize,
    rx_buf: Mutex<Box<[u8]>>,
    tx_buf: Mutex<Box<[u8]>>,
    watch: Arc<Watch>,
    thread: Option<JoinHandle<()>>,
}

impl TapPort {
    /// Open a device node (`/dev/tap7`) or, for a bare interface name,
    /// create the tap interface through `/dev/net/tun`.
    pub fn open(path: &str, wakeup: Arc<EventFd>) -> io::Result<Self> {
        let (file, header_size) = if path.contains('/') {
            tap::open_tap(Path::new(path))?
        } else {
            tap::create_tap(path)?
        };
        Self::from_file(path, file, header_size, wakeup)
    }

    /// Wrap any descriptor that preserves frame boundaries on read and
    /// write. The descriptor is switched to non-blocking mode.
    pub fn from_file(name: &str, file: File, header_size: usize, wakeup: Arc<EventFd>) -> io::Result<Self> {
        if header_size > MAX_VNET_HEADER {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "vnet header too large"));
        }
        set_nonblocking(&file)?;

        let watch = Arc::new(Watch {
            fd: file.as_fd().try_clone_to_owned()?,
            wakeup,
            request: EventFd::new()?,
            armed: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });
        let thread = {
            let watch = watch.clone();
            let name = name.to_string();
            thread::Builder::new()
                .name(format!("tap-watch-{name}"))
                .spawn(move || watch.run(&name))?
        };

        debug!(port = %name, header_size, "tap port opened");
        Ok(Self {
            name: name.to_string(),
            file,
            header_size,
            rx_buf: Mutex::new(vec![0u8; header_size + TAP_MAX_FRAME].into_boxed_slice()),
            tx_buf: Mutex::new(vec![0u8; header_size + TAP_MAX_FRAME].into_boxed_slice()),
            watch,
            thread: Some(thread),
        })
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    fn arm(&self) -> Result<(), PortBroken> {
        if !self.watch.armed.swap(true, Ordering::SeqCst) {
            self.watch.request.notify()?;
        }
        Ok(())
    }
}

fn set_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, PortBroken> {
    mutex.lock().map_err(|_| PortBroken::new("port state poisoned"))
}

impl Port for TapPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&self, packet: &mut Packet, enable_notifications: bool) -> Result<bool, PortBroken> {
        let mut buf = lock(&self.rx_buf)?;
        let n = match (&self.file).read(&mut buf[..]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if enable_notifications {
                    self.arm()?;
                }
                return Ok(false);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if n < self.header_size {
            return Err(PortBroken::new(format!("short read of {n} bytes")));
        }

        let frame = &mut buf[self.header_size..n];
        let ptr = NonNull::new(frame.as_mut_ptr()).ok_or_else(|| PortBroken::new("null buffer"))?;
        // The buffer is only rewritten by the next poll, which happens after
        // this packet has been completed.
        unsafe { packet.push_fragment(ptr, frame.len() as u32)? };
        packet.set_completion(Completion::Tap);
        Ok(true)
    }

    fn receive(&self, packet: &Packet) -> Result<(), PortBroken> {
        let mut buf = lock(&self.tx_buf)?;
        let (header, frame) = buf.split_at_mut(self.header_size);
        header.fill(0);
        let len = packet.copy_to(frame);
        if len < packet.len() {
            trace!(port = %self.name, len = packet.len(), "oversized frame cropped");
        }

        match (&self.file).write(&buf[..self.header_size + len]) {
            Ok(_) => Ok(()),
            // Device queue full or interface down: the frame is dropped.
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                trace!(port = %self.name, "tap busy, frame dropped");
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                trace!(port = %self.name, "tap down, frame dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn mark_done(&self, _packet: &Packet) -> Result<(), PortBroken> {
        Ok(())
    }
}

impl Drop for TapPort {
    fn drop(&mut self) {
        self.watch.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.watch.request.notify() {
            error!(port = %self.name, error = %e, "failed to stop tap watch");
            return;
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
