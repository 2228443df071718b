//! Ports: anything that can produce and consume Ethernet frames.

pub mod nic;
pub mod queue_pair;
pub mod tap;
pub mod virtio;

pub use nic::{NicDevice, NicPort};
pub use queue_pair::QueuePairPort;
pub use tap::TapPort;
pub use virtio::VirtioPort;

use std::ops::Deref;
use std::ptr;
use std::sync::Arc;

use tracing::debug;

use crate::engine::Switch;
use crate::error::{PortBroken, SwitchError};
use crate::packet::Packet;

/// One switch port.
///
/// Every method except `name` is only ever called from the thread running
/// the switch loop, but ports are created and dropped elsewhere, hence the
/// `Send + Sync` bound. An `Err` from any method means the port's peer
/// violated its protocol: the switch detaches the port.
pub trait Port: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the next incoming packet into `packet` (which is empty on
    /// entry). Returns `Ok(false)` when nothing is pending.
    ///
    /// With `enable_notifications` set and nothing pending, the port must
    /// arm its notification source so that a later arrival calls
    /// [`Switch::schedule_poll`], and must re-check for work after arming.
    fn poll(&self, packet: &mut Packet, enable_notifications: bool) -> Result<bool, PortBroken>;

    /// Deliver a copy of `packet`. A full destination drops the packet and
    /// still returns `Ok`.
    fn receive(&self, packet: &Packet) -> Result<(), PortBroken>;

    /// Retire a packet previously returned by `poll`, exactly once.
    fn mark_done(&self, packet: &Packet) -> Result<(), PortBroken>;

    /// Flush any interrupts deferred while delivering.
    fn poll_irq(&self) -> Result<(), PortBroken> {
        Ok(())
    }
}

/// Whether two handles name the same port object.
pub fn same_port(a: &Arc<dyn Port>, b: &Arc<dyn Port>) -> bool {
    ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// A port attached to a switch for as long as this guard lives.
pub struct EnabledPort<P: Port + 'static> {
    switch: Arc<Switch>,
    port: Arc<P>,
}

/// Attach `port` to `switch`.
pub fn enable<P: Port + 'static>(switch: &Arc<Switch>, port: Arc<P>) -> Result<EnabledPort<P>, SwitchError> {
    switch.attach_port(port.clone())?;
    Ok(EnabledPort { switch: switch.clone(), port })
}

impl<P: Port + 'static> EnabledPort<P> {
    pub fn port(&self) -> &Arc<P> {
        &self.port
    }

    pub fn switch(&self) -> &Arc<Switch> {
        &self.switch
    }

    /// Detach and wait until the switch loop can no longer touch the port.
    pub fn disable(self) {}
}

impl<P: Port + 'static> Deref for EnabledPort<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.port
    }
}

impl<P: Port + 'static> Drop for EnabledPort<P> {
    fn drop(&mut self) {
        let port: Arc<dyn Port> = self.port.clone();
        self.switch.detach_port(&port);
        self.switch.synchronize();
        debug!(port = %self.port.name(), "port disabled");
    }
}
