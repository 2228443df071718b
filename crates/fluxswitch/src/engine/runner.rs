use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fluxswitch_core::sys::EventFd;
use fluxswitch_proto::MacAddr;
use tracing::{debug, error, info, warn};

use crate::config::SwitchConfig;
use crate::engine::mac_table::{MacTable, MAX_PORTS};
use crate::engine::quantum::{BrokenPort, QuantumContext};
use crate::engine::rcu::{Rcu, RcuReader};
use crate::engine::timer::Timer;
use crate::error::SwitchError;
use crate::port::{same_port, Port};

/// Immutable snapshot of the port set and the addresses learned on it.
pub struct Generation {
    pub(crate) ports: Vec<Arc<dyn Port>>,
    pub(crate) mac_table: MacTable,
}

impl Generation {
    pub(crate) fn with_ports(ports: Vec<Arc<dyn Port>>) -> Self {
        Self { ports, mac_table: MacTable::new() }
    }

    pub fn ports(&self) -> &[Arc<dyn Port>] {
        &self.ports
    }

    pub fn mac_table(&self) -> &MacTable {
        &self.mac_table
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Work,
    Idle,
    NotificationEnable,
}

/// The switch: a port set, a MAC table and the loop that moves frames.
///
/// Ports are attached and detached from any thread. Exactly one thread runs
/// [`Switch::run`], which never blocks on the locks those threads take.
pub struct Switch {
    config: SwitchConfig,
    state: Rcu<Generation>,
    wakeup: Arc<EventFd>,
    shutdown: AtomicBool,
}

impl Switch {
    pub fn new(config: SwitchConfig) -> Result<Arc<Self>, SwitchError> {
        let wakeup = Arc::new(EventFd::new()?);
        debug!(batch_size = config.batch_size, poller = ?config.poller, "switch created");
        Ok(Arc::new(Self {
            config,
            state: Rcu::new(Generation::with_ports(Vec::new())),
            wakeup,
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.config
    }

    /// The doorbell the loop sleeps on. Ports and remote clients write it
    /// to wake the loop.
    pub fn notifier(&self) -> Arc<EventFd> {
        self.wakeup.clone()
    }

    /// Wake the loop if it is blocked. Safe from any thread.
    pub fn schedule_poll(&self) {
        if let Err(e) = self.wakeup.notify() {
            error!(error = %e, "failed to wake switch loop");
        }
    }

    /// Ask the loop to return. Idempotent; only writes an eventfd, so it may
    /// be called from a signal handler.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.wakeup.notify();
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Add a port at the front of the port list and start over with an
    /// empty MAC table. Attaching a port twice is a no-op.
    pub fn attach_port(&self, port: Arc<dyn Port>) -> Result<(), SwitchError> {
        let mut full = false;
        let added = self.state.update(|old| {
            if old.ports.iter().any(|p| same_port(p, &port)) {
                return None;
            }
            if old.ports.len() >= MAX_PORTS {
                full = true;
                return None;
            }
            let mut ports = Vec::with_capacity(old.ports.len() + 1);
            ports.push(port.clone());
            ports.extend(old.ports.iter().cloned());
            Some(Generation::with_ports(ports))
        });
        if full {
            return Err(SwitchError::PortSetup(format!("port limit of {MAX_PORTS} reached")));
        }
        if added {
            info!(port = %port.name(), "port attached");
            self.schedule_poll();
        }
        Ok(())
    }

    /// Remove a port. The loop may still be using it, and a retired
    /// generation may still hold it, until the next [`Switch::synchronize`]
    /// returns.
    pub fn detach_port(&self, port: &Arc<dyn Port>) {
        let removed = self.state.update(|old| without(old, |p| same_port(p, port)));
        if removed {
            info!(port = %port.name(), "port detached");
            self.schedule_poll();
        }
    }

    /// Wait until the loop holds no reference to any generation published
    /// before this call and every retired generation has been dropped.
    /// Must not be called from the loop thread.
    pub fn synchronize(&self) {
        self.state.synchronize();
    }

    pub fn ports(&self) -> Vec<Arc<dyn Port>> {
        self.state.with_current(|generation| generation.ports.clone())
    }

    /// Port on which `addr` was last seen.
    pub fn lookup(&self, addr: &MacAddr) -> Option<Arc<dyn Port>> {
        self.state.with_current(|generation| {
            let index = generation.mac_table.lookup(addr)?;
            generation.ports.get(index as usize).cloned()
        })
    }

    /// Run the switch loop on the calling thread until [`Switch::shutdown`].
    ///
    /// The loop polls while there is work, keeps polling for the idle
    /// timeout once there is none, then does one more round with
    /// notifications armed and sleeps on the wakeup eventfd.
    pub fn run(&self) -> Result<(), SwitchError> {
        let mut reader = self.state.reader().ok_or(SwitchError::AlreadyPolling)?;
        let mut ctx = QuantumContext::new(self.config.batch_size);
        let idle_timeout = self.config.idle_timeout();
        let mut timer = Timer::new(idle_timeout.unwrap_or_default());

        info!(
            batch_size = self.config.batch_size,
            poller = ?self.config.poller,
            "switch loop started"
        );

        while !self.should_shutdown() {
            let mut state = LoopState::Work;
            while !self.should_shutdown() {
                reader.quiescent();
                let enable_notifications = state == LoopState::NotificationEnable;
                if self.iterate(&reader, &mut ctx, enable_notifications) {
                    state = LoopState::Work;
                    continue;
                }
                match state {
                    LoopState::Work => {
                        if idle_timeout.is_some() {
                            state = LoopState::Idle;
                            timer.arm();
                        }
                    }
                    LoopState::Idle => {
                        if timer.elapsed(1) {
                            state = LoopState::NotificationEnable;
                        }
                    }
                    LoopState::NotificationEnable => break,
                }
            }
            if self.should_shutdown() {
                break;
            }

            reader.offline();
            let woken = self.wakeup.wait();
            reader.online();
            if let Err(e) = woken {
                error!(error = %e, "waiting for wakeup failed");
                return Err(e.into());
            }
        }

        info!("switch loop stopped");
        Ok(())
    }

    /// Run a single quantum over all ports from the calling thread.
    /// Public for testing and for embedders that drive their own loop.
    pub fn process_quantum(&self, enable_notifications: bool) -> Result<bool, SwitchError> {
        let mut reader = self.state.reader().ok_or(SwitchError::AlreadyPolling)?;
        reader.quiescent();
        let mut ctx = QuantumContext::new(self.config.batch_size);
        Ok(self.iterate(&reader, &mut ctx, enable_notifications))
    }

    /// One quantum plus handling of ports that broke during it. Returns
    /// whether any work was done.
    fn iterate(&self, reader: &RcuReader<'_, Generation>, ctx: &mut QuantumContext, notify: bool) -> bool {
        self.retry_detach(ctx);
        let generation = reader.read();
        match ctx.work_quantum(generation, notify) {
            Ok(work_done) => work_done,
            Err(broken) => {
                for BrokenPort { port, cause } in broken {
                    warn!(port = %port.name(), reason = %cause, "port broken, detaching");
                    ctx.quarantine(&port);
                }
                self.retry_detach(ctx);
                true
            }
        }
    }

    /// Detach quarantined ports unless a writer holds the lock, in which
    /// case they stay skipped and are retried next iteration.
    fn retry_detach(&self, ctx: &mut QuantumContext) {
        if !ctx.has_quarantine() {
            return;
        }
        let detached = self.state.try_update(|old| {
            let new = without(old, |port| ctx.is_quarantined(port))?;
            for port in old.ports.iter().filter(|port| ctx.is_quarantined(port)) {
                info!(port = %port.name(), "port detached");
            }
            Some(new)
        });
        if detached.is_some() {
            ctx.release_quarantine();
        }
    }
}

/// `old` minus the ports matching `gone`, or `None` if none does.
fn without(old: &Generation, gone: impl Fn(&Arc<dyn Port>) -> bool) -> Option<Generation> {
    let kept: Vec<Arc<dyn Port>> = old.ports.iter().filter(|&p| !gone(p)).cloned().collect();
    (kept.len() != old.ports.len()).then(|| Generation::with_ports(kept))
}
