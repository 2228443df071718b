use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Poller {
    /// Never arms notifications; the loop spins on every port.
    Busy,
    /// Arms notifications after the first idle round and sleeps as soon as
    /// nothing arrives.
    Wait,
    /// Keeps polling for the idle timeout, then arms notifications and sleeps.
    Adaptive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchConfig {
    /// Packets taken from one port per quantum.
    pub batch_size: usize,
    /// How long an idle switch keeps polling before arming notifications.
    pub idle_poll: Duration,
    pub poller: Poller,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            idle_poll: Duration::from_micros(50),
            poller: Poller::Adaptive,
        }
    }
}

impl SwitchConfig {
    /// Idle time after which notifications are armed, `None` for never.
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.poller {
            Poller::Busy => None,
            Poller::Wait => Some(Duration::ZERO),
            Poller::Adaptive => Some(self.idle_poll),
        }
    }
}
