use std::sync::Arc;
use std::time::Duration;

use crate::config::{Poller, SwitchConfig};
use crate::engine::Switch;
use crate::error::SwitchError;

/// Largest accepted batch; one quantum must stay short enough to keep
/// quiescent points frequent.
const MAX_BATCH_SIZE: usize = 4096;

pub struct SwitchBuilder {
    config: SwitchConfig,
}

impl SwitchBuilder {
    pub fn new() -> Self {
        Self { config: SwitchConfig::default() }
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn idle_poll(mut self, duration: Duration) -> Self {
        self.config.idle_poll = duration;
        self
    }

    pub fn poll_us(self, us: u64) -> Self {
        self.idle_poll(Duration::from_micros(us))
    }

    pub fn poller(mut self, poller: Poller) -> Self {
        self.config.poller = poller;
        self
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.config
    }

    pub fn build(self) -> Result<Arc<Switch>, SwitchError> {
        if self.config.batch_size == 0 || self.config.batch_size > MAX_BATCH_SIZE {
            return Err(SwitchError::InvalidConfiguration(format!(
                "batch size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.config.batch_size
            )));
        }
        Switch::new(self.config)
    }
}

impl Default for SwitchBuilder {
    fn default() -> Self {
        Self::new()
    }
}
