pub mod builder;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod packet;
pub mod port;

#[cfg(any(test, feature = "simulator"))]
pub mod simulator;

pub use builder::SwitchBuilder;
pub use config::{Poller, SwitchConfig};
pub use engine::Switch;
pub use error::{ControlError, PortBroken, SwitchError};
pub use packet::{Completion, Packet};
pub use port::{EnabledPort, Port};
