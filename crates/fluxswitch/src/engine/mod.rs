pub mod mac_table;
pub mod quantum;
pub mod rcu;
pub mod runner;
pub mod timer;

pub use mac_table::{Learned, MacTable, PortIndex};
pub use quantum::{BrokenPort, QuantumContext};
pub use rcu::{Rcu, RcuReader};
pub use runner::{Generation, Switch};
pub use timer::Timer;
