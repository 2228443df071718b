pub mod ethernet;
pub mod virtio_net;

pub use ethernet::{parse_eth, EthHeader, MacAddr, ETH_HEADER_LEN};
pub use virtio_net::VirtioNetHdr;
