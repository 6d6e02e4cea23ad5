#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Protocol engines of the Teredo endpoint: the qualification/maintenance
//! state machine, the peer cache, the relay datapath, local discovery and the
//! server-side datagram handling.
//!
//! All engines are sans-IO: they consume parsed packets plus the coarse clock
//! and return the transmissions they want performed. The binary crate owns
//! the sockets and the tunnel device and pumps them.

mod clock;
mod discovery;
mod maintain;
mod peer_list;
mod relay;
mod security;
mod server;

pub use clock::Clock;
pub use discovery::{eligible_interfaces, Discovery, DiscoveryConfig, NetInterface};
pub use maintain::{Maintenance, MaintenanceConfig, RaError, TeredoState};
pub use peer_list::{PeerEntry, PeerList, PeerRef, PEER_TTL_SECS};
pub use relay::{Rejected, Relay, RelayConfig, Transmit};
pub use security::TokenKeys;
pub use server::{ServerState, ServerTx};
