//! Node-local network reconciliation agent for edge meshes.
//!
//! The agent keeps this node's tunnel, NAT, service-proxy and DNS
//! configuration in line with a changing view of its peers. Peers come
//! from the tunnels file and, with auto-networking, from LAN multicast
//! announcements; a debounced reconciliation loop plus a periodic
//! heartbeat push the complete desired state to the subsystems that
//! enforce it.

pub mod apply;
pub mod backup;
pub mod config;
pub mod debounce;
pub mod discovery;
pub mod manager;
pub mod reconcile;
pub mod sources;
pub mod sweeper;
pub mod table;
pub mod types;

pub use config::Config;
pub use manager::{Manager, ManagerError};
