//! Plugins shipped with the agent

pub mod load;
pub mod network;
pub mod tcp;

pub use load::LoadMetrics;
pub use network::{LinkState, Network, SystemNetwork};
pub use tcp::TcpMetrics;
