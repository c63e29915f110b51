//! Nimbus Core - Entity types and configuration
//!
//! This crate provides:
//! - The network data model (Network, FixedIp, VirtualInterface, FloatingIp)
//! - Network-info assembly types returned to compute hosts
//! - NetworkConfig, the deployment configuration passed into constructors

pub mod config;
pub mod types;

// Re-export commonly used types
pub use config::NetworkConfig;
pub use types::{
    FixedIp, FloatingIp, InstanceId, InstanceType, Ip6Entry, IpEntry, InterfaceInfo, Network,
    NetworkDescriptor, NetworkId, NetworkInfo, ProjectId, VifId, VirtualInterface,
};
