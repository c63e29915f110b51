//! Nimbus Storage - Store contract and in-memory reference implementation
//!
//! This crate provides:
//! - The `Store` trait: the narrow persistence contract the network
//!   engine issues against persisted entities
//! - `MemoryStore`, an in-memory implementation whose single write lock
//!   makes the two required primitives (pool claim, host claim) atomic
//! - Typed patch structs for the row updates the engine performs

pub mod error;
pub mod memory;
pub mod store;

// Re-export commonly used types
pub use error::{Result, StorageError};
pub use memory::MemoryStore;
pub use store::{FixedIpUpdate, NetworkUpdate, Store};
