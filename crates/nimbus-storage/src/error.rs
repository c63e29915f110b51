use miette::Diagnostic;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Storage error type for store contract operations
#[derive(Error, Debug, Diagnostic)]
pub enum StorageError {
    /// Entity not found
    #[error("{entity} not found: {key}")]
    #[diagnostic(
        code(nimbus::storage::not_found),
        help("Verify the id or address; the row may have been removed out-of-band")
    )]
    NotFound {
        #[allow(unused)]
        entity: &'static str,
        #[allow(unused)]
        key: String,
    },

    /// MAC address unique index violation
    #[error("Virtual interface with mac {mac} already exists")]
    #[diagnostic(
        code(nimbus::storage::mac_conflict),
        help("Regenerate the mac address and retry the insert")
    )]
    MacConflict {
        #[allow(unused)]
        mac: String,
    },

    /// No eligible fixed ip left in a network's pool
    #[error("No free fixed ip remaining in network {network_id}")]
    #[diagnostic(
        code(nimbus::storage::pool_exhausted),
        help("Retry against a different network, or grow the subnet")
    )]
    PoolExhausted {
        #[allow(unused)]
        network_id: u64,
    },

    /// No free floating ip left in the deployment pool
    #[error("No free floating ip remaining in the pool")]
    #[diagnostic(
        code(nimbus::storage::floating_pool_exhausted),
        help("Create more floating ips from the configured floating range")
    )]
    FloatingPoolExhausted,

    /// Fixed ip claimed directly while already bound
    #[error("Fixed ip {address} is already associated")]
    #[diagnostic(
        code(nimbus::storage::address_in_use),
        help("The address is bound to another instance; deallocate it first")
    )]
    AddressInUse {
        #[allow(unused)]
        address: Ipv4Addr,
    },

    /// Floating ip association attempted while one is active
    #[error("Floating ip {address} is already associated with a fixed ip")]
    #[diagnostic(
        code(nimbus::storage::already_associated),
        help("Disassociate the floating ip before associating it again")
    )]
    AlreadyAssociated {
        #[allow(unused)]
        address: Ipv4Addr,
    },

    /// Floating ip released while still associated
    #[error("Floating ip {address} is still associated with a fixed ip")]
    #[diagnostic(
        code(nimbus::storage::still_associated),
        help("Disassociate the floating ip before returning it to the pool")
    )]
    StillAssociated {
        #[allow(unused)]
        address: Ipv4Addr,
    },
}

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn mac_conflict(mac: impl Into<String>) -> Self {
        Self::MacConflict { mac: mac.into() }
    }
}
