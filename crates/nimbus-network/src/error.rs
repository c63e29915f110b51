use miette::Diagnostic;
use std::net::Ipv4Addr;
use thiserror::Error;
use uuid::Uuid;

/// Error type for network engine operations
#[derive(Error, Debug, Diagnostic)]
pub enum NetworkError {
    /// Invalid network creation parameters
    #[error("Invalid network parameters: {message}")]
    #[diagnostic(code(nimbus::network::invalid_network), help("{suggestion}"))]
    InvalidNetwork {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// A network with an overlapping cidr already exists
    #[error("Network with cidr {cidr} already exists")]
    #[diagnostic(
        code(nimbus::network::cidr_conflict),
        help("Pick a block that does not overlap an existing network")
    )]
    CidrConflict {
        #[allow(unused)]
        cidr: String,
    },

    /// Could not mint a unique mac address within the attempt budget
    #[error("Unable to create a unique mac address for instance {instance_id} after {attempts} attempts")]
    #[diagnostic(
        code(nimbus::network::mac_exhausted),
        help("The 24-bit mac space is under pressure; retry, or raise create_unique_mac_address_attempts")
    )]
    MacExhausted {
        #[allow(unused)]
        instance_id: Uuid,
        #[allow(unused)]
        attempts: u32,
    },

    /// Floating ip quota check failed before any state change
    #[error("Address quota exceeded for project {project_id}")]
    #[diagnostic(
        code(nimbus::network::quota_exceeded),
        help("Release unused floating ips or raise the project quota")
    )]
    QuotaExceeded {
        #[allow(unused)]
        project_id: String,
    },

    /// The dhcp daemon reported a lease for an unassociated address
    #[error("IP {address} leased or released that is not associated")]
    #[diagnostic(
        code(nimbus::network::orphan_lease),
        help("The dhcp daemon and the store disagree; audit the network's conf file")
    )]
    OrphanLease {
        #[allow(unused)]
        address: Ipv4Addr,
    },

    /// Operation not offered by the active topology policy
    #[error("Operation not supported by the {policy} policy: {operation}")]
    #[diagnostic(
        code(nimbus::network::unsupported),
        help("Run this operation against a host configured with a capable policy")
    )]
    Unsupported {
        #[allow(unused)]
        policy: &'static str,
        #[allow(unused)]
        operation: &'static str,
    },

    /// Fan-out partially failed; surviving allocations are kept
    #[error("Fixed ip allocation for instance {instance_id} partially failed: {failures:?}")]
    #[diagnostic(
        code(nimbus::network::partial_allocation),
        help("Reconcile by deallocating the instance and retrying")
    )]
    PartialAllocation {
        #[allow(unused)]
        instance_id: Uuid,
        #[allow(unused)]
        failures: Vec<String>,
    },

    /// Remote call failed
    #[error("Bus call failed: {message}")]
    #[diagnostic(
        code(nimbus::network::bus_error),
        help("Check that the target host is registered on the bus topic")
    )]
    Bus {
        #[allow(unused)]
        message: String,
    },

    /// Driver side effect failed
    #[error("Driver operation failed: {message}")]
    #[diagnostic(
        code(nimbus::network::driver_error),
        help("Inspect the forwarding backend; driver operations are safe to re-run")
    )]
    Driver {
        #[allow(unused)]
        message: String,
    },

    /// Storage error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] nimbus_storage::StorageError),
}

/// Result type alias for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

impl NetworkError {
    pub fn invalid_network(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidNetwork {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn cidr_conflict(cidr: impl Into<String>) -> Self {
        Self::CidrConflict { cidr: cidr.into() }
    }

    pub fn quota_exceeded(project_id: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            project_id: project_id.into(),
        }
    }

    pub fn unsupported(policy: &'static str, operation: &'static str) -> Self {
        Self::Unsupported { policy, operation }
    }

    pub fn bus(message: impl Into<String>) -> Self {
        Self::Bus {
            message: message.into(),
        }
    }

    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
        }
    }
}
