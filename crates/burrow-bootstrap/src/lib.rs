//! Burrow bootstrap registry: the set of known multiaddresses of the home
//! peer, all sharing one canonical peer id.
//!
//! Candidates arrive from the local cache, the direct info query and relay
//! announcements. Each is probed, ranked by latency and persisted to the
//! document store under `p2p:bootstrap-list`.

pub mod address;
pub mod list;
pub mod probe;
pub mod registry;

pub use address::{compare, AddressRecord, BootstrapAddress, Latency};
pub use list::{BootstrapList, Identity};
pub use probe::{dial_target, Prober, TcpProber};
pub use registry::{derived_forms, AddOptions, AddOutcome, Registry};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("malformed multiaddr {0:?}")]
    Malformed(String),

    #[error("multiaddr {0:?} carries no peer id")]
    MissingPeerId(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("storage: {0}")]
    Storage(#[from] burrow_storage::StorageError),

    #[error("no usable bootstrap addresses")]
    NoUsableAddresses,
}

/// Wall clock in unix milliseconds, the unit persisted in `lastSeen`.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
