//! Shared data model for the stratus DNS control-plane bridge.
//!
//! The entities here mirror what the record store persists: zones, provider
//! configurations, credentials, notify targets, and the append-only record
//! log. Everything is plain serde data so the store and the admin API can
//! share one representation.

pub mod error;
pub mod name;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    Credential, CredentialKind, NotifyProtocol, ProviderConfig,
    ProviderRecord, Record, RecordKey, RrsetKey, Zone, ZoneCredential,
    ZoneNotify,
};
