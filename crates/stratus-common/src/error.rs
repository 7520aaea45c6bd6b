use thiserror::Error;

/// Error kinds shared across the workspace.
///
/// User-facing surfaces translate these into their own vocabulary: the DNS
/// server maps them to RCODEs with extended DNS errors, the admin API to
/// HTTP statuses with `user:*`/`server:*` codes. Background workers log and
/// count them.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed name, bad base64, unknown type, duplicate, and similar.
    #[error("invalid input: {0}")]
    UserInput(String),

    /// Unknown zone, record, credential, provider config.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unauthenticated, or credential not authorized for the zone.
    #[error("permission denied: {0}")]
    Permission(String),

    /// DNS protocol level failure reported by or to a peer
    /// (FORMERR, BADVERS, BADKEY, BADTIME, BADSIG, NXRRSET, ...).
    #[error("protocol: {0}")]
    Protocol(String),

    /// A southbound provider call failed.
    #[error("provider: {0}")]
    Provider(String),

    /// Deadline exceeded or operation cancelled; retried on the next tick.
    #[error("transient: {0}")]
    Transient(String),

    /// Internal inconsistency. Counted and logged, never user-caused.
    #[error("internal: {0}")]
    Invariant(String),
}

impl Error {
    pub fn user(msg: impl Into<String>) -> Self {
        Error::UserInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Error::Permission(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Error::Provider(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
