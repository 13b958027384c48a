//! Error types for rusty-dyndns.

use thiserror::Error;

/// Result type alias for rusty-dyndns.
pub type Result<T> = std::result::Result<T, DdnsError>;

/// DDNS error types.
#[derive(Error, Debug)]
pub enum DdnsError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The update program could not be started.
    #[error("Failed to start update session: {0}")]
    Spawn(String),

    /// The update program reported a failure. The text is passed through
    /// verbatim so it can be returned to the caller.
    #[error("{0}")]
    Session(String),

    /// An update session operation was called from a state that does not
    /// allow it.
    #[error("Update session cannot {operation} while {state}")]
    InvalidTransition {
        state: &'static str,
        operation: &'static str,
    },

    /// No usable client address in the forwarding headers or peer.
    #[error("no match")]
    NoClientAddress,

    /// Expiry store error.
    #[error("Expiry store error: {0}")]
    Store(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for DdnsError {
    fn from(e: toml::de::Error) -> Self {
        DdnsError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for DdnsError {
    fn from(e: toml::ser::Error) -> Self {
        DdnsError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for DdnsError {
    fn from(e: serde_json::Error) -> Self {
        DdnsError::Serialization(e.to_string())
    }
}
