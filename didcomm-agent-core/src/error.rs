//! Error types for the didcomm-agent-core crate.

use thiserror::Error;

/// Error type for the agent core library
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid format error
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    /// Base64 decode error
    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
    /// Invalid signature error
    #[error("Invalid signature")]
    InvalidSignature,
    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    /// The DID string could not be parsed
    #[error("Invalid DID: {0}")]
    InvalidDid(String),
    /// DID resolution error
    #[error("DID resolution error: {0}")]
    DIDResolution(String),
    /// Serialization error
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    /// Signing error
    #[error("Signing error: {0}")]
    Signing(String),
    /// Verification error
    #[error("Verification error: {0}")]
    Verification(String),
    /// Encryption error
    #[error("Encryption error: {0}")]
    Encryption(String),
    /// Decryption error
    #[error("Decryption error: {0}")]
    Decryption(String),
    /// No resolver, registrar or registry is registered for the method or namespace
    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),
    /// A registration did not reach durable acceptance in time
    #[error("Registration timed out: {0}")]
    RegistrationTimeout(String),
    /// A backend failure that may succeed when retried
    #[error("Transient backend failure: {0}")]
    Transient(String),
    /// An endpoint refused a delivery for good
    #[error("Delivery rejected: {0}")]
    DeliveryRejected(String),
    /// A registry rejected a read or write
    #[error("Registry error: {0}")]
    Registry(String),
    /// AnonCreds backend failure
    #[error("AnonCreds error: {0}")]
    AnonCreds(String),
    /// A record or registry object does not exist
    #[error("Not found: {0}")]
    NotFound(String),
    /// Record store failure
    #[error("Storage error: {0}")]
    Storage(String),
    /// The stored record changed underneath an update
    #[error("State conflict: {0}")]
    StateConflict(String),
}

impl Error {
    /// Whether the failure is worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

/// Result type for the agent core library
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = [
            (Error::UnsupportedMethod("did:foo".into()), "Unsupported method: did:foo"),
            (Error::StateConflict("stale".into()), "State conflict: stale"),
            (Error::MissingField("from"), "Missing required field: from"),
            (Error::InvalidSignature, "Invalid signature"),
        ];

        for (error, expected) in &errors {
            assert_eq!(error.to_string(), *expected);
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transient("503".into()).is_transient());
        assert!(!Error::UnsupportedMethod("did:foo".into()).is_transient());
        assert!(!Error::RegistrationTimeout("schema".into()).is_transient());
    }
}
