//! Error types for the didcomm-agent-node crate.

use thiserror::Error;

/// The main error type for agent operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No protocol handler is registered for the message type.
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// An inbound envelope failed to decrypt or authenticate and was dropped.
    #[error("Message rejected: {0}")]
    MessageRejected(String),

    /// No DID resolver, registrar or credential registry answers for the method or namespace.
    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    /// A message does not match the protocol version or formats the exchange committed to.
    #[error("Format mismatch: {0}")]
    FormatMismatch(String),

    /// The holder has no link secret to request a credential with.
    #[error("A link secret must be created before requesting a credential")]
    LinkSecretRequired,

    /// No stored credential satisfies a requested attribute or predicate.
    #[error("No matching credential for {0}")]
    NoMatchingCredential(String),

    /// A presentation or credential request failed cryptographic verification.
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// A single-use invitation was used a second time.
    #[error("Invitation {0} has already been used")]
    InvitationAlreadyUsed(String),

    /// The invitation is past its expiry time.
    #[error("Invitation {0} has expired")]
    InvitationExpired(String),

    /// A registry or ledger write was not durably accepted in time.
    #[error("Registration timed out: {0}")]
    RegistrationTimeout(String),

    /// The connection did not complete within the caller's timeout.
    #[error("Connection {0} did not complete in time")]
    ConnectionTimeout(String),

    /// The connection was abandoned before it completed.
    #[error("Connection {id} was abandoned: {reason}")]
    ConnectionAbandoned {
        /// Connection id
        id: String,
        /// Why the connection was abandoned
        reason: String,
    },

    /// A credential or proof exchange was abandoned before reaching the awaited state.
    #[error("Exchange {id} was abandoned: {reason}")]
    ExchangeAbandoned {
        /// Exchange id
        id: String,
        /// Why the exchange was abandoned
        reason: String,
    },

    /// A credential or proof exchange did not reach the awaited state in time.
    #[error("Exchange {0} did not reach the expected state in time")]
    ExchangeTimeout(String),

    /// The record changed while a transition was in flight; the transition was discarded.
    #[error("State conflict: {0}")]
    StateConflict(String),

    /// A record referenced by id or thread does not exist.
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// The operation is not allowed in the record's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An error from the core crate.
    #[error("Core error: {0}")]
    Core(didcomm_agent_core::Error),

    /// An error occurred during HTTP operations.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// An error occurred during serialization or deserialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The agent configuration is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<didcomm_agent_core::Error> for Error {
    fn from(error: didcomm_agent_core::Error) -> Self {
        use didcomm_agent_core::Error as Core;

        match error {
            Core::UnsupportedMethod(method) => Error::UnsupportedMethod(method),
            Core::RegistrationTimeout(what) => Error::RegistrationTimeout(what),
            Core::StateConflict(what) => Error::StateConflict(what),
            other => Error::Core(other),
        }
    }
}

impl Error {
    /// Problem report code sent to the peer when this error ends an exchange.
    #[must_use]
    pub fn problem_code(&self) -> &'static str {
        match self {
            Error::FormatMismatch(_) => "format-mismatch",
            Error::VerificationFailed(_) => "verification-failed",
            Error::InvitationAlreadyUsed(_) => "invitation-already-used",
            Error::InvitationExpired(_) => "invitation-expired",
            Error::NoMatchingCredential(_) => "no-matching-credential",
            Error::LinkSecretRequired => "link-secret-required",
            _ => "abandoned",
        }
    }

    /// Whether the error ends the exchange it occurred in, rather than
    /// leaving it for a later retry.
    #[must_use]
    pub fn ends_exchange(&self) -> bool {
        matches!(self, Error::FormatMismatch(_) | Error::VerificationFailed(_))
    }

    /// Rebuilds the typed error for an exchange abandoned with `code`.
    #[must_use]
    pub fn from_problem(id: &str, code: &str, reason: &str) -> Self {
        match code {
            "format-mismatch" => Error::FormatMismatch(reason.to_string()),
            "verification-failed" => Error::VerificationFailed(reason.to_string()),
            "invitation-already-used" => Error::InvitationAlreadyUsed(id.to_string()),
            "invitation-expired" => Error::InvitationExpired(id.to_string()),
            _ => Error::ExchangeAbandoned {
                id: id.to_string(),
                reason: reason.to_string(),
            },
        }
    }
}

/// A specialized Result type for agent operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_keep_their_taxonomy() {
        let mapped: Error = didcomm_agent_core::Error::UnsupportedMethod("did:foo".into()).into();
        assert!(matches!(mapped, Error::UnsupportedMethod(m) if m == "did:foo"));

        let mapped: Error = didcomm_agent_core::Error::StateConflict("stale".into()).into();
        assert!(matches!(mapped, Error::StateConflict(_)));

        let mapped: Error = didcomm_agent_core::Error::RegistrationTimeout("schema".into()).into();
        assert!(matches!(mapped, Error::RegistrationTimeout(_)));

        let mapped: Error = didcomm_agent_core::Error::InvalidSignature.into();
        assert!(matches!(mapped, Error::Core(_)));
    }

    #[test]
    fn test_problem_codes_round_trip() {
        let error = Error::VerificationFailed("bad proof".into());
        let rebuilt = Error::from_problem("x", error.problem_code(), "bad proof");
        assert!(matches!(rebuilt, Error::VerificationFailed(r) if r == "bad proof"));

        let rebuilt = Error::from_problem("x", "abandoned", "cancelled");
        assert!(matches!(rebuilt, Error::ExchangeAbandoned { .. }));
    }
}
