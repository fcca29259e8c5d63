//! Agent configuration.
//!
//! Configuration is owned by the [`crate::Agent`]. Components read a snapshot
//! when they need it; the only runtime writer is [`crate::Agent::set_endpoints`].

use didcomm_agent_core::{PackingType, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When a protocol step is taken without an explicit application call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AutoAccept {
    /// Always take the next step.
    Always,
    /// Take the next step only if the received content matches what this
    /// agent approved earlier in the thread. Without earlier content the
    /// step is taken.
    ContentApproved,
    /// Wait for the application.
    #[default]
    Never,
}

/// Auto-accept policy of credential exchanges.
pub type AutoAcceptCredential = AutoAccept;

/// Auto-accept policy of proof exchanges.
pub type AutoAcceptProof = AutoAccept;

/// Configuration for outbound message dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Timeout of a single HTTP delivery attempt
    pub timeout: Duration,
    /// Retry policy for failed deliveries
    pub retry: RetryPolicy,
    /// How long an empty delivery queue keeps its worker
    pub idle_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Configuration for an [`crate::Agent`].
///
/// # Examples
///
/// ```rust
/// use didcomm_agent_node::AgentConfig;
///
/// let config = AgentConfig {
///     label: "Faber College".to_string(),
///     endpoints: vec!["http://localhost:8020/didcomm".to_string()],
///     auto_accept_connections: true,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Label presented to peers in invitations and requests
    pub label: String,

    /// Endpoints this agent receives messages at
    pub endpoints: Vec<String>,

    /// Respond to connection requests without waiting for the application
    pub auto_accept_connections: bool,

    /// Default auto-accept policy of credential exchanges
    pub auto_accept_credentials: AutoAcceptCredential,

    /// Default auto-accept policy of proof exchanges
    pub auto_accept_proofs: AutoAcceptProof,

    /// Envelope used for outbound protocol messages
    pub default_packing: PackingType,

    /// Bound on schema, credential definition and DID registrations
    pub registration_timeout: Duration,

    /// Retry policy for registry and resolver calls
    pub retry: RetryPolicy,

    /// Configuration for message dispatch
    pub dispatch: DispatchConfig,

    /// Interval at which waits re-read the record they wait on
    pub wait_poll: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            label: "didcomm-agent".to_string(),
            endpoints: Vec::new(),
            auto_accept_connections: false,
            auto_accept_credentials: AutoAccept::Never,
            auto_accept_proofs: AutoAccept::Never,
            default_packing: PackingType::AuthcryptV2,
            registration_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            dispatch: DispatchConfig::default(),
            wait_poll: Duration::from_millis(250),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert!(config.endpoints.is_empty());
        assert!(!config.auto_accept_connections);
        assert_eq!(config.auto_accept_credentials, AutoAccept::Never);
        assert_eq!(config.default_packing, PackingType::AuthcryptV2);
        assert_eq!(config.dispatch.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_auto_accept_serialization() {
        let json = serde_json::to_string(&AutoAccept::ContentApproved).unwrap();
        assert_eq!(json, r#""contentApproved""#);
    }
}
