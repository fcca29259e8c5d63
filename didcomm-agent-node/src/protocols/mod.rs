//! Protocol state machines.
//!
//! Each service implements [`crate::dispatcher::ProtocolHandler`] for the
//! protocol URIs it owns and exposes the application API of that protocol.

pub mod connection;
pub mod credential;
pub mod proof;

use didcomm_agent_core::MessageType;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Version of the issue-credential and present-proof protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// `1.0`: legacy-indy only, fixed attachment ids
    V1,
    /// `2.0`: attachments described by a `formats` list
    V2,
}

impl ProtocolVersion {
    /// Version segment of the protocol URI.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "1.0",
            ProtocolVersion::V2 => "2.0",
        }
    }

    /// Version of an inbound message of protocol `family`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedProtocol`] for any other family or version.
    pub fn of_message(family: &str, typ: &MessageType) -> Result<Self> {
        [ProtocolVersion::V1, ProtocolVersion::V2]
            .into_iter()
            .find(|version| typ.protocol_uri() == Some(version.protocol_uri(family).as_str()))
            .ok_or_else(|| Error::UnsupportedProtocol(typ.to_string()))
    }

    /// Protocol URI of `family` at this version.
    #[must_use]
    pub fn protocol_uri(self, family: &str) -> String {
        format!("{}/{family}/{}", didcomm_agent_core::types::DIDCOMM_ORG, self.as_str())
    }

    /// Message type `name` of `family` at this version.
    #[must_use]
    pub fn message_type(self, family: &str, name: &str) -> String {
        MessageType::from_parts(family, self.as_str(), name).0
    }
}
