//! Core DIDComm v2 type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Base URI shared by the Aries protocol families.
pub const DIDCOMM_ORG: &str = "https://didcomm.org";

/// A DIDComm message type identifier.
///
/// Message types have the shape `https://didcomm.org/<family>/<version>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageType(pub String);

impl MessageType {
    /// Create a new message type
    pub fn new(typ: impl Into<String>) -> Self {
        Self(typ.into())
    }

    /// Build a message type from its protocol family, version and message name.
    #[must_use]
    pub fn from_parts(family: &str, version: &str, name: &str) -> Self {
        Self(format!("{DIDCOMM_ORG}/{family}/{version}/{name}"))
    }

    /// Get the message type as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The protocol URI, i.e. the type without its trailing message name.
    pub fn protocol_uri(&self) -> Option<&str> {
        self.0.rsplit_once('/').map(|(protocol, _)| protocol)
    }

    /// The message name, i.e. the last path segment.
    pub fn name(&self) -> Option<&str> {
        self.0
            .rsplit_once('/')
            .map(|(_, name)| name)
            .filter(|name| !name.is_empty())
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Represents a DIDComm message ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a new message ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a new random message ID
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the message ID as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Represents a DIDComm plaintext message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The message ID
    pub id: MessageId,
    /// The message type
    #[serde(rename = "type")]
    pub typ: MessageType,
    /// Thread the message belongs to. Absent on the first message of a thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thid: Option<String>,
    /// Parent thread, used to correlate a connection request with its invitation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,
    /// The sender's DID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// The recipient's DIDs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Vec<String>>,
    /// The time the message was created
    #[serde(default)]
    pub created_time: u64,
    /// The time the message expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_time: Option<u64>,
    /// The message body
    pub body: serde_json::Value,
    /// Message attachments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Create a new message
    pub fn new(typ: impl Into<String>, body: impl Into<serde_json::Value>) -> Self {
        Self {
            id: MessageId::random(),
            typ: MessageType(typ.into()),
            thid: None,
            pthid: None,
            from: None,
            to: None,
            created_time: unix_time(),
            expires_time: None,
            body: body.into(),
            attachments: Vec::new(),
        }
    }

    /// Set the sender of the message
    #[must_use]
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Set the recipients of the message
    #[must_use]
    pub fn to(mut self, to: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.to = Some(to.into_iter().map(Into::into).collect());
        self
    }

    /// Set the thread id
    #[must_use]
    pub fn thread(mut self, thid: impl Into<String>) -> Self {
        self.thid = Some(thid.into());
        self
    }

    /// Set the parent thread id
    #[must_use]
    pub fn parent_thread(mut self, pthid: impl Into<String>) -> Self {
        self.pthid = Some(pthid.into());
        self
    }

    /// Attach a payload
    #[must_use]
    pub fn attach(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// The thread this message belongs to: `thid` if set, otherwise the message's own id.
    pub fn thread_id(&self) -> &str {
        self.thid.as_deref().unwrap_or(self.id.as_str())
    }

    /// Look up an attachment by id.
    pub fn attachment(&self, id: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.id == id)
    }
}

/// Represents a message attachment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// The attachment ID
    pub id: String,
    /// The attachment description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The attachment filename
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// The attachment media type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// The attachment format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// The attachment data
    pub data: AttachmentData,
}

impl Attachment {
    /// A JSON attachment with the given id and optional format identifier.
    pub fn json(id: impl Into<String>, format: Option<&str>, value: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            description: None,
            filename: None,
            media_type: Some("application/json".to_string()),
            format: format.map(str::to_string),
            data: AttachmentData::Json(value),
        }
    }

    /// Returns the attachment payload as JSON, decoding base64 data if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the attachment is a link or hash, or if base64
    /// data does not decode to JSON.
    pub fn json_value(&self) -> crate::Result<serde_json::Value> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        match &self.data {
            AttachmentData::Json(value) | AttachmentData::Jws(value) => Ok(value.clone()),
            AttachmentData::Base64(encoded) => {
                let bytes = STANDARD.decode(encoded)?;
                Ok(serde_json::from_slice(&bytes)?)
            }
            AttachmentData::Links(_) | AttachmentData::Hash(_) => Err(crate::Error::InvalidFormat(
                format!("attachment {} carries no inline data", self.id),
            )),
        }
    }
}

/// Represents attachment data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentData {
    /// JWS data
    Jws(serde_json::Value),
    /// Hash data
    Hash(serde_json::Value),
    /// Links data
    Links(Vec<String>),
    /// Base64 data
    Base64(String),
    /// JSON data
    Json(serde_json::Value),
}

/// The type of message packing to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackingType {
    /// No encryption, just signed
    Signed,
    /// Authenticated encryption with sender identity
    #[default]
    AuthcryptV2,
    /// Anonymous encryption without sender identity
    AnonV2,
}

/// A packed DIDComm message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackedMessage {
    /// The packed message data.
    pub data: String,
    /// The type of packing used.
    #[serde(skip)]
    pub packing: PackingType,
}

/// Seconds since the unix epoch.
pub fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_serialization() {
        let message = Message::new("https://didcomm.org/test/1.0/ping", json!("world"))
            .from("did:example:alice")
            .to(vec!["did:example:bob"])
            .thread("thread-1");

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "https://didcomm.org/test/1.0/ping");
        assert_eq!(json["thid"], "thread-1");
        assert!(json.get("pthid").is_none());

        let deserialized: Message = serde_json::from_value(json).unwrap();
        assert_eq!(message, deserialized);
    }

    #[test]
    fn test_message_type_parts() {
        let typ = MessageType::from_parts("issue-credential", "2.0", "offer-credential");
        assert_eq!(
            typ.as_str(),
            "https://didcomm.org/issue-credential/2.0/offer-credential"
        );
        assert_eq!(
            typ.protocol_uri(),
            Some("https://didcomm.org/issue-credential/2.0")
        );
        assert_eq!(typ.name(), Some("offer-credential"));
        assert_eq!(MessageType::new("nonsense").protocol_uri(), None);
    }

    #[test]
    fn test_thread_id_defaults_to_message_id() {
        let message = Message::new("https://didcomm.org/test/1.0/ping", json!({}));
        assert_eq!(message.thread_id(), message.id.as_str());

        let reply = Message::new("https://didcomm.org/test/1.0/pong", json!({}))
            .thread(message.id.as_str());
        assert_eq!(reply.thread_id(), message.id.as_str());
    }

    #[test]
    fn test_base64_attachment_decodes_to_json() {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let attachment = Attachment {
            id: "a".into(),
            description: None,
            filename: None,
            media_type: None,
            format: None,
            data: AttachmentData::Base64(STANDARD.encode(br#"{"x":1}"#)),
        };
        assert_eq!(attachment.json_value().unwrap(), json!({"x": 1}));

        let link = Attachment {
            data: AttachmentData::Links(vec!["https://example.com".into()]),
            ..attachment
        };
        assert!(link.json_value().is_err());
    }
}
