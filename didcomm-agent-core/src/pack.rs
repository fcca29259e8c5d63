//! Message packing and unpacking functionality.
//!
//! This module turns plaintext [`Message`]s into envelopes and back, using the
//! [`DIDCommPlugin`] gateway for every cryptographic operation.
//!
//! - Signed: a general JWS JSON envelope whose protected header names the
//!   signing key (`kid`)
//! - AuthCrypt / AnonCrypt: a JWE JSON style envelope whose `recipients`
//!   list names every recipient DID and whose protected header carries the
//!   sender (`skid`) for authenticated encryption

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::{
    error::Result,
    plugin::DIDCommPlugin,
    types::{PackedMessage, PackingType},
    Error, Message,
};

/// Media type of encrypted envelopes.
pub const ENCRYPTED_MEDIA_TYPE: &str = "application/didcomm-encrypted+json";

/// Media type of signed envelopes.
pub const SIGNED_MEDIA_TYPE: &str = "application/didcomm-signed+json";

#[derive(Debug, Serialize, Deserialize)]
struct ProtectedHeader {
    typ: String,
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    skid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SignatureEntry {
    protected: String,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct SignedEnvelope {
    payload: String,
    signatures: Vec<SignatureEntry>,
}

#[derive(Debug, Deserialize)]
struct RecipientHeader {
    kid: String,
}

#[derive(Debug, Deserialize)]
struct RecipientEntry {
    header: RecipientHeader,
}

#[derive(Debug, Deserialize)]
struct EncryptedEnvelope {
    protected: String,
    recipients: Vec<RecipientEntry>,
    ciphertext: String,
}

fn encode_header(header: &ProtectedHeader) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(header)?))
}

fn decode_header(encoded: &str) -> Result<ProtectedHeader> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Pack a `DIDComm` message using the specified packing type.
///
/// # Errors
///
/// Returns an error if:
/// - Message serialization fails
/// - Plugin operations (signing/encryption) fail
/// - Required fields are missing for the chosen packing type
pub async fn pack_message(
    message: &Message,
    plugin: &dyn DIDCommPlugin,
    packing_type: PackingType,
) -> Result<PackedMessage> {
    let msg_json = serde_json::to_vec(message)?;

    let data = match packing_type {
        PackingType::Signed => {
            let from = message.from.as_deref().ok_or(Error::MissingField("from"))?;
            let protected = encode_header(&ProtectedHeader {
                typ: SIGNED_MEDIA_TYPE.to_string(),
                alg: "EdDSA".to_string(),
                kid: Some(from.to_string()),
                skid: None,
            })?;
            let payload = URL_SAFE_NO_PAD.encode(&msg_json);
            let signing_input = format!("{protected}.{payload}");

            let signature = plugin
                .signer()
                .sign(signing_input.as_bytes(), from)
                .await
                .map_err(|e| Error::Signing(e.to_string()))?;

            json!({
                "payload": payload,
                "signatures": [{
                    "protected": protected,
                    "signature": URL_SAFE_NO_PAD.encode(signature),
                }]
            })
        }
        PackingType::AuthcryptV2 | PackingType::AnonV2 => {
            let to = message.to.as_ref().ok_or(Error::MissingField("to"))?;
            if to.is_empty() {
                return Err(Error::MissingField("to"));
            }

            let (alg, sender) = if packing_type == PackingType::AuthcryptV2 {
                let from = message.from.as_deref().ok_or(Error::MissingField("from"))?;
                ("ECDH-1PU+A256KW", Some(from))
            } else {
                ("ECDH-ES+A256KW", None)
            };

            let recipients: Vec<&str> = to.iter().map(String::as_str).collect();
            let ciphertext = plugin
                .encryptor()
                .encrypt(&msg_json, &recipients, sender)
                .await
                .map_err(|e| Error::Encryption(e.to_string()))?;

            let protected = encode_header(&ProtectedHeader {
                typ: ENCRYPTED_MEDIA_TYPE.to_string(),
                alg: alg.to_string(),
                kid: None,
                skid: sender.map(str::to_string),
            })?;

            json!({
                "protected": protected,
                "recipients": recipients
                    .iter()
                    .map(|kid| json!({ "header": { "kid": kid } }))
                    .collect::<Vec<_>>(),
                "ciphertext": URL_SAFE_NO_PAD.encode(ciphertext),
            })
        }
    };

    Ok(PackedMessage {
        data: serde_json::to_string(&data)?,
        packing: packing_type,
    })
}

/// The recipient DIDs named by an encrypted envelope.
///
/// # Errors
///
/// Returns an error if `packed` is not an encrypted envelope.
pub fn envelope_recipients(packed: &str) -> Result<Vec<String>> {
    let envelope: EncryptedEnvelope = serde_json::from_str(packed)
        .map_err(|e| Error::InvalidFormat(format!("not an encrypted envelope: {e}")))?;
    Ok(envelope
        .recipients
        .into_iter()
        .map(|r| r.header.kid)
        .collect())
}

/// A message taken out of its envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct UnpackedMessage {
    /// The plaintext message
    pub message: Message,
    /// DID the envelope proves the message came from: the signer of a JWS or
    /// the `skid` of an authcrypt envelope. `None` for anoncrypt, whose
    /// `from` is only a claim.
    pub sender: Option<String>,
}

/// Unpack a `DIDComm` message.
///
/// For encrypted envelopes, `recipient` selects the local DID to decrypt
/// with; without it every recipient named by the envelope is tried in order.
///
/// # Errors
///
/// Returns an error if:
/// - The packed message is not a known envelope
/// - Signature verification fails
/// - No recipient key can decrypt the message
/// - The authenticated sender does not match the message's `from`
pub async fn unpack_message(
    packed: &str,
    plugin: &dyn DIDCommPlugin,
    recipient: Option<&str>,
) -> Result<UnpackedMessage> {
    let value: serde_json::Value = serde_json::from_str(packed)
        .map_err(|e| Error::InvalidFormat(format!("Invalid JSON: {e}")))?;

    if value.get("signatures").is_some() {
        let envelope: SignedEnvelope = serde_json::from_value(value)?;
        return unpack_signed(envelope, plugin).await;
    }

    if value.get("ciphertext").is_some() {
        let envelope: EncryptedEnvelope = serde_json::from_value(value)?;
        return unpack_encrypted(envelope, plugin, recipient).await;
    }

    Err(Error::InvalidFormat("Invalid message format".into()))
}

async fn unpack_signed(envelope: SignedEnvelope, plugin: &dyn DIDCommPlugin) -> Result<UnpackedMessage> {
    let entry = envelope
        .signatures
        .first()
        .ok_or(Error::MissingField("signatures"))?;
    let header = decode_header(&entry.protected)?;
    let kid = header.kid.ok_or(Error::MissingField("kid"))?;

    let signature = URL_SAFE_NO_PAD.decode(&entry.signature)?;
    let signing_input = format!("{}.{}", entry.protected, envelope.payload);

    let valid = plugin
        .signer()
        .verify(signing_input.as_bytes(), &signature, &kid)
        .await
        .map_err(|e| Error::Verification(e.to_string()))?;
    if !valid {
        return Err(Error::InvalidSignature);
    }

    let payload = URL_SAFE_NO_PAD.decode(&envelope.payload)?;
    let message: Message = serde_json::from_slice(&payload)?;
    if message.from.as_deref() != Some(kid.as_str()) {
        return Err(Error::Verification(format!(
            "message signed by {kid} but sent from {:?}",
            message.from
        )));
    }
    Ok(UnpackedMessage {
        message,
        sender: Some(kid),
    })
}

async fn unpack_encrypted(
    envelope: EncryptedEnvelope,
    plugin: &dyn DIDCommPlugin,
    recipient: Option<&str>,
) -> Result<UnpackedMessage> {
    let header = decode_header(&envelope.protected)?;
    let ciphertext = URL_SAFE_NO_PAD.decode(&envelope.ciphertext)?;

    let candidates: Vec<&str> = match recipient {
        Some(recipient) => vec![recipient],
        None => envelope
            .recipients
            .iter()
            .map(|r| r.header.kid.as_str())
            .collect(),
    };

    let mut plaintext = None;
    for candidate in candidates {
        match plugin.encryptor().decrypt(&ciphertext, candidate).await {
            Ok(bytes) => {
                plaintext = Some(bytes);
                break;
            }
            Err(e) => debug!(recipient = candidate, "decryption attempt failed: {e}"),
        }
    }
    let plaintext =
        plaintext.ok_or_else(|| Error::Decryption("no recipient key could decrypt".into()))?;

    let message: Message = serde_json::from_slice(&plaintext)?;
    if let Some(skid) = &header.skid {
        if message.from.as_deref() != Some(skid.as_str()) {
            return Err(Error::Decryption(format!(
                "authenticated sender {skid} does not match message sender"
            )));
        }
    }
    Ok(UnpackedMessage {
        message,
        sender: header.skid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPlugin;
    use serde_json::json;

    fn test_message() -> Message {
        Message::new(
            "https://didcomm.org/basicmessage/2.0/message",
            json!({ "content": "hello" }),
        )
        .from("did:example:alice")
        .to(vec!["did:example:bob"])
    }

    #[tokio::test]
    async fn test_pack_signed() -> Result<()> {
        let plugin = MockPlugin::new();
        let message = test_message();

        let packed = pack_message(&message, &plugin, PackingType::Signed).await?;
        let packed_json: serde_json::Value = serde_json::from_str(&packed.data)?;
        assert!(packed_json["payload"].is_string());
        assert_eq!(packed_json["signatures"].as_array().map(Vec::len), Some(1));

        let unpacked = unpack_message(&packed.data, &plugin, None).await?;
        assert_eq!(unpacked.message, message);
        assert_eq!(unpacked.sender.as_deref(), Some("did:example:alice"));
        Ok(())
    }

    #[tokio::test]
    async fn test_tampered_signature_is_rejected() -> Result<()> {
        let plugin = MockPlugin::new();
        let packed = pack_message(&test_message(), &plugin, PackingType::Signed).await?;

        let mut envelope: serde_json::Value = serde_json::from_str(&packed.data)?;
        let forged = Message::new("https://didcomm.org/basicmessage/2.0/message", json!({}))
            .from("did:example:alice");
        envelope["payload"] = json!(URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged)?));

        let result = unpack_message(&envelope.to_string(), &plugin, None).await;
        assert!(matches!(result, Err(Error::InvalidSignature)));
        Ok(())
    }

    #[tokio::test]
    async fn test_authcrypt_roundtrip_names_recipients() -> Result<()> {
        let plugin = MockPlugin::new();
        let message = test_message();

        let packed = pack_message(&message, &plugin, PackingType::AuthcryptV2).await?;
        assert_eq!(envelope_recipients(&packed.data)?, vec!["did:example:bob"]);

        let unpacked = unpack_message(&packed.data, &plugin, Some("did:example:bob")).await?;
        assert_eq!(unpacked.message.body, json!({ "content": "hello" }));
        assert_eq!(unpacked.sender.as_deref(), Some("did:example:alice"));

        let wrong = unpack_message(&packed.data, &plugin, Some("did:example:eve")).await;
        assert!(matches!(wrong, Err(Error::Decryption(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_anoncrypt_does_not_require_sender() -> Result<()> {
        let plugin = MockPlugin::new();
        let mut message = test_message();
        message.from = None;

        let packed = pack_message(&message, &plugin, PackingType::AnonV2).await?;
        let unpacked = unpack_message(&packed.data, &plugin, None).await?;
        assert_eq!(unpacked.message.from, None);
        assert_eq!(unpacked.sender, None);

        assert!(matches!(
            pack_message(&message, &plugin, PackingType::AuthcryptV2).await,
            Err(Error::MissingField("from"))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_anoncrypt_sender_claim_is_not_authenticated() -> Result<()> {
        let plugin = MockPlugin::new();
        let claimed = test_message();

        let packed = pack_message(&claimed, &plugin, PackingType::AnonV2).await?;
        let unpacked = unpack_message(&packed.data, &plugin, None).await?;
        assert_eq!(unpacked.message.from.as_deref(), Some("did:example:alice"));
        assert_eq!(unpacked.sender, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_plaintext_is_not_an_envelope() {
        let plugin = MockPlugin::new();
        let plaintext = serde_json::to_string(&test_message()).unwrap();
        assert!(matches!(
            unpack_message(&plaintext, &plugin, None).await,
            Err(Error::InvalidFormat(_))
        ));
    }
}
