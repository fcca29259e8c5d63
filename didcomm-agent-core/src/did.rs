//! Decentralized Identifier (DID) handling.
//!
//! Generic DID parsing and DID Documents, plus the key-derived `did:key`
//! method which can be resolved and created without any network backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::plugin::{DIDCommPlugin, DIDRegistrar, DIDResolver};
use crate::{Error, Result};

/// Multicodec prefix of an Ed25519 public key.
const ED25519_MULTICODEC: [u8; 2] = [0xed, 0x01];

/// Service type used for DIDComm endpoints.
pub const DIDCOMM_SERVICE_TYPE: &str = "did-communication";

/// A parsed DID: `did:<method>:<method-specific-id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Did {
    method: String,
    id: String,
}

impl Did {
    /// The DID method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Everything after the method name.
    pub fn method_specific_id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "did:{}:{}", self.method, self.id)
    }
}

impl FromStr for Did {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        if parts.next() != Some("did") {
            return Err(Error::InvalidDid(format!("{s}: must start with 'did'")));
        }

        let method = parts
            .next()
            .filter(|m| !m.is_empty() && m.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()))
            .ok_or_else(|| Error::InvalidDid(format!("{s}: invalid method")))?;

        let id = parts
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::InvalidDid(format!("{s}: missing method-specific id")))?;

        Ok(Self {
            method: method.to_string(),
            id: id.to_string(),
        })
    }
}

/// A verification method inside a DID Document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    /// Fully qualified key id (`did#fragment`)
    pub id: String,
    /// Verification method type
    #[serde(rename = "type")]
    pub typ: String,
    /// Controlling DID
    pub controller: String,
    /// Multibase encoded public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_multibase: Option<String>,
}

/// A service entry inside a DID Document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Service id
    pub id: String,
    /// Service type
    #[serde(rename = "type")]
    pub typ: String,
    /// Endpoint URL
    pub service_endpoint: String,
    /// Keys (as DIDs) that messages for this service are encrypted to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipient_keys: Vec<String>,
    /// Mediator keys, outermost last
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_keys: Vec<String>,
}

impl Service {
    /// A DIDComm service for `did` reachable at `endpoint`.
    pub fn didcomm(did: &str, index: usize, endpoint: impl Into<String>) -> Self {
        Self {
            id: format!("{did}#didcomm-{index}"),
            typ: DIDCOMM_SERVICE_TYPE.to_string(),
            service_endpoint: endpoint.into(),
            recipient_keys: vec![did.to_string()],
            routing_keys: Vec::new(),
        }
    }
}

/// A DID Document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    /// JSON-LD context
    #[serde(rename = "@context", default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
    /// The DID this document describes
    pub id: String,
    /// Verification methods
    #[serde(default)]
    pub verification_method: Vec<VerificationMethod>,
    /// Authentication key references
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authentication: Vec<String>,
    /// Key agreement key references
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_agreement: Vec<String>,
    /// Service endpoints
    #[serde(default)]
    pub service: Vec<Service>,
}

impl DidDocument {
    /// An empty document for `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            context: vec!["https://www.w3.org/ns/did/v1".to_string()],
            id: id.into(),
            verification_method: Vec::new(),
            authentication: Vec::new(),
            key_agreement: Vec::new(),
            service: Vec::new(),
        }
    }

    /// The first DIDComm service entry, if any.
    pub fn didcomm_service(&self) -> Option<&Service> {
        self.service
            .iter()
            .find(|s| s.typ == DIDCOMM_SERVICE_TYPE || s.typ == "DIDCommMessaging")
    }

    /// Adds one DIDComm service per endpoint.
    #[must_use]
    pub fn with_endpoints(mut self, endpoints: &[String]) -> Self {
        let did = self.id.clone();
        self.service.extend(
            endpoints
                .iter()
                .enumerate()
                .map(|(index, endpoint)| Service::didcomm(&did, index, endpoint.clone())),
        );
        self
    }
}

/// Options for creating a DID through a registrar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DidCreateOptions {
    /// Seed for deterministic key creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<Vec<u8>>,
    /// Endpoints to publish as DIDComm services, where the method supports it
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Method specific options (e.g. the ledger namespace)
    #[serde(default)]
    pub method_options: serde_json::Value,
}

/// Outcome of a successful DID creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidCreateResult {
    /// The created DID
    pub did: String,
    /// Its document
    pub document: DidDocument,
    /// Reference to the private key in the secure store
    pub key_reference: Option<String>,
}

/// Encodes an Ed25519 public key as a `did:key`.
///
/// # Errors
///
/// Returns an error if the key is not 32 bytes long.
pub fn did_key_from_ed25519(public_key: &[u8]) -> Result<String> {
    if public_key.len() != 32 {
        return Err(Error::InvalidDid(format!(
            "public key must be 32 bytes, got {}",
            public_key.len()
        )));
    }

    let mut bytes = Vec::with_capacity(34);
    bytes.extend_from_slice(&ED25519_MULTICODEC);
    bytes.extend_from_slice(public_key);
    Ok(format!("did:key:z{}", bs58::encode(bytes).into_string()))
}

/// Extracts the Ed25519 public key of a `did:key`.
///
/// # Errors
///
/// Returns an error if the DID is not a base58btc Ed25519 `did:key`.
pub fn ed25519_from_did_key(did: &str) -> Result<Vec<u8>> {
    let parsed: Did = did.parse()?;
    if parsed.method() != "key" {
        return Err(Error::InvalidDid(format!("{did}: not a did:key")));
    }

    let multibase = parsed
        .method_specific_id()
        .split('#')
        .next()
        .unwrap_or_default();
    let encoded = multibase
        .strip_prefix('z')
        .ok_or_else(|| Error::InvalidDid(format!("{did}: only base58btc keys are supported")))?;

    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| Error::InvalidDid(format!("{did}: {e}")))?;

    if bytes.len() != 34 || bytes[..2] != ED25519_MULTICODEC {
        return Err(Error::InvalidDid(format!("{did}: not an Ed25519 key")));
    }
    Ok(bytes[2..].to_vec())
}

/// Resolves `did:key` DIDs by expanding the key into a document.
#[derive(Debug, Default, Clone)]
pub struct KeyDidResolver;

#[async_trait]
impl DIDResolver for KeyDidResolver {
    fn method(&self) -> &str {
        "key"
    }

    async fn resolve(&self, did: &str) -> Result<DidDocument> {
        ed25519_from_did_key(did)?;

        let multibase = did.trim_start_matches("did:key:").to_string();
        let key_id = format!("{did}#{multibase}");

        let mut document = DidDocument::new(did);
        document.verification_method.push(VerificationMethod {
            id: key_id.clone(),
            typ: "Ed25519VerificationKey2020".to_string(),
            controller: did.to_string(),
            public_key_multibase: Some(multibase),
        });
        document.authentication.push(key_id.clone());
        document.key_agreement.push(key_id);
        Ok(document)
    }
}

/// Creates `did:key` DIDs from keys generated by the gateway.
pub struct KeyDidRegistrar {
    plugin: Arc<dyn DIDCommPlugin>,
}

impl KeyDidRegistrar {
    /// Creates a registrar that generates its keys through `plugin`.
    pub fn new(plugin: Arc<dyn DIDCommPlugin>) -> Self {
        Self { plugin }
    }
}

#[async_trait]
impl DIDRegistrar for KeyDidRegistrar {
    fn method(&self) -> &str {
        "key"
    }

    async fn create(&self, options: &DidCreateOptions) -> Result<DidCreateResult> {
        let key = self.plugin.keys().create_key(options.seed.as_deref()).await?;
        let did = did_key_from_ed25519(&key.public_key)?;
        self.plugin.keys().assign_did(&key.key_reference, &did).await?;

        let document = KeyDidResolver.resolve(&did).await?;
        Ok(DidCreateResult {
            did,
            document,
            key_reference: Some(key.key_reference),
        })
    }
}
