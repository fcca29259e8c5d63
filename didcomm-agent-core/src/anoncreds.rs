//! AnonCreds objects and the traits of the two AnonCreds collaborators.
//!
//! - [`AnonCredsBackend`] is the cryptographic gateway: link secrets,
//!   blinded commitments, credential signatures and proofs.
//! - [`AnonCredsRegistry`] publishes and reads schemas, credential
//!   definitions and revocation status lists for one identifier namespace.
//!   Registries are composed by [`crate::router::RegistryRouter`].
//!
//! Object shapes follow the AnonCreds JSON encoding so they can travel
//! unchanged inside DIDComm attachments.

use async_trait::async_trait;
use ruint::aliases::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use zeroize::Zeroize;

use crate::Result;

/// A schema: the attribute names a credential carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// DID of the schema author
    pub issuer_id: String,
    /// Schema name
    pub name: String,
    /// Schema version
    pub version: String,
    /// Attribute names
    pub attr_names: Vec<String>,
}

/// A public credential definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialDefinition {
    /// DID of the issuer
    pub issuer_id: String,
    /// Schema the definition is built on
    pub schema_id: String,
    /// Signature type, `CL` for AnonCreds
    #[serde(rename = "type")]
    pub typ: String,
    /// Distinguishes definitions of the same issuer and schema
    pub tag: String,
    /// Public key material, opaque to the agent
    pub value: serde_json::Value,
}

/// A freshly generated credential definition with its private half.
#[derive(Debug, Clone)]
pub struct CreatedCredentialDefinition {
    /// Public part, to be registered
    pub definition: CredentialDefinition,
    /// Private key material, kept by the issuer
    pub private: serde_json::Value,
    /// Proof sent along with every offer
    pub key_correctness_proof: serde_json::Value,
}

/// Revocation state of a revocation registry at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationStatusList {
    /// Revocation registry definition the list belongs to
    pub rev_reg_def_id: String,
    /// Issuer DID
    pub issuer_id: String,
    /// One entry per credential index, `1` meaning revoked
    pub revocation_list: Vec<u8>,
    /// Ledger time of the list
    pub timestamp: u64,
}

impl RevocationStatusList {
    /// Whether the credential at `index` is revoked.
    pub fn is_revoked(&self, index: usize) -> bool {
        self.revocation_list.get(index).copied().unwrap_or_default() == 1
    }
}

/// An issuer's credential offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialOffer {
    /// Schema id
    pub schema_id: String,
    /// Credential definition id
    pub cred_def_id: String,
    /// Proves the issuer knows the credential definition private key
    pub key_correctness_proof: serde_json::Value,
    /// Fresh nonce the request must answer
    pub nonce: String,
}

/// A holder's credential request carrying the blinded link secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRequest {
    /// Holder entropy (or prover DID)
    pub entropy: String,
    /// Credential definition id
    pub cred_def_id: String,
    /// Commitment to the link secret
    pub blinded_ms: serde_json::Value,
    /// Proof of correctness of the commitment
    pub blinded_ms_correctness_proof: serde_json::Value,
    /// Nonce for the issued credential
    pub nonce: String,
}

/// Holder-side secrets needed to process the issued credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRequestMetadata {
    /// Blinding factors, opaque to the agent
    pub link_secret_blinding_data: serde_json::Value,
    /// Nonce of the request
    pub nonce: String,
    /// Id of the link secret used
    pub link_secret_name: String,
}

/// Raw and encoded form of one credential attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialValue {
    /// Value as issued
    pub raw: String,
    /// Integer encoding used in signatures
    pub encoded: String,
}

impl CredentialValue {
    /// Encodes a raw attribute value.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let encoded = encode_credential_value(&raw);
        Self { raw, encoded }
    }
}

/// An issued AnonCreds credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnonCredsCredential {
    /// Schema id
    pub schema_id: String,
    /// Credential definition id
    pub cred_def_id: String,
    /// Revocation registry, if the credential is revocable
    #[serde(default)]
    pub rev_reg_id: Option<String>,
    /// Attribute values
    pub values: BTreeMap<String, CredentialValue>,
    /// Issuer signature, opaque to the agent
    pub signature: serde_json::Value,
    /// Signature correctness proof, opaque to the agent
    pub signature_correctness_proof: serde_json::Value,
}

impl AnonCredsCredential {
    /// Attribute name to raw value.
    pub fn raw_values(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(name, value)| (name.clone(), value.raw.clone()))
            .collect()
    }
}

/// The holder's blinding secret.
///
/// The value is wiped from memory on drop and never serialized into messages.
#[derive(Clone, PartialEq, Eq)]
pub struct LinkSecret(String);

impl LinkSecret {
    /// Wraps a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The secret value, for handing to the backend or the secure store.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for LinkSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LinkSecret(..)")
    }
}

impl Drop for LinkSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Comparison of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredicateType {
    /// `>=`
    #[serde(rename = ">=")]
    GreaterOrEqual,
    /// `>`
    #[serde(rename = ">")]
    Greater,
    /// `<=`
    #[serde(rename = "<=")]
    LessOrEqual,
    /// `<`
    #[serde(rename = "<")]
    Less,
}

impl PredicateType {
    /// Whether `value` satisfies the predicate against `bound`.
    pub fn holds(self, value: i64, bound: i64) -> bool {
        match self {
            PredicateType::GreaterOrEqual => value >= bound,
            PredicateType::Greater => value > bound,
            PredicateType::LessOrEqual => value <= bound,
            PredicateType::Less => value < bound,
        }
    }
}

/// Limits which credentials may answer a referent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restriction {
    /// Required schema id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    /// Required credential definition id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cred_def_id: Option<String>,
    /// Required issuer DID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_id: Option<String>,
}

impl Restriction {
    /// Whether a credential with the given identifiers satisfies every set field.
    pub fn matches(&self, schema_id: &str, cred_def_id: &str) -> bool {
        self.schema_id.as_deref().map_or(true, |id| id == schema_id)
            && self.cred_def_id.as_deref().map_or(true, |id| id == cred_def_id)
            && self
                .issuer_id
                .as_deref()
                .map_or(true, |issuer| cred_def_id.starts_with(issuer))
    }
}

/// A requested attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeInfo {
    /// Attribute name
    pub name: String,
    /// Allowed sources; empty means any credential
    #[serde(default)]
    pub restrictions: Vec<Restriction>,
}

/// A requested predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateInfo {
    /// Attribute name
    pub name: String,
    /// Comparison
    pub p_type: PredicateType,
    /// Bound
    pub p_value: i64,
    /// Allowed sources; empty means any credential
    #[serde(default)]
    pub restrictions: Vec<Restriction>,
}

/// Interval in which the credential must not have been revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonRevokedInterval {
    /// Lower bound
    #[serde(default)]
    pub from: Option<u64>,
    /// Upper bound
    #[serde(default)]
    pub to: Option<u64>,
}

/// A verifier's proof request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRequest {
    /// Request name
    pub name: String,
    /// Request version
    pub version: String,
    /// Fresh nonce binding the presentation to this request
    pub nonce: String,
    /// Referent to attribute
    #[serde(default)]
    pub requested_attributes: BTreeMap<String, AttributeInfo>,
    /// Referent to predicate
    #[serde(default)]
    pub requested_predicates: BTreeMap<String, PredicateInfo>,
    /// Revocation interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_revoked: Option<NonRevokedInterval>,
}

/// Which stored credential answers each referent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedCredentials {
    /// Attribute referent to credential id
    pub attributes: BTreeMap<String, String>,
    /// Predicate referent to credential id
    pub predicates: BTreeMap<String, String>,
}

/// A revealed attribute inside a presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealedAttribute {
    /// Index into [`Presentation::identifiers`]
    pub sub_proof_index: usize,
    /// Raw value
    pub raw: String,
    /// Encoded value
    pub encoded: String,
}

/// A predicate answered inside a presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubProofReferent {
    /// Index into [`Presentation::identifiers`]
    pub sub_proof_index: usize,
}

/// Referent-level view of a presentation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedProof {
    /// Revealed attributes
    #[serde(default)]
    pub revealed_attrs: BTreeMap<String, RevealedAttribute>,
    /// Satisfied predicates
    #[serde(default)]
    pub predicates: BTreeMap<String, SubProofReferent>,
}

/// Ledger objects a sub proof was built against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    /// Schema id
    pub schema_id: String,
    /// Credential definition id
    pub cred_def_id: String,
    /// Revocation registry id
    #[serde(default)]
    pub rev_reg_id: Option<String>,
    /// Revocation status list timestamp
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// A prover's presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presentation {
    /// Referent-level view
    pub requested_proof: RequestedProof,
    /// One entry per sub proof
    pub identifiers: Vec<Identifier>,
    /// The proof itself, opaque to the agent
    pub proof: serde_json::Value,
}

/// Cryptographic operations of the AnonCreds stack.
#[async_trait]
pub trait AnonCredsBackend: Send + Sync {
    /// Creates a new link secret value.
    async fn create_link_secret(&self) -> Result<LinkSecret>;

    /// Generates the key material of a new credential definition.
    async fn create_credential_definition(
        &self,
        schema_id: &str,
        schema: &Schema,
        issuer_id: &str,
        tag: &str,
    ) -> Result<CreatedCredentialDefinition>;

    /// Builds an offer for a registered credential definition.
    async fn create_credential_offer(
        &self,
        schema_id: &str,
        cred_def_id: &str,
        key_correctness_proof: &serde_json::Value,
    ) -> Result<CredentialOffer>;

    /// Blinds the link secret into a request answering `offer`.
    async fn create_credential_request(
        &self,
        offer: &CredentialOffer,
        cred_def: &CredentialDefinition,
        link_secret: &LinkSecret,
        link_secret_id: &str,
        entropy: &str,
    ) -> Result<(CredentialRequest, CredentialRequestMetadata)>;

    /// Checks the blinded link secret commitment of a request.
    async fn verify_credential_request(
        &self,
        offer: &CredentialOffer,
        request: &CredentialRequest,
        cred_def: &CredentialDefinition,
    ) -> Result<bool>;

    /// Signs `values` into a credential for the requester.
    async fn create_credential(
        &self,
        offer: &CredentialOffer,
        request: &CredentialRequest,
        cred_def: &CredentialDefinition,
        cred_def_private: &serde_json::Value,
        values: &BTreeMap<String, String>,
    ) -> Result<AnonCredsCredential>;

    /// Unblinds and checks an issued credential.
    async fn process_credential(
        &self,
        credential: &AnonCredsCredential,
        metadata: &CredentialRequestMetadata,
        link_secret: &LinkSecret,
        cred_def: &CredentialDefinition,
    ) -> Result<AnonCredsCredential>;

    /// Builds a presentation from the selected credentials.
    #[allow(clippy::too_many_arguments)]
    async fn create_presentation(
        &self,
        request: &ProofRequest,
        selected: &SelectedCredentials,
        credentials: &BTreeMap<String, AnonCredsCredential>,
        link_secret: &LinkSecret,
        schemas: &BTreeMap<String, Schema>,
        cred_defs: &BTreeMap<String, CredentialDefinition>,
    ) -> Result<Presentation>;

    /// Verifies a presentation against the resolved ledger objects.
    async fn verify_presentation(
        &self,
        request: &ProofRequest,
        presentation: &Presentation,
        schemas: &BTreeMap<String, Schema>,
        cred_defs: &BTreeMap<String, CredentialDefinition>,
        status_lists: &[RevocationStatusList],
    ) -> Result<bool>;
}

/// A registry answering for one identifier namespace.
#[async_trait]
pub trait AnonCredsRegistry: Send + Sync {
    /// Identifier prefix this registry owns, e.g. `did:indy:bcovrin:test:`.
    fn supported_prefix(&self) -> &str;

    /// Reads a schema.
    async fn get_schema(&self, schema_id: &str) -> Result<Schema>;

    /// Publishes a schema and returns its id once durably accepted.
    async fn register_schema(&self, schema: &Schema) -> Result<String>;

    /// Reads a credential definition.
    async fn get_credential_definition(&self, cred_def_id: &str) -> Result<CredentialDefinition>;

    /// Publishes a credential definition and returns its id once durably accepted.
    async fn register_credential_definition(&self, definition: &CredentialDefinition) -> Result<String>;

    /// Reads the revocation status list valid at `timestamp`.
    async fn get_revocation_status_list(
        &self,
        rev_reg_def_id: &str,
        timestamp: u64,
    ) -> Result<RevocationStatusList>;
}

/// AnonCreds attribute encoding: 32-bit integers are kept as is, anything
/// else is the decimal value of its SHA-256 digest.
pub fn encode_credential_value(raw: &str) -> String {
    if let Ok(value) = raw.parse::<i32>() {
        return value.to_string();
    }

    let digest: [u8; 32] = Sha256::digest(raw.as_bytes()).into();
    U256::from_be_bytes(digest).to_string()
}
