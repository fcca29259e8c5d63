//! Credential formats.
//!
//! The issuance state machine never looks inside a payload. Everything
//! format specific happens behind [`CredentialFormatService`], selected per
//! [`CredentialFormatKind`] from a [`FormatRegistry`] built once with the agent.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use didcomm_agent_core::anoncreds::{
    AnonCredsCredential, CredentialOffer, CredentialRequest, CredentialRequestMetadata,
};
use didcomm_agent_core::types::unix_time;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::context::AgentContext;
use crate::error::{Error, Result};
use crate::records::{
    CredentialDefinitionRecord, CredentialRecord, DidRecord, LinkSecretRecord, StoredCredentialFormat,
};

/// Attribute name to raw value.
pub type Attributes = BTreeMap<String, String>;

/// Signature suite of JSON-LD credentials issued by this agent.
pub const LD_PROOF_TYPE: &str = "Ed25519Signature2018";

/// A credential format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialFormatKind {
    /// AnonCreds credentials (legacy-indy)
    Indy,
    /// W3C credentials with a linked data proof
    JsonLd,
}

/// Message of the issuance protocol a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// `propose-credential`
    Proposal,
    /// `offer-credential`
    Offer,
    /// `request-credential`
    Request,
    /// `issue-credential`
    Credential,
}

impl CredentialFormatKind {
    /// Every known format.
    pub const ALL: [CredentialFormatKind; 2] = [CredentialFormatKind::Indy, CredentialFormatKind::JsonLd];

    /// Format identifier in the `formats` list of a v2 message.
    #[must_use]
    pub fn format_id(self, stage: Stage) -> &'static str {
        match (self, stage) {
            (CredentialFormatKind::Indy, Stage::Proposal) => "hlindy/cred-filter@v2.0",
            (CredentialFormatKind::Indy, Stage::Offer) => "hlindy/cred-abstract@v2.0",
            (CredentialFormatKind::Indy, Stage::Request) => "hlindy/cred-req@v2.0",
            (CredentialFormatKind::Indy, Stage::Credential) => "hlindy/cred@v2.0",
            (CredentialFormatKind::JsonLd, Stage::Credential) => "aries/ld-proof-vc@v1.0",
            (CredentialFormatKind::JsonLd, _) => "aries/ld-proof-vc-detail@v1.0",
        }
    }

    /// The format whose identifier at `stage` is `format_id`.
    #[must_use]
    pub fn from_format_id(format_id: &str, stage: Stage) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.format_id(stage) == format_id)
    }

    /// Fixed attachment id of a v1 message. Only legacy-indy exists in v1.
    #[must_use]
    pub fn v1_attachment_id(self, stage: Stage) -> Option<&'static str> {
        match (self, stage) {
            (CredentialFormatKind::Indy, Stage::Offer) => Some("libindy-cred-offer-0"),
            (CredentialFormatKind::Indy, Stage::Request) => Some("libindy-cred-request-0"),
            (CredentialFormatKind::Indy, Stage::Credential) => Some("libindy-cred-0"),
            _ => None,
        }
    }

    /// Attachment id used in v2 messages.
    #[must_use]
    pub fn attach_id(self) -> &'static str {
        match self {
            CredentialFormatKind::Indy => "indy",
            CredentialFormatKind::JsonLd => "ld_proof",
        }
    }
}

/// What the issuer (or a proposing holder) wants issued, per format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "format")]
pub enum CredentialFormatOptions {
    /// An AnonCreds credential of a credential definition
    #[serde(rename_all = "camelCase")]
    Indy {
        /// Credential definition id
        credential_definition_id: String,
    },
    /// A JSON-LD credential built from a template
    JsonLd {
        /// Credential template; `issuer` must be a DID of the issuing agent
        credential: Value,
    },
}

impl CredentialFormatOptions {
    /// Format of these options.
    #[must_use]
    pub fn kind(&self) -> CredentialFormatKind {
        match self {
            CredentialFormatOptions::Indy { .. } => CredentialFormatKind::Indy,
            CredentialFormatOptions::JsonLd { .. } => CredentialFormatKind::JsonLd,
        }
    }

    /// Payload of a proposal.
    #[must_use]
    pub fn proposal_payload(&self) -> Value {
        match self {
            CredentialFormatOptions::Indy {
                credential_definition_id,
            } => json!({ "cred_def_id": credential_definition_id }),
            CredentialFormatOptions::JsonLd { credential } => json!({ "credential": credential }),
        }
    }

    /// Options from a received proposal payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FormatMismatch`] if the payload does not fit `kind`.
    pub fn from_proposal(kind: CredentialFormatKind, payload: &Value) -> Result<Self> {
        let field = match kind {
            CredentialFormatKind::Indy => "cred_def_id",
            CredentialFormatKind::JsonLd => "credential",
        };
        let value = payload
            .get(field)
            .ok_or_else(|| Error::FormatMismatch(format!("{kind:?} proposal without {field}")))?;
        Ok(match kind {
            CredentialFormatKind::Indy => CredentialFormatOptions::Indy {
                credential_definition_id: value
                    .as_str()
                    .ok_or_else(|| Error::FormatMismatch("cred_def_id is not a string".into()))?
                    .to_string(),
            },
            CredentialFormatKind::JsonLd => CredentialFormatOptions::JsonLd {
                credential: value.clone(),
            },
        })
    }
}

/// Format specific steps of the issuance protocol.
///
/// The issuer side plugs in at three points: [`create_offer`],
/// [`validate_request`] and [`create_credential`]. The holder side builds the
/// request and processes the result.
///
/// [`create_offer`]: CredentialFormatService::create_offer
/// [`validate_request`]: CredentialFormatService::validate_request
/// [`create_credential`]: CredentialFormatService::create_credential
#[async_trait]
pub trait CredentialFormatService: Send + Sync {
    /// Format handled.
    fn kind(&self) -> CredentialFormatKind;

    /// Builds the offer payload.
    async fn create_offer(
        &self,
        ctx: &AgentContext,
        options: &CredentialFormatOptions,
        attributes: &Attributes,
    ) -> Result<Value>;

    /// Builds the request payload answering `offer`, and holder side
    /// metadata needed once the credential arrives.
    async fn create_request(&self, ctx: &AgentContext, offer: &Value, holder_did: &str) -> Result<(Value, Value)>;

    /// Checks a received request against the offer it answers.
    async fn validate_request(&self, ctx: &AgentContext, offer: &Value, request: &Value) -> Result<()>;

    /// Builds the credential payload.
    async fn create_credential(
        &self,
        ctx: &AgentContext,
        offer: &Value,
        request: &Value,
        attributes: &Attributes,
    ) -> Result<Value>;

    /// Verifies and stores a received credential.
    async fn store_credential(
        &self,
        ctx: &AgentContext,
        credential: &Value,
        metadata: &Value,
        thread_id: &str,
    ) -> Result<CredentialRecord>;
}

/// The one link secret of this agent.
///
/// # Errors
///
/// Returns [`Error::LinkSecretRequired`] if none was created.
pub(crate) async fn link_secret(ctx: &AgentContext) -> Result<LinkSecretRecord> {
    let mut secrets = ctx.repository::<LinkSecretRecord>().all().await?;
    match secrets.len() {
        0 => Err(Error::LinkSecretRequired),
        1 => Ok(secrets.remove(0).record),
        n => Err(Error::InvalidState(format!("{n} link secrets exist, expected one"))),
    }
}

fn parse<T: serde::de::DeserializeOwned>(what: &str, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone()).map_err(|e| Error::FormatMismatch(format!("malformed {what}: {e}")))
}

/// AnonCreds issuance.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndyCredentialFormat;

#[async_trait]
impl CredentialFormatService for IndyCredentialFormat {
    fn kind(&self) -> CredentialFormatKind {
        CredentialFormatKind::Indy
    }

    async fn create_offer(
        &self,
        ctx: &AgentContext,
        options: &CredentialFormatOptions,
        attributes: &Attributes,
    ) -> Result<Value> {
        let CredentialFormatOptions::Indy {
            credential_definition_id,
        } = options
        else {
            return Err(Error::FormatMismatch("expected legacy-indy options".into()));
        };

        let definition = ctx
            .repository::<CredentialDefinitionRecord>()
            .get(credential_definition_id)
            .await?;
        let schema = ctx.registries.get_schema(&definition.definition.schema_id).await?;

        let expected: BTreeSet<&str> = schema.attr_names.iter().map(String::as_str).collect();
        let offered: BTreeSet<&str> = attributes.keys().map(String::as_str).collect();
        if expected != offered {
            return Err(Error::FormatMismatch(format!(
                "attributes {offered:?} do not match schema {:?}",
                schema.attr_names
            )));
        }

        let offer = ctx
            .anoncreds
            .create_credential_offer(
                &definition.definition.schema_id,
                &definition.id,
                &definition.key_correctness_proof,
            )
            .await?;
        Ok(serde_json::to_value(offer)?)
    }

    async fn create_request(&self, ctx: &AgentContext, offer: &Value, holder_did: &str) -> Result<(Value, Value)> {
        let offer: CredentialOffer = parse("credential offer", offer)?;
        let secret = link_secret(ctx).await?;
        let definition = ctx.registries.get_credential_definition(&offer.cred_def_id).await?;

        let (request, metadata) = ctx
            .anoncreds
            .create_credential_request(&offer, &definition, &secret.secret(), &secret.id, holder_did)
            .await?;
        Ok((serde_json::to_value(request)?, serde_json::to_value(metadata)?))
    }

    async fn validate_request(&self, ctx: &AgentContext, offer: &Value, request: &Value) -> Result<()> {
        let offer: CredentialOffer = parse("credential offer", offer)?;
        let request: CredentialRequest = parse("credential request", request)?;
        if request.cred_def_id != offer.cred_def_id {
            return Err(Error::VerificationFailed(format!(
                "request for {} answers an offer of {}",
                request.cred_def_id, offer.cred_def_id
            )));
        }

        let definition = ctx.registries.get_credential_definition(&offer.cred_def_id).await?;
        let valid = ctx
            .anoncreds
            .verify_credential_request(&offer, &request, &definition)
            .await?;
        if !valid {
            return Err(Error::VerificationFailed(
                "blinded link secret commitment does not verify".into(),
            ));
        }
        Ok(())
    }

    async fn create_credential(
        &self,
        ctx: &AgentContext,
        offer: &Value,
        request: &Value,
        attributes: &Attributes,
    ) -> Result<Value> {
        let offer: CredentialOffer = parse("credential offer", offer)?;
        let request: CredentialRequest = parse("credential request", request)?;
        let definition = ctx
            .repository::<CredentialDefinitionRecord>()
            .get(&offer.cred_def_id)
            .await?;

        let credential = ctx
            .anoncreds
            .create_credential(
                &offer,
                &request,
                &definition.definition,
                &definition.private,
                attributes,
            )
            .await?;
        Ok(serde_json::to_value(credential)?)
    }

    async fn store_credential(
        &self,
        ctx: &AgentContext,
        credential: &Value,
        metadata: &Value,
        thread_id: &str,
    ) -> Result<CredentialRecord> {
        let credential: AnonCredsCredential = parse("credential", credential)?;
        let metadata: CredentialRequestMetadata = parse("request metadata", metadata)?;
        let secret = ctx
            .repository::<LinkSecretRecord>()
            .get(&metadata.link_secret_name)
            .await?;
        let definition = ctx
            .registries
            .get_credential_definition(&credential.cred_def_id)
            .await?;

        let processed = ctx
            .anoncreds
            .process_credential(&credential, &metadata, &secret.secret(), &definition)
            .await
            .map_err(|e| Error::VerificationFailed(e.to_string()))?;

        let record = CredentialRecord {
            id: Uuid::new_v4().to_string(),
            format: StoredCredentialFormat::Indy,
            schema_id: processed.schema_id.clone(),
            credential_definition_id: processed.cred_def_id.clone(),
            revocation_registry_id: processed.rev_reg_id.clone(),
            attributes: processed.raw_values(),
            credential: serde_json::to_value(&processed)?,
            thread_id: thread_id.to_string(),
        };
        debug!(credential_id = record.id, cred_def_id = record.credential_definition_id, "stored credential");
        Ok(ctx.repository::<CredentialRecord>().save(record).await?.record)
    }
}

/// JSON-LD issuance with Ed25519 signatures from the agent's wallet.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLdCredentialFormat;

impl JsonLdCredentialFormat {
    fn issuer(credential: &Value) -> Result<String> {
        let issuer = credential.get("issuer").ok_or(didcomm_agent_core::Error::MissingField("issuer"))?;
        issuer
            .as_str()
            .or_else(|| issuer.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| Error::FormatMismatch("issuer is neither a string nor an object with an id".into()))
    }

    fn signing_input(credential: &Value) -> Result<Vec<u8>> {
        let mut unsigned = credential.clone();
        if let Some(object) = unsigned.as_object_mut() {
            object.remove("proof");
        }
        Ok(serde_json::to_vec(&unsigned)?)
    }

    fn without_subject_id(detail: &Value) -> Value {
        let mut detail = detail.clone();
        if let Some(subject) = detail
            .pointer_mut("/credential/credentialSubject")
            .and_then(Value::as_object_mut)
        {
            subject.remove("id");
        }
        detail
    }
}

#[async_trait]
impl CredentialFormatService for JsonLdCredentialFormat {
    fn kind(&self) -> CredentialFormatKind {
        CredentialFormatKind::JsonLd
    }

    async fn create_offer(
        &self,
        ctx: &AgentContext,
        options: &CredentialFormatOptions,
        attributes: &Attributes,
    ) -> Result<Value> {
        let CredentialFormatOptions::JsonLd { credential } = options else {
            return Err(Error::FormatMismatch("expected JSON-LD options".into()));
        };

        let mut credential = credential.clone();
        let issuer = Self::issuer(&credential)?;
        if !ctx.owns_did(&issuer).await? {
            return Err(Error::InvalidConfig(format!("issuer {issuer} is not a DID of this agent")));
        }

        let object = credential
            .as_object_mut()
            .ok_or_else(|| Error::FormatMismatch("credential template is not an object".into()))?;
        let subject = object
            .entry("credentialSubject")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| Error::FormatMismatch("credentialSubject is not an object".into()))?;
        for (name, value) in attributes {
            subject.insert(name.clone(), Value::String(value.clone()));
        }

        Ok(json!({
            "credential": credential,
            "options": { "proofType": LD_PROOF_TYPE, "proofPurpose": "assertionMethod" },
        }))
    }

    async fn create_request(&self, _ctx: &AgentContext, offer: &Value, holder_did: &str) -> Result<(Value, Value)> {
        let mut detail = offer.clone();
        let subject = detail
            .pointer_mut("/credential/credentialSubject")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::FormatMismatch("offer carries no credentialSubject".into()))?;
        subject.insert("id".into(), Value::String(holder_did.to_string()));
        Ok((detail, Value::Null))
    }

    async fn validate_request(&self, _ctx: &AgentContext, offer: &Value, request: &Value) -> Result<()> {
        if Self::without_subject_id(offer) != Self::without_subject_id(request) {
            return Err(Error::VerificationFailed(
                "requested credential differs from the offer".into(),
            ));
        }
        Ok(())
    }

    async fn create_credential(
        &self,
        ctx: &AgentContext,
        _offer: &Value,
        request: &Value,
        _attributes: &Attributes,
    ) -> Result<Value> {
        let mut credential = request
            .get("credential")
            .cloned()
            .ok_or(didcomm_agent_core::Error::MissingField("credential"))?;
        let issuer = Self::issuer(&credential)?;
        let issuer_record = ctx.repository::<DidRecord>().get(&issuer).await?;
        let verification_method = issuer_record
            .document
            .verification_method
            .first()
            .map_or_else(|| issuer.clone(), |vm| vm.id.clone());

        let signature = ctx
            .plugin
            .signer()
            .sign(&Self::signing_input(&credential)?, &verification_method)
            .await?;
        if let Some(object) = credential.as_object_mut() {
            object.insert(
                "proof".into(),
                json!({
                    "type": LD_PROOF_TYPE,
                    "created": unix_time(),
                    "proofPurpose": "assertionMethod",
                    "verificationMethod": verification_method,
                    "jws": URL_SAFE_NO_PAD.encode(signature),
                }),
            );
        }
        Ok(credential)
    }

    async fn store_credential(
        &self,
        ctx: &AgentContext,
        credential: &Value,
        _metadata: &Value,
        thread_id: &str,
    ) -> Result<CredentialRecord> {
        let proof = credential
            .get("proof")
            .ok_or_else(|| Error::VerificationFailed("credential carries no proof".into()))?;
        let verification_method = proof
            .get("verificationMethod")
            .and_then(Value::as_str)
            .ok_or(didcomm_agent_core::Error::MissingField("verificationMethod"))?;
        let jws = proof
            .get("jws")
            .and_then(Value::as_str)
            .ok_or(didcomm_agent_core::Error::MissingField("jws"))?;
        let signature = URL_SAFE_NO_PAD
            .decode(jws)
            .map_err(didcomm_agent_core::Error::from)?;

        let issuer = Self::issuer(credential)?;
        let valid = verification_method.split('#').next() == Some(issuer.as_str())
            && ctx
                .plugin
                .signer()
                .verify(&Self::signing_input(credential)?, &signature, verification_method)
                .await?;
        if !valid {
            return Err(Error::VerificationFailed(format!("proof of credential from {issuer}")));
        }

        let schema_id = credential
            .get("type")
            .and_then(Value::as_array)
            .and_then(|types| types.last())
            .and_then(Value::as_str)
            .unwrap_or("VerifiableCredential")
            .to_string();
        let attributes = credential
            .get("credentialSubject")
            .and_then(Value::as_object)
            .map(|subject| {
                subject
                    .iter()
                    .filter(|(name, _)| name.as_str() != "id")
                    .filter_map(|(name, value)| value.as_str().map(|v| (name.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let record = CredentialRecord {
            id: Uuid::new_v4().to_string(),
            format: StoredCredentialFormat::JsonLd,
            schema_id,
            credential_definition_id: issuer,
            revocation_registry_id: None,
            attributes,
            credential: credential.clone(),
            thread_id: thread_id.to_string(),
        };
        Ok(ctx.repository::<CredentialRecord>().save(record).await?.record)
    }
}

/// Format services by kind, fixed at construction.
#[derive(Clone)]
pub struct FormatRegistry {
    services: BTreeMap<CredentialFormatKind, Arc<dyn CredentialFormatService>>,
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new(vec![
            Arc::new(IndyCredentialFormat),
            Arc::new(JsonLdCredentialFormat),
        ])
    }
}

impl FormatRegistry {
    /// Builds the table. For a format given twice, the first service wins.
    #[must_use]
    pub fn new(services: Vec<Arc<dyn CredentialFormatService>>) -> Self {
        let mut table = BTreeMap::new();
        for service in services {
            table.entry(service.kind()).or_insert(service);
        }
        Self { services: table }
    }

    /// The service of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FormatMismatch`] if no service handles it.
    pub fn get(&self, kind: CredentialFormatKind) -> Result<&Arc<dyn CredentialFormatService>> {
        self.services
            .get(&kind)
            .ok_or_else(|| Error::FormatMismatch(format!("{kind:?} credentials are not supported")))
    }
}
