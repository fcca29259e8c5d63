//! In-process stand-ins for the external collaborators.
//!
//! None of these provide real security. They are deterministic, hash based
//! implementations of the gateway traits for tests, demos and local
//! development:
//!
//! - [`MockPlugin`]: key manager, signer and encryptor
//! - [`MockAnonCreds`]: AnonCreds backend whose "proofs" are SHA-256 digests
//! - [`InMemoryRegistry`]: AnonCreds registry for one identifier prefix

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::anoncreds::{
    AnonCredsBackend, AnonCredsCredential, AnonCredsRegistry, CreatedCredentialDefinition,
    CredentialDefinition, CredentialOffer, CredentialRequest, CredentialRequestMetadata,
    CredentialValue, Identifier, LinkSecret, Presentation, ProofRequest, RequestedProof,
    RevealedAttribute, RevocationStatusList, Schema, SelectedCredentials, SubProofReferent,
};
use crate::plugin::{DIDCommPlugin, Encryptor, KeyInfo, KeyManager, Signer};
use crate::{Error, Result};

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn nonce() -> String {
    Uuid::new_v4().as_u128().to_string()
}

fn bare_did(key_id: &str) -> &str {
    key_id.split('#').next().unwrap_or(key_id)
}

/// Deterministic wallet stand-in.
///
/// Signatures are keyed hashes over the signer's DID, so any `MockPlugin`
/// verifies what any other produced. Encryption is base64 wrapped JSON that
/// only "decrypts" for DIDs it was addressed to.
#[derive(Debug, Default)]
pub struct MockPlugin {
    keys: RwLock<HashMap<String, Vec<u8>>>,
    dids: RwLock<HashMap<String, String>>,
}

impl MockPlugin {
    /// Creates an empty wallet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `did` was bound to a key of this wallet.
    pub async fn owns(&self, did: &str) -> bool {
        self.dids.read().await.contains_key(did)
    }
}

#[async_trait]
impl KeyManager for MockPlugin {
    async fn create_key(&self, seed: Option<&[u8]>) -> Result<KeyInfo> {
        let secret = match seed {
            Some(seed) if seed.len() < 16 => {
                return Err(Error::InvalidFormat("seed must be at least 16 bytes".into()))
            }
            Some(seed) => seed.to_vec(),
            None => Uuid::new_v4().as_bytes().to_vec(),
        };
        let public_key = Sha256::digest(&secret).to_vec();
        let key_reference = Uuid::new_v4().to_string();

        self.keys.write().await.insert(key_reference.clone(), secret);
        Ok(KeyInfo {
            public_key,
            key_reference,
        })
    }

    async fn assign_did(&self, key_reference: &str, did: &str) -> Result<()> {
        if !self.keys.read().await.contains_key(key_reference) {
            return Err(Error::NotFound(format!("key {key_reference}")));
        }
        self.dids
            .write()
            .await
            .insert(did.to_string(), key_reference.to_string());
        Ok(())
    }
}

#[async_trait]
impl Signer for MockPlugin {
    async fn sign(&self, data: &[u8], key_id: &str) -> Result<Vec<u8>> {
        let mut hasher = Sha256::new();
        hasher.update(bare_did(key_id).as_bytes());
        hasher.update(data);
        Ok(hasher.finalize().to_vec())
    }

    async fn verify(&self, data: &[u8], signature: &[u8], key_id: &str) -> Result<bool> {
        let expected = self.sign(data, key_id).await?;
        Ok(expected == signature)
    }
}

#[async_trait]
impl Encryptor for MockPlugin {
    async fn encrypt(&self, data: &[u8], recipients: &[&str], sender: Option<&str>) -> Result<Vec<u8>> {
        let wrapped = json!({
            "to": recipients,
            "from": sender,
            "payload": STANDARD.encode(data),
        });
        Ok(STANDARD.encode(serde_json::to_vec(&wrapped)?).into_bytes())
    }

    async fn decrypt(&self, data: &[u8], recipient: &str) -> Result<Vec<u8>> {
        let wrapped: serde_json::Value = serde_json::from_slice(&STANDARD.decode(data)?)?;
        let addressed = wrapped["to"]
            .as_array()
            .map_or(false, |to| to.iter().any(|r| r.as_str() == Some(recipient)));
        if !addressed {
            return Err(Error::Decryption(format!("not addressed to {recipient}")));
        }

        let payload = wrapped["payload"]
            .as_str()
            .ok_or(Error::MissingField("payload"))?;
        Ok(STANDARD.decode(payload)?)
    }
}

impl DIDCommPlugin for MockPlugin {
    fn keys(&self) -> &dyn KeyManager {
        self
    }

    fn signer(&self) -> &dyn Signer {
        self
    }

    fn encryptor(&self) -> &dyn Encryptor {
        self
    }
}

/// Hash based AnonCreds backend.
///
/// Each credential signature commits to every attribute digest and to the
/// holder's blinded link secret, so tampering with revealed values, the
/// request nonce or the credential definition makes verification fail.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockAnonCreds;

impl MockAnonCreds {
    fn public_n(cred_def: &CredentialDefinition) -> Result<&str> {
        cred_def.value["primary"]["n"]
            .as_str()
            .ok_or_else(|| Error::AnonCreds(format!("malformed credential definition {}", cred_def.tag)))
    }

    fn blinded_link_secret(link_secret: &LinkSecret, n: &str) -> String {
        digest(&["ms", link_secret.expose(), n])
    }

    fn attribute_digest(n: &str, name: &str, encoded: &str) -> String {
        digest(&["attr", n, name, encoded])
    }

    fn credential_signature(n: &str, u: &str, attr_digests: &BTreeMap<String, String>) -> String {
        let joined: Vec<&str> = attr_digests.values().map(String::as_str).collect();
        digest(&["sig", n, u, &joined.join(",")])
    }

    fn predicate_proof(n: &str, attr_digest: &str, p_type: &str, bound: i64) -> String {
        digest(&["ge", n, attr_digest, p_type, &bound.to_string()])
    }
}

#[async_trait]
impl AnonCredsBackend for MockAnonCreds {
    async fn create_link_secret(&self) -> Result<LinkSecret> {
        Ok(LinkSecret::new(nonce()))
    }

    async fn create_credential_definition(
        &self,
        schema_id: &str,
        _schema: &Schema,
        issuer_id: &str,
        tag: &str,
    ) -> Result<CreatedCredentialDefinition> {
        let secret = Uuid::new_v4().to_string();
        let n = digest(&["n", &secret]);

        Ok(CreatedCredentialDefinition {
            definition: CredentialDefinition {
                issuer_id: issuer_id.to_string(),
                schema_id: schema_id.to_string(),
                typ: "CL".to_string(),
                tag: tag.to_string(),
                value: json!({ "primary": { "n": n } }),
            },
            private: json!({ "secret": secret }),
            key_correctness_proof: json!({ "c": digest(&["kcp", &n]) }),
        })
    }

    async fn create_credential_offer(
        &self,
        schema_id: &str,
        cred_def_id: &str,
        key_correctness_proof: &serde_json::Value,
    ) -> Result<CredentialOffer> {
        Ok(CredentialOffer {
            schema_id: schema_id.to_string(),
            cred_def_id: cred_def_id.to_string(),
            key_correctness_proof: key_correctness_proof.clone(),
            nonce: nonce(),
        })
    }

    async fn create_credential_request(
        &self,
        offer: &CredentialOffer,
        cred_def: &CredentialDefinition,
        link_secret: &LinkSecret,
        link_secret_id: &str,
        entropy: &str,
    ) -> Result<(CredentialRequest, CredentialRequestMetadata)> {
        let n = Self::public_n(cred_def)?;
        if offer.key_correctness_proof["c"].as_str() != Some(digest(&["kcp", n]).as_str()) {
            return Err(Error::AnonCreds("invalid key correctness proof".into()));
        }

        let u = Self::blinded_link_secret(link_secret, n);
        let request_nonce = nonce();
        let request = CredentialRequest {
            entropy: entropy.to_string(),
            cred_def_id: offer.cred_def_id.clone(),
            blinded_ms: json!({ "u": u }),
            blinded_ms_correctness_proof: json!({ "c": digest(&["bmcp", &u, &offer.nonce]) }),
            nonce: request_nonce.clone(),
        };
        let metadata = CredentialRequestMetadata {
            link_secret_blinding_data: json!({ "v_prime": digest(&["v", &u]) }),
            nonce: request_nonce,
            link_secret_name: link_secret_id.to_string(),
        };
        Ok((request, metadata))
    }

    async fn verify_credential_request(
        &self,
        offer: &CredentialOffer,
        request: &CredentialRequest,
        _cred_def: &CredentialDefinition,
    ) -> Result<bool> {
        let Some(u) = request.blinded_ms["u"].as_str() else {
            return Ok(false);
        };
        let expected = digest(&["bmcp", u, &offer.nonce]);
        Ok(request.cred_def_id == offer.cred_def_id
            && request.blinded_ms_correctness_proof["c"].as_str() == Some(expected.as_str()))
    }

    async fn create_credential(
        &self,
        offer: &CredentialOffer,
        request: &CredentialRequest,
        cred_def: &CredentialDefinition,
        cred_def_private: &serde_json::Value,
        values: &BTreeMap<String, String>,
    ) -> Result<AnonCredsCredential> {
        let n = Self::public_n(cred_def)?;
        let secret = cred_def_private["secret"]
            .as_str()
            .ok_or_else(|| Error::AnonCreds("malformed private credential definition".into()))?;
        if digest(&["n", secret]) != n {
            return Err(Error::AnonCreds("private key does not match credential definition".into()));
        }
        let u = request.blinded_ms["u"]
            .as_str()
            .ok_or(Error::MissingField("blinded_ms"))?;

        let values: BTreeMap<String, CredentialValue> = values
            .iter()
            .map(|(name, raw)| (name.clone(), CredentialValue::new(raw.clone())))
            .collect();
        let attr_digests: BTreeMap<String, String> = values
            .iter()
            .map(|(name, value)| (name.clone(), Self::attribute_digest(n, name, &value.encoded)))
            .collect();

        Ok(AnonCredsCredential {
            schema_id: offer.schema_id.clone(),
            cred_def_id: offer.cred_def_id.clone(),
            rev_reg_id: None,
            signature: json!({
                "m2": Self::credential_signature(n, u, &attr_digests),
                "attr_digests": attr_digests,
            }),
            signature_correctness_proof: json!({ "se": digest(&["scp", &request.nonce]) }),
            values,
        })
    }

    async fn process_credential(
        &self,
        credential: &AnonCredsCredential,
        metadata: &CredentialRequestMetadata,
        link_secret: &LinkSecret,
        cred_def: &CredentialDefinition,
    ) -> Result<AnonCredsCredential> {
        let n = Self::public_n(cred_def)?;
        let u = Self::blinded_link_secret(link_secret, n);

        let attr_digests: BTreeMap<String, String> =
            serde_json::from_value(credential.signature["attr_digests"].clone())?;
        for (name, value) in &credential.values {
            if attr_digests.get(name) != Some(&Self::attribute_digest(n, name, &value.encoded)) {
                return Err(Error::AnonCreds(format!("attribute {name} does not match signature")));
            }
        }
        if credential.signature["m2"].as_str()
            != Some(Self::credential_signature(n, &u, &attr_digests).as_str())
        {
            return Err(Error::AnonCreds("credential is not bound to this link secret".into()));
        }
        if credential.signature_correctness_proof["se"].as_str()
            != Some(digest(&["scp", &metadata.nonce]).as_str())
        {
            return Err(Error::AnonCreds("invalid signature correctness proof".into()));
        }
        Ok(credential.clone())
    }

    async fn create_presentation(
        &self,
        request: &ProofRequest,
        selected: &SelectedCredentials,
        credentials: &BTreeMap<String, AnonCredsCredential>,
        link_secret: &LinkSecret,
        _schemas: &BTreeMap<String, Schema>,
        cred_defs: &BTreeMap<String, CredentialDefinition>,
    ) -> Result<Presentation> {
        let mut order: Vec<&String> = Vec::new();
        for id in selected.attributes.values().chain(selected.predicates.values()) {
            if !order.contains(&id) {
                order.push(id);
            }
        }

        let lookup = |id: &str| {
            credentials
                .get(id)
                .ok_or_else(|| Error::AnonCreds(format!("credential {id} was not supplied")))
        };

        let mut identifiers = Vec::new();
        let mut sub_proofs = Vec::new();
        for id in &order {
            let credential = lookup(id)?;
            let cred_def = cred_defs
                .get(&credential.cred_def_id)
                .ok_or_else(|| Error::NotFound(credential.cred_def_id.clone()))?;
            let n = Self::public_n(cred_def)?;

            identifiers.push(Identifier {
                schema_id: credential.schema_id.clone(),
                cred_def_id: credential.cred_def_id.clone(),
                rev_reg_id: credential.rev_reg_id.clone(),
                timestamp: None,
            });
            sub_proofs.push(json!({
                "u": Self::blinded_link_secret(link_secret, n),
                "m2": credential.signature["m2"],
                "attr_digests": credential.signature["attr_digests"],
                "predicates": {},
            }));
        }
        let index_of = |id: &String| order.iter().position(|o| *o == id).unwrap_or_default();

        let mut requested_proof = RequestedProof::default();
        for (referent, info) in &request.requested_attributes {
            let id = selected
                .attributes
                .get(referent)
                .ok_or_else(|| Error::AnonCreds(format!("no credential selected for {referent}")))?;
            let value = lookup(id)?
                .values
                .get(&info.name)
                .ok_or_else(|| Error::AnonCreds(format!("credential {id} has no {}", info.name)))?;
            requested_proof.revealed_attrs.insert(
                referent.clone(),
                RevealedAttribute {
                    sub_proof_index: index_of(id),
                    raw: value.raw.clone(),
                    encoded: value.encoded.clone(),
                },
            );
        }

        for (referent, info) in &request.requested_predicates {
            let id = selected
                .predicates
                .get(referent)
                .ok_or_else(|| Error::AnonCreds(format!("no credential selected for {referent}")))?;
            let credential = lookup(id)?;
            let value = credential
                .values
                .get(&info.name)
                .ok_or_else(|| Error::AnonCreds(format!("credential {id} has no {}", info.name)))?;
            let number: i64 = value
                .raw
                .parse()
                .map_err(|_| Error::AnonCreds(format!("{} is not numeric", info.name)))?;
            if !info.p_type.holds(number, info.p_value) {
                return Err(Error::AnonCreds(format!("predicate {referent} is not satisfied")));
            }

            let index = index_of(id);
            let n = Self::public_n(
                cred_defs
                    .get(&credential.cred_def_id)
                    .ok_or_else(|| Error::NotFound(credential.cred_def_id.clone()))?,
            )?;
            let p_type = serde_json::to_value(info.p_type)?;
            let attr_digest = Self::attribute_digest(n, &info.name, &value.encoded);
            sub_proofs[index]["predicates"][referent] = json!(Self::predicate_proof(
                n,
                &attr_digest,
                p_type.as_str().unwrap_or_default(),
                info.p_value
            ));
            requested_proof
                .predicates
                .insert(referent.clone(), SubProofReferent { sub_proof_index: index });
        }

        let m2s: Vec<String> = sub_proofs.iter().map(|p| p["m2"].to_string()).collect();
        Ok(Presentation {
            requested_proof,
            identifiers,
            proof: json!({
                "proofs": sub_proofs,
                "aggregated": digest(&["agg", &request.nonce, &m2s.join(",")]),
            }),
        })
    }

    async fn verify_presentation(
        &self,
        request: &ProofRequest,
        presentation: &Presentation,
        _schemas: &BTreeMap<String, Schema>,
        cred_defs: &BTreeMap<String, CredentialDefinition>,
        status_lists: &[RevocationStatusList],
    ) -> Result<bool> {
        let Some(sub_proofs) = presentation.proof["proofs"].as_array() else {
            return Ok(false);
        };
        if sub_proofs.len() != presentation.identifiers.len() {
            return Ok(false);
        }

        let m2s: Vec<String> = sub_proofs.iter().map(|p| p["m2"].to_string()).collect();
        if presentation.proof["aggregated"].as_str()
            != Some(digest(&["agg", &request.nonce, &m2s.join(",")]).as_str())
        {
            return Ok(false);
        }

        let mut digests = Vec::new();
        for (identifier, sub_proof) in presentation.identifiers.iter().zip(sub_proofs) {
            let Some(cred_def) = cred_defs.get(&identifier.cred_def_id) else {
                return Ok(false);
            };
            let n = Self::public_n(cred_def)?;
            let attr_digests: BTreeMap<String, String> =
                serde_json::from_value(sub_proof["attr_digests"].clone())?;
            let u = sub_proof["u"].as_str().unwrap_or_default();
            if sub_proof["m2"].as_str() != Some(Self::credential_signature(n, u, &attr_digests).as_str()) {
                return Ok(false);
            }

            if let Some(rev_reg_id) = &identifier.rev_reg_id {
                let index = sub_proof["rev_idx"].as_u64().unwrap_or_default() as usize;
                let revoked = status_lists
                    .iter()
                    .any(|l| &l.rev_reg_def_id == rev_reg_id && l.is_revoked(index));
                if revoked {
                    return Ok(false);
                }
            }
            digests.push((n, attr_digests));
        }

        for (referent, info) in &request.requested_attributes {
            let Some(revealed) = presentation.requested_proof.revealed_attrs.get(referent) else {
                return Ok(false);
            };
            let Some((n, attr_digests)) = digests.get(revealed.sub_proof_index) else {
                return Ok(false);
            };
            let identifier = &presentation.identifiers[revealed.sub_proof_index];
            if !info.restrictions.is_empty()
                && !info
                    .restrictions
                    .iter()
                    .any(|r| r.matches(&identifier.schema_id, &identifier.cred_def_id))
            {
                return Ok(false);
            }
            if CredentialValue::new(revealed.raw.clone()).encoded != revealed.encoded
                || attr_digests.get(&info.name)
                    != Some(&Self::attribute_digest(n, &info.name, &revealed.encoded))
            {
                return Ok(false);
            }
        }

        for (referent, info) in &request.requested_predicates {
            let Some(answer) = presentation.requested_proof.predicates.get(referent) else {
                return Ok(false);
            };
            let Some((n, attr_digests)) = digests.get(answer.sub_proof_index) else {
                return Ok(false);
            };
            let Some(attr_digest) = attr_digests.get(&info.name) else {
                return Ok(false);
            };
            let p_type = serde_json::to_value(info.p_type)?;
            let expected =
                Self::predicate_proof(n, attr_digest, p_type.as_str().unwrap_or_default(), info.p_value);
            if sub_proofs[answer.sub_proof_index]["predicates"][referent].as_str() != Some(expected.as_str()) {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

/// An AnonCreds registry held in memory, owning one identifier prefix.
#[derive(Debug)]
pub struct InMemoryRegistry {
    prefix: String,
    schemas: RwLock<HashMap<String, Schema>>,
    definitions: RwLock<HashMap<String, CredentialDefinition>>,
    status_lists: RwLock<HashMap<String, RevocationStatusList>>,
    sequence: AtomicU64,
    failing_writes: AtomicU32,
}

impl InMemoryRegistry {
    /// Creates a registry for identifiers starting with `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            schemas: RwLock::default(),
            definitions: RwLock::default(),
            status_lists: RwLock::default(),
            sequence: AtomicU64::new(1),
            failing_writes: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` writes fail with a transient error.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Publishes a revocation status list.
    pub async fn publish_status_list(&self, list: RevocationStatusList) {
        self.status_lists
            .write()
            .await
            .insert(list.rev_reg_def_id.clone(), list);
    }

    fn check_write(&self) -> Result<()> {
        let pending = self.failing_writes.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_writes.store(pending - 1, Ordering::SeqCst);
            return Err(Error::Transient("registry unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AnonCredsRegistry for InMemoryRegistry {
    fn supported_prefix(&self) -> &str {
        &self.prefix
    }

    async fn get_schema(&self, schema_id: &str) -> Result<Schema> {
        self.schemas
            .read()
            .await
            .get(schema_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("schema {schema_id}")))
    }

    async fn register_schema(&self, schema: &Schema) -> Result<String> {
        self.check_write()?;
        let id = format!(
            "{}/anoncreds/v0/SCHEMA/{}/{}",
            schema.issuer_id, schema.name, schema.version
        );

        let mut schemas = self.schemas.write().await;
        match schemas.get(&id) {
            Some(existing) if existing != schema => {
                Err(Error::Registry(format!("schema {id} already registered with other content")))
            }
            Some(_) => Ok(id),
            None => {
                schemas.insert(id.clone(), schema.clone());
                Ok(id)
            }
        }
    }

    async fn get_credential_definition(&self, cred_def_id: &str) -> Result<CredentialDefinition> {
        self.definitions
            .read()
            .await
            .get(cred_def_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("credential definition {cred_def_id}")))
    }

    async fn register_credential_definition(&self, definition: &CredentialDefinition) -> Result<String> {
        self.check_write()?;
        if !self.schemas.read().await.contains_key(&definition.schema_id) {
            return Err(Error::Registry(format!("unknown schema {}", definition.schema_id)));
        }

        let id = format!(
            "{}/anoncreds/v0/CLAIM_DEF/{}/{}",
            definition.issuer_id,
            self.sequence.fetch_add(1, Ordering::SeqCst),
            definition.tag
        );
        self.definitions
            .write()
            .await
            .insert(id.clone(), definition.clone());
        Ok(id)
    }

    async fn get_revocation_status_list(
        &self,
        rev_reg_def_id: &str,
        _timestamp: u64,
    ) -> Result<RevocationStatusList> {
        self.status_lists
            .read()
            .await
            .get(rev_reg_def_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("revocation status list {rev_reg_def_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anoncreds::{AttributeInfo, PredicateInfo, PredicateType, Restriction};
    use pretty_assertions::assert_eq;

    struct Issued {
        schemas: BTreeMap<String, Schema>,
        cred_defs: BTreeMap<String, CredentialDefinition>,
        credential: AnonCredsCredential,
        link_secret: LinkSecret,
    }

    async fn issue(values: &[(&str, &str)]) -> Issued {
        let backend = MockAnonCreds;
        let schema = Schema {
            issuer_id: "did:indy:test:issuer".into(),
            name: "person".into(),
            version: "1.0".into(),
            attr_names: values.iter().map(|(k, _)| k.to_string()).collect(),
        };
        let created = backend
            .create_credential_definition("schema-1", &schema, &schema.issuer_id, "default")
            .await
            .unwrap();
        let cred_def_id = "did:indy:test:issuer/anoncreds/v0/CLAIM_DEF/1/default";

        let offer = backend
            .create_credential_offer("schema-1", cred_def_id, &created.key_correctness_proof)
            .await
            .unwrap();
        let link_secret = backend.create_link_secret().await.unwrap();
        let (request, metadata) = backend
            .create_credential_request(&offer, &created.definition, &link_secret, "ls", "holder")
            .await
            .unwrap();
        assert!(backend
            .verify_credential_request(&offer, &request, &created.definition)
            .await
            .unwrap());

        let values: BTreeMap<String, String> = values
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let credential = backend
            .create_credential(&offer, &request, &created.definition, &created.private, &values)
            .await
            .unwrap();
        let credential = backend
            .process_credential(&credential, &metadata, &link_secret, &created.definition)
            .await
            .unwrap();

        Issued {
            schemas: BTreeMap::from([("schema-1".to_string(), schema)]),
            cred_defs: BTreeMap::from([(cred_def_id.to_string(), created.definition)]),
            credential,
            link_secret,
        }
    }

    fn proof_request(cred_def_id: &str) -> ProofRequest {
        ProofRequest {
            name: "proof".into(),
            version: "1.0".into(),
            nonce: "1234".into(),
            requested_attributes: BTreeMap::from([(
                "attr_a".to_string(),
                AttributeInfo {
                    name: "a".into(),
                    restrictions: vec![Restriction {
                        cred_def_id: Some(cred_def_id.to_string()),
                        ..Restriction::default()
                    }],
                },
            )]),
            requested_predicates: BTreeMap::from([(
                "age_over_18".to_string(),
                PredicateInfo {
                    name: "age".into(),
                    p_type: PredicateType::GreaterOrEqual,
                    p_value: 18,
                    restrictions: Vec::new(),
                },
            )]),
            non_revoked: None,
        }
    }

    fn selection() -> SelectedCredentials {
        SelectedCredentials {
            attributes: BTreeMap::from([("attr_a".to_string(), "cred-1".to_string())]),
            predicates: BTreeMap::from([("age_over_18".to_string(), "cred-1".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_plugin_signs_and_decrypts() {
        let plugin = MockPlugin::new();
        let key = plugin.keys().create_key(None).await.unwrap();
        assert_eq!(key.public_key.len(), 32);
        plugin.keys().assign_did(&key.key_reference, "did:key:z6Mk1").await.unwrap();
        assert!(plugin.owns("did:key:z6Mk1").await);
        assert!(plugin.keys().assign_did("nope", "did:key:z6Mk2").await.is_err());

        let signature = plugin.signer().sign(b"data", "did:key:z6Mk1#key-1").await.unwrap();
        assert!(plugin.signer().verify(b"data", &signature, "did:key:z6Mk1").await.unwrap());
        assert!(!plugin.signer().verify(b"data", &signature, "did:key:z6Mk9").await.unwrap());

        let sealed = plugin
            .encryptor()
            .encrypt(b"secret", &["did:example:bob"], None)
            .await
            .unwrap();
        assert_eq!(
            plugin.encryptor().decrypt(&sealed, "did:example:bob").await.unwrap(),
            b"secret".to_vec()
        );
        assert!(plugin.encryptor().decrypt(&sealed, "did:example:eve").await.is_err());
    }

    #[tokio::test]
    async fn test_credential_round_trip_and_presentation() {
        let issued = issue(&[("a", "b"), ("age", "21")]).await;
        assert_eq!(issued.credential.raw_values()["a"], "b");

        let cred_def_id = issued.credential.cred_def_id.clone();
        let request = proof_request(&cred_def_id);
        let credentials = BTreeMap::from([("cred-1".to_string(), issued.credential.clone())]);

        let presentation = MockAnonCreds
            .create_presentation(
                &request,
                &selection(),
                &credentials,
                &issued.link_secret,
                &issued.schemas,
                &issued.cred_defs,
            )
            .await
            .unwrap();
        assert_eq!(presentation.requested_proof.revealed_attrs["attr_a"].raw, "b");

        assert!(MockAnonCreds
            .verify_presentation(&request, &presentation, &issued.schemas, &issued.cred_defs, &[])
            .await
            .unwrap());

        let mut tampered = presentation.clone();
        tampered
            .requested_proof
            .revealed_attrs
            .get_mut("attr_a")
            .unwrap()
            .raw = "c".into();
        assert!(!MockAnonCreds
            .verify_presentation(&request, &tampered, &issued.schemas, &issued.cred_defs, &[])
            .await
            .unwrap());

        let replayed = ProofRequest {
            nonce: "9999".into(),
            ..request
        };
        assert!(!MockAnonCreds
            .verify_presentation(&replayed, &presentation, &issued.schemas, &issued.cred_defs, &[])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unsatisfied_predicate_cannot_be_proven() {
        let issued = issue(&[("a", "b"), ("age", "16")]).await;
        let request = proof_request(&issued.credential.cred_def_id);
        let credentials = BTreeMap::from([("cred-1".to_string(), issued.credential.clone())]);

        let result = MockAnonCreds
            .create_presentation(
                &request,
                &selection(),
                &credentials,
                &issued.link_secret,
                &issued.schemas,
                &issued.cred_defs,
            )
            .await;
        assert!(matches!(result, Err(Error::AnonCreds(_))));
    }

    #[tokio::test]
    async fn test_credential_is_bound_to_link_secret() {
        let issued = issue(&[("a", "b")]).await;
        let cred_def = issued.cred_defs.values().next().unwrap();
        let metadata = CredentialRequestMetadata {
            link_secret_blinding_data: json!({}),
            nonce: "0".into(),
            link_secret_name: "other".into(),
        };
        let other_secret = LinkSecret::new("other");

        let result = MockAnonCreds
            .process_credential(&issued.credential, &metadata, &other_secret, cred_def)
            .await;
        assert!(matches!(result, Err(Error::AnonCreds(_))));
    }

    #[tokio::test]
    async fn test_registry_writes() {
        let registry = InMemoryRegistry::new("did:indy:test:");
        let schema = Schema {
            issuer_id: "did:indy:test:issuer".into(),
            name: "person".into(),
            version: "1.0".into(),
            attr_names: vec!["a".into()],
        };

        registry.fail_next_writes(1);
        assert!(matches!(
            registry.register_schema(&schema).await,
            Err(Error::Transient(_))
        ));

        let schema_id = registry.register_schema(&schema).await.unwrap();
        assert_eq!(schema_id, "did:indy:test:issuer/anoncreds/v0/SCHEMA/person/1.0");
        assert_eq!(registry.register_schema(&schema).await.unwrap(), schema_id);

        let changed = Schema {
            attr_names: vec!["b".into()],
            ..schema
        };
        assert!(matches!(
            registry.register_schema(&changed).await,
            Err(Error::Registry(_))
        ));

        let orphan = CredentialDefinition {
            issuer_id: "did:indy:test:issuer".into(),
            schema_id: "missing".into(),
            typ: "CL".into(),
            tag: "default".into(),
            value: json!({}),
        };
        assert!(registry.register_credential_definition(&orphan).await.is_err());
        assert!(matches!(
            registry.get_credential_definition("missing").await,
            Err(Error::NotFound(_))
        ));
    }
}
