//! Typed records on top of the [`RecordStore`].
//!
//! A [`Repository`] serializes one record type into the untyped store and
//! hands records back wrapped in [`Versioned`], so that a later update can
//! be checked against the revision that was read.

use didcomm_agent_core::anoncreds::{AnonCredsCredential, CredentialDefinition, LinkSecret};
use didcomm_agent_core::did::DidDocument;
use didcomm_agent_core::storage::Tags;
use didcomm_agent_core::RecordStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// A record kept in the [`RecordStore`].
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Record category in the store.
    const TYPE: &'static str;

    /// Unique id within the category.
    fn id(&self) -> &str;

    /// Tags the record is queryable by.
    fn tags(&self) -> Tags {
        Tags::new()
    }
}

/// Builds a tag map from pairs.
pub fn tags<const N: usize>(pairs: [(&str, &str); N]) -> Tags {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A record together with the store revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<R> {
    /// The record
    pub record: R,
    /// Store revision, checked on update
    pub revision: u64,
}

impl<R> std::ops::Deref for Versioned<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.record
    }
}

impl<R> std::ops::DerefMut for Versioned<R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.record
    }
}

/// Typed access to the records of one category.
pub struct Repository<R> {
    store: Arc<dyn RecordStore>,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for Repository<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _record: PhantomData,
        }
    }
}

impl<R: Record> Repository<R> {
    /// Creates a repository over `store`.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            _record: PhantomData,
        }
    }

    fn decode(stored: didcomm_agent_core::StorageRecord) -> Result<Versioned<R>> {
        Ok(Versioned {
            record: serde_json::from_value(stored.value)?,
            revision: stored.version,
        })
    }

    /// Stores a new record.
    ///
    /// # Errors
    ///
    /// Returns an error if a record with the same id exists.
    pub async fn save(&self, record: R) -> Result<Versioned<R>> {
        let stored = self
            .store
            .insert(R::TYPE, record.id(), serde_json::to_value(&record)?, record.tags())
            .await?;
        Ok(Versioned {
            record,
            revision: stored.version,
        })
    }

    /// Reads a record by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordNotFound`] if it does not exist.
    pub async fn get(&self, id: &str) -> Result<Versioned<R>> {
        match self.store.get(R::TYPE, id).await {
            Ok(stored) => Self::decode(stored),
            Err(didcomm_agent_core::Error::NotFound(_)) => {
                Err(Error::RecordNotFound(format!("{} {id}", R::TYPE)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writes back a record read earlier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateConflict`] if the record changed since it was read.
    pub async fn update(&self, versioned: Versioned<R>) -> Result<Versioned<R>> {
        let Versioned { record, revision } = versioned;
        let stored = self
            .store
            .update(
                R::TYPE,
                record.id(),
                serde_json::to_value(&record)?,
                record.tags(),
                revision,
            )
            .await?;
        Ok(Versioned {
            record,
            revision: stored.version,
        })
    }

    /// All records whose tags contain every given pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or a record does not decode.
    pub async fn find_by(&self, tags: &Tags) -> Result<Vec<Versioned<R>>> {
        self.store
            .query(R::TYPE, tags)
            .await?
            .into_iter()
            .map(Self::decode)
            .collect()
    }

    /// The single record matching `tags`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if more than one record matches.
    pub async fn find_one_by(&self, tags: &Tags) -> Result<Option<Versioned<R>>> {
        let mut found = self.find_by(tags).await?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            n => Err(Error::InvalidState(format!("{n} {} records match {tags:?}", R::TYPE))),
        }
    }

    /// Every record of this category.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or a record does not decode.
    pub async fn all(&self) -> Result<Vec<Versioned<R>>> {
        self.find_by(&Tags::new()).await
    }

    /// Removes a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordNotFound`] if it does not exist.
    pub async fn delete(&self, id: &str) -> Result<()> {
        match self.store.delete(R::TYPE, id).await {
            Err(didcomm_agent_core::Error::NotFound(_)) => {
                Err(Error::RecordNotFound(format!("{} {id}", R::TYPE)))
            }
            other => Ok(other?),
        }
    }
}

/// A DID owned by this agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidRecord {
    /// The DID
    pub did: String,
    /// Its method
    pub method: String,
    /// Reference to the private key in the wallet
    pub key_reference: Option<String>,
    /// Document as created
    pub document: DidDocument,
}

impl Record for DidRecord {
    const TYPE: &'static str = "DidRecord";

    fn id(&self) -> &str {
        &self.did
    }

    fn tags(&self) -> Tags {
        tags([("method", self.method.as_str())])
    }
}

/// The holder's link secret.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSecretRecord {
    /// Link secret id, referenced by credential requests
    pub id: String,
    value: String,
}

impl LinkSecretRecord {
    /// Wraps a freshly created secret.
    pub fn new(id: impl Into<String>, secret: &LinkSecret) -> Self {
        Self {
            id: id.into(),
            value: secret.expose().to_string(),
        }
    }

    /// The secret, for handing to the AnonCreds backend.
    #[must_use]
    pub fn secret(&self) -> LinkSecret {
        LinkSecret::new(self.value.clone())
    }
}

impl std::fmt::Debug for LinkSecretRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSecretRecord")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for LinkSecretRecord {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

impl Record for LinkSecretRecord {
    const TYPE: &'static str = "LinkSecretRecord";

    fn id(&self) -> &str {
        &self.id
    }
}

/// A credential definition this agent issues with, including its private key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialDefinitionRecord {
    /// Registered id
    pub id: String,
    /// Public definition
    pub definition: CredentialDefinition,
    /// Private key material
    pub private: serde_json::Value,
    /// Key correctness proof sent with offers
    pub key_correctness_proof: serde_json::Value,
}

impl Record for CredentialDefinitionRecord {
    const TYPE: &'static str = "CredentialDefinitionRecord";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> Tags {
        tags([("schemaId", self.definition.schema_id.as_str())])
    }
}

/// Format of a stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoredCredentialFormat {
    /// AnonCreds credential
    Indy,
    /// W3C credential with a linked data proof
    JsonLd,
}

/// A credential held by this agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    /// Credential id
    pub id: String,
    /// Credential format
    pub format: StoredCredentialFormat,
    /// Schema id (AnonCreds) or credential type (JSON-LD)
    pub schema_id: String,
    /// Credential definition id (AnonCreds) or issuer (JSON-LD)
    pub credential_definition_id: String,
    /// Revocation registry id, if revocable
    pub revocation_registry_id: Option<String>,
    /// Attribute name to raw value
    pub attributes: BTreeMap<String, String>,
    /// The credential as received
    pub credential: serde_json::Value,
    /// Thread of the exchange that issued it
    pub thread_id: String,
}

impl CredentialRecord {
    /// The AnonCreds credential, for Indy format records.
    ///
    /// # Errors
    ///
    /// Returns an error if the record holds another format.
    pub fn anoncreds(&self) -> Result<AnonCredsCredential> {
        if self.format != StoredCredentialFormat::Indy {
            return Err(Error::FormatMismatch(format!("credential {} is not AnonCreds", self.id)));
        }
        Ok(serde_json::from_value(self.credential.clone())?)
    }
}

impl Record for CredentialRecord {
    const TYPE: &'static str = "CredentialRecord";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> Tags {
        let format = match self.format {
            StoredCredentialFormat::Indy => "indy",
            StoredCredentialFormat::JsonLd => "jsonld",
        };
        tags([
            ("format", format),
            ("schemaId", self.schema_id.as_str()),
            ("credentialDefinitionId", self.credential_definition_id.as_str()),
            ("threadId", self.thread_id.as_str()),
        ])
    }
}
