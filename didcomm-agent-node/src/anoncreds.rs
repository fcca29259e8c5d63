//! Schema and credential definition registration, and the holder's link secret.

use didcomm_agent_core::anoncreds::Schema;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::context::AgentContext;
use crate::error::Result;
use crate::records::{CredentialDefinitionRecord, LinkSecretRecord, Repository};

/// AnonCreds objects owned by the agent.
pub struct AnonCredsApi {
    ctx: Arc<AgentContext>,
    definitions: Repository<CredentialDefinitionRecord>,
    link_secrets: Repository<LinkSecretRecord>,
}

impl AnonCredsApi {
    pub(crate) fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            definitions: ctx.repository(),
            link_secrets: ctx.repository(),
            ctx,
        }
    }

    /// Publishes `schema` in the registry owning its issuer and returns the schema id.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::UnsupportedMethod`] if no registry owns the issuer
    /// - [`crate::Error::RegistrationTimeout`] if the write is not durably accepted in time
    pub async fn register_schema(&self, schema: &Schema) -> Result<String> {
        Ok(self.ctx.registries.register_schema(schema).await?)
    }

    /// Generates and publishes a credential definition for `schema_id`,
    /// keeping its private part for issuance.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::UnsupportedMethod`] if no registry owns the schema or the issuer
    /// - [`crate::Error::RegistrationTimeout`] if the write is not durably accepted in time
    pub async fn register_credential_definition(
        &self,
        schema_id: &str,
        issuer_id: &str,
        tag: &str,
    ) -> Result<CredentialDefinitionRecord> {
        let schema = self.ctx.registries.get_schema(schema_id).await?;
        let created = self
            .ctx
            .anoncreds
            .create_credential_definition(schema_id, &schema, issuer_id, tag)
            .await?;
        let id = self
            .ctx
            .registries
            .register_credential_definition(&created.definition)
            .await?;

        let record = CredentialDefinitionRecord {
            id,
            definition: created.definition,
            private: created.private,
            key_correctness_proof: created.key_correctness_proof,
        };
        let record = self.definitions.save(record).await?.record;
        info!(cred_def_id = record.id, schema_id, "credential definition ready for issuance");
        Ok(record)
    }

    /// Credential definitions this agent can issue with.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn credential_definitions(&self) -> Result<Vec<CredentialDefinitionRecord>> {
        Ok(self
            .definitions
            .all()
            .await?
            .into_iter()
            .map(|d| d.record)
            .collect())
    }

    /// Ids of the holder's link secrets; empty until one is created.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn link_secret_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .link_secrets
            .all()
            .await?
            .iter()
            .map(|secret| secret.id.clone())
            .collect())
    }

    /// Creates the holder's link secret and returns its id. An existing
    /// secret is kept and its id returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend or the store fails.
    pub async fn create_link_secret(&self) -> Result<String> {
        if let Some(existing) = self.link_secrets.all().await?.into_iter().next() {
            return Ok(existing.id.clone());
        }

        let secret = self.ctx.anoncreds.create_link_secret().await?;
        let record = LinkSecretRecord::new(Uuid::new_v4().to_string(), &secret);
        let saved = self.link_secrets.save(record).await?;
        info!(link_secret_id = saved.id, "created link secret");
        Ok(saved.id.clone())
    }
}
