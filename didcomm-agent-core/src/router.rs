//! Dispatch tables for DID methods and credential registries.
//!
//! Both routers are assembled once through a builder and immutable afterwards.
//! Lookup walks the entries in registration order and the first entry that
//! claims a method (or identifier prefix) wins. Nothing matching is a
//! configuration problem and fails immediately with
//! [`Error::UnsupportedMethod`]; it is never retried.
//!
//! Writes that need durable acceptance by a backend are retried on transient
//! failures and bounded by the registration timeout, after which they fail
//! with [`Error::RegistrationTimeout`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::anoncreds::{AnonCredsRegistry, CredentialDefinition, RevocationStatusList, Schema};
use crate::did::{Did, DidCreateOptions, DidCreateResult, DidDocument};
use crate::plugin::{DIDRegistrar, DIDResolver};
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Default bound on a registration round trip.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

async fn durable_write<T, F, Fut>(
    retry: &RetryPolicy,
    timeout: Duration,
    what: &str,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, retry.run(what, operation)).await {
        Ok(Err(e)) if e.is_transient() => Err(Error::RegistrationTimeout(format!("{what}: {e}"))),
        Ok(result) => result,
        Err(_) => Err(Error::RegistrationTimeout(format!(
            "{what}: no durable acceptance within {timeout:?}"
        ))),
    }
}

/// Routes DIDs to the resolver or registrar of their method.
pub struct DidRouter {
    resolvers: Vec<Arc<dyn DIDResolver>>,
    registrars: Vec<Arc<dyn DIDRegistrar>>,
    retry: RetryPolicy,
    registration_timeout: Duration,
}

impl std::fmt::Debug for DidRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DidRouter")
            .field("resolvers", &self.resolvers.iter().map(|r| r.method()).collect::<Vec<_>>())
            .field("registrars", &self.registrars.iter().map(|r| r.method()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl DidRouter {
    /// Starts building a router.
    #[must_use]
    pub fn builder() -> DidRouterBuilder {
        DidRouterBuilder::default()
    }

    /// Whether a resolver is registered for `method`.
    #[must_use]
    pub fn can_resolve(&self, method: &str) -> bool {
        self.resolvers.iter().any(|r| r.method() == method)
    }

    /// Whether a registrar is registered for `method`.
    #[must_use]
    pub fn can_create(&self, method: &str) -> bool {
        self.registrars.iter().any(|r| r.method() == method)
    }

    /// Resolves a DID through the first resolver registered for its method.
    ///
    /// # Errors
    /// - [`Error::InvalidDid`] if `did` does not parse
    /// - [`Error::UnsupportedMethod`] if no resolver claims the method
    /// - Any resolver failure once retries are exhausted
    pub async fn resolve(&self, did: &str) -> Result<DidDocument> {
        let parsed: Did = did.parse()?;
        let resolver = self
            .resolvers
            .iter()
            .find(|r| r.method() == parsed.method())
            .ok_or_else(|| Error::UnsupportedMethod(format!("did:{}", parsed.method())))?;

        debug!(did, method = parsed.method(), "resolving DID");
        self.retry.run("resolve DID", || resolver.resolve(did)).await
    }

    /// Creates a DID through the first registrar registered for `method`.
    ///
    /// # Errors
    /// - [`Error::UnsupportedMethod`] if no registrar claims the method
    /// - [`Error::RegistrationTimeout`] if the backend does not durably accept in time
    pub async fn create(&self, method: &str, options: &DidCreateOptions) -> Result<DidCreateResult> {
        let registrar = self
            .registrars
            .iter()
            .find(|r| r.method() == method)
            .ok_or_else(|| Error::UnsupportedMethod(format!("did:{method}")))?;

        let created = durable_write(&self.retry, self.registration_timeout, "create DID", || {
            registrar.create(options)
        })
        .await?;
        info!(did = %created.did, method, "created DID");
        Ok(created)
    }
}

/// Builder of [`DidRouter`].
pub struct DidRouterBuilder {
    resolvers: Vec<Arc<dyn DIDResolver>>,
    registrars: Vec<Arc<dyn DIDRegistrar>>,
    retry: RetryPolicy,
    registration_timeout: Duration,
}

impl Default for DidRouterBuilder {
    fn default() -> Self {
        Self {
            resolvers: Vec::new(),
            registrars: Vec::new(),
            retry: RetryPolicy::default(),
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
        }
    }
}

impl DidRouterBuilder {
    /// Appends a resolver. Earlier resolvers take priority for the same method.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn DIDResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Appends a registrar. Earlier registrars take priority for the same method.
    #[must_use]
    pub fn registrar(mut self, registrar: Arc<dyn DIDRegistrar>) -> Self {
        self.registrars.push(registrar);
        self
    }

    /// Retry policy for transient backend failures.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound on a registration round trip.
    #[must_use]
    pub fn registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    /// Freezes the table.
    #[must_use]
    pub fn build(self) -> DidRouter {
        DidRouter {
            resolvers: self.resolvers,
            registrars: self.registrars,
            retry: self.retry,
            registration_timeout: self.registration_timeout,
        }
    }
}

/// Routes AnonCreds objects to the registry owning their identifier namespace.
pub struct RegistryRouter {
    registries: Vec<Arc<dyn AnonCredsRegistry>>,
    retry: RetryPolicy,
    registration_timeout: Duration,
}

impl std::fmt::Debug for RegistryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryRouter")
            .field(
                "registries",
                &self.registries.iter().map(|r| r.supported_prefix()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl RegistryRouter {
    /// Starts building a router.
    #[must_use]
    pub fn builder() -> RegistryRouterBuilder {
        RegistryRouterBuilder::default()
    }

    fn registry_for(&self, identifier: &str) -> Result<&dyn AnonCredsRegistry> {
        self.registries
            .iter()
            .find(|r| identifier.starts_with(r.supported_prefix()))
            .map(|r| r.as_ref())
            .ok_or_else(|| Error::UnsupportedMethod(identifier.to_string()))
    }

    /// Reads a schema.
    ///
    /// # Errors
    /// - [`Error::UnsupportedMethod`] if no registry owns the identifier
    pub async fn get_schema(&self, schema_id: &str) -> Result<Schema> {
        let registry = self.registry_for(schema_id)?;
        self.retry.run("get schema", || registry.get_schema(schema_id)).await
    }

    /// Publishes a schema under its issuer's namespace.
    ///
    /// # Errors
    /// - [`Error::UnsupportedMethod`] if no registry owns the issuer
    /// - [`Error::RegistrationTimeout`] if the write is not accepted in time
    pub async fn register_schema(&self, schema: &Schema) -> Result<String> {
        let registry = self.registry_for(&schema.issuer_id)?;
        let id = durable_write(&self.retry, self.registration_timeout, "register schema", || {
            registry.register_schema(schema)
        })
        .await?;
        info!(schema_id = %id, "registered schema");
        Ok(id)
    }

    /// Reads a credential definition.
    ///
    /// # Errors
    /// - [`Error::UnsupportedMethod`] if no registry owns the identifier
    pub async fn get_credential_definition(&self, cred_def_id: &str) -> Result<CredentialDefinition> {
        let registry = self.registry_for(cred_def_id)?;
        self.retry
            .run("get credential definition", || {
                registry.get_credential_definition(cred_def_id)
            })
            .await
    }

    /// Publishes a credential definition under its issuer's namespace.
    ///
    /// # Errors
    /// - [`Error::UnsupportedMethod`] if no registry owns the issuer
    /// - [`Error::RegistrationTimeout`] if the write is not accepted in time
    pub async fn register_credential_definition(
        &self,
        definition: &CredentialDefinition,
    ) -> Result<String> {
        let registry = self.registry_for(&definition.issuer_id)?;
        let id = durable_write(
            &self.retry,
            self.registration_timeout,
            "register credential definition",
            || registry.register_credential_definition(definition),
        )
        .await?;
        info!(cred_def_id = %id, "registered credential definition");
        Ok(id)
    }

    /// Reads the revocation status list of a revocation registry.
    ///
    /// # Errors
    /// - [`Error::UnsupportedMethod`] if no registry owns the identifier
    pub async fn get_revocation_status_list(
        &self,
        rev_reg_def_id: &str,
        timestamp: u64,
    ) -> Result<RevocationStatusList> {
        let registry = self.registry_for(rev_reg_def_id)?;
        self.retry
            .run("get revocation status list", || {
                registry.get_revocation_status_list(rev_reg_def_id, timestamp)
            })
            .await
    }
}

/// Builder of [`RegistryRouter`].
pub struct RegistryRouterBuilder {
    registries: Vec<Arc<dyn AnonCredsRegistry>>,
    retry: RetryPolicy,
    registration_timeout: Duration,
}

impl Default for RegistryRouterBuilder {
    fn default() -> Self {
        Self {
            registries: Vec::new(),
            retry: RetryPolicy::default(),
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
        }
    }
}

impl RegistryRouterBuilder {
    /// Appends a registry. Earlier registries take priority for overlapping prefixes.
    #[must_use]
    pub fn registry(mut self, registry: Arc<dyn AnonCredsRegistry>) -> Self {
        self.registries.push(registry);
        self
    }

    /// Retry policy for transient backend failures.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound on a registration round trip.
    #[must_use]
    pub fn registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    /// Freezes the table.
    #[must_use]
    pub fn build(self) -> RegistryRouter {
        RegistryRouter {
            registries: self.registries,
            retry: self.retry,
            registration_timeout: self.registration_timeout,
        }
    }
}
