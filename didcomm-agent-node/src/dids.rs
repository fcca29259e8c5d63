//! DID resolution and creation.
//!
//! [`WebDidResolver`] fetches `did:web` documents over HTTPS. [`DidsApi`] is
//! the application's view of the agent's [`didcomm_agent_core::DidRouter`]
//! and of the DIDs it owns.

use async_trait::async_trait;
use didcomm_agent_core::did::{Did, DidDocument};
use didcomm_agent_core::DIDResolver;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::context::AgentContext;
use crate::error::{Error, Result};
use crate::records::{DidRecord, Repository};

/// Resolves `did:web` DIDs from `/.well-known/did.json` or `<path>/did.json`.
#[derive(Debug, Clone)]
pub struct WebDidResolver {
    client: Client,
    scheme: String,
}

impl Default for WebDidResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl WebDidResolver {
    /// A resolver fetching documents over HTTPS.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            scheme: "https".to_string(),
        }
    }

    /// Uses `scheme` instead of `https`, for local test servers.
    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// The URL the document of `did` is served at.
    ///
    /// # Errors
    ///
    /// Returns [`didcomm_agent_core::Error::InvalidDid`] if `did` is not a `did:web`.
    pub fn document_url(&self, did: &str) -> didcomm_agent_core::Result<String> {
        let specific = did
            .strip_prefix("did:web:")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| didcomm_agent_core::Error::InvalidDid(did.to_string()))?;

        let mut segments = specific.split(':');
        let host = segments
            .next()
            .map(|host| host.replace("%3A", ":").replace("%3a", ":"))
            .unwrap_or_default();
        let path: Vec<&str> = segments.collect();

        let url = if path.is_empty() {
            format!("{}://{host}/.well-known/did.json", self.scheme)
        } else {
            format!("{}://{host}/{}/did.json", self.scheme, path.join("/"))
        };
        reqwest::Url::parse(&url)
            .map_err(|e| didcomm_agent_core::Error::InvalidDid(format!("{did}: {e}")))?;
        Ok(url)
    }
}

#[async_trait]
impl DIDResolver for WebDidResolver {
    fn method(&self) -> &str {
        "web"
    }

    async fn resolve(&self, did: &str) -> didcomm_agent_core::Result<DidDocument> {
        let url = self.document_url(did)?;
        debug!(did, url, "fetching did:web document");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| didcomm_agent_core::Error::Transient(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(didcomm_agent_core::Error::NotFound(format!("DID document of {did}")))
            }
            status if status.is_server_error() => {
                return Err(didcomm_agent_core::Error::Transient(format!("{url} answered {status}")))
            }
            status => {
                return Err(didcomm_agent_core::Error::DIDResolution(format!("{url} answered {status}")))
            }
        }

        let document: DidDocument = response
            .json()
            .await
            .map_err(|e| didcomm_agent_core::Error::DIDResolution(format!("invalid document: {e}")))?;
        if document.id != did {
            return Err(didcomm_agent_core::Error::DIDResolution(format!(
                "document at {url} describes {}",
                document.id
            )));
        }
        Ok(document)
    }
}

/// Options of [`DidsApi::import_did`].
#[derive(Clone)]
pub struct ImportDidOptions {
    /// The DID to import
    pub did: String,
    /// Ed25519 private key (seed) controlling the DID
    pub private_key: Zeroizing<Vec<u8>>,
    /// Document to keep for the DID; without one a bare document
    /// advertising the agent's endpoints is stored
    pub document: Option<DidDocument>,
    /// Replace a DID imported before
    pub overwrite: bool,
}

/// Resolves and creates DIDs through the agent's routers.
pub struct DidsApi {
    ctx: Arc<AgentContext>,
    owned: Repository<DidRecord>,
}

impl DidsApi {
    pub(crate) fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            owned: ctx.repository(),
            ctx,
        }
    }

    /// Resolves `did` through the resolver of its method.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::UnsupportedMethod`] if no resolver is registered for the method.
    pub async fn resolve(&self, did: &str) -> Result<DidDocument> {
        Ok(self.ctx.dids.resolve(did).await?)
    }

    /// Creates a DID of `method`, advertising the agent's endpoints.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::UnsupportedMethod`] if no registrar is registered for the method
    /// - [`crate::Error::RegistrationTimeout`] if the DID was not durably created in time
    pub async fn create(&self, method: &str) -> Result<DidRecord> {
        self.ctx.create_did(method).await
    }

    /// Takes ownership of an existing DID by importing its private key into
    /// the wallet, e.g. an issuer DID already written to a ledger.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the DID is owned already and `overwrite` is not set
    /// - [`crate::Error::Core`] if the DID does not parse or the wallet rejects the key
    pub async fn import_did(&self, options: ImportDidOptions) -> Result<DidRecord> {
        let parsed: Did = options.did.parse()?;
        let did = parsed.to_string();
        let exists = self.ctx.owns_did(&did).await?;
        if exists && !options.overwrite {
            return Err(Error::InvalidState(format!("{did} is already owned")));
        }

        let keys = self.ctx.plugin.keys();
        let key = keys.create_key(Some(options.private_key.as_slice())).await?;
        keys.assign_did(&key.key_reference, &did).await?;

        let document = match options.document {
            Some(document) => document,
            None => DidDocument::new(did.clone()).with_endpoints(&self.ctx.config().await.endpoints),
        };
        if exists {
            self.owned.delete(&did).await?;
        }
        let record = self
            .owned
            .save(DidRecord {
                did,
                method: parsed.method().to_string(),
                key_reference: Some(key.key_reference),
                document,
            })
            .await?;
        info!(did = record.did, overwritten = exists, "imported DID");
        Ok(record.record)
    }

    /// The DIDs this agent owns.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn owned(&self) -> Result<Vec<DidRecord>> {
        Ok(self.owned.all().await?.into_iter().map(|d| d.record).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Agent, AgentConfig};
    use didcomm_agent_core::mock::{MockAnonCreds, MockPlugin};
    use pretty_assertions::assert_eq;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[tokio::test]
    async fn test_import_did_binds_the_key() {
        let plugin = Arc::new(MockPlugin::new());
        let config = AgentConfig {
            endpoints: vec!["http://issuer.test/didcomm".into()],
            ..Default::default()
        };
        let agent = Agent::builder(config, plugin.clone(), Arc::new(MockAnonCreds))
            .build()
            .unwrap();
        let did = "did:indy:bcovrin:test:A4CYPASJYRZRt98YWrac3H";
        let options = ImportDidOptions {
            did: did.into(),
            private_key: Zeroizing::new(b"asdfasdf000000000000000000000000".to_vec()),
            document: None,
            overwrite: false,
        };

        let imported = agent.dids().import_did(options.clone()).await.unwrap();
        assert_eq!(imported.method, "indy");
        assert!(plugin.owns(did).await);
        assert_eq!(
            imported.document.didcomm_service().map(|s| s.service_endpoint.as_str()),
            Some("http://issuer.test/didcomm")
        );
        assert_eq!(agent.dids().owned().await.unwrap(), vec![imported.clone()]);

        let again = agent.dids().import_did(options.clone()).await;
        assert!(matches!(again, Err(Error::InvalidState(_))));

        let replaced = agent
            .dids()
            .import_did(ImportDidOptions {
                overwrite: true,
                ..options
            })
            .await
            .unwrap();
        assert_ne!(replaced.key_reference, imported.key_reference);
        assert_eq!(agent.dids().owned().await.unwrap(), vec![replaced]);

        let short = agent
            .dids()
            .import_did(ImportDidOptions {
                did: "did:indy:bcovrin:test:other".into(),
                private_key: Zeroizing::new(b"short".to_vec()),
                document: None,
                overwrite: false,
            })
            .await;
        assert!(short.is_err());
    }

    #[test]
    fn test_document_urls() {
        let resolver = WebDidResolver::new();
        assert_eq!(
            resolver.document_url("did:web:example.com").unwrap(),
            "https://example.com/.well-known/did.json"
        );
        assert_eq!(
            resolver.document_url("did:web:example.com:user:alice").unwrap(),
            "https://example.com/user/alice/did.json"
        );
        assert_eq!(
            resolver.document_url("did:web:localhost%3A8443").unwrap(),
            "https://localhost:8443/.well-known/did.json"
        );
        assert!(resolver.document_url("did:key:z6Mk").is_err());
    }

    fn server_did(server: &MockServer, suffix: &str) -> String {
        let host = server.uri().trim_start_matches("http://").replace(':', "%3A");
        format!("did:web:{host}{suffix}")
    }

    #[tokio::test]
    async fn test_resolve_web_did() {
        let server = MockServer::start().await;
        let did = server_did(&server, ":issuers:faber");
        let document = DidDocument::new(did.clone())
            .with_endpoints(&["https://faber.example/didcomm".to_string()]);

        Mock::given(method("GET"))
            .and(path("/issuers/faber/did.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&document))
            .mount(&server)
            .await;

        let resolver = WebDidResolver::new().with_scheme("http");
        let resolved = resolver.resolve(&did).await.unwrap();
        assert_eq!(resolved, document);
    }

    #[tokio::test]
    async fn test_resolve_classifies_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/did.json"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing/did.json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/other/did.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(DidDocument::new("did:web:elsewhere.example")),
            )
            .mount(&server)
            .await;

        let resolver = WebDidResolver::new().with_scheme("http");

        let result = resolver.resolve(&server_did(&server, "")).await;
        assert!(matches!(result, Err(e) if e.is_transient()));

        let result = resolver.resolve(&server_did(&server, ":missing")).await;
        assert!(matches!(result, Err(didcomm_agent_core::Error::NotFound(_))));

        let result = resolver.resolve(&server_did(&server, ":other")).await;
        assert!(matches!(result, Err(didcomm_agent_core::Error::DIDResolution(_))));
    }
}
