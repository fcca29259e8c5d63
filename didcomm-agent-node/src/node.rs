//! The agent: one identity with its protocol services.
//!
//! An [`Agent`] owns its configuration, its collaborators and the protocol
//! services built on them. It is put together once by an [`AgentBuilder`];
//! the DID, registry and protocol tables are immutable afterwards.
//!
//! # Examples
//!
//! ```rust,no_run
//! use didcomm_agent_core::mock::{MockAnonCreds, MockPlugin};
//! use didcomm_agent_node::protocols::connection::CreateInvitationOptions;
//! use didcomm_agent_node::{Agent, AgentConfig};
//! use std::sync::Arc;
//!
//! async fn example() -> didcomm_agent_node::Result<()> {
//!     let config = AgentConfig {
//!         label: "Faber College".to_string(),
//!         endpoints: vec!["http://localhost:8020/didcomm".to_string()],
//!         ..Default::default()
//!     };
//!     let agent = Agent::builder(config, Arc::new(MockPlugin::new()), Arc::new(MockAnonCreds)).build()?;
//!
//!     let invitation = agent
//!         .connections()
//!         .create_invitation(CreateInvitationOptions::default())
//!         .await?;
//!     println!("{}", invitation.invitation.to_url("http://localhost:8020")?);
//!     Ok(())
//! }
//! ```

use didcomm_agent_core::did::{KeyDidRegistrar, KeyDidResolver};
use didcomm_agent_core::pack::envelope_recipients;
use didcomm_agent_core::{
    unpack_message, AnonCredsBackend, AnonCredsRegistry, DIDCommPlugin, DIDRegistrar, DIDResolver,
    DidRouter, InMemoryRecordStore, RecordStore, RegistryRouter,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::anoncreds::AnonCredsApi;
use crate::config::AgentConfig;
use crate::context::AgentContext;
use crate::dids::{DidsApi, WebDidResolver};
use crate::dispatch::{HttpOutboundTransport, MessageSender, OutboundTransport};
use crate::dispatcher::{Dispatcher, InboundMessage, ProtocolHandler, ThreadLocks};
use crate::error::{Error, Result};
use crate::events::{AgentEvent, EventBus, HandlerHandle};
use crate::protocols::connection::ConnectionService;
use crate::protocols::credential::{CredentialFormatService, CredentialService, FormatRegistry};
use crate::protocols::proof::ProofService;

fn validate_endpoints(endpoints: &[String]) -> Result<()> {
    for endpoint in endpoints {
        reqwest::Url::parse(endpoint)
            .map_err(|e| Error::InvalidConfig(format!("endpoint {endpoint}: {e}")))?;
    }
    Ok(())
}

/// Collects the collaborators of an [`Agent`].
pub struct AgentBuilder {
    config: AgentConfig,
    plugin: Arc<dyn DIDCommPlugin>,
    anoncreds: Arc<dyn AnonCredsBackend>,
    resolvers: Vec<Arc<dyn DIDResolver>>,
    registrars: Vec<Arc<dyn DIDRegistrar>>,
    registries: Vec<Arc<dyn AnonCredsRegistry>>,
    formats: Vec<Arc<dyn CredentialFormatService>>,
    store: Option<Arc<dyn RecordStore>>,
    transport: Option<Arc<dyn OutboundTransport>>,
    handlers: HashMap<String, HandlerHandle>,
}

impl AgentBuilder {
    /// Adds a DID resolver. Resolvers added here take precedence over the
    /// built-in `did:key` and `did:web` resolvers.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn DIDResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Adds a DID registrar, ahead of the built-in `did:key` registrar.
    #[must_use]
    pub fn registrar(mut self, registrar: Arc<dyn DIDRegistrar>) -> Self {
        self.registrars.push(registrar);
        self
    }

    /// Adds an AnonCreds registry.
    #[must_use]
    pub fn registry(mut self, registry: Arc<dyn AnonCredsRegistry>) -> Self {
        self.registries.push(registry);
        self
    }

    /// Adds a credential format service, ahead of the built-in ones.
    #[must_use]
    pub fn credential_format(mut self, format: Arc<dyn CredentialFormatService>) -> Self {
        self.formats.push(format);
        self
    }

    /// Uses `store` for records instead of an in-memory store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Delivers outbound messages through `transport` instead of HTTP.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn OutboundTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Forwards messages of `message_type` no protocol claims to `handler`.
    #[must_use]
    pub fn handler(mut self, message_type: impl Into<String>, handler: HandlerHandle) -> Self {
        let message_type = message_type.into();
        info!("Registered handler for message type: {message_type}");
        self.handlers.insert(message_type, handler);
        self
    }

    /// Builds the agent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if an endpoint is not a URL, or an
    /// error if the HTTP transport cannot be created.
    pub fn build(self) -> Result<Agent> {
        validate_endpoints(&self.config.endpoints)?;

        let transport: Arc<dyn OutboundTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpOutboundTransport::new(&self.config.dispatch)?),
        };

        let mut dids = DidRouter::builder()
            .retry(self.config.retry)
            .registration_timeout(self.config.registration_timeout);
        for resolver in self.resolvers {
            dids = dids.resolver(resolver);
        }
        for registrar in self.registrars {
            dids = dids.registrar(registrar);
        }
        let dids = dids
            .resolver(Arc::new(KeyDidResolver))
            .resolver(Arc::new(WebDidResolver::new()))
            .registrar(Arc::new(KeyDidRegistrar::new(self.plugin.clone())))
            .build();

        let mut registries = RegistryRouter::builder()
            .retry(self.config.retry)
            .registration_timeout(self.config.registration_timeout);
        for registry in self.registries {
            registries = registries.registry(registry);
        }

        let mut formats = self.formats;
        formats.push(Arc::new(crate::protocols::credential::IndyCredentialFormat));
        formats.push(Arc::new(crate::protocols::credential::JsonLdCredentialFormat));

        let events = EventBus::new();
        let ctx = Arc::new(AgentContext {
            sender: MessageSender::new(transport, self.config.dispatch.retry, events.clone())
                .with_idle_timeout(self.config.dispatch.idle_timeout),
            config: RwLock::new(self.config),
            plugin: self.plugin,
            anoncreds: self.anoncreds,
            dids,
            registries: registries.build(),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryRecordStore::new())),
            events,
            locks: ThreadLocks::new(),
        });

        let connections = Arc::new(ConnectionService::new(ctx.clone()));
        let credentials = Arc::new(CredentialService::new(ctx.clone(), FormatRegistry::new(formats)));
        let proofs = Arc::new(ProofService::new(ctx.clone()));
        let handlers: Vec<Arc<dyn ProtocolHandler>> =
            vec![connections.clone(), credentials.clone(), proofs.clone()];
        let dispatcher = Dispatcher::new(handlers, self.handlers);

        Ok(Agent {
            dids: DidsApi::new(ctx.clone()),
            anoncreds: AnonCredsApi::new(ctx.clone()),
            ctx,
            dispatcher,
            connections,
            credentials,
            proofs,
        })
    }
}

/// A `DIDComm` agent.
///
/// The `Agent` is the main entry point of the crate. It:
/// - Unpacks inbound envelopes addressed to its DIDs and dispatches them
/// - Runs the connection, credential and proof protocols
/// - Resolves and creates DIDs, and registers AnonCreds objects
pub struct Agent {
    ctx: Arc<AgentContext>,
    dispatcher: Dispatcher,
    connections: Arc<ConnectionService>,
    credentials: Arc<CredentialService>,
    proofs: Arc<ProofService>,
    dids: DidsApi,
    anoncreds: AnonCredsApi,
}

impl Agent {
    /// Starts building an agent around its wallet and AnonCreds backend.
    #[must_use]
    pub fn builder(
        config: AgentConfig,
        plugin: Arc<dyn DIDCommPlugin>,
        anoncreds: Arc<dyn AnonCredsBackend>,
    ) -> AgentBuilder {
        AgentBuilder {
            config,
            plugin,
            anoncreds,
            resolvers: Vec::new(),
            registrars: Vec::new(),
            registries: Vec::new(),
            formats: Vec::new(),
            store: None,
            transport: None,
            handlers: HashMap::new(),
        }
    }

    /// Decrypts or verifies an inbound envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageRejected`] if the envelope is not addressed to
    /// one of this agent's DIDs, fails to decrypt or fails authentication.
    pub async fn unpack(&self, packed: &str) -> Result<InboundMessage> {
        let recipient = match envelope_recipients(packed) {
            Ok(recipients) => {
                let mut owned = None;
                for recipient in recipients {
                    if self.ctx.owns_did(&recipient).await? {
                        owned = Some(recipient);
                        break;
                    }
                }
                Some(owned.ok_or_else(|| {
                    Error::MessageRejected("envelope is not addressed to this agent".to_string())
                })?)
            }
            Err(_) => None,
        };

        let unpacked = unpack_message(packed, self.ctx.plugin.as_ref(), recipient.as_deref())
            .await
            .map_err(|e| Error::MessageRejected(e.to_string()))?;
        Ok(InboundMessage {
            message: unpacked.message,
            recipient,
            authenticated_sender: unpacked.sender,
        })
    }

    /// Routes an unpacked message to its protocol.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedProtocol`] for unknown message types, or
    /// whatever the protocol transition fails with.
    pub async fn dispatch(&self, inbound: InboundMessage) -> Result<()> {
        self.dispatcher.dispatch(inbound).await
    }

    /// Unpacks and dispatches an inbound envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageRejected`] if the envelope does not unpack;
    /// the message is dropped and never retried.
    pub async fn receive(&self, packed: &str) -> Result<()> {
        let inbound = match self.unpack(packed).await {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("dropping inbound message: {e}");
                return Err(e);
            }
        };
        self.dispatch(inbound).await
    }

    /// Connections and out-of-band invitations.
    #[must_use]
    pub fn connections(&self) -> &ConnectionService {
        &self.connections
    }

    /// Credential issuance.
    #[must_use]
    pub fn credentials(&self) -> &CredentialService {
        &self.credentials
    }

    /// Proof presentation.
    #[must_use]
    pub fn proofs(&self) -> &ProofService {
        &self.proofs
    }

    /// DID resolution and creation.
    #[must_use]
    pub fn dids(&self) -> &DidsApi {
        &self.dids
    }

    /// Schemas, credential definitions and the link secret.
    #[must_use]
    pub fn anoncreds(&self) -> &AnonCredsApi {
        &self.anoncreds
    }

    /// Subscribes to the agent's events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<AgentEvent> {
        self.ctx.events.subscribe()
    }

    /// A snapshot of the configuration.
    pub async fn config(&self) -> AgentConfig {
        self.ctx.config().await
    }

    /// The label presented to peers.
    pub async fn label(&self) -> String {
        self.ctx.config.read().await.label.clone()
    }

    /// Replaces the endpoints advertised in new invitations and DIDs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if an endpoint is not a URL.
    pub async fn set_endpoints(&self, endpoints: Vec<String>) -> Result<()> {
        validate_endpoints(&endpoints)?;
        info!(?endpoints, "updating endpoints");
        self.ctx.config.write().await.endpoints = endpoints;
        Ok(())
    }
}
