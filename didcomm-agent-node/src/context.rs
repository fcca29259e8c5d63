//! State shared by the protocol services of one agent.

use didcomm_agent_core::prelude::{
    pack_message, AnonCredsBackend, DIDCommPlugin, DidCreateOptions, DidRouter, Message, PackingType,
    RecordStore, RegistryRouter,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::error::Elapsed;
use tracing::debug;

use crate::config::AgentConfig;
use crate::dispatch::{MessageSender, OutboundMessage};
use crate::dispatcher::{InboundMessage, ProblemReport, ThreadLocks};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::protocols::connection::ConnectionRecord;
use crate::records::{tags, DidRecord, Record, Repository, Versioned};

/// Everything a protocol service needs, shared behind an `Arc`.
pub struct AgentContext {
    pub(crate) config: RwLock<AgentConfig>,
    pub(crate) plugin: Arc<dyn DIDCommPlugin>,
    pub(crate) anoncreds: Arc<dyn AnonCredsBackend>,
    pub(crate) dids: DidRouter,
    pub(crate) registries: RegistryRouter,
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) events: EventBus,
    pub(crate) sender: MessageSender,
    pub(crate) locks: ThreadLocks,
}

impl AgentContext {
    /// A snapshot of the configuration.
    pub async fn config(&self) -> AgentConfig {
        self.config.read().await.clone()
    }

    /// Typed access to one record category.
    pub fn repository<R: Record>(&self) -> Repository<R> {
        Repository::new(self.store.clone())
    }

    /// Creates a DID through the router and records it as owned, adding the
    /// agent's endpoints as DIDComm services.
    pub async fn create_did(&self, method: &str) -> Result<DidRecord> {
        let endpoints = self.config.read().await.endpoints.clone();
        let options = DidCreateOptions {
            endpoints: endpoints.clone(),
            ..DidCreateOptions::default()
        };
        let created = self.dids.create(method, &options).await?;

        let document = if created.document.didcomm_service().is_none() {
            created.document.with_endpoints(&endpoints)
        } else {
            created.document
        };
        let record = DidRecord {
            did: created.did,
            method: method.to_string(),
            key_reference: created.key_reference,
            document,
        };
        Ok(self.repository::<DidRecord>().save(record).await?.record)
    }

    /// Whether `did` is owned by this agent.
    pub async fn owns_did(&self, did: &str) -> Result<bool> {
        match self.repository::<DidRecord>().get(did).await {
            Ok(_) => Ok(true),
            Err(Error::RecordNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Packs `message` and queues it for `endpoint`.
    pub async fn send(&self, queue: &str, endpoint: &str, message: &Message) -> Result<()> {
        let packing = if message.from.is_some() {
            self.config.read().await.default_packing
        } else {
            PackingType::AnonV2
        };
        let packed = pack_message(message, self.plugin.as_ref(), packing).await?;

        debug!(queue, endpoint, message_type = %message.typ, "queueing message");
        self.sender
            .enqueue(
                queue,
                OutboundMessage {
                    message_id: message.id.0.clone(),
                    endpoint: endpoint.to_string(),
                    packed,
                },
            )
            .await
    }

    /// Sends `message` over an established connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the connection lacks DIDs or an endpoint.
    pub async fn send_to_connection(&self, connection: &ConnectionRecord, message: Message) -> Result<()> {
        self.send_to_peer(&connection.id, connection, message).await
    }

    /// Sends `message` to the peer of `connection` on the outbound queue
    /// `queue`, for peers that have no stored connection yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the connection lacks DIDs or an endpoint.
    pub async fn send_to_peer(&self, queue: &str, connection: &ConnectionRecord, message: Message) -> Result<()> {
        let (our_did, their_did) = connection.dids()?;
        let endpoint = connection.their_endpoint().ok_or_else(|| {
            Error::InvalidState(format!("connection {} has no endpoint", connection.id))
        })?;
        let message = message.from(our_did).to([their_did]);
        self.send(queue, &endpoint, &message).await
    }

    /// The complete connection with the peer `did`, if any.
    pub async fn connection_with(&self, did: &str) -> Result<Option<Versioned<ConnectionRecord>>> {
        self.repository::<ConnectionRecord>()
            .find_one_by(&tags([("theirDid", did), ("state", "complete")]))
            .await
    }

    /// The complete connection whose peer sent `inbound`, by the envelope's
    /// authenticated sender. The plaintext `from` is never trusted.
    ///
    /// # Errors
    ///
    /// - [`Error::MessageRejected`] if the sender is not authenticated
    /// - [`Error::RecordNotFound`] if the sender is not a connected peer
    pub async fn connection_from(&self, inbound: &InboundMessage) -> Result<Versioned<ConnectionRecord>> {
        let sender = inbound.sender()?;
        self.connection_with(sender)
            .await?
            .ok_or_else(|| Error::RecordNotFound(format!("connection with {sender}")))
    }

    /// Tells the peer of `connection` that the thread was abandoned.
    pub async fn send_problem_report(
        &self,
        connection: &ConnectionRecord,
        thread_id: &str,
        report: ProblemReport,
    ) -> Result<()> {
        self.send_to_connection(connection, report.into_message(thread_id)?)
            .await
    }

    /// Re-runs `check` whenever an event is published (or the poll interval
    /// passes) until it yields a value or fails.
    pub async fn wait_until<T, F, Fut>(
        &self,
        timeout: Duration,
        mut check: F,
    ) -> std::result::Result<Result<T>, Elapsed>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let mut events = self.events.subscribe();
        let poll = self.config.read().await.wait_poll;

        tokio::time::timeout(timeout, async move {
            loop {
                match check().await {
                    Ok(Some(value)) => return Ok(value),
                    Ok(None) => {}
                    Err(e) => return Err(e),
                }
                tokio::select! {
                    _ = events.recv() => {}
                    () = tokio::time::sleep(poll) => {}
                }
            }
        })
        .await
    }
}
