//! Connection establishment through out-of-band invitations.
//!
//! Inviter: `create_invitation` publishes an [`OutOfBandInvitation`] naming a
//! fresh recipient key. Each connection request for it spawns a
//! [`ConnectionRecord`] (`Requested`), answered either automatically or by
//! `accept_request` (`Responded`). The invitee's ack completes it.
//!
//! Invitee: `receive_invitation` creates the record (`Init -> Invited`) and,
//! unless told otherwise, sends the request (`Requested`). The signed
//! response completes it.
//!
//! A single-use invitation is consumed by the first request; any later
//! request is refused with a problem report and fails with
//! [`Error::InvitationAlreadyUsed`].

use async_trait::async_trait;
use base64::{
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use didcomm_agent_core::did::{DidDocument, Service, DIDCOMM_SERVICE_TYPE};
use didcomm_agent_core::storage::Tags;
use didcomm_agent_core::types::unix_time;
use didcomm_agent_core::{Message, MessageType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::AgentContext;
use crate::dispatcher::{InboundMessage, ProblemReport, ProtocolHandler};
use crate::error::{Error, Result};
use crate::events::AgentEvent;
use crate::records::{tags, Record, Repository, Versioned};

/// Out-of-band protocol URI.
pub const OUT_OF_BAND: &str = "https://didcomm.org/out-of-band/1.1";

/// Connections protocol URI.
pub const CONNECTIONS: &str = "https://didcomm.org/connections/1.0";

/// State of a [`ConnectionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// Created from a received invitation, nothing processed yet
    Init,
    /// Invitation processed, request not yet sent
    Invited,
    /// Request sent (invitee) or received (inviter)
    Requested,
    /// Response sent, waiting for the ack
    Responded,
    /// Both sides hold each other's DID
    Complete,
    /// Ended by an error or cancellation
    Abandoned,
}

impl ConnectionState {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Complete | ConnectionState::Abandoned)
    }

    fn as_tag(self) -> &'static str {
        match self {
            ConnectionState::Init => "init",
            ConnectionState::Invited => "invited",
            ConnectionState::Requested => "requested",
            ConnectionState::Responded => "responded",
            ConnectionState::Complete => "complete",
            ConnectionState::Abandoned => "abandoned",
        }
    }
}

/// Which side of the invitation this agent is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionRole {
    /// Created the invitation
    Inviter,
    /// Received the invitation
    Invitee,
}

/// A pairwise relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    /// Connection id
    pub id: String,
    /// Current state
    pub state: ConnectionState,
    /// Our side of the invitation
    pub role: ConnectionRole,
    /// Our pairwise DID
    pub our_did: Option<String>,
    /// The peer's pairwise DID
    pub their_did: Option<String>,
    /// The peer's DID Document
    pub their_did_doc: Option<DidDocument>,
    /// The peer's label
    pub their_label: Option<String>,
    /// Invitation the connection came from
    pub invitation_id: String,
    /// Out-of-band record the connection came from
    pub out_of_band_id: String,
    /// Recipient key of the invitation, which signs the response
    pub invitation_key: String,
    /// Endpoint of the invitation, used until the peer's document is known
    pub invitation_endpoint: Option<String>,
    /// Thread of the connection request
    pub thread_id: Option<String>,
    /// Per-connection override of the auto-accept setting
    pub auto_accept: Option<bool>,
    /// Why the connection was abandoned
    pub error_message: Option<String>,
    /// Creation time (unix seconds)
    pub created_at: u64,
}

impl ConnectionRecord {
    /// Whether the connection can carry protocol messages.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Complete
    }

    /// Our DID and the peer's DID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if either is not known yet.
    pub fn dids(&self) -> Result<(String, String)> {
        match (&self.our_did, &self.their_did) {
            (Some(ours), Some(theirs)) => Ok((ours.clone(), theirs.clone())),
            _ => Err(Error::InvalidState(format!(
                "connection {} has not exchanged DIDs",
                self.id
            ))),
        }
    }

    /// Whether `did` is the peer of this connection. Until the response
    /// arrives, an invitee only knows the inviter by its invitation key.
    #[must_use]
    pub fn is_peer(&self, did: &str) -> bool {
        self.their_did.as_deref() == Some(did)
            || (self.role == ConnectionRole::Invitee && self.invitation_key == did)
    }

    /// Where to send messages for the peer.
    #[must_use]
    pub fn their_endpoint(&self) -> Option<String> {
        self.their_did_doc
            .as_ref()
            .and_then(DidDocument::didcomm_service)
            .map(|s| s.service_endpoint.clone())
            .or_else(|| self.invitation_endpoint.clone())
    }

    /// Fails unless the connection is complete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if it is not.
    pub fn assert_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "connection {} is {:?}, not complete",
                self.id, self.state
            )))
        }
    }
}

impl Record for ConnectionRecord {
    const TYPE: &'static str = "ConnectionRecord";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> Tags {
        let mut tags = tags([
            ("state", self.state.as_tag()),
            (
                "role",
                match self.role {
                    ConnectionRole::Inviter => "inviter",
                    ConnectionRole::Invitee => "invitee",
                },
            ),
            ("outOfBandId", self.out_of_band_id.as_str()),
        ]);
        if let Some(thread_id) = &self.thread_id {
            tags.insert("threadId".into(), thread_id.clone());
        }
        if let Some(did) = &self.our_did {
            tags.insert("ourDid".into(), did.clone());
        }
        if let Some(did) = &self.their_did {
            tags.insert("theirDid".into(), did.clone());
        }
        tags
    }
}

/// A service entry of an invitation: inline keys or a resolvable DID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutOfBandService {
    /// Inline service block
    Inline(Service),
    /// DID whose document carries the service
    Did(String),
}

/// Signature over an invitation by its recipient key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationSignature {
    /// Signing key, as a DID
    pub signer: String,
    /// Base64url signature over the unsigned invitation JSON
    pub signature: String,
}

/// An out-of-band invitation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutOfBandInvitation {
    /// Invitation id, the parent thread of every request
    #[serde(rename = "@id")]
    pub id: String,
    /// Message type
    #[serde(rename = "@type")]
    pub typ: String,
    /// Inviter label
    pub label: String,
    /// Goal code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_code: Option<String>,
    /// Goal description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    /// Accepted media types
    #[serde(default)]
    pub accept: Vec<String>,
    /// Handshake protocols the inviter supports
    #[serde(default)]
    pub handshake_protocols: Vec<String>,
    /// Where and how to reach the inviter
    pub services: Vec<OutOfBandService>,
    /// Expiry time (unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_time: Option<u64>,
    /// Signature by the recipient key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<InvitationSignature>,
}

impl OutOfBandInvitation {
    fn signing_input(&self) -> Result<Vec<u8>> {
        let unsigned = Self {
            signature: None,
            ..self.clone()
        };
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Whether the invitation expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_time.map_or(false, |expires| expires <= now)
    }

    /// Encodes the invitation as `<base>?oob=<base64url json>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the invitation does not serialize.
    pub fn to_url(&self, base: &str) -> Result<String> {
        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?);
        Ok(format!("{base}?oob={encoded}"))
    }

    /// The short, id-addressable form `<base>/invitations/<id>`.
    #[must_use]
    pub fn short_url(&self, base: &str) -> String {
        format!("{}/invitations/{}", base.trim_end_matches('/'), self.id)
    }

    /// Encodes the invitation as a `connections/1.0` invitation in the
    /// `c_i` parameter, for agents that predate out-of-band.
    ///
    /// # Errors
    ///
    /// Returns an error if the invitation has no inline service.
    pub fn to_legacy_url(&self, base: &str) -> Result<String> {
        let legacy = LegacyInvitation::try_from(self)?;
        let encoded = URL_SAFE.encode(serde_json::to_vec(&legacy)?);
        Ok(format!("{base}?c_i={encoded}"))
    }

    /// Decodes the `oob` parameter of an invitation URL, or a legacy `c_i`
    /// invitation, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse or the parameter is not an invitation.
    pub fn from_url(url: &str) -> Result<Option<Self>> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| didcomm_agent_core::Error::InvalidFormat(format!("{url}: {e}")))?;
        let Some((key, encoded)) = parsed.query_pairs().find(|(key, _)| key == "oob" || key == "c_i") else {
            return Ok(None);
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(didcomm_agent_core::Error::from)?;
        if key == "c_i" {
            let legacy: LegacyInvitation = serde_json::from_slice(&bytes)?;
            return Ok(Some(legacy.into()));
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// A `connections/1.0` invitation, as carried by legacy `c_i` URLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyInvitation {
    /// Invitation id
    #[serde(rename = "@id")]
    pub id: String,
    /// Message type
    #[serde(rename = "@type")]
    pub typ: String,
    /// Inviter label
    pub label: String,
    /// Keys (as DIDs) the connection request is encrypted to
    pub recipient_keys: Vec<String>,
    /// Where to send the connection request
    pub service_endpoint: String,
    /// Mediator keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_keys: Vec<String>,
}

impl TryFrom<&OutOfBandInvitation> for LegacyInvitation {
    type Error = Error;

    fn try_from(invitation: &OutOfBandInvitation) -> Result<Self> {
        let service = invitation
            .services
            .iter()
            .find_map(|service| match service {
                OutOfBandService::Inline(service) => Some(service),
                OutOfBandService::Did(_) => None,
            })
            .ok_or_else(|| {
                didcomm_agent_core::Error::InvalidFormat(format!(
                    "invitation {} has no inline service",
                    invitation.id
                ))
            })?;
        Ok(Self {
            id: invitation.id.clone(),
            typ: format!("{CONNECTIONS}/invitation"),
            label: invitation.label.clone(),
            recipient_keys: service.recipient_keys.clone(),
            service_endpoint: service.service_endpoint.clone(),
            routing_keys: service.routing_keys.clone(),
        })
    }
}

impl From<LegacyInvitation> for OutOfBandInvitation {
    fn from(legacy: LegacyInvitation) -> Self {
        Self {
            id: legacy.id,
            typ: legacy.typ,
            label: legacy.label,
            goal_code: None,
            goal: None,
            accept: Vec::new(),
            handshake_protocols: vec![CONNECTIONS.to_string()],
            services: vec![OutOfBandService::Inline(Service {
                id: "#inline-0".to_string(),
                typ: DIDCOMM_SERVICE_TYPE.to_string(),
                service_endpoint: legacy.service_endpoint,
                recipient_keys: legacy.recipient_keys,
                routing_keys: legacy.routing_keys,
            })],
            expires_time: None,
            signature: None,
        }
    }
}

/// Which side of an invitation an [`OutOfBandRecord`] tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutOfBandRole {
    /// We created the invitation
    Sender,
    /// We received the invitation
    Receiver,
}

/// Lifecycle of an invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutOfBandState {
    /// Published, waiting for requests
    AwaitResponse,
    /// Received, request not yet answered
    PrepareResponse,
    /// Consumed
    Done,
    /// Past its expiry
    Expired,
}

/// Local bookkeeping of an invitation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutOfBandRecord {
    /// Record id
    pub id: String,
    /// Our side of the invitation
    pub role: OutOfBandRole,
    /// Current state
    pub state: OutOfBandState,
    /// The invitation
    pub invitation: OutOfBandInvitation,
    /// Whether many connections may be made from it
    pub multi_use: bool,
    /// Override of the agent's auto-accept setting for its connections
    pub auto_accept_connection: Option<bool>,
    /// Recipient key of the invitation
    pub recipient_key: String,
    /// Connections created from it
    pub connection_ids: Vec<String>,
}

impl Record for OutOfBandRecord {
    const TYPE: &'static str = "OutOfBandRecord";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> Tags {
        tags([
            ("invitationId", self.invitation.id.as_str()),
            (
                "role",
                match self.role {
                    OutOfBandRole::Sender => "sender",
                    OutOfBandRole::Receiver => "receiver",
                },
            ),
        ])
    }
}

/// Options of [`ConnectionService::create_invitation`].
#[derive(Debug, Clone, Default)]
pub struct CreateInvitationOptions {
    /// Label override
    pub label: Option<String>,
    /// Goal code
    pub goal_code: Option<String>,
    /// Goal description
    pub goal: Option<String>,
    /// Allow many connections from one invitation
    pub multi_use: bool,
    /// Override of the agent's auto-accept setting
    pub auto_accept_connection: Option<bool>,
    /// Invitation lifetime
    pub expires_in: Option<Duration>,
}

/// Options of [`ConnectionService::receive_invitation`].
#[derive(Debug, Clone)]
pub struct ReceiveInvitationOptions {
    /// Send the connection request right away
    pub auto_accept_invitation: bool,
    /// Label override for the request
    pub label: Option<String>,
}

impl Default for ReceiveInvitationOptions {
    fn default() -> Self {
        Self {
            auto_accept_invitation: true,
            label: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ConnectionInfo {
    #[serde(rename = "DID")]
    did: String,
    #[serde(rename = "DIDDoc")]
    did_doc: DidDocument,
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestBody {
    label: String,
    connection: ConnectionInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignedConnection {
    signer: String,
    signature: String,
    sig_data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResponseBody {
    #[serde(rename = "connection~sig")]
    connection_sig: SignedConnection,
}

/// Connection establishment: application API and inbound handler.
pub struct ConnectionService {
    ctx: Arc<AgentContext>,
    connections: Repository<ConnectionRecord>,
    out_of_band: Repository<OutOfBandRecord>,
}

impl ConnectionService {
    pub(crate) fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            connections: ctx.repository(),
            out_of_band: ctx.repository(),
            ctx,
        }
    }

    async fn transition(
        &self,
        mut connection: Versioned<ConnectionRecord>,
        state: ConnectionState,
    ) -> Result<Versioned<ConnectionRecord>> {
        let previous = connection.state;
        connection.state = state;
        let connection = self.connections.update(connection).await?;
        info!(connection_id = connection.id, ?previous, ?state, "connection state changed");
        self.ctx.events.emit(AgentEvent::ConnectionStateChanged {
            connection_id: connection.id.clone(),
            previous: Some(previous),
            state,
        });
        Ok(connection)
    }

    async fn insert(&self, connection: ConnectionRecord) -> Result<Versioned<ConnectionRecord>> {
        let connection = self.connections.save(connection).await?;
        info!(connection_id = connection.id, state = ?connection.state, "connection created");
        self.ctx.events.emit(AgentEvent::ConnectionStateChanged {
            connection_id: connection.id.clone(),
            previous: None,
            state: connection.state,
        });
        Ok(connection)
    }

    /// Creates and signs an invitation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the agent has no endpoint.
    pub async fn create_invitation(&self, options: CreateInvitationOptions) -> Result<OutOfBandRecord> {
        let config = self.ctx.config().await;
        let endpoint = config
            .endpoints
            .first()
            .cloned()
            .ok_or_else(|| Error::InvalidConfig("an endpoint is required to create invitations".into()))?;

        let recipient = self.ctx.create_did("key").await?;
        let mut invitation = OutOfBandInvitation {
            id: Uuid::new_v4().to_string(),
            typ: MessageType::from_parts("out-of-band", "1.1", "invitation").0,
            label: options.label.unwrap_or(config.label),
            goal_code: options.goal_code,
            goal: options.goal,
            accept: vec!["didcomm/v2".to_string(), "didcomm/aip2;env=rfc19".to_string()],
            handshake_protocols: vec![CONNECTIONS.to_string()],
            services: vec![OutOfBandService::Inline(Service {
                id: "#inline-0".to_string(),
                typ: DIDCOMM_SERVICE_TYPE.to_string(),
                service_endpoint: endpoint,
                recipient_keys: vec![recipient.did.clone()],
                routing_keys: Vec::new(),
            })],
            expires_time: options.expires_in.map(|ttl| unix_time() + ttl.as_secs()),
            signature: None,
        };

        let signature = self
            .ctx
            .plugin
            .signer()
            .sign(&invitation.signing_input()?, &recipient.did)
            .await?;
        invitation.signature = Some(InvitationSignature {
            signer: recipient.did.clone(),
            signature: URL_SAFE_NO_PAD.encode(signature),
        });

        let record = OutOfBandRecord {
            id: Uuid::new_v4().to_string(),
            role: OutOfBandRole::Sender,
            state: OutOfBandState::AwaitResponse,
            invitation,
            multi_use: options.multi_use,
            auto_accept_connection: options.auto_accept_connection,
            recipient_key: recipient.did,
            connection_ids: Vec::new(),
        };
        info!(invitation_id = record.invitation.id, multi_use = record.multi_use, "created invitation");
        Ok(self.out_of_band.save(record).await?.record)
    }

    /// A published invitation, for the short URL lookup.
    ///
    /// Consumed single-use and expired invitations are not returned.
    pub async fn find_invitation(&self, invitation_id: &str) -> Result<Option<OutOfBandInvitation>> {
        let record = self
            .out_of_band
            .find_one_by(&tags([("invitationId", invitation_id), ("role", "sender")]))
            .await?;
        Ok(record
            .filter(|r| r.state == OutOfBandState::AwaitResponse)
            .filter(|r| !r.invitation.is_expired_at(unix_time()))
            .map(|r| r.record.invitation))
    }

    /// Receives an invitation from its URL, inline (`?oob=`) or short form.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL carries no invitation or fetching it fails.
    pub async fn receive_invitation_url(
        &self,
        url: &str,
        options: ReceiveInvitationOptions,
    ) -> Result<ConnectionRecord> {
        let invitation = match OutOfBandInvitation::from_url(url)? {
            Some(invitation) => invitation,
            None if url.contains("/invitations/") => {
                let timeout = self.ctx.config().await.dispatch.timeout;
                let client = reqwest::Client::builder().timeout(timeout).build()?;
                debug!(url, "fetching invitation");
                client.get(url).send().await?.error_for_status()?.json().await?
            }
            None => {
                return Err(didcomm_agent_core::Error::InvalidFormat(format!(
                    "{url} does not carry an invitation"
                ))
                .into())
            }
        };
        self.receive_invitation(invitation, options).await
    }

    /// Receives an invitation and, unless disabled, sends the connection request.
    ///
    /// # Errors
    ///
    /// - [`Error::MessageRejected`] if the signature does not verify
    /// - [`Error::InvitationExpired`] if it expired
    /// - [`Error::InvitationAlreadyUsed`] if it was received before
    /// - [`Error::UnsupportedMethod`] if its service DID cannot be resolved
    pub async fn receive_invitation(
        &self,
        invitation: OutOfBandInvitation,
        options: ReceiveInvitationOptions,
    ) -> Result<ConnectionRecord> {
        if let Some(signature) = &invitation.signature {
            let bytes = URL_SAFE_NO_PAD
                .decode(&signature.signature)
                .map_err(didcomm_agent_core::Error::from)?;
            let valid = self
                .ctx
                .plugin
                .signer()
                .verify(&invitation.signing_input()?, &bytes, &signature.signer)
                .await?;
            if !valid {
                return Err(Error::MessageRejected(format!(
                    "invitation {} has an invalid signature",
                    invitation.id
                )));
            }
        }
        if invitation.is_expired_at(unix_time()) {
            return Err(Error::InvitationExpired(invitation.id));
        }

        let (endpoint, recipient_key) = self.resolve_service(&invitation).await?;

        let connection = {
            let _guard = self.ctx.locks.lock(&invitation.id).await;
            let existing = self
                .out_of_band
                .find_by(&tags([("invitationId", invitation.id.as_str()), ("role", "receiver")]))
                .await?;
            if !existing.is_empty() {
                return Err(Error::InvitationAlreadyUsed(invitation.id));
            }

            let connection_id = Uuid::new_v4().to_string();
            let out_of_band = self
                .out_of_band
                .save(OutOfBandRecord {
                    id: Uuid::new_v4().to_string(),
                    role: OutOfBandRole::Receiver,
                    state: OutOfBandState::PrepareResponse,
                    invitation: invitation.clone(),
                    multi_use: false,
                    auto_accept_connection: None,
                    recipient_key: recipient_key.clone(),
                    connection_ids: vec![connection_id.clone()],
                })
                .await?;

            let connection = self
                .insert(ConnectionRecord {
                    id: connection_id,
                    state: ConnectionState::Init,
                    role: ConnectionRole::Invitee,
                    our_did: None,
                    their_did: None,
                    their_did_doc: None,
                    their_label: Some(invitation.label.clone()),
                    invitation_id: invitation.id.clone(),
                    out_of_band_id: out_of_band.id.clone(),
                    invitation_key: recipient_key,
                    invitation_endpoint: Some(endpoint),
                    thread_id: None,
                    auto_accept: None,
                    error_message: None,
                    created_at: unix_time(),
                })
                .await?;
            self.transition(connection, ConnectionState::Invited).await?
        };

        if !options.auto_accept_invitation {
            return Ok(connection.record);
        }
        self.send_request(&connection.id, options.label).await
    }

    async fn resolve_service(&self, invitation: &OutOfBandInvitation) -> Result<(String, String)> {
        let service = invitation.services.first().ok_or_else(|| {
            didcomm_agent_core::Error::InvalidFormat(format!("invitation {} has no service", invitation.id))
        })?;

        let service = match service {
            OutOfBandService::Inline(service) => service.clone(),
            OutOfBandService::Did(did) => {
                let document = self.ctx.dids.resolve(did).await?;
                let mut service = document.didcomm_service().cloned().ok_or_else(|| {
                    didcomm_agent_core::Error::DIDResolution(format!("{did} has no DIDComm service"))
                })?;
                if service.recipient_keys.is_empty() {
                    service.recipient_keys.push(did.clone());
                }
                service
            }
        };

        let recipient_key = service.recipient_keys.first().cloned().ok_or_else(|| {
            didcomm_agent_core::Error::InvalidFormat(format!(
                "invitation {} names no recipient key",
                invitation.id
            ))
        })?;
        Ok((service.service_endpoint, recipient_key))
    }

    /// Sends the connection request for a received invitation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the connection is an invitee in `Invited`.
    pub async fn accept_invitation(&self, connection_id: &str) -> Result<ConnectionRecord> {
        self.send_request(connection_id, None).await
    }

    async fn send_request(&self, connection_id: &str, label: Option<String>) -> Result<ConnectionRecord> {
        let _guard = self.ctx.locks.lock(connection_id).await;
        let mut connection = self.connections.get(connection_id).await?;
        if connection.role != ConnectionRole::Invitee || connection.state != ConnectionState::Invited {
            return Err(Error::InvalidState(format!(
                "cannot send a request for connection {connection_id} in state {:?}",
                connection.state
            )));
        }

        let ours = self.ctx.create_did("key").await?;
        let label = match label {
            Some(label) => label,
            None => self.ctx.config().await.label,
        };
        let body = RequestBody {
            label,
            connection: ConnectionInfo {
                did: ours.did.clone(),
                did_doc: ours.document.clone(),
            },
        };
        let request = Message::new(
            MessageType::from_parts("connections", "1.0", "request").0,
            serde_json::to_value(body)?,
        )
        .parent_thread(connection.invitation_id.clone())
        .from(ours.did.clone())
        .to([connection.invitation_key.clone()]);

        connection.our_did = Some(ours.did);
        connection.thread_id = Some(request.id.0.clone());
        let connection = self.transition(connection, ConnectionState::Requested).await?;

        let endpoint = connection.their_endpoint().unwrap_or_default();
        self.ctx.send(&connection.id, &endpoint, &request).await?;
        Ok(connection.record)
    }

    /// Answers a connection request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the connection is an inviter in `Requested`.
    pub async fn accept_request(&self, connection_id: &str) -> Result<ConnectionRecord> {
        let thread_id = self
            .connections
            .get(connection_id)
            .await?
            .thread_id
            .clone()
            .unwrap_or_else(|| connection_id.to_string());
        let _guard = self.ctx.locks.lock(&thread_id).await;

        let mut connection = self.connections.get(connection_id).await?;
        if connection.role != ConnectionRole::Inviter || connection.state != ConnectionState::Requested {
            return Err(Error::InvalidState(format!(
                "cannot respond on connection {connection_id} in state {:?}",
                connection.state
            )));
        }

        let ours = self.ctx.create_did("key").await?;
        let sig_data = serde_json::to_vec(&ConnectionInfo {
            did: ours.did.clone(),
            did_doc: ours.document.clone(),
        })?;
        let signature = self
            .ctx
            .plugin
            .signer()
            .sign(&sig_data, &connection.invitation_key)
            .await?;

        let response = Message::new(
            MessageType::from_parts("connections", "1.0", "response").0,
            serde_json::to_value(ResponseBody {
                connection_sig: SignedConnection {
                    signer: connection.invitation_key.clone(),
                    signature: URL_SAFE_NO_PAD.encode(signature),
                    sig_data: URL_SAFE_NO_PAD.encode(sig_data),
                },
            })?,
        )
        .thread(thread_id);

        connection.our_did = Some(ours.did);
        let connection = self.transition(connection, ConnectionState::Responded).await?;
        self.ctx.send_to_connection(&connection, response).await?;
        Ok(connection.record)
    }

    /// Waits until the connection is complete.
    ///
    /// Returns immediately for a connection that is already complete. The
    /// record is never modified by the wait.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionTimeout`] if `timeout` passes first
    /// - [`Error::ConnectionAbandoned`] if the connection was abandoned
    pub async fn return_when_is_connected(
        &self,
        connection_id: &str,
        timeout: Duration,
    ) -> Result<ConnectionRecord> {
        self.ctx
            .wait_until(timeout, move || async move {
                let connection = self.connections.get(connection_id).await?;
                match connection.state {
                    ConnectionState::Complete => Ok(Some(connection.record)),
                    ConnectionState::Abandoned => Err(Error::ConnectionAbandoned {
                        id: connection_id.to_string(),
                        reason: connection.error_message.clone().unwrap_or_default(),
                    }),
                    _ => Ok(None),
                }
            })
            .await
            .map_err(|_| Error::ConnectionTimeout(connection_id.to_string()))?
    }

    /// Abandons a connection that is not yet complete and tells the peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the connection already ended.
    pub async fn abandon(&self, connection_id: &str, reason: &str) -> Result<ConnectionRecord> {
        let mut connection = self.connections.get(connection_id).await?;
        if connection.state.is_terminal() {
            return Err(Error::InvalidState(format!(
                "connection {connection_id} already {:?}",
                connection.state
            )));
        }

        connection.error_message = Some(reason.to_string());
        let connection = self.transition(connection, ConnectionState::Abandoned).await?;
        if let (Some(thread_id), Ok(_)) = (&connection.thread_id, connection.dids()) {
            self.ctx
                .send_problem_report(&connection, thread_id, ProblemReport::new("abandoned", reason))
                .await?;
        }
        Ok(connection.record)
    }

    /// Reads a connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordNotFound`] if it does not exist.
    pub async fn get(&self, connection_id: &str) -> Result<ConnectionRecord> {
        Ok(self.connections.get(connection_id).await?.record)
    }

    /// Every connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn find_all(&self) -> Result<Vec<ConnectionRecord>> {
        Ok(self
            .connections
            .all()
            .await?
            .into_iter()
            .map(|c| c.record)
            .collect())
    }

    /// The out-of-band record with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordNotFound`] if it does not exist.
    pub async fn out_of_band(&self, id: &str) -> Result<OutOfBandRecord> {
        Ok(self.out_of_band.get(id).await?.record)
    }

    async fn by_thread(&self, thread_id: &str, role: &str) -> Result<Versioned<ConnectionRecord>> {
        self.connections
            .find_one_by(&tags([("threadId", thread_id), ("role", role)]))
            .await?
            .ok_or_else(|| Error::RecordNotFound(format!("connection on thread {thread_id}")))
    }

    async fn process_request(&self, message: Message) -> Result<()> {
        let invitation_id = message
            .pthid
            .clone()
            .ok_or(didcomm_agent_core::Error::MissingField("pthid"))?;
        let body: RequestBody = serde_json::from_value(message.body.clone())?;
        let thread_id = message.thread_id().to_string();

        let out_of_band = self
            .out_of_band
            .find_one_by(&tags([("invitationId", invitation_id.as_str()), ("role", "sender")]))
            .await?
            .ok_or_else(|| Error::RecordNotFound(format!("invitation {invitation_id}")))?;

        let requester = ConnectionRecord {
            id: Uuid::new_v4().to_string(),
            state: ConnectionState::Requested,
            role: ConnectionRole::Inviter,
            our_did: Some(out_of_band.recipient_key.clone()),
            their_did: Some(body.connection.did.clone()),
            their_did_doc: Some(body.connection.did_doc.clone()),
            their_label: Some(body.label.clone()),
            invitation_id: invitation_id.clone(),
            out_of_band_id: out_of_band.id.clone(),
            invitation_key: out_of_band.recipient_key.clone(),
            invitation_endpoint: None,
            thread_id: Some(thread_id.clone()),
            auto_accept: out_of_band.auto_accept_connection,
            error_message: None,
            created_at: unix_time(),
        };

        let connection = {
            let _guard = self.ctx.locks.lock(&out_of_band.id).await;
            let mut out_of_band = self.out_of_band.get(&out_of_band.id).await?;

            let refusal = if out_of_band.invitation.is_expired_at(unix_time()) {
                if out_of_band.state != OutOfBandState::Expired {
                    out_of_band.state = OutOfBandState::Expired;
                    out_of_band = self.out_of_band.update(out_of_band).await?;
                }
                Some(Error::InvitationExpired(invitation_id.clone()))
            } else if out_of_band.state == OutOfBandState::Done && !out_of_band.multi_use {
                Some(Error::InvitationAlreadyUsed(invitation_id.clone()))
            } else {
                None
            };

            if let Some(error) = refusal {
                warn!(invitation_id, "refusing connection request: {error}");
                let report = ProblemReport::new(error.problem_code(), error.to_string());
                self.ctx
                    .send_to_peer(&out_of_band.id, &requester, report.into_message(&thread_id)?)
                    .await?;
                return Err(error);
            }

            let duplicate = self
                .connections
                .find_by(&tags([("threadId", thread_id.as_str()), ("role", "inviter")]))
                .await?;
            if !duplicate.is_empty() {
                return Err(Error::StateConflict(format!(
                    "connection request {thread_id} was already processed"
                )));
            }

            let connection = self.insert(requester).await?;
            out_of_band.connection_ids.push(connection.id.clone());
            if !out_of_band.multi_use {
                out_of_band.state = OutOfBandState::Done;
            }
            self.out_of_band.update(out_of_band).await?;
            connection
        };

        let auto_accept = match connection.auto_accept {
            Some(auto_accept) => auto_accept,
            None => self.ctx.config().await.auto_accept_connections,
        };
        if auto_accept {
            self.accept_request(&connection.id).await?;
        }
        Ok(())
    }

    async fn process_response(&self, inbound: &InboundMessage) -> Result<()> {
        let sender = inbound.sender()?;
        let message = &inbound.message;
        let thread_id = message.thread_id().to_string();
        let body: ResponseBody = serde_json::from_value(message.body.clone())?;

        let _guard = self.ctx.locks.lock(&thread_id).await;
        let mut connection = self.by_thread(&thread_id, "invitee").await?;
        if sender != connection.invitation_key {
            return Err(Error::MessageRejected(format!(
                "response on thread {thread_id} not sent by the invitation key"
            )));
        }
        if connection.state != ConnectionState::Requested {
            return Err(Error::StateConflict(format!(
                "response on connection {} in state {:?}",
                connection.id, connection.state
            )));
        }

        let signed = &body.connection_sig;
        let signature = URL_SAFE_NO_PAD
            .decode(&signed.signature)
            .map_err(didcomm_agent_core::Error::from)?;
        let sig_data = URL_SAFE_NO_PAD
            .decode(&signed.sig_data)
            .map_err(didcomm_agent_core::Error::from)?;
        let valid = signed.signer == connection.invitation_key
            && self
                .ctx
                .plugin
                .signer()
                .verify(&sig_data, &signature, &signed.signer)
                .await?;
        if !valid {
            connection.error_message = Some("response not signed by the invitation key".into());
            self.transition(connection, ConnectionState::Abandoned).await?;
            return Err(Error::VerificationFailed(format!(
                "connection response on thread {thread_id}"
            )));
        }

        let info: ConnectionInfo = serde_json::from_slice(&sig_data)?;
        connection.their_did = Some(info.did);
        connection.their_did_doc = Some(info.did_doc);
        let connection = self.transition(connection, ConnectionState::Complete).await?;

        let mut out_of_band = self.out_of_band.get(&connection.out_of_band_id).await?;
        out_of_band.state = OutOfBandState::Done;
        self.out_of_band.update(out_of_band).await?;

        let ack = Message::new(
            MessageType::from_parts("connections", "1.0", "ack").0,
            json!({ "status": "OK" }),
        )
        .thread(thread_id);
        self.ctx.send_to_connection(&connection, ack).await
    }

    async fn process_ack(&self, inbound: &InboundMessage) -> Result<()> {
        let sender = inbound.sender()?;
        let thread_id = inbound.message.thread_id().to_string();
        let _guard = self.ctx.locks.lock(&thread_id).await;

        let connection = self.by_thread(&thread_id, "inviter").await?;
        if !connection.is_peer(sender) {
            return Err(Error::MessageRejected(format!(
                "ack on thread {thread_id} not sent by the peer"
            )));
        }
        if connection.state != ConnectionState::Responded {
            return Err(Error::StateConflict(format!(
                "ack on connection {} in state {:?}",
                connection.id, connection.state
            )));
        }
        self.transition(connection, ConnectionState::Complete).await?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolHandler for ConnectionService {
    fn protocols(&self) -> Vec<String> {
        vec![CONNECTIONS.to_string()]
    }

    async fn handle(&self, inbound: InboundMessage) -> Result<()> {
        match inbound.message.typ.name() {
            Some("request") => self.process_request(inbound.message).await,
            Some("response") => self.process_response(&inbound).await,
            Some("ack") => self.process_ack(&inbound).await,
            _ => Err(Error::UnsupportedProtocol(inbound.message.typ.to_string())),
        }
    }

    async fn handle_problem_report(&self, sender: &str, thread_id: &str, report: &ProblemReport) -> Result<bool> {
        let _guard = self.ctx.locks.lock(thread_id).await;
        let found = self
            .connections
            .find_by(&tags([("threadId", thread_id)]))
            .await?;

        let mut owned = false;
        for mut connection in found {
            if !connection.is_peer(sender) {
                continue;
            }
            owned = true;
            if connection.state.is_terminal() {
                continue;
            }
            connection.error_message = Some(report.reason());
            self.transition(connection, ConnectionState::Abandoned).await?;
        }
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn invitation() -> OutOfBandInvitation {
        OutOfBandInvitation {
            id: "2f8d3b1c".into(),
            typ: format!("{OUT_OF_BAND}/invitation"),
            label: "Faber".into(),
            goal_code: None,
            goal: None,
            accept: vec!["didcomm/v2".into()],
            handshake_protocols: vec![CONNECTIONS.into()],
            services: vec![OutOfBandService::Did("did:web:faber.example".into())],
            expires_time: Some(100),
            signature: None,
        }
    }

    #[test]
    fn test_invitation_urls() {
        let invitation = invitation();
        let url = invitation.to_url("https://faber.example/didcomm").unwrap();
        assert!(url.starts_with("https://faber.example/didcomm?oob="));
        assert_eq!(OutOfBandInvitation::from_url(&url).unwrap(), Some(invitation.clone()));

        assert_eq!(
            invitation.short_url("https://faber.example/"),
            "https://faber.example/invitations/2f8d3b1c"
        );
        assert_eq!(
            OutOfBandInvitation::from_url("https://faber.example/invitations/2f8d3b1c").unwrap(),
            None
        );
    }

    #[test]
    fn test_legacy_invitation_urls() {
        let mut invitation = invitation();
        assert!(invitation.to_legacy_url("https://faber.example").is_err());

        invitation.services = vec![OutOfBandService::Inline(Service {
            id: "#inline-0".into(),
            typ: DIDCOMM_SERVICE_TYPE.into(),
            service_endpoint: "https://faber.example/didcomm".into(),
            recipient_keys: vec!["did:key:z6Mkfaber".into()],
            routing_keys: Vec::new(),
        })];
        let url = invitation.to_legacy_url("https://faber.example").unwrap();
        assert!(url.starts_with("https://faber.example?c_i="));

        let legacy = OutOfBandInvitation::from_url(&url).unwrap().unwrap();
        assert_eq!(legacy.id, invitation.id);
        assert_eq!(legacy.label, "Faber");
        assert_eq!(legacy.typ, format!("{CONNECTIONS}/invitation"));
        assert_eq!(legacy.handshake_protocols, vec![CONNECTIONS.to_string()]);
        assert_eq!(legacy.services, invitation.services);
        assert_eq!(legacy.expires_time, None);
    }

    #[test]
    fn test_invitation_serialization() {
        let json = serde_json::to_value(invitation()).unwrap();
        assert_eq!(json["@id"], "2f8d3b1c");
        assert_eq!(json["services"][0], "did:web:faber.example");
        assert!(json.get("signature").is_none());

        let inline: OutOfBandService = serde_json::from_value(serde_json::json!({
            "id": "#inline-0",
            "type": "did-communication",
            "serviceEndpoint": "https://faber.example/didcomm",
            "recipientKeys": ["did:key:z6Mk"]
        }))
        .unwrap();
        assert!(matches!(inline, OutOfBandService::Inline(s) if s.recipient_keys == vec!["did:key:z6Mk"]));
    }

    #[test]
    fn test_expiry() {
        let invitation = invitation();
        assert!(!invitation.is_expired_at(99));
        assert!(invitation.is_expired_at(100));

        let forever = OutOfBandInvitation {
            expires_time: None,
            ..invitation
        };
        assert!(!forever.is_expired_at(u64::MAX));
    }

    #[test]
    fn test_connection_tags_follow_state() {
        let record = ConnectionRecord {
            id: "c1".into(),
            state: ConnectionState::Requested,
            role: ConnectionRole::Inviter,
            our_did: Some("did:key:ours".into()),
            their_did: None,
            their_did_doc: None,
            their_label: None,
            invitation_id: "i1".into(),
            out_of_band_id: "o1".into(),
            invitation_key: "did:key:ours".into(),
            invitation_endpoint: Some("http://peer/didcomm".into()),
            thread_id: Some("t1".into()),
            auto_accept: None,
            error_message: None,
            created_at: 0,
        };
        let tags = record.tags();
        assert_eq!(tags["state"], "requested");
        assert_eq!(tags["threadId"], "t1");
        assert!(!tags.contains_key("theirDid"));
        assert!(record.dids().is_err());
        assert!(record.assert_ready().is_err());
        assert_eq!(record.their_endpoint().as_deref(), Some("http://peer/didcomm"));
    }
}
