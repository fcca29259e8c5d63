//! Credential issuance, `issue-credential` 1.0 and 2.0.
//!
//! One [`CredentialExchangeRecord`] tracks one thread on one connection.
//! The protocol version and the set of formats are fixed by the first
//! message of the thread; any later message that disagrees abandons the
//! exchange with [`Error::FormatMismatch`].
//!
//! Transitions that wait on a registry or ledger (validating a request,
//! storing a credential) read the record under the thread lock, release it
//! for the network call and commit against the version they read. A record
//! that moved on in the meantime fails the commit with
//! [`Error::StateConflict`] and the network result is discarded.

pub mod format;

use async_trait::async_trait;
use didcomm_agent_core::storage::Tags;
use didcomm_agent_core::types::unix_time;
use didcomm_agent_core::{Attachment, Message};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use format::{
    Attributes, CredentialFormatKind, CredentialFormatOptions, CredentialFormatService, FormatRegistry,
    IndyCredentialFormat, JsonLdCredentialFormat, Stage,
};

use crate::config::{AutoAccept, AutoAcceptCredential};
use crate::context::AgentContext;
use crate::dispatcher::{InboundMessage, ProblemReport, ProtocolHandler};
use crate::error::{Error, Result};
use crate::events::AgentEvent;
use crate::protocols::connection::ConnectionRecord;
use crate::protocols::ProtocolVersion;
use crate::records::{tags, CredentialRecord, Record, Repository, Versioned};

/// Protocol family name.
pub const ISSUE_CREDENTIAL: &str = "issue-credential";

/// State of a [`CredentialExchangeRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialState {
    /// Holder proposed a credential
    ProposalSent,
    /// Issuer received a proposal
    ProposalReceived,
    /// Issuer offered a credential
    OfferSent,
    /// Holder received an offer
    OfferReceived,
    /// Holder requested the offered credential
    RequestSent,
    /// Issuer received a valid request
    RequestReceived,
    /// Issuer sent the credential
    CredentialIssued,
    /// Holder verified and stored the credential
    CredentialReceived,
    /// Acknowledged
    Done,
    /// Ended by an error or cancellation
    Abandoned,
}

impl CredentialState {
    fn rank(self) -> u8 {
        match self {
            CredentialState::ProposalSent | CredentialState::ProposalReceived => 0,
            CredentialState::OfferSent | CredentialState::OfferReceived => 1,
            CredentialState::RequestSent | CredentialState::RequestReceived => 2,
            CredentialState::CredentialIssued | CredentialState::CredentialReceived => 3,
            CredentialState::Done => 4,
            CredentialState::Abandoned => 5,
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, CredentialState::Done | CredentialState::Abandoned)
    }

    /// Whether moving to `next` keeps the exchange monotonic.
    #[must_use]
    pub fn can_transition_to(self, next: CredentialState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    fn as_tag(self) -> &'static str {
        match self {
            CredentialState::ProposalSent => "proposal-sent",
            CredentialState::ProposalReceived => "proposal-received",
            CredentialState::OfferSent => "offer-sent",
            CredentialState::OfferReceived => "offer-received",
            CredentialState::RequestSent => "request-sent",
            CredentialState::RequestReceived => "request-received",
            CredentialState::CredentialIssued => "credential-issued",
            CredentialState::CredentialReceived => "credential-received",
            CredentialState::Done => "done",
            CredentialState::Abandoned => "abandoned",
        }
    }
}

/// Our side of a credential exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialRole {
    /// Signs the credential
    Issuer,
    /// Receives the credential
    Holder,
}

/// Payload per format of one protocol message.
pub type FormatPayloads = BTreeMap<CredentialFormatKind, Value>;

/// One issuance thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialExchangeRecord {
    /// Exchange id
    pub id: String,
    /// Connection the exchange runs over
    pub connection_id: String,
    /// Thread id
    pub thread_id: String,
    /// Our side
    pub role: CredentialRole,
    /// Protocol version, fixed by the first message
    pub version: ProtocolVersion,
    /// Formats, fixed by the first message
    pub formats: Vec<CredentialFormatKind>,
    /// Current state
    pub state: CredentialState,
    /// Per exchange override of the agent's policy
    pub auto_accept: Option<AutoAcceptCredential>,
    /// Comment of the latest proposal or offer
    pub comment: Option<String>,
    /// Credential preview of the latest proposal or offer
    pub attributes: Attributes,
    /// Content this agent approved by sending it or answering it
    pub approved_attributes: Option<Attributes>,
    /// Proposal payloads
    pub proposal: FormatPayloads,
    /// Offer payloads
    pub offer: FormatPayloads,
    /// Request payloads
    pub request: FormatPayloads,
    /// Holder secrets of the request, never sent
    pub request_metadata: FormatPayloads,
    /// Stored credentials (holder)
    pub credential_ids: Vec<String>,
    /// Problem code the exchange was abandoned with
    pub error_code: Option<String>,
    /// Why the exchange was abandoned
    pub error_message: Option<String>,
    /// Creation time (unix seconds)
    pub created_at: u64,
}

impl Record for CredentialExchangeRecord {
    const TYPE: &'static str = "CredentialExchangeRecord";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> Tags {
        tags([
            ("state", self.state.as_tag()),
            (
                "role",
                match self.role {
                    CredentialRole::Issuer => "issuer",
                    CredentialRole::Holder => "holder",
                },
            ),
            ("threadId", self.thread_id.as_str()),
            ("connectionId", self.connection_id.as_str()),
        ])
    }
}

/// Options of [`CredentialService::offer_credential`] and
/// [`CredentialService::propose_credential`].
#[derive(Debug, Clone)]
pub struct CredentialExchangeOptions {
    /// Connection to run the exchange over
    pub connection_id: String,
    /// Protocol version
    pub version: ProtocolVersion,
    /// One entry per format to issue in
    pub formats: Vec<CredentialFormatOptions>,
    /// Credential attributes
    pub attributes: Attributes,
    /// Human readable comment
    pub comment: Option<String>,
    /// Override of the agent's auto-accept policy
    pub auto_accept: Option<AutoAcceptCredential>,
}

fn message_name(stage: Stage) -> &'static str {
    match stage {
        Stage::Proposal => "propose-credential",
        Stage::Offer => "offer-credential",
        Stage::Request => "request-credential",
        Stage::Credential => "issue-credential",
    }
}

fn preview(version: ProtocolVersion, attributes: &Attributes) -> Value {
    json!({
        "@type": version.message_type(ISSUE_CREDENTIAL, "credential-preview"),
        "attributes": attributes
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect::<Vec<_>>(),
    })
}

#[derive(Deserialize)]
struct PreviewAttribute {
    name: String,
    value: String,
}

fn read_preview(message: &Message) -> Result<Attributes> {
    let Some(attributes) = message.body.pointer("/credential_preview/attributes") else {
        return Ok(Attributes::new());
    };
    let attributes: Vec<PreviewAttribute> = serde_json::from_value(attributes.clone())
        .map_err(|e| Error::FormatMismatch(format!("malformed credential preview: {e}")))?;
    Ok(attributes.into_iter().map(|a| (a.name, a.value)).collect())
}

/// Builds an issuance message carrying `payloads`.
fn build_message(
    version: ProtocolVersion,
    stage: Stage,
    payloads: &FormatPayloads,
    attributes: Option<&Attributes>,
    comment: Option<&str>,
) -> Result<Message> {
    let mut body = json!({});
    if let Some(comment) = comment {
        body["comment"] = json!(comment);
    }
    if let Some(attributes) = attributes {
        body["credential_preview"] = preview(version, attributes);
    }

    let mut attachments = Vec::new();
    match version {
        ProtocolVersion::V1 => {
            for (kind, payload) in payloads {
                match (kind.v1_attachment_id(stage), payload) {
                    (Some(id), _) => attachments.push(Attachment::json(id, None, payload.clone())),
                    (None, Value::Object(fields)) if *kind == CredentialFormatKind::Indy => {
                        for (key, value) in fields {
                            body[key] = value.clone();
                        }
                    }
                    _ => {
                        return Err(Error::FormatMismatch(format!(
                            "{kind:?} credentials require issue-credential 2.0"
                        )))
                    }
                }
            }
        }
        ProtocolVersion::V2 => {
            body["formats"] = payloads
                .keys()
                .map(|kind| json!({ "attach_id": kind.attach_id(), "format": kind.format_id(stage) }))
                .collect();
            for (kind, payload) in payloads {
                attachments.push(Attachment::json(
                    kind.attach_id(),
                    Some(kind.format_id(stage)),
                    payload.clone(),
                ));
            }
        }
    }

    let mut message = Message::new(version.message_type(ISSUE_CREDENTIAL, message_name(stage)), body);
    message.attachments = attachments;
    Ok(message)
}

#[derive(Deserialize)]
struct FormatEntry {
    attach_id: String,
    format: String,
}

/// Reads the per-format payloads of an issuance message.
fn read_payloads(message: &Message, version: ProtocolVersion, stage: Stage) -> Result<FormatPayloads> {
    let mut payloads = FormatPayloads::new();
    match version {
        ProtocolVersion::V1 => {
            let kind = CredentialFormatKind::Indy;
            match kind.v1_attachment_id(stage) {
                Some(id) => {
                    let attachment = message.attachment(id).ok_or_else(|| {
                        Error::FormatMismatch(format!("{} without attachment {id}", message.typ))
                    })?;
                    payloads.insert(kind, attachment.json_value()?);
                }
                None => {
                    let cred_def_id = message.body.get("cred_def_id").ok_or_else(|| {
                        Error::FormatMismatch(format!("{} without cred_def_id", message.typ))
                    })?;
                    payloads.insert(kind, json!({ "cred_def_id": cred_def_id }));
                }
            }
        }
        ProtocolVersion::V2 => {
            let entries: Vec<FormatEntry> = message
                .body
                .get("formats")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| Error::FormatMismatch(format!("malformed formats: {e}")))?
                .unwrap_or_default();
            for entry in entries {
                let kind = CredentialFormatKind::from_format_id(&entry.format, stage).ok_or_else(|| {
                    Error::FormatMismatch(format!("unsupported format {} in {}", entry.format, message.typ))
                })?;
                let attachment = message.attachment(&entry.attach_id).ok_or_else(|| {
                    Error::FormatMismatch(format!("missing attachment {}", entry.attach_id))
                })?;
                payloads.insert(kind, attachment.json_value()?);
            }
        }
    }

    if payloads.is_empty() {
        return Err(Error::FormatMismatch(format!("{} names no credential format", message.typ)));
    }
    Ok(payloads)
}

fn ensure_formats(exchange: &CredentialExchangeRecord, payloads: FormatPayloads) -> Result<FormatPayloads> {
    let expected: BTreeSet<_> = exchange.formats.iter().copied().collect();
    let received: BTreeSet<_> = payloads.keys().copied().collect();
    if expected != received {
        return Err(Error::FormatMismatch(format!(
            "exchange {} committed to {expected:?}, message carries {received:?}",
            exchange.id
        )));
    }
    Ok(payloads)
}

/// Credential issuance: application API and inbound handler.
pub struct CredentialService {
    ctx: Arc<AgentContext>,
    exchanges: Repository<CredentialExchangeRecord>,
    connections: Repository<ConnectionRecord>,
    credentials: Repository<CredentialRecord>,
    formats: FormatRegistry,
}

impl CredentialService {
    pub(crate) fn new(ctx: Arc<AgentContext>, formats: FormatRegistry) -> Self {
        Self {
            exchanges: ctx.repository(),
            connections: ctx.repository(),
            credentials: ctx.repository(),
            formats,
            ctx,
        }
    }

    async fn create(&self, exchange: CredentialExchangeRecord) -> Result<Versioned<CredentialExchangeRecord>> {
        let exchange = self.exchanges.save(exchange).await?;
        info!(
            exchange_id = exchange.id,
            thread_id = exchange.thread_id,
            state = ?exchange.state,
            "credential exchange created"
        );
        self.ctx.events.emit(AgentEvent::CredentialStateChanged {
            exchange_id: exchange.id.clone(),
            thread_id: exchange.thread_id.clone(),
            previous: None,
            state: exchange.state,
        });
        Ok(exchange)
    }

    /// Writes `exchange` in `state`, failing if it changed since it was read.
    async fn commit(
        &self,
        mut exchange: Versioned<CredentialExchangeRecord>,
        state: CredentialState,
    ) -> Result<Versioned<CredentialExchangeRecord>> {
        let previous = exchange.state;
        if !previous.can_transition_to(state) {
            return Err(Error::StateConflict(format!(
                "exchange {} cannot move from {previous:?} to {state:?}",
                exchange.id
            )));
        }

        exchange.state = state;
        let exchange = self.exchanges.update(exchange).await?;
        info!(exchange_id = exchange.id, ?previous, ?state, "credential state changed");
        self.ctx.events.emit(AgentEvent::CredentialStateChanged {
            exchange_id: exchange.id.clone(),
            thread_id: exchange.thread_id.clone(),
            previous: Some(previous),
            state,
        });
        Ok(exchange)
    }

    async fn send(&self, exchange: &CredentialExchangeRecord, message: Message) -> Result<()> {
        let connection = self.connections.get(&exchange.connection_id).await?;
        self.ctx
            .send_to_connection(&connection, message.thread(exchange.thread_id.clone()))
            .await
    }

    /// Abandons `exchange` if `error` ends it, telling the peer, and hands the error back.
    async fn fail(&self, mut exchange: Versioned<CredentialExchangeRecord>, error: Error) -> Error {
        if !error.ends_exchange() {
            return error;
        }

        warn!(exchange_id = exchange.id, "abandoning credential exchange: {error}");
        exchange.error_code = Some(error.problem_code().to_string());
        exchange.error_message = Some(error.to_string());
        match self.commit(exchange, CredentialState::Abandoned).await {
            Ok(exchange) => {
                let report = ProblemReport::new(error.problem_code(), error.to_string());
                if let Err(e) = self.report(&exchange, report).await {
                    warn!(exchange_id = exchange.id, "could not send problem report: {e}");
                }
            }
            Err(e) => warn!("could not abandon credential exchange: {e}"),
        }
        error
    }

    async fn report(&self, exchange: &CredentialExchangeRecord, report: ProblemReport) -> Result<()> {
        let connection = self.connections.get(&exchange.connection_id).await?;
        self.ctx
            .send_problem_report(&connection, &exchange.thread_id, report)
            .await
    }

    /// Refuses the first message of a thread that never became an exchange.
    async fn reject(&self, connection: &ConnectionRecord, thread_id: &str, error: Error) -> Error {
        let report = ProblemReport::new(error.problem_code(), error.to_string());
        if let Err(e) = self.ctx.send_problem_report(connection, thread_id, report).await {
            warn!(thread_id, "could not send problem report: {e}");
        }
        error
    }

    async fn policy(&self, exchange: &CredentialExchangeRecord) -> AutoAccept {
        match exchange.auto_accept {
            Some(policy) => policy,
            None => self.ctx.config().await.auto_accept_credentials,
        }
    }

    /// Whether the next step is taken without the application, given the
    /// content just received.
    async fn approves(&self, exchange: &CredentialExchangeRecord, received: &Attributes) -> bool {
        match self.policy(exchange).await {
            AutoAccept::Always => true,
            AutoAccept::Never => false,
            AutoAccept::ContentApproved => exchange
                .approved_attributes
                .as_ref()
                .map_or(true, |approved| approved == received),
        }
    }

    fn check_formats(
        &self,
        version: ProtocolVersion,
        formats: &[CredentialFormatOptions],
    ) -> Result<Vec<CredentialFormatKind>> {
        let kinds: Vec<_> = formats.iter().map(CredentialFormatOptions::kind).collect();
        let unique: BTreeSet<_> = kinds.iter().collect();
        if kinds.is_empty() || unique.len() != kinds.len() {
            return Err(Error::FormatMismatch("each format must be given exactly once".into()));
        }
        for kind in &kinds {
            if version == ProtocolVersion::V1 && *kind != CredentialFormatKind::Indy {
                return Err(Error::FormatMismatch(format!(
                    "{kind:?} credentials require issue-credential 2.0"
                )));
            }
            self.formats.get(*kind)?;
        }
        Ok(kinds)
    }

    fn new_exchange(
        &self,
        connection_id: &str,
        thread_id: &str,
        role: CredentialRole,
        version: ProtocolVersion,
        formats: Vec<CredentialFormatKind>,
        state: CredentialState,
    ) -> CredentialExchangeRecord {
        CredentialExchangeRecord {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            thread_id: thread_id.to_string(),
            role,
            version,
            formats,
            state,
            auto_accept: None,
            comment: None,
            attributes: Attributes::new(),
            approved_attributes: None,
            proposal: FormatPayloads::new(),
            offer: FormatPayloads::new(),
            request: FormatPayloads::new(),
            request_metadata: FormatPayloads::new(),
            credential_ids: Vec::new(),
            error_code: None,
            error_message: None,
            created_at: unix_time(),
        }
    }

    async fn expect(
        &self,
        exchange_id: &str,
        role: CredentialRole,
        state: CredentialState,
    ) -> Result<Versioned<CredentialExchangeRecord>> {
        let exchange = self.exchanges.get(exchange_id).await?;
        if exchange.role != role || exchange.state != state {
            return Err(Error::InvalidState(format!(
                "exchange {exchange_id} is {:?} in {:?}, expected {role:?} in {state:?}",
                exchange.role, exchange.state
            )));
        }
        Ok(exchange)
    }

    /// Proposes a credential to an issuer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FormatMismatch`] for formats the version does not carry.
    pub async fn propose_credential(&self, options: CredentialExchangeOptions) -> Result<CredentialExchangeRecord> {
        let connection = self.connections.get(&options.connection_id).await?;
        connection.assert_ready()?;
        let kinds = self.check_formats(options.version, &options.formats)?;

        let proposal: FormatPayloads = options
            .formats
            .iter()
            .map(|format| (format.kind(), format.proposal_payload()))
            .collect();
        let message = build_message(
            options.version,
            Stage::Proposal,
            &proposal,
            Some(&options.attributes),
            options.comment.as_deref(),
        )?;

        let mut exchange = self.new_exchange(
            &connection.id,
            message.id.as_str(),
            CredentialRole::Holder,
            options.version,
            kinds,
            CredentialState::ProposalSent,
        );
        exchange.auto_accept = options.auto_accept;
        exchange.comment = options.comment;
        exchange.attributes = options.attributes.clone();
        exchange.approved_attributes = Some(options.attributes);
        exchange.proposal = proposal;

        let exchange = self.create(exchange).await?;
        self.send(&exchange, message).await?;
        Ok(exchange.record)
    }

    /// Offers a credential to a holder.
    ///
    /// # Errors
    ///
    /// - [`Error::FormatMismatch`] for formats the version does not carry or
    ///   attributes that do not match the schema
    /// - [`Error::InvalidState`] if the connection is not complete
    pub async fn offer_credential(&self, options: CredentialExchangeOptions) -> Result<CredentialExchangeRecord> {
        let connection = self.connections.get(&options.connection_id).await?;
        connection.assert_ready()?;
        let kinds = self.check_formats(options.version, &options.formats)?;

        let mut offer = FormatPayloads::new();
        for format in &options.formats {
            let payload = self
                .formats
                .get(format.kind())?
                .create_offer(&self.ctx, format, &options.attributes)
                .await?;
            offer.insert(format.kind(), payload);
        }
        let message = build_message(
            options.version,
            Stage::Offer,
            &offer,
            Some(&options.attributes),
            options.comment.as_deref(),
        )?;

        let mut exchange = self.new_exchange(
            &connection.id,
            message.id.as_str(),
            CredentialRole::Issuer,
            options.version,
            kinds,
            CredentialState::OfferSent,
        );
        exchange.auto_accept = options.auto_accept;
        exchange.comment = options.comment;
        exchange.attributes = options.attributes.clone();
        exchange.approved_attributes = Some(options.attributes);
        exchange.offer = offer;

        let exchange = self.create(exchange).await?;
        self.send(&exchange, message).await?;
        Ok(exchange.record)
    }

    /// Answers a received proposal with an offer of the proposed content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the exchange is an issuer in `ProposalReceived`.
    pub async fn accept_proposal(&self, exchange_id: &str) -> Result<CredentialExchangeRecord> {
        let mut exchange = self
            .expect(exchange_id, CredentialRole::Issuer, CredentialState::ProposalReceived)
            .await?;

        let mut offer = FormatPayloads::new();
        for (kind, proposal) in &exchange.proposal {
            let options = CredentialFormatOptions::from_proposal(*kind, proposal)?;
            let payload = self
                .formats
                .get(*kind)?
                .create_offer(&self.ctx, &options, &exchange.attributes)
                .await?;
            offer.insert(*kind, payload);
        }
        let message = build_message(
            exchange.version,
            Stage::Offer,
            &offer,
            Some(&exchange.attributes),
            exchange.comment.as_deref(),
        )?;

        exchange.offer = offer;
        exchange.approved_attributes = Some(exchange.attributes.clone());
        let exchange = {
            let _guard = self.ctx.locks.lock(&exchange.thread_id).await;
            self.commit(exchange, CredentialState::OfferSent).await?
        };
        self.send(&exchange, message).await?;
        Ok(exchange.record)
    }

    /// Accepts a received offer by requesting the credential.
    ///
    /// # Errors
    ///
    /// - [`Error::LinkSecretRequired`] for legacy-indy offers if no link secret exists
    /// - [`Error::InvalidState`] unless the exchange is a holder in `OfferReceived`
    pub async fn request_credential(&self, exchange_id: &str) -> Result<CredentialExchangeRecord> {
        let mut exchange = self
            .expect(exchange_id, CredentialRole::Holder, CredentialState::OfferReceived)
            .await?;
        let connection = self.connections.get(&exchange.connection_id).await?;
        let (holder_did, _) = connection.dids()?;

        let mut request = FormatPayloads::new();
        let mut metadata = FormatPayloads::new();
        for (kind, offer) in &exchange.offer {
            let (payload, secrets) = self
                .formats
                .get(*kind)?
                .create_request(&self.ctx, offer, &holder_did)
                .await?;
            request.insert(*kind, payload);
            metadata.insert(*kind, secrets);
        }
        let message = build_message(exchange.version, Stage::Request, &request, None, None)?;

        exchange.request = request;
        exchange.request_metadata = metadata;
        exchange.approved_attributes = Some(exchange.attributes.clone());
        let exchange = {
            let _guard = self.ctx.locks.lock(&exchange.thread_id).await;
            self.commit(exchange, CredentialState::RequestSent).await?
        };
        self.send(&exchange, message).await?;
        Ok(exchange.record)
    }

    /// Accepts a received request by issuing the credential.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the exchange is an issuer in `RequestReceived`.
    pub async fn issue_credential(&self, exchange_id: &str) -> Result<CredentialExchangeRecord> {
        let exchange = self
            .expect(exchange_id, CredentialRole::Issuer, CredentialState::RequestReceived)
            .await?;

        let mut credentials = FormatPayloads::new();
        for (kind, request) in &exchange.request {
            let offer = exchange.offer.get(kind).ok_or_else(|| {
                Error::FormatMismatch(format!("exchange {exchange_id} has no {kind:?} offer"))
            })?;
            let credential = self
                .formats
                .get(*kind)?
                .create_credential(&self.ctx, offer, request, &exchange.attributes)
                .await?;
            credentials.insert(*kind, credential);
        }
        let message = build_message(exchange.version, Stage::Credential, &credentials, None, None)?;

        let exchange = {
            let _guard = self.ctx.locks.lock(&exchange.thread_id).await;
            self.commit(exchange, CredentialState::CredentialIssued).await?
        };
        self.send(&exchange, message).await?;
        Ok(exchange.record)
    }

    /// Acknowledges a stored credential, completing the exchange.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the exchange is a holder in `CredentialReceived`.
    pub async fn accept_credential(&self, exchange_id: &str) -> Result<CredentialExchangeRecord> {
        let exchange = self
            .expect(exchange_id, CredentialRole::Holder, CredentialState::CredentialReceived)
            .await?;
        let exchange = {
            let _guard = self.ctx.locks.lock(&exchange.thread_id).await;
            self.commit(exchange, CredentialState::Done).await?
        };

        let ack = Message::new(
            exchange.version.message_type(ISSUE_CREDENTIAL, "ack"),
            json!({ "status": "OK" }),
        );
        self.send(&exchange, ack).await?;
        Ok(exchange.record)
    }

    /// Abandons an exchange and tells the peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the exchange already ended.
    pub async fn abandon(&self, exchange_id: &str, reason: &str) -> Result<CredentialExchangeRecord> {
        let mut exchange = self.exchanges.get(exchange_id).await?;
        if exchange.state.is_terminal() {
            return Err(Error::InvalidState(format!(
                "exchange {exchange_id} already {:?}",
                exchange.state
            )));
        }

        exchange.error_code = Some("abandoned".to_string());
        exchange.error_message = Some(reason.to_string());
        let exchange = {
            let _guard = self.ctx.locks.lock(&exchange.thread_id).await;
            self.commit(exchange, CredentialState::Abandoned).await?
        };
        self.report(&exchange, ProblemReport::new("abandoned", reason)).await?;
        Ok(exchange.record)
    }

    /// Waits until the exchange reaches `state` or a later one.
    ///
    /// # Errors
    ///
    /// - [`Error::ExchangeTimeout`] if `timeout` passes first
    /// - the error the exchange was abandoned with, e.g. [`Error::VerificationFailed`]
    pub async fn wait_for_state(
        &self,
        exchange_id: &str,
        state: CredentialState,
        timeout: Duration,
    ) -> Result<CredentialExchangeRecord> {
        self.ctx
            .wait_until(timeout, move || async move {
                let exchange = self.exchanges.get(exchange_id).await?;
                if exchange.state == state {
                    return Ok(Some(exchange.record));
                }
                if exchange.state == CredentialState::Abandoned {
                    return Err(Error::from_problem(
                        exchange_id,
                        exchange.error_code.as_deref().unwrap_or("abandoned"),
                        exchange.error_message.as_deref().unwrap_or_default(),
                    ));
                }
                Ok((exchange.state.rank() > state.rank()).then_some(exchange.record))
            })
            .await
            .map_err(|_| Error::ExchangeTimeout(exchange_id.to_string()))?
    }

    /// Reads an exchange.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordNotFound`] if it does not exist.
    pub async fn get(&self, exchange_id: &str) -> Result<CredentialExchangeRecord> {
        Ok(self.exchanges.get(exchange_id).await?.record)
    }

    /// The exchanges on `thread_id`, one per connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn find_by_thread(&self, thread_id: &str) -> Result<Vec<CredentialExchangeRecord>> {
        Ok(self
            .exchanges
            .find_by(&tags([("threadId", thread_id)]))
            .await?
            .into_iter()
            .map(|e| e.record)
            .collect())
    }

    /// Every exchange.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn find_all(&self) -> Result<Vec<CredentialExchangeRecord>> {
        Ok(self
            .exchanges
            .all()
            .await?
            .into_iter()
            .map(|e| e.record)
            .collect())
    }

    /// Every credential held by this agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn stored_credentials(&self) -> Result<Vec<CredentialRecord>> {
        Ok(self
            .credentials
            .all()
            .await?
            .into_iter()
            .map(|c| c.record)
            .collect())
    }

    async fn on_thread(
        &self,
        connection: &ConnectionRecord,
        thread_id: &str,
    ) -> Result<Option<Versioned<CredentialExchangeRecord>>> {
        self.exchanges
            .find_one_by(&tags([("threadId", thread_id), ("connectionId", connection.id.as_str())]))
            .await
    }

    /// Reads the exchange a continuation message belongs to and checks it
    /// against the version and formats the exchange committed to.
    async fn continuation(
        &self,
        connection: &ConnectionRecord,
        message: &Message,
        version: ProtocolVersion,
        stage: Stage,
        role: CredentialRole,
        state: CredentialState,
    ) -> Result<(Versioned<CredentialExchangeRecord>, FormatPayloads)> {
        let thread_id = message.thread_id();
        let exchange = self
            .on_thread(connection, thread_id)
            .await?
            .ok_or_else(|| Error::RecordNotFound(format!("credential exchange on thread {thread_id}")))?;
        if exchange.role != role || exchange.state != state {
            return Err(Error::StateConflict(format!(
                "{} on exchange {} in state {:?}",
                message.typ, exchange.id, exchange.state
            )));
        }
        if exchange.version != version {
            let error = Error::FormatMismatch(format!(
                "exchange {} runs issue-credential {}",
                exchange.id,
                exchange.version.as_str()
            ));
            return Err(self.fail(exchange, error).await);
        }

        match read_payloads(message, version, stage).and_then(|p| ensure_formats(&exchange, p)) {
            Ok(payloads) => Ok((exchange, payloads)),
            Err(error) => Err(self.fail(exchange, error).await),
        }
    }

    async fn process_proposal(
        &self,
        connection: &ConnectionRecord,
        message: Message,
        version: ProtocolVersion,
    ) -> Result<()> {
        let thread_id = message.thread_id().to_string();
        let exchange = {
            let _guard = self.ctx.locks.lock(&thread_id).await;
            if self.on_thread(connection, &thread_id).await?.is_some() {
                return Err(Error::StateConflict(format!("proposal on existing thread {thread_id}")));
            }

            let proposal = match read_payloads(&message, version, Stage::Proposal) {
                Ok(proposal) => proposal,
                Err(error) => return Err(self.reject(connection, &thread_id, error).await),
            };
            let mut exchange = self.new_exchange(
                &connection.id,
                &thread_id,
                CredentialRole::Issuer,
                version,
                proposal.keys().copied().collect(),
                CredentialState::ProposalReceived,
            );
            exchange.attributes = read_preview(&message)?;
            exchange.comment = message.body.get("comment").and_then(Value::as_str).map(str::to_string);
            exchange.proposal = proposal;
            self.create(exchange).await?
        };

        if self.policy(&exchange).await == AutoAccept::Always {
            self.accept_proposal(&exchange.id).await?;
        }
        Ok(())
    }

    async fn process_offer(
        &self,
        connection: &ConnectionRecord,
        message: Message,
        version: ProtocolVersion,
    ) -> Result<()> {
        let thread_id = message.thread_id().to_string();
        let exchange = {
            let _guard = self.ctx.locks.lock(&thread_id).await;
            match self.on_thread(connection, &thread_id).await? {
                Some(_) => {
                    let (mut exchange, offer) = self
                        .continuation(
                            connection,
                            &message,
                            version,
                            Stage::Offer,
                            CredentialRole::Holder,
                            CredentialState::ProposalSent,
                        )
                        .await?;
                    exchange.offer = offer;
                    exchange.attributes = read_preview(&message)?;
                    self.commit(exchange, CredentialState::OfferReceived).await?
                }
                None => {
                    let offer = match read_payloads(&message, version, Stage::Offer) {
                        Ok(offer) => offer,
                        Err(error) => return Err(self.reject(connection, &thread_id, error).await),
                    };
                    let mut exchange = self.new_exchange(
                        &connection.id,
                        &thread_id,
                        CredentialRole::Holder,
                        version,
                        offer.keys().copied().collect(),
                        CredentialState::OfferReceived,
                    );
                    exchange.attributes = read_preview(&message)?;
                    exchange.comment = message.body.get("comment").and_then(Value::as_str).map(str::to_string);
                    exchange.offer = offer;
                    self.create(exchange).await?
                }
            }
        };

        if self.approves(&exchange, &exchange.attributes).await {
            self.request_credential(&exchange.id).await?;
        }
        Ok(())
    }

    async fn process_request(
        &self,
        connection: &ConnectionRecord,
        message: Message,
        version: ProtocolVersion,
    ) -> Result<()> {
        let (mut exchange, request) = {
            let _guard = self.ctx.locks.lock(message.thread_id()).await;
            self.continuation(
                connection,
                &message,
                version,
                Stage::Request,
                CredentialRole::Issuer,
                CredentialState::OfferSent,
            )
            .await?
        };

        for (kind, payload) in &request {
            let validated = match exchange.offer.get(kind) {
                Some(offer) => {
                    self.formats
                        .get(*kind)?
                        .validate_request(&self.ctx, offer, payload)
                        .await
                }
                None => Err(Error::FormatMismatch(format!("no {kind:?} offer to validate against"))),
            };
            if let Err(error) = validated {
                return Err(self.fail(exchange, error).await);
            }
        }

        exchange.request = request;
        let exchange = {
            let _guard = self.ctx.locks.lock(&exchange.thread_id).await;
            self.commit(exchange, CredentialState::RequestReceived).await?
        };

        if self.approves(&exchange, &exchange.attributes).await {
            self.issue_credential(&exchange.id).await?;
        }
        Ok(())
    }

    async fn process_credential(
        &self,
        connection: &ConnectionRecord,
        message: Message,
        version: ProtocolVersion,
    ) -> Result<()> {
        let (mut exchange, credentials) = {
            let _guard = self.ctx.locks.lock(message.thread_id()).await;
            self.continuation(
                connection,
                &message,
                version,
                Stage::Credential,
                CredentialRole::Holder,
                CredentialState::RequestSent,
            )
            .await?
        };

        let mut stored = Vec::new();
        for (kind, credential) in &credentials {
            let metadata = exchange.request_metadata.get(kind).cloned().unwrap_or_default();
            let result = match self.formats.get(*kind) {
                Ok(service) => {
                    service
                        .store_credential(&self.ctx, credential, &metadata, &exchange.thread_id)
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(record) => stored.push(record),
                Err(error) => {
                    self.discard(&stored).await;
                    return Err(self.fail(exchange, error).await);
                }
            }
        }

        exchange.credential_ids = stored.iter().map(|c| c.id.clone()).collect();
        let committed = {
            let _guard = self.ctx.locks.lock(&exchange.thread_id).await;
            self.commit(exchange, CredentialState::CredentialReceived).await
        };
        let exchange = match committed {
            Ok(exchange) => exchange,
            Err(error) => {
                self.discard(&stored).await;
                return Err(error);
            }
        };

        let mut approved = true;
        for credential in &stored {
            approved &= self.approves(&exchange, &credential.attributes).await;
        }
        if approved {
            self.accept_credential(&exchange.id).await?;
        }
        Ok(())
    }

    async fn discard(&self, stored: &[CredentialRecord]) {
        for credential in stored {
            if let Err(e) = self.credentials.delete(&credential.id).await {
                warn!(credential_id = credential.id, "could not discard credential: {e}");
            }
        }
    }

    async fn process_ack(&self, connection: &ConnectionRecord, message: Message) -> Result<()> {
        let thread_id = message.thread_id();
        let _guard = self.ctx.locks.lock(thread_id).await;
        let exchange = self
            .on_thread(connection, thread_id)
            .await?
            .ok_or_else(|| Error::RecordNotFound(format!("credential exchange on thread {thread_id}")))?;
        if exchange.role != CredentialRole::Issuer {
            return Err(Error::StateConflict(format!("ack for holder exchange {}", exchange.id)));
        }
        if exchange.state != CredentialState::CredentialIssued {
            return Err(Error::StateConflict(format!(
                "ack on credential exchange {} in state {:?}",
                exchange.id, exchange.state
            )));
        }
        self.commit(exchange, CredentialState::Done).await?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolHandler for CredentialService {
    fn protocols(&self) -> Vec<String> {
        vec![
            ProtocolVersion::V1.protocol_uri(ISSUE_CREDENTIAL),
            ProtocolVersion::V2.protocol_uri(ISSUE_CREDENTIAL),
        ]
    }

    async fn handle(&self, inbound: InboundMessage) -> Result<()> {
        let connection = self.ctx.connection_from(&inbound).await?;
        let message = inbound.message;
        let version = ProtocolVersion::of_message(ISSUE_CREDENTIAL, &message.typ)?;
        debug!(message_type = %message.typ, connection_id = connection.id, "credential message");

        match message.typ.name() {
            Some("propose-credential") => self.process_proposal(&connection, message, version).await,
            Some("offer-credential") => self.process_offer(&connection, message, version).await,
            Some("request-credential") => self.process_request(&connection, message, version).await,
            Some("issue-credential") => self.process_credential(&connection, message, version).await,
            Some("ack") => self.process_ack(&connection, message).await,
            _ => Err(Error::UnsupportedProtocol(message.typ.to_string())),
        }
    }

    async fn handle_problem_report(&self, sender: &str, thread_id: &str, report: &ProblemReport) -> Result<bool> {
        let Some(connection) = self.ctx.connection_with(sender).await? else {
            return Ok(false);
        };
        let _guard = self.ctx.locks.lock(thread_id).await;
        let found = self
            .exchanges
            .find_by(&tags([("threadId", thread_id), ("connectionId", connection.id.as_str())]))
            .await?;

        let owned = !found.is_empty();
        for mut exchange in found {
            if exchange.state.is_terminal() {
                continue;
            }
            exchange.error_code = Some(report.code.clone());
            exchange.error_message = Some(report.reason());
            self.commit(exchange, CredentialState::Abandoned).await?;
        }
        Ok(owned)
    }
}
