//! Proof presentation, `present-proof` 1.0 and 2.0, legacy-indy proofs.
//!
//! The verifier sends a [`ProofRequest`]; the prover answers it from stored
//! credentials and the verifier checks the presentation against the
//! schemas, credential definitions and revocation status lists it resolves
//! itself. A presentation that fails verification abandons the exchange and
//! is never retried.

use async_trait::async_trait;
use didcomm_agent_core::anoncreds::{
    AnonCredsCredential, AttributeInfo, CredentialDefinition, NonRevokedInterval, PredicateInfo,
    Presentation, ProofRequest, Restriction, Schema, SelectedCredentials,
};
use didcomm_agent_core::storage::Tags;
use didcomm_agent_core::types::unix_time;
use didcomm_agent_core::{Attachment, Message};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AutoAccept, AutoAcceptProof};
use crate::context::AgentContext;
use crate::dispatcher::{InboundMessage, ProblemReport, ProtocolHandler};
use crate::error::{Error, Result};
use crate::events::AgentEvent;
use crate::protocols::connection::ConnectionRecord;
use crate::protocols::credential::format::link_secret;
use crate::protocols::ProtocolVersion;
use crate::records::{tags, CredentialRecord, Record, Repository, StoredCredentialFormat, Versioned};

/// Protocol family name.
pub const PRESENT_PROOF: &str = "present-proof";

const REQUEST_FORMAT: &str = "hlindy/proof-req@v2.0";
const PRESENTATION_FORMAT: &str = "hlindy/proof@v2.0";
const V1_REQUEST_ATTACHMENT: &str = "libindy-request-presentation-0";
const V1_PRESENTATION_ATTACHMENT: &str = "libindy-presentation-0";
const V2_ATTACHMENT: &str = "indy";

/// State of a [`ProofExchangeRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProofState {
    /// Verifier sent a request
    RequestSent,
    /// Prover received a request
    RequestReceived,
    /// Prover sent a presentation
    PresentationSent,
    /// Verifier received and verified a presentation
    PresentationReceived,
    /// Acknowledged
    Done,
    /// Ended by an error or cancellation
    Abandoned,
}

impl ProofState {
    fn rank(self) -> u8 {
        match self {
            ProofState::RequestSent | ProofState::RequestReceived => 0,
            ProofState::PresentationSent | ProofState::PresentationReceived => 1,
            ProofState::Done => 2,
            ProofState::Abandoned => 3,
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ProofState::Done | ProofState::Abandoned)
    }

    /// Whether moving to `next` keeps the exchange monotonic.
    #[must_use]
    pub fn can_transition_to(self, next: ProofState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    fn as_tag(self) -> &'static str {
        match self {
            ProofState::RequestSent => "request-sent",
            ProofState::RequestReceived => "request-received",
            ProofState::PresentationSent => "presentation-sent",
            ProofState::PresentationReceived => "presentation-received",
            ProofState::Done => "done",
            ProofState::Abandoned => "abandoned",
        }
    }
}

/// Our side of a proof exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProofRole {
    /// Requests and verifies
    Verifier,
    /// Presents
    Prover,
}

/// One presentation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofExchangeRecord {
    /// Exchange id
    pub id: String,
    /// Connection the exchange runs over
    pub connection_id: String,
    /// Thread id
    pub thread_id: String,
    /// Our side
    pub role: ProofRole,
    /// Protocol version, fixed by the request
    pub version: ProtocolVersion,
    /// Current state
    pub state: ProofState,
    /// Per exchange override of the agent's policy
    pub auto_accept: Option<AutoAcceptProof>,
    /// Comment of the request
    pub comment: Option<String>,
    /// The proof request
    pub request: ProofRequest,
    /// The presentation, once sent or verified
    pub presentation: Option<Presentation>,
    /// Credentials used to answer the request (prover)
    pub selected: Option<SelectedCredentials>,
    /// Problem code the exchange was abandoned with
    pub error_code: Option<String>,
    /// Why the exchange was abandoned
    pub error_message: Option<String>,
    /// Creation time (unix seconds)
    pub created_at: u64,
}

impl Record for ProofExchangeRecord {
    const TYPE: &'static str = "ProofExchangeRecord";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> Tags {
        tags([
            ("state", self.state.as_tag()),
            (
                "role",
                match self.role {
                    ProofRole::Verifier => "verifier",
                    ProofRole::Prover => "prover",
                },
            ),
            ("threadId", self.thread_id.as_str()),
            ("connectionId", self.connection_id.as_str()),
        ])
    }
}

/// Options of [`ProofService::request_proof`].
#[derive(Debug, Clone)]
pub struct RequestProofOptions {
    /// Connection to run the exchange over
    pub connection_id: String,
    /// Protocol version
    pub version: ProtocolVersion,
    /// Name of the request
    pub name: String,
    /// Referent to requested attribute
    pub requested_attributes: BTreeMap<String, AttributeInfo>,
    /// Referent to requested predicate
    pub requested_predicates: BTreeMap<String, PredicateInfo>,
    /// Interval the credentials must not have been revoked in
    pub non_revoked: Option<NonRevokedInterval>,
    /// Human readable comment
    pub comment: Option<String>,
    /// Override of the agent's auto-accept policy
    pub auto_accept: Option<AutoAcceptProof>,
}

fn attach(message: Message, version: ProtocolVersion, v1_id: &str, format: &str, payload: Value) -> Message {
    match version {
        ProtocolVersion::V1 => message.attach(Attachment::json(v1_id, None, payload)),
        ProtocolVersion::V2 => {
            let mut message = message.attach(Attachment::json(V2_ATTACHMENT, Some(format), payload));
            message.body["formats"] = json!([{ "attach_id": V2_ATTACHMENT, "format": format }]);
            message
        }
    }
}

fn read_attachment<T: serde::de::DeserializeOwned>(
    message: &Message,
    version: ProtocolVersion,
    v1_id: &str,
    format: &str,
) -> Result<T> {
    let attachment = match version {
        ProtocolVersion::V1 => message.attachment(v1_id),
        ProtocolVersion::V2 => {
            let declared = message
                .body
                .get("formats")
                .and_then(Value::as_array)
                .map(|formats| formats.iter().any(|f| f["format"] == format))
                .unwrap_or_default();
            if !declared {
                return Err(Error::FormatMismatch(format!("{} does not carry {format}", message.typ)));
            }
            message
                .attachments
                .iter()
                .find(|a| a.format.as_deref() == Some(format))
        }
    };
    let attachment = attachment
        .ok_or_else(|| Error::FormatMismatch(format!("{} without {format} attachment", message.typ)))?;
    serde_json::from_value(attachment.json_value()?)
        .map_err(|e| Error::FormatMismatch(format!("malformed {format}: {e}")))
}

fn satisfies(credential: &CredentialRecord, name: &str, restrictions: &[Restriction]) -> bool {
    credential.attributes.contains_key(name)
        && (restrictions.is_empty()
            || restrictions
                .iter()
                .any(|r| r.matches(&credential.schema_id, &credential.credential_definition_id)))
}

/// Picks one stored credential per referent.
fn select(request: &ProofRequest, credentials: &[CredentialRecord]) -> Result<SelectedCredentials> {
    let mut selected = SelectedCredentials::default();

    for (referent, info) in &request.requested_attributes {
        let credential = credentials
            .iter()
            .find(|c| satisfies(c, &info.name, &info.restrictions))
            .ok_or_else(|| Error::NoMatchingCredential(referent.clone()))?;
        selected.attributes.insert(referent.clone(), credential.id.clone());
    }

    for (referent, info) in &request.requested_predicates {
        let credential = credentials
            .iter()
            .filter(|c| satisfies(c, &info.name, &info.restrictions))
            .find(|c| {
                c.attributes
                    .get(&info.name)
                    .and_then(|value| value.parse::<i64>().ok())
                    .map_or(false, |value| info.p_type.holds(value, info.p_value))
            })
            .ok_or_else(|| Error::NoMatchingCredential(referent.clone()))?;
        selected.predicates.insert(referent.clone(), credential.id.clone());
    }

    Ok(selected)
}

/// Proof presentation: application API and inbound handler.
pub struct ProofService {
    ctx: Arc<AgentContext>,
    exchanges: Repository<ProofExchangeRecord>,
    connections: Repository<ConnectionRecord>,
    credentials: Repository<CredentialRecord>,
}

impl ProofService {
    pub(crate) fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            exchanges: ctx.repository(),
            connections: ctx.repository(),
            credentials: ctx.repository(),
            ctx,
        }
    }

    async fn create(&self, exchange: ProofExchangeRecord) -> Result<Versioned<ProofExchangeRecord>> {
        let exchange = self.exchanges.save(exchange).await?;
        info!(
            exchange_id = exchange.id,
            thread_id = exchange.thread_id,
            state = ?exchange.state,
            "proof exchange created"
        );
        self.ctx.events.emit(AgentEvent::ProofStateChanged {
            exchange_id: exchange.id.clone(),
            thread_id: exchange.thread_id.clone(),
            previous: None,
            state: exchange.state,
        });
        Ok(exchange)
    }

    async fn commit(
        &self,
        mut exchange: Versioned<ProofExchangeRecord>,
        state: ProofState,
    ) -> Result<Versioned<ProofExchangeRecord>> {
        let previous = exchange.state;
        if !previous.can_transition_to(state) {
            return Err(Error::StateConflict(format!(
                "proof exchange {} cannot move from {previous:?} to {state:?}",
                exchange.id
            )));
        }

        exchange.state = state;
        let exchange = self.exchanges.update(exchange).await?;
        info!(exchange_id = exchange.id, ?previous, ?state, "proof state changed");
        self.ctx.events.emit(AgentEvent::ProofStateChanged {
            exchange_id: exchange.id.clone(),
            thread_id: exchange.thread_id.clone(),
            previous: Some(previous),
            state,
        });
        Ok(exchange)
    }

    async fn send(&self, exchange: &ProofExchangeRecord, message: Message) -> Result<()> {
        let connection = self.connections.get(&exchange.connection_id).await?;
        self.ctx
            .send_to_connection(&connection, message.thread(exchange.thread_id.clone()))
            .await
    }

    async fn fail(&self, mut exchange: Versioned<ProofExchangeRecord>, error: Error) -> Error {
        if !error.ends_exchange() {
            return error;
        }

        warn!(exchange_id = exchange.id, "abandoning proof exchange: {error}");
        exchange.error_code = Some(error.problem_code().to_string());
        exchange.error_message = Some(error.to_string());
        match self.commit(exchange, ProofState::Abandoned).await {
            Ok(exchange) => {
                let connection = self.connections.get(&exchange.connection_id).await;
                let report = ProblemReport::new(error.problem_code(), error.to_string());
                let sent = match connection {
                    Ok(connection) => {
                        self.ctx
                            .send_problem_report(&connection, &exchange.thread_id, report)
                            .await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    warn!(exchange_id = exchange.id, "could not send problem report: {e}");
                }
            }
            Err(e) => warn!("could not abandon proof exchange: {e}"),
        }
        error
    }

    async fn policy(&self, exchange: &ProofExchangeRecord) -> AutoAccept {
        match exchange.auto_accept {
            Some(policy) => policy,
            None => self.ctx.config().await.auto_accept_proofs,
        }
    }

    async fn expect(&self, exchange_id: &str, role: ProofRole, state: ProofState) -> Result<Versioned<ProofExchangeRecord>> {
        let exchange = self.exchanges.get(exchange_id).await?;
        if exchange.role != role || exchange.state != state {
            return Err(Error::InvalidState(format!(
                "proof exchange {exchange_id} is {:?} in {:?}, expected {role:?} in {state:?}",
                exchange.role, exchange.state
            )));
        }
        Ok(exchange)
    }

    async fn indy_credentials(&self) -> Result<Vec<CredentialRecord>> {
        Ok(self
            .credentials
            .find_by(&tags([("format", "indy")]))
            .await?
            .into_iter()
            .map(|c| c.record)
            .filter(|c| c.format == StoredCredentialFormat::Indy)
            .collect())
    }

    /// Sends a proof request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the connection is not complete.
    pub async fn request_proof(&self, options: RequestProofOptions) -> Result<ProofExchangeRecord> {
        let connection = self.connections.get(&options.connection_id).await?;
        connection.assert_ready()?;

        let request = ProofRequest {
            name: options.name,
            version: "1.0".to_string(),
            nonce: Uuid::new_v4().as_u128().to_string(),
            requested_attributes: options.requested_attributes,
            requested_predicates: options.requested_predicates,
            non_revoked: options.non_revoked,
        };

        let mut body = json!({});
        if let Some(comment) = &options.comment {
            body["comment"] = json!(comment);
        }
        let message = attach(
            Message::new(options.version.message_type(PRESENT_PROOF, "request-presentation"), body),
            options.version,
            V1_REQUEST_ATTACHMENT,
            REQUEST_FORMAT,
            serde_json::to_value(&request)?,
        );

        let exchange = self
            .create(ProofExchangeRecord {
                id: Uuid::new_v4().to_string(),
                connection_id: connection.id.clone(),
                thread_id: message.id.0.clone(),
                role: ProofRole::Verifier,
                version: options.version,
                state: ProofState::RequestSent,
                auto_accept: options.auto_accept,
                comment: options.comment,
                request,
                presentation: None,
                selected: None,
                error_code: None,
                error_message: None,
                created_at: unix_time(),
            })
            .await?;
        self.send(&exchange, message).await?;
        Ok(exchange.record)
    }

    /// Picks a stored credential for every referent of a received request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMatchingCredential`] naming the first referent no
    /// stored credential satisfies.
    pub async fn select_credentials(&self, exchange_id: &str) -> Result<SelectedCredentials> {
        let exchange = self
            .expect(exchange_id, ProofRole::Prover, ProofState::RequestReceived)
            .await?;
        select(&exchange.request, &self.indy_credentials().await?)
    }

    /// Answers a received request, with `selected` credentials or an automatic selection.
    ///
    /// # Errors
    ///
    /// - [`Error::NoMatchingCredential`] if the request cannot be answered
    /// - [`Error::LinkSecretRequired`] if no link secret exists
    pub async fn present(
        &self,
        exchange_id: &str,
        selected: Option<SelectedCredentials>,
    ) -> Result<ProofExchangeRecord> {
        let mut exchange = self
            .expect(exchange_id, ProofRole::Prover, ProofState::RequestReceived)
            .await?;
        let selected = match selected {
            Some(selected) => selected,
            None => select(&exchange.request, &self.indy_credentials().await?)?,
        };

        let mut credentials = BTreeMap::new();
        for credential_id in selected.attributes.values().chain(selected.predicates.values()) {
            if credentials.contains_key(credential_id) {
                continue;
            }
            let record = self.credentials.get(credential_id).await?;
            credentials.insert(credential_id.clone(), record.anoncreds()?);
        }
        let (schemas, cred_defs) = self.ledger_objects(credentials.values()).await?;
        let secret = link_secret(&self.ctx).await?;

        let presentation = self
            .ctx
            .anoncreds
            .create_presentation(
                &exchange.request,
                &selected,
                &credentials,
                &secret.secret(),
                &schemas,
                &cred_defs,
            )
            .await?;

        let message = attach(
            Message::new(exchange.version.message_type(PRESENT_PROOF, "presentation"), json!({})),
            exchange.version,
            V1_PRESENTATION_ATTACHMENT,
            PRESENTATION_FORMAT,
            serde_json::to_value(&presentation)?,
        );

        exchange.selected = Some(selected);
        exchange.presentation = Some(presentation);
        let exchange = {
            let _guard = self.ctx.locks.lock(&exchange.thread_id).await;
            self.commit(exchange, ProofState::PresentationSent).await?
        };
        self.send(&exchange, message).await?;
        Ok(exchange.record)
    }

    async fn ledger_objects<'a>(
        &self,
        credentials: impl Iterator<Item = &'a AnonCredsCredential>,
    ) -> Result<(BTreeMap<String, Schema>, BTreeMap<String, CredentialDefinition>)> {
        let mut schemas = BTreeMap::new();
        let mut cred_defs = BTreeMap::new();
        for credential in credentials {
            if !schemas.contains_key(&credential.schema_id) {
                let schema = self.ctx.registries.get_schema(&credential.schema_id).await?;
                schemas.insert(credential.schema_id.clone(), schema);
            }
            if !cred_defs.contains_key(&credential.cred_def_id) {
                let definition = self
                    .ctx
                    .registries
                    .get_credential_definition(&credential.cred_def_id)
                    .await?;
                cred_defs.insert(credential.cred_def_id.clone(), definition);
            }
        }
        Ok((schemas, cred_defs))
    }

    /// Acknowledges a verified presentation, completing the exchange.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the exchange is a verifier in `PresentationReceived`.
    pub async fn accept_presentation(&self, exchange_id: &str) -> Result<ProofExchangeRecord> {
        let exchange = self
            .expect(exchange_id, ProofRole::Verifier, ProofState::PresentationReceived)
            .await?;
        let exchange = {
            let _guard = self.ctx.locks.lock(&exchange.thread_id).await;
            self.commit(exchange, ProofState::Done).await?
        };

        let ack = Message::new(
            exchange.version.message_type(PRESENT_PROOF, "ack"),
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
    pub async fn abandon(&self, exchange_id: &str, reason: &str) -> Result<ProofExchangeRecord> {
        let mut exchange = self.exchanges.get(exchange_id).await?;
        if exchange.state.is_terminal() {
            return Err(Error::InvalidState(format!(
                "proof exchange {exchange_id} already {:?}",
                exchange.state
            )));
        }

        exchange.error_code = Some("abandoned".to_string());
        exchange.error_message = Some(reason.to_string());
        let exchange = {
            let _guard = self.ctx.locks.lock(&exchange.thread_id).await;
            self.commit(exchange, ProofState::Abandoned).await?
        };
        let connection = self.connections.get(&exchange.connection_id).await?;
        self.ctx
            .send_problem_report(&connection, &exchange.thread_id, ProblemReport::new("abandoned", reason))
            .await?;
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
        state: ProofState,
        timeout: Duration,
    ) -> Result<ProofExchangeRecord> {
        self.ctx
            .wait_until(timeout, move || async move {
                let exchange = self.exchanges.get(exchange_id).await?;
                if exchange.state == state {
                    return Ok(Some(exchange.record));
                }
                if exchange.state == ProofState::Abandoned {
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
    pub async fn get(&self, exchange_id: &str) -> Result<ProofExchangeRecord> {
        Ok(self.exchanges.get(exchange_id).await?.record)
    }

    /// The exchanges on `thread_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn find_by_thread(&self, thread_id: &str) -> Result<Vec<ProofExchangeRecord>> {
        Ok(self
            .exchanges
            .find_by(&tags([("threadId", thread_id)]))
            .await?
            .into_iter()
            .map(|e| e.record)
            .collect())
    }

    async fn on_thread(
        &self,
        connection: &ConnectionRecord,
        thread_id: &str,
    ) -> Result<Option<Versioned<ProofExchangeRecord>>> {
        self.exchanges
            .find_one_by(&tags([("threadId", thread_id), ("connectionId", connection.id.as_str())]))
            .await
    }

    async fn process_request(
        &self,
        connection: &ConnectionRecord,
        message: Message,
        version: ProtocolVersion,
    ) -> Result<()> {
        let thread_id = message.thread_id().to_string();
        let exchange = {
            let _guard = self.ctx.locks.lock(&thread_id).await;
            if self.on_thread(connection, &thread_id).await?.is_some() {
                return Err(Error::StateConflict(format!("proof request on existing thread {thread_id}")));
            }

            let request: ProofRequest =
                match read_attachment(&message, version, V1_REQUEST_ATTACHMENT, REQUEST_FORMAT) {
                    Ok(request) => request,
                    Err(error) => {
                        let report = ProblemReport::new(error.problem_code(), error.to_string());
                        if let Err(e) = self.ctx.send_problem_report(connection, &thread_id, report).await {
                            warn!(thread_id, "could not send problem report: {e}");
                        }
                        return Err(error);
                    }
                };

            self.create(ProofExchangeRecord {
                id: Uuid::new_v4().to_string(),
                connection_id: connection.id.clone(),
                thread_id: thread_id.clone(),
                role: ProofRole::Prover,
                version,
                state: ProofState::RequestReceived,
                auto_accept: None,
                comment: message.body.get("comment").and_then(Value::as_str).map(str::to_string),
                request,
                presentation: None,
                selected: None,
                error_code: None,
                error_message: None,
                created_at: unix_time(),
            })
            .await?
        };

        if self.policy(&exchange).await != AutoAccept::Never {
            self.present(&exchange.id, None).await?;
        }
        Ok(())
    }

    async fn process_presentation(
        &self,
        connection: &ConnectionRecord,
        message: Message,
        version: ProtocolVersion,
    ) -> Result<()> {
        let thread_id = message.thread_id().to_string();
        let (mut exchange, presentation) = {
            let _guard = self.ctx.locks.lock(&thread_id).await;
            let exchange = self
                .on_thread(connection, &thread_id)
                .await?
                .ok_or_else(|| Error::RecordNotFound(format!("proof exchange on thread {thread_id}")))?;
            if exchange.role != ProofRole::Verifier || exchange.state != ProofState::RequestSent {
                return Err(Error::StateConflict(format!(
                    "presentation on exchange {} in state {:?}",
                    exchange.id, exchange.state
                )));
            }
            if exchange.version != version {
                let error = Error::FormatMismatch(format!(
                    "exchange {} runs present-proof {}",
                    exchange.id,
                    exchange.version.as_str()
                ));
                return Err(self.fail(exchange, error).await);
            }
            match read_attachment::<Presentation>(&message, version, V1_PRESENTATION_ATTACHMENT, PRESENTATION_FORMAT) {
                Ok(presentation) => (exchange, presentation),
                Err(error) => return Err(self.fail(exchange, error).await),
            }
        };

        let verified = match self.verify(&exchange.request, &presentation).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::VerificationFailed(format!(
                "presentation on thread {thread_id} does not verify"
            ))),
            Err(error) => Err(error),
        };
        if let Err(error) = verified {
            return Err(self.fail(exchange, error).await);
        }

        exchange.presentation = Some(presentation);
        let exchange = {
            let _guard = self.ctx.locks.lock(&thread_id).await;
            self.commit(exchange, ProofState::PresentationReceived).await?
        };

        if self.policy(&exchange).await != AutoAccept::Never {
            self.accept_presentation(&exchange.id).await?;
        }
        Ok(())
    }

    async fn verify(&self, request: &ProofRequest, presentation: &Presentation) -> Result<bool> {
        let mut schemas = BTreeMap::new();
        let mut cred_defs = BTreeMap::new();
        let mut status_lists = Vec::new();

        for identifier in &presentation.identifiers {
            if !schemas.contains_key(&identifier.schema_id) {
                let schema = self.ctx.registries.get_schema(&identifier.schema_id).await?;
                schemas.insert(identifier.schema_id.clone(), schema);
            }
            if !cred_defs.contains_key(&identifier.cred_def_id) {
                let definition = self
                    .ctx
                    .registries
                    .get_credential_definition(&identifier.cred_def_id)
                    .await?;
                cred_defs.insert(identifier.cred_def_id.clone(), definition);
            }
            if let (Some(rev_reg_id), Some(timestamp)) = (&identifier.rev_reg_id, identifier.timestamp) {
                let list = self
                    .ctx
                    .registries
                    .get_revocation_status_list(rev_reg_id, timestamp)
                    .await?;
                status_lists.push(list);
            }
        }

        debug!(sub_proofs = presentation.identifiers.len(), "verifying presentation");
        Ok(self
            .ctx
            .anoncreds
            .verify_presentation(request, presentation, &schemas, &cred_defs, &status_lists)
            .await?)
    }

    async fn process_ack(&self, connection: &ConnectionRecord, message: Message) -> Result<()> {
        let thread_id = message.thread_id();
        let _guard = self.ctx.locks.lock(thread_id).await;
        let exchange = self
            .on_thread(connection, thread_id)
            .await?
            .ok_or_else(|| Error::RecordNotFound(format!("proof exchange on thread {thread_id}")))?;
        if exchange.role != ProofRole::Prover {
            return Err(Error::StateConflict(format!("ack for verifier exchange {}", exchange.id)));
        }
        if exchange.state != ProofState::PresentationSent {
            return Err(Error::StateConflict(format!(
                "ack on proof exchange {} in state {:?}",
                exchange.id, exchange.state
            )));
        }
        self.commit(exchange, ProofState::Done).await?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolHandler for ProofService {
    fn protocols(&self) -> Vec<String> {
        vec![
            ProtocolVersion::V1.protocol_uri(PRESENT_PROOF),
            ProtocolVersion::V2.protocol_uri(PRESENT_PROOF),
        ]
    }

    async fn handle(&self, inbound: InboundMessage) -> Result<()> {
        let connection = self.ctx.connection_from(&inbound).await?;
        let message = inbound.message;
        let version = ProtocolVersion::of_message(PRESENT_PROOF, &message.typ)?;
        debug!(message_type = %message.typ, connection_id = connection.id, "proof message");

        match message.typ.name() {
            Some("request-presentation") => self.process_request(&connection, message, version).await,
            Some("presentation") => self.process_presentation(&connection, message, version).await,
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
            self.commit(exchange, ProofState::Abandoned).await?;
        }
        Ok(owned)
    }
}
