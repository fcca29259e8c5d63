//! Two or more agents talking over an in-process transport.

use async_trait::async_trait;
use didcomm_agent_core::anoncreds::{
    AttributeInfo, CredentialDefinition, Presentation, Restriction, RevocationStatusList, Schema,
};
use didcomm_agent_core::mock::{InMemoryRegistry, MockAnonCreds, MockPlugin};
use didcomm_agent_core::{
    pack_message, AnonCredsRegistry, Attachment, Message, PackedMessage, PackingType, RetryPolicy,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::dispatcher::ProblemReport;
use crate::protocols::connection::{
    ConnectionRecord, ConnectionState, CreateInvitationOptions, OutOfBandRecord, OutOfBandState,
    ReceiveInvitationOptions,
};
use crate::protocols::credential::{
    Attributes, CredentialExchangeOptions, CredentialExchangeRecord, CredentialFormatOptions, CredentialState,
};
use crate::protocols::proof::{ProofExchangeRecord, ProofState, RequestProofOptions};
use crate::records::CredentialDefinitionRecord;
use crate::{Agent, AgentConfig, AutoAccept, Error, InboundMessage, OutboundTransport, ProtocolVersion};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Delivers envelopes straight into the agent owning the endpoint.
#[derive(Default)]
struct LoopbackTransport {
    agents: RwLock<HashMap<String, Weak<Agent>>>,
    failures: Mutex<Vec<Error>>,
}

impl LoopbackTransport {
    async fn failed_with(&self, matches: impl Fn(&Error) -> bool) -> bool {
        self.failures.lock().await.iter().any(matches)
    }
}

#[async_trait]
impl OutboundTransport for LoopbackTransport {
    async fn send(&self, endpoint: &str, packed: &PackedMessage) -> didcomm_agent_core::Result<()> {
        let agent = self
            .agents
            .read()
            .await
            .get(endpoint)
            .and_then(Weak::upgrade)
            .ok_or_else(|| didcomm_agent_core::Error::Transient(format!("nobody listens at {endpoint}")))?;

        let inbound = agent
            .unpack(&packed.data)
            .await
            .map_err(|e| didcomm_agent_core::Error::InvalidFormat(e.to_string()))?;
        if let Err(e) = agent.dispatch(inbound).await {
            debug!(endpoint, "inbound message failed: {e}");
            self.failures.lock().await.push(e);
        }
        Ok(())
    }
}

/// Holds credential definition reads until the gate is released.
struct GatedRegistry {
    inner: Arc<InMemoryRegistry>,
    gate: Arc<Mutex<()>>,
    waiting: AtomicU32,
}

impl GatedRegistry {
    fn new(inner: Arc<InMemoryRegistry>) -> Self {
        Self {
            inner,
            gate: Arc::new(Mutex::new(())),
            waiting: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl AnonCredsRegistry for GatedRegistry {
    fn supported_prefix(&self) -> &str {
        self.inner.supported_prefix()
    }

    async fn get_schema(&self, schema_id: &str) -> didcomm_agent_core::Result<Schema> {
        self.inner.get_schema(schema_id).await
    }

    async fn register_schema(&self, schema: &Schema) -> didcomm_agent_core::Result<String> {
        self.inner.register_schema(schema).await
    }

    async fn get_credential_definition(&self, cred_def_id: &str) -> didcomm_agent_core::Result<CredentialDefinition> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _open = self.gate.lock().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        self.inner.get_credential_definition(cred_def_id).await
    }

    async fn register_credential_definition(
        &self,
        definition: &CredentialDefinition,
    ) -> didcomm_agent_core::Result<String> {
        self.inner.register_credential_definition(definition).await
    }

    async fn get_revocation_status_list(
        &self,
        rev_reg_def_id: &str,
        timestamp: u64,
    ) -> didcomm_agent_core::Result<RevocationStatusList> {
        self.inner.get_revocation_status_list(rev_reg_def_id, timestamp).await
    }
}

struct Network {
    transport: Arc<LoopbackTransport>,
    registry: Arc<InMemoryRegistry>,
}

impl Network {
    fn new() -> Self {
        Self {
            transport: Arc::new(LoopbackTransport::default()),
            registry: Arc::new(InMemoryRegistry::new("did:key:")),
        }
    }

    async fn agent(&self, label: &str, configure: impl FnOnce(&mut AgentConfig)) -> Arc<Agent> {
        self.agent_with_registry(label, self.registry.clone(), configure).await
    }

    async fn agent_with_registry(
        &self,
        label: &str,
        registry: Arc<dyn AnonCredsRegistry>,
        configure: impl FnOnce(&mut AgentConfig),
    ) -> Arc<Agent> {
        let endpoint = format!("http://{label}.test/didcomm");
        let mut config = AgentConfig {
            label: label.to_string(),
            endpoints: vec![endpoint.clone()],
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(10),
            },
            wait_poll: Duration::from_millis(20),
            ..Default::default()
        };
        config.dispatch.retry = config.retry;
        configure(&mut config);

        let agent = Arc::new(
            Agent::builder(config, Arc::new(MockPlugin::new()), Arc::new(MockAnonCreds))
                .registry(registry)
                .transport(self.transport.clone())
                .build()
                .unwrap(),
        );
        self.transport
            .agents
            .write()
            .await
            .insert(endpoint, Arc::downgrade(&agent));
        agent
    }
}

/// Polls `check` until it yields a value.
async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

async fn inviter_connection(inviter: &Agent, out_of_band: &OutOfBandRecord) -> ConnectionRecord {
    eventually(move || async move {
        inviter
            .connections()
            .find_all()
            .await
            .unwrap()
            .into_iter()
            .find(|c| c.out_of_band_id == out_of_band.id)
    })
    .await
}

/// Connects two agents and returns (inviter side, invitee side) connections.
async fn connect(inviter: &Agent, invitee: &Agent) -> (ConnectionRecord, ConnectionRecord) {
    let out_of_band = inviter
        .connections()
        .create_invitation(CreateInvitationOptions {
            auto_accept_connection: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    let received = invitee
        .connections()
        .receive_invitation(out_of_band.invitation.clone(), ReceiveInvitationOptions::default())
        .await
        .unwrap();

    let invitee_side = invitee
        .connections()
        .return_when_is_connected(&received.id, TIMEOUT)
        .await
        .unwrap();
    let inviter_side = inviter_connection(inviter, &out_of_band).await;
    let inviter_side = inviter
        .connections()
        .return_when_is_connected(&inviter_side.id, TIMEOUT)
        .await
        .unwrap();
    (inviter_side, invitee_side)
}

/// `message` as delivered over `peer`'s side of a connection.
fn sent_by(peer: &ConnectionRecord, message: Message) -> InboundMessage {
    let did = peer.our_did.clone().unwrap();
    InboundMessage {
        message: message.from(did.clone()),
        recipient: None,
        authenticated_sender: Some(did),
    }
}

fn attributes(pairs: &[(&str, &str)]) -> Attributes {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Registers a schema over `names` and a credential definition for it.
async fn credential_definition(issuer: &Agent, names: &[&str]) -> CredentialDefinitionRecord {
    let issuer_did = issuer.dids().create("key").await.unwrap().did;
    let schema_id = issuer
        .anoncreds()
        .register_schema(&Schema {
            issuer_id: issuer_did.clone(),
            name: "degree".into(),
            version: "1.0".into(),
            attr_names: names.iter().map(|n| n.to_string()).collect(),
        })
        .await
        .unwrap();
    issuer
        .anoncreds()
        .register_credential_definition(&schema_id, &issuer_did, "default")
        .await
        .unwrap()
}

async fn holder_exchange(holder: &Agent, thread_id: &str) -> CredentialExchangeRecord {
    eventually(move || async move { holder.credentials().find_by_thread(thread_id).await.unwrap().pop() }).await
}

async fn prover_exchange(prover: &Agent, thread_id: &str) -> ProofExchangeRecord {
    eventually(move || async move { prover.proofs().find_by_thread(thread_id).await.unwrap().pop() }).await
}

fn indy_offer(connection: &ConnectionRecord, cred_def_id: &str, attributes: Attributes) -> CredentialExchangeOptions {
    CredentialExchangeOptions {
        connection_id: connection.id.clone(),
        version: ProtocolVersion::V1,
        formats: vec![CredentialFormatOptions::Indy {
            credential_definition_id: cred_def_id.to_string(),
        }],
        attributes,
        comment: Some("your degree".into()),
        auto_accept: None,
    }
}

fn content_approved(config: &mut AgentConfig) {
    config.auto_accept_credentials = AutoAccept::ContentApproved;
    config.auto_accept_proofs = AutoAccept::ContentApproved;
}

#[tokio::test]
async fn test_auto_accepted_invitation_completes_both_sides() {
    let network = Network::new();
    let faber = network.agent("faber", |_| {}).await;
    let alice = network.agent("alice", |_| {}).await;

    let (faber_side, alice_side) = connect(&faber, &alice).await;

    assert_eq!(faber_side.state, ConnectionState::Complete);
    assert_eq!(alice_side.state, ConnectionState::Complete);
    assert_eq!(faber_side.their_did, alice_side.our_did);
    assert_eq!(faber_side.our_did, alice_side.their_did);
    assert_eq!(alice_side.their_label.as_deref(), Some("faber"));
}

#[tokio::test]
async fn test_invitation_by_url_and_config_auto_accept() {
    let network = Network::new();
    let faber = network.agent("faber", |c| c.auto_accept_connections = true).await;
    let alice = network.agent("alice", |_| {}).await;

    let out_of_band = faber
        .connections()
        .create_invitation(CreateInvitationOptions::default())
        .await
        .unwrap();
    let url = out_of_band.invitation.to_url("https://faber.test").unwrap();

    let received = alice
        .connections()
        .receive_invitation_url(&url, ReceiveInvitationOptions::default())
        .await
        .unwrap();
    alice
        .connections()
        .return_when_is_connected(&received.id, TIMEOUT)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_single_use_invitation_is_used_once() {
    let network = Network::new();
    let faber = network.agent("faber", |_| {}).await;
    let alice = network.agent("alice", |_| {}).await;
    let bob = network.agent("bob", |_| {}).await;

    let out_of_band = faber
        .connections()
        .create_invitation(CreateInvitationOptions {
            auto_accept_connection: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();

    let first = alice
        .connections()
        .receive_invitation(out_of_band.invitation.clone(), ReceiveInvitationOptions::default())
        .await
        .unwrap();
    let second = alice
        .connections()
        .receive_invitation(out_of_band.invitation.clone(), ReceiveInvitationOptions::default())
        .await;
    assert!(matches!(second, Err(Error::InvitationAlreadyUsed(id)) if id == out_of_band.invitation.id));
    alice
        .connections()
        .return_when_is_connected(&first.id, TIMEOUT)
        .await
        .unwrap();

    // Another agent's request for the consumed invitation is refused by the inviter.
    let late = bob
        .connections()
        .receive_invitation(out_of_band.invitation.clone(), ReceiveInvitationOptions::default())
        .await
        .unwrap();
    let result = bob.connections().return_when_is_connected(&late.id, TIMEOUT).await;
    assert!(matches!(result, Err(Error::ConnectionAbandoned { .. })));

    let connections = faber.connections().find_all().await.unwrap();
    assert_eq!(connections.len(), 1);
}

#[tokio::test]
async fn test_multi_use_invitation_spawns_connections() {
    let network = Network::new();
    let faber = network.agent("faber", |_| {}).await;
    let alice = network.agent("alice", |_| {}).await;
    let bob = network.agent("bob", |_| {}).await;

    let out_of_band = faber
        .connections()
        .create_invitation(CreateInvitationOptions {
            multi_use: true,
            auto_accept_connection: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();

    for invitee in [&alice, &bob] {
        let received = invitee
            .connections()
            .receive_invitation(out_of_band.invitation.clone(), ReceiveInvitationOptions::default())
            .await
            .unwrap();
        invitee
            .connections()
            .return_when_is_connected(&received.id, TIMEOUT)
            .await
            .unwrap();
    }

    let connections = faber.connections().find_all().await.unwrap();
    assert_eq!(connections.len(), 2);
    let record = faber.connections().out_of_band(&out_of_band.id).await.unwrap();
    assert_eq!(record.connection_ids.len(), 2);
}

#[tokio::test]
async fn test_wait_times_out_without_touching_the_connection() {
    let network = Network::new();
    let faber = network.agent("faber", |_| {}).await;
    let alice = network.agent("alice", |_| {}).await;

    let out_of_band = faber
        .connections()
        .create_invitation(CreateInvitationOptions {
            auto_accept_connection: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    let received = alice
        .connections()
        .receive_invitation(out_of_band.invitation.clone(), ReceiveInvitationOptions::default())
        .await
        .unwrap();

    let result = alice
        .connections()
        .return_when_is_connected(&received.id, Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(Error::ConnectionTimeout(id)) if id == received.id));
    assert_eq!(
        alice.connections().get(&received.id).await.unwrap().state,
        ConnectionState::Requested
    );

    let pending = inviter_connection(&faber, &out_of_band).await;
    faber.connections().accept_request(&pending.id).await.unwrap();
    let (invitee, connection_id) = (&*alice, received.id.as_str());
    eventually(move || async move {
        let connection = invitee.connections().get(connection_id).await.unwrap();
        (connection.state == ConnectionState::Complete).then_some(())
    })
    .await;

    let started = tokio::time::Instant::now();
    alice
        .connections()
        .return_when_is_connected(&received.id, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn test_issued_credential_round_trip() {
    let network = Network::new();
    let faber = network.agent("faber", content_approved).await;
    let alice = network.agent("alice", content_approved).await;
    let (faber_side, _) = connect(&faber, &alice).await;

    let definition = credential_definition(&faber, &["a"]).await;
    alice.anoncreds().create_link_secret().await.unwrap();

    let offered = faber
        .credentials()
        .offer_credential(indy_offer(&faber_side, &definition.id, attributes(&[("a", "b")])))
        .await
        .unwrap();
    faber
        .credentials()
        .wait_for_state(&offered.id, CredentialState::Done, TIMEOUT)
        .await
        .unwrap();

    let held = holder_exchange(&alice, &offered.thread_id).await;
    let held = alice
        .credentials()
        .wait_for_state(&held.id, CredentialState::Done, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(held.credential_ids.len(), 1);

    let stored = alice.credentials().stored_credentials().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].attributes, attributes(&[("a", "b")]));
    assert_eq!(stored[0].credential_definition_id, definition.id);
    assert_eq!(stored[0].schema_id, definition.definition.schema_id);
}

#[tokio::test]
async fn test_request_requires_a_link_secret() {
    let network = Network::new();
    let faber = network.agent("faber", content_approved).await;
    let alice = network.agent("alice", |_| {}).await;
    let (faber_side, _) = connect(&faber, &alice).await;
    let definition = credential_definition(&faber, &["a"]).await;

    let offered = faber
        .credentials()
        .offer_credential(indy_offer(&faber_side, &definition.id, attributes(&[("a", "b")])))
        .await
        .unwrap();
    let held = holder_exchange(&alice, &offered.thread_id).await;
    assert_eq!(held.state, CredentialState::OfferReceived);

    let result = alice.credentials().request_credential(&held.id).await;
    assert!(matches!(result, Err(Error::LinkSecretRequired)));
    assert_eq!(
        alice.credentials().get(&held.id).await.unwrap().state,
        CredentialState::OfferReceived
    );

    assert!(alice.anoncreds().link_secret_ids().await.unwrap().is_empty());
    let secret = alice.anoncreds().create_link_secret().await.unwrap();
    assert_eq!(alice.anoncreds().create_link_secret().await.unwrap(), secret);
    assert_eq!(alice.anoncreds().link_secret_ids().await.unwrap(), vec![secret]);

    alice.credentials().request_credential(&held.id).await.unwrap();
    let held = alice
        .credentials()
        .wait_for_state(&held.id, CredentialState::CredentialReceived, TIMEOUT)
        .await
        .unwrap();
    alice.credentials().accept_credential(&held.id).await.unwrap();
    faber
        .credentials()
        .wait_for_state(&offered.id, CredentialState::Done, TIMEOUT)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_offer_with_unknown_attributes_is_refused() {
    let network = Network::new();
    let faber = network.agent("faber", |_| {}).await;
    let alice = network.agent("alice", |_| {}).await;
    let (faber_side, _) = connect(&faber, &alice).await;
    let definition = credential_definition(&faber, &["a"]).await;

    let result = faber
        .credentials()
        .offer_credential(indy_offer(&faber_side, &definition.id, attributes(&[("z", "b")])))
        .await;
    assert!(matches!(result, Err(Error::FormatMismatch(_))));

    let mut options = indy_offer(&faber_side, &definition.id, attributes(&[("a", "b")]));
    options.formats.push(CredentialFormatOptions::JsonLd {
        credential: json!({ "issuer": faber_side.our_did }),
    });
    let result = faber.credentials().offer_credential(options).await;
    assert!(matches!(result, Err(Error::FormatMismatch(_))));
}

#[tokio::test]
async fn test_proposal_led_json_ld_issuance() {
    let network = Network::new();
    let faber = network.agent("faber", content_approved).await;
    let alice = network.agent("alice", content_approved).await;
    let (faber_side, alice_side) = connect(&faber, &alice).await;
    let issuer = faber.dids().create("key").await.unwrap().did;

    let template = json!({
        "@context": ["https://www.w3.org/2018/credentials/v1"],
        "type": ["VerifiableCredential", "UniversityDegreeCredential"],
        "issuer": issuer,
        "issuanceDate": "2024-01-01T00:00:00Z",
        "credentialSubject": {},
    });
    let proposed = alice
        .credentials()
        .propose_credential(CredentialExchangeOptions {
            connection_id: alice_side.id.clone(),
            version: ProtocolVersion::V2,
            formats: vec![CredentialFormatOptions::JsonLd { credential: template }],
            attributes: attributes(&[("degree", "Maths")]),
            comment: None,
            auto_accept: None,
        })
        .await
        .unwrap();

    let pending = holder_exchange(&faber, &proposed.thread_id).await;
    assert_eq!(pending.state, CredentialState::ProposalReceived);
    assert_eq!(pending.connection_id, faber_side.id);
    faber.credentials().accept_proposal(&pending.id).await.unwrap();

    alice
        .credentials()
        .wait_for_state(&proposed.id, CredentialState::Done, TIMEOUT)
        .await
        .unwrap();
    let stored = alice.credentials().stored_credentials().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].credential_definition_id, issuer);
    assert_eq!(stored[0].schema_id, "UniversityDegreeCredential");
    assert_eq!(stored[0].attributes, attributes(&[("degree", "Maths")]));
}

async fn issued(faber: &Agent, alice: &Agent, faber_side: &ConnectionRecord) -> CredentialDefinitionRecord {
    let definition = credential_definition(faber, &["a"]).await;
    alice.anoncreds().create_link_secret().await.unwrap();
    let offered = faber
        .credentials()
        .offer_credential(CredentialExchangeOptions {
            auto_accept: Some(AutoAccept::Always),
            ..indy_offer(faber_side, &definition.id, attributes(&[("a", "b")]))
        })
        .await
        .unwrap();
    let held = holder_exchange(alice, &offered.thread_id).await;
    alice
        .credentials()
        .wait_for_state(&held.id, CredentialState::Done, TIMEOUT)
        .await
        .unwrap();
    definition
}

fn request_for(connection: &ConnectionRecord, cred_def_id: &str) -> RequestProofOptions {
    RequestProofOptions {
        connection_id: connection.id.clone(),
        version: ProtocolVersion::V2,
        name: "proof of a".into(),
        requested_attributes: BTreeMap::from([(
            "a_0".to_string(),
            AttributeInfo {
                name: "a".into(),
                restrictions: vec![Restriction {
                    cred_def_id: Some(cred_def_id.to_string()),
                    ..Restriction::default()
                }],
            },
        )]),
        requested_predicates: BTreeMap::new(),
        non_revoked: None,
        comment: None,
        auto_accept: None,
    }
}

#[tokio::test]
async fn test_proof_needs_a_matching_credential() {
    let network = Network::new();
    let faber = network.agent("faber", content_approved).await;
    let alice = network.agent("alice", |c| c.auto_accept_credentials = AutoAccept::Always).await;
    let (faber_side, _) = connect(&faber, &alice).await;
    let definition = issued(&faber, &alice, &faber_side).await;

    let unmatched = faber
        .proofs()
        .request_proof(request_for(&faber_side, "did:key:z6Mkother/anoncreds/v0/CLAIM_DEF/9/default"))
        .await
        .unwrap();
    let pending = prover_exchange(&alice, &unmatched.thread_id).await;
    let result = alice.proofs().select_credentials(&pending.id).await;
    assert!(matches!(result, Err(Error::NoMatchingCredential(referent)) if referent == "a_0"));
    assert!(matches!(
        alice.proofs().present(&pending.id, None).await,
        Err(Error::NoMatchingCredential(_))
    ));
    assert_eq!(alice.proofs().get(&pending.id).await.unwrap().state, ProofState::RequestReceived);

    let matched = faber
        .proofs()
        .request_proof(request_for(&faber_side, &definition.id))
        .await
        .unwrap();
    let pending = prover_exchange(&alice, &matched.thread_id).await;
    let selected = alice.proofs().select_credentials(&pending.id).await.unwrap();
    alice.proofs().present(&pending.id, Some(selected)).await.unwrap();

    let verified = faber
        .proofs()
        .wait_for_state(&matched.id, ProofState::Done, TIMEOUT)
        .await
        .unwrap();
    let presentation = verified.presentation.unwrap();
    assert_eq!(presentation.requested_proof.revealed_attrs["a_0"].raw, "b");
    alice
        .proofs()
        .wait_for_state(&pending.id, ProofState::Done, TIMEOUT)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_forged_presentation_abandons_the_exchange() {
    let network = Network::new();
    let faber = network.agent("faber", content_approved).await;
    let alice = network.agent("alice", |_| {}).await;
    let (faber_side, alice_side) = connect(&faber, &alice).await;

    let requested = faber
        .proofs()
        .request_proof(request_for(&faber_side, "did:key:z6Mkany/anoncreds/v0/CLAIM_DEF/1/default"))
        .await
        .unwrap();
    let pending = prover_exchange(&alice, &requested.thread_id).await;

    let forged = Presentation {
        requested_proof: Default::default(),
        identifiers: Vec::new(),
        proof: json!({}),
    };
    let message = Message::new(
        ProtocolVersion::V2.message_type("present-proof", "presentation"),
        json!({ "formats": [{ "attach_id": "indy", "format": "hlindy/proof@v2.0" }] }),
    )
    .attach(Attachment::json("indy", Some("hlindy/proof@v2.0"), serde_json::to_value(forged).unwrap()))
    .thread(requested.thread_id.clone());

    let result = faber.dispatch(sent_by(&alice_side, message)).await;
    assert!(matches!(result, Err(Error::VerificationFailed(_))));

    let waited = faber
        .proofs()
        .wait_for_state(&requested.id, ProofState::Done, TIMEOUT)
        .await;
    assert!(matches!(waited, Err(Error::VerificationFailed(_))));
    assert_eq!(faber.proofs().get(&requested.id).await.unwrap().state, ProofState::Abandoned);

    // The prover learns about it through the problem report.
    let (prover, exchange_id) = (&*alice, pending.id.as_str());
    eventually(move || async move {
        let exchange = prover.proofs().get(exchange_id).await.unwrap();
        (exchange.state == ProofState::Abandoned).then_some(())
    })
    .await;
}

#[tokio::test]
async fn test_concurrent_messages_on_one_thread_never_diverge() {
    let network = Network::new();
    let faber = network.agent("faber", |_| {}).await;
    let alice = network.agent("alice", |_| {}).await;
    let (faber_side, alice_side) = connect(&faber, &alice).await;
    let definition = credential_definition(&faber, &["a"]).await;
    alice.anoncreds().create_link_secret().await.unwrap();

    let offered = faber
        .credentials()
        .offer_credential(indy_offer(&faber_side, &definition.id, attributes(&[("a", "b")])))
        .await
        .unwrap();
    let held = holder_exchange(&alice, &offered.thread_id).await;
    alice.credentials().request_credential(&held.id).await.unwrap();
    faber
        .credentials()
        .wait_for_state(&offered.id, CredentialState::RequestReceived, TIMEOUT)
        .await
        .unwrap();
    faber.credentials().issue_credential(&offered.id).await.unwrap();

    let ack = || {
        sent_by(
            &alice_side,
            Message::new(ProtocolVersion::V1.message_type("issue-credential", "ack"), json!({ "status": "OK" }))
                .thread(offered.thread_id.clone()),
        )
    };
    let (first, second) = tokio::join!(faber.dispatch(ack()), faber.dispatch(ack()));

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(Error::StateConflict(_)))));
    assert_eq!(
        faber.credentials().get(&offered.id).await.unwrap().state,
        CredentialState::Done
    );
}

#[tokio::test]
async fn test_unknown_registry_namespace_is_unsupported() {
    let network = Network::new();
    let faber = network.agent("faber", |_| {}).await;

    let result = faber
        .anoncreds()
        .register_schema(&Schema {
            issuer_id: "did:indy:sovrin:WRfXPg8dantKVubE3HX8pw".into(),
            name: "degree".into(),
            version: "1.0".into(),
            attr_names: vec!["a".into()],
        })
        .await;
    assert!(matches!(result, Err(Error::UnsupportedMethod(_))));
}

#[tokio::test]
async fn test_registration_survives_transient_failures() {
    let network = Network::new();
    let faber = network.agent("faber", |_| {}).await;
    let issuer = faber.dids().create("key").await.unwrap().did;

    network.registry.fail_next_writes(1);
    let schema_id = faber
        .anoncreds()
        .register_schema(&Schema {
            issuer_id: issuer.clone(),
            name: "degree".into(),
            version: "1.0".into(),
            attr_names: vec!["a".into()],
        })
        .await
        .unwrap();
    assert!(schema_id.starts_with(&issuer));
}

#[tokio::test]
async fn test_legacy_invitation_url_connects() {
    let network = Network::new();
    let faber = network.agent("faber", |c| c.auto_accept_connections = true).await;
    let alice = network.agent("alice", |_| {}).await;

    let out_of_band = faber
        .connections()
        .create_invitation(CreateInvitationOptions::default())
        .await
        .unwrap();
    let url = out_of_band.invitation.to_legacy_url("https://faber.test").unwrap();
    assert!(url.starts_with("https://faber.test?c_i="));

    let received = alice
        .connections()
        .receive_invitation_url(&url, ReceiveInvitationOptions::default())
        .await
        .unwrap();
    assert_eq!(received.invitation_id, out_of_band.invitation.id);
    alice
        .connections()
        .return_when_is_connected(&received.id, TIMEOUT)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_expired_invitations_are_refused() {
    let network = Network::new();
    let faber = network.agent("faber", |_| {}).await;
    let alice = network.agent("alice", |_| {}).await;

    let stale = faber
        .connections()
        .create_invitation(CreateInvitationOptions {
            expires_in: Some(Duration::ZERO),
            ..Default::default()
        })
        .await
        .unwrap();
    let result = alice
        .connections()
        .receive_invitation(stale.invitation.clone(), ReceiveInvitationOptions::default())
        .await;
    assert!(matches!(result, Err(Error::InvitationExpired(id)) if id == stale.invitation.id));
    assert!(faber
        .connections()
        .find_invitation(&stale.invitation.id)
        .await
        .unwrap()
        .is_none());

    // Received in time, but the request reaches the inviter after expiry.
    let short = faber
        .connections()
        .create_invitation(CreateInvitationOptions {
            auto_accept_connection: Some(true),
            expires_in: Some(Duration::from_secs(2)),
            ..Default::default()
        })
        .await
        .unwrap();
    let received = alice
        .connections()
        .receive_invitation(
            short.invitation.clone(),
            ReceiveInvitationOptions {
                auto_accept_invitation: false,
                label: None,
            },
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2100)).await;
    alice.connections().accept_invitation(&received.id).await.unwrap();

    let result = alice.connections().return_when_is_connected(&received.id, TIMEOUT).await;
    assert!(matches!(result, Err(Error::ConnectionAbandoned { .. })));
    assert_eq!(
        faber.connections().out_of_band(&short.id).await.unwrap().state,
        OutOfBandState::Expired
    );
    assert!(faber.connections().find_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_out_of_order_credential_messages() {
    let network = Network::new();
    let faber = network.agent("faber", |_| {}).await;
    let alice = network.agent("alice", |_| {}).await;
    let (faber_side, alice_side) = connect(&faber, &alice).await;
    let definition = credential_definition(&faber, &["a"]).await;

    let offered = faber
        .credentials()
        .offer_credential(indy_offer(&faber_side, &definition.id, attributes(&[("a", "b")])))
        .await
        .unwrap();
    let held = holder_exchange(&alice, &offered.thread_id).await;

    let early_ack = Message::new(ProtocolVersion::V1.message_type("issue-credential", "ack"), json!({ "status": "OK" }))
        .thread(offered.thread_id.clone());
    let result = faber.dispatch(sent_by(&alice_side, early_ack)).await;
    assert!(matches!(result, Err(Error::StateConflict(_))));
    assert_eq!(
        faber.credentials().get(&offered.id).await.unwrap().state,
        CredentialState::OfferSent
    );

    // A v2 request on a v1 exchange ends it on both sides.
    let request = Message::new(
        ProtocolVersion::V2.message_type("issue-credential", "request-credential"),
        json!({ "formats": [] }),
    )
    .thread(offered.thread_id.clone());
    let result = faber.dispatch(sent_by(&alice_side, request)).await;
    assert!(matches!(result, Err(Error::FormatMismatch(_))));
    assert_eq!(
        faber.credentials().get(&offered.id).await.unwrap().state,
        CredentialState::Abandoned
    );

    let (holder, exchange_id) = (&*alice, held.id.as_str());
    eventually(move || async move {
        let exchange = holder.credentials().get(exchange_id).await.unwrap();
        (exchange.state == CredentialState::Abandoned).then_some(())
    })
    .await;
}

#[tokio::test]
async fn test_abandon_wins_over_a_request_in_flight() {
    let network = Network::new();
    let registry = Arc::new(GatedRegistry::new(network.registry.clone()));
    let faber = network.agent_with_registry("faber", registry.clone(), |_| {}).await;
    let alice = network.agent("alice", |_| {}).await;
    let (faber_side, _) = connect(&faber, &alice).await;
    let definition = credential_definition(&faber, &["a"]).await;
    alice.anoncreds().create_link_secret().await.unwrap();

    let offered = faber
        .credentials()
        .offer_credential(indy_offer(&faber_side, &definition.id, attributes(&[("a", "b")])))
        .await
        .unwrap();
    let held = holder_exchange(&alice, &offered.thread_id).await;

    // Faber reads the definition outside the thread lock while validating the request.
    let closed = registry.gate.clone().lock_owned().await;
    alice.credentials().request_credential(&held.id).await.unwrap();
    let gated = &*registry;
    eventually(move || async move { (gated.waiting.load(Ordering::SeqCst) > 0).then_some(()) }).await;

    faber.credentials().abandon(&offered.id, "offer withdrawn").await.unwrap();
    drop(closed);

    let transport = &*network.transport;
    eventually(move || async move {
        transport
            .failed_with(|e| matches!(e, Error::StateConflict(_)))
            .await
            .then_some(())
    })
    .await;
    let exchange = faber.credentials().get(&offered.id).await.unwrap();
    assert_eq!(exchange.state, CredentialState::Abandoned);
    assert_eq!(exchange.error_message.as_deref(), Some("offer withdrawn"));
    assert!(exchange.request.is_empty());
}

#[tokio::test]
async fn test_proof_thread_only_answers_its_peer() {
    let network = Network::new();
    let faber = network.agent("faber", |_| {}).await;
    let alice = network.agent("alice", |_| {}).await;
    let bob = network.agent("bob", |_| {}).await;
    let (faber_side, alice_side) = connect(&faber, &alice).await;
    let (_, bob_side) = connect(&faber, &bob).await;

    let requested = faber
        .proofs()
        .request_proof(request_for(&faber_side, "did:key:z6Mkany/anoncreds/v0/CLAIM_DEF/1/default"))
        .await
        .unwrap();
    let pending = prover_exchange(&alice, &requested.thread_id).await;

    let early_ack = Message::new(ProtocolVersion::V2.message_type("present-proof", "ack"), json!({ "status": "OK" }))
        .thread(requested.thread_id.clone());
    let result = alice.dispatch(sent_by(&faber_side, early_ack)).await;
    assert!(matches!(result, Err(Error::StateConflict(_))));
    assert_eq!(alice.proofs().get(&pending.id).await.unwrap().state, ProofState::RequestReceived);

    // Another connected peer cannot end alice's exchange.
    let report = ProblemReport::new("abandoned", "not yours")
        .into_message(&requested.thread_id)
        .unwrap();
    let result = faber.dispatch(sent_by(&bob_side, report)).await;
    assert!(matches!(result, Err(Error::RecordNotFound(_))));

    // Nor can an anonymous envelope claiming to come from alice.
    let forged = ProblemReport::new("abandoned", "not really alice")
        .into_message(&requested.thread_id)
        .unwrap()
        .from(alice_side.our_did.clone().unwrap())
        .to([faber_side.our_did.clone().unwrap()]);
    let packed = pack_message(&forged, &MockPlugin::new(), PackingType::AnonV2)
        .await
        .unwrap();
    let result = faber.receive(&packed.data).await;
    assert!(matches!(result, Err(Error::MessageRejected(_))));

    assert_eq!(faber.proofs().get(&requested.id).await.unwrap().state, ProofState::RequestSent);
}
