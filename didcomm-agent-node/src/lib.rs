//! `DIDComm` agent built on didcomm-agent-core.
//!
//! This crate provides the agent that:
//! - Receives, unpacks and dispatches `DIDComm` messages
//! - Establishes connections through out-of-band invitations
//! - Issues and holds credentials (`issue-credential` 1.0 and 2.0)
//! - Requests and presents proofs (`present-proof` 1.0 and 2.0)
//! - Delivers outbound messages in order per connection, with retries
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//! - `node`: The [`Agent`] and its builder
//! - `config`: Agent and dispatch configuration
//! - `dispatcher`: Inbound routing and per-thread transition locks
//! - `dispatch`: Outbound transports and per-connection delivery queues
//! - `protocols`: Connection, credential and proof state machines
//! - `records`: Typed, versioned records on the record store
//! - `dids`: `did:web` resolution and the DID API
//! - `anoncreds`: Schema, credential definition and link secret API
//! - `events`: Agent events and application message handlers
//! - `error`: Error types and handling
//!
//! # Examples
//!
//! ```rust,no_run
//! use didcomm_agent_core::mock::{InMemoryRegistry, MockAnonCreds, MockPlugin};
//! use didcomm_agent_node::{Agent, AgentConfig};
//! use std::sync::Arc;
//!
//! async fn example(packed: &str) -> didcomm_agent_node::Result<()> {
//!     let agent = Agent::builder(AgentConfig::default(), Arc::new(MockPlugin::new()), Arc::new(MockAnonCreds))
//!         .registry(Arc::new(InMemoryRegistry::new("did:indy:test:")))
//!         .build()?;
//!
//!     // Unpack and route a message received from a transport
//!     agent.receive(packed).await
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod anoncreds;
pub mod config;
pub mod context;
pub mod dids;
pub mod dispatch;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod node;
pub mod protocols;
pub mod records;

#[cfg(test)]
mod tests;

// Re-export main types for convenience
pub use config::{AgentConfig, AutoAccept, AutoAcceptCredential, AutoAcceptProof, DispatchConfig};
pub use dispatch::{HttpOutboundTransport, OutboundTransport};
pub use dispatcher::{InboundMessage, ProblemReport, ProtocolHandler};
pub use error::{Error, Result};
pub use events::{AgentEvent, HandlerHandle};
pub use node::{Agent, AgentBuilder};
pub use protocols::ProtocolVersion;
