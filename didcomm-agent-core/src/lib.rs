//! Core building blocks of a `DIDComm` agent.
//!
//! This crate provides the protocol-independent parts of the agent: message
//! types, envelope packing, the traits through which the agent reaches its
//! external collaborators, and the dispatch tables that select a backend for a
//! DID method or credential registry namespace.
//!
//! # Features
//!
//! - Message packing and unpacking with different security levels:
//!   - Signed: Messages are signed but not encrypted
//!   - AuthCrypt: Authenticated encryption with sender identity
//!   - AnonCrypt: Anonymous encryption without sender identity
//! - Gateway traits for the wallet ([`DIDCommPlugin`]) and the AnonCreds
//!   stack ([`AnonCredsBackend`], [`AnonCredsRegistry`])
//! - DID resolution and registration routing, with a built-in `did:key` method
//! - A versioned record store contract with optimistic concurrency
//!
//! # Architecture
//!
//! The crate is organized into these main modules:
//! - `types`: Core message type definitions
//! - `pack`: Message packing and unpacking operations
//! - `plugin`: Wallet, resolver and registrar traits
//! - `did`: DID parsing, DID Documents and `did:key`
//! - `anoncreds`: AnonCreds objects and backend / registry traits
//! - `router`: DID and credential registry dispatch tables
//! - `retry`: Bounded retry for transient backend failures
//! - `storage`: Record store contract and in-memory store
//! - `mock`: Deterministic collaborators for tests and demos (`test-utils` feature)
//! - `error`: Error types and handling
//!
//! # Examples
//!
//! ```rust,ignore
//! // Needs the `test-utils` feature for `MockPlugin`.
//! use didcomm_agent_core::{Message, PackingType};
//! use didcomm_agent_core::mock::MockPlugin;
//! use didcomm_agent_core::pack::{pack_message, unpack_message};
//! use serde_json::json;
//!
//! async fn example() -> didcomm_agent_core::Result<()> {
//!     let plugin = MockPlugin::new();
//!     let message = Message::new("https://didcomm.org/basicmessage/2.0/message", json!({"content": "hi"}))
//!         .from("did:example:alice")
//!         .to(vec!["did:example:bob"]);
//!
//!     let packed = pack_message(&message, &plugin, PackingType::AuthcryptV2).await?;
//!     let unpacked = unpack_message(&packed.data, &plugin, Some("did:example:bob")).await?;
//!     assert_eq!(unpacked.message.id, message.id);
//!     assert_eq!(unpacked.sender.as_deref(), Some("did:example:alice"));
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod anoncreds;
pub mod did;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod pack;
pub mod plugin;
pub mod prelude;
pub mod retry;
pub mod router;
pub mod storage;
pub mod types;

pub use anoncreds::{AnonCredsBackend, AnonCredsRegistry};
pub use error::{Error, Result};
pub use pack::{pack_message, unpack_message, UnpackedMessage};
pub use plugin::{DIDCommPlugin, DIDRegistrar, DIDResolver, Encryptor, KeyManager, Signer};
pub use retry::RetryPolicy;
pub use router::{DidRouter, RegistryRouter};
pub use storage::{InMemoryRecordStore, RecordStore, StorageRecord};
pub use types::{
    Attachment, AttachmentData, Message, MessageId, MessageType, PackedMessage, PackingType,
};
