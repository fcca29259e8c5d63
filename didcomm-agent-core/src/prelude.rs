//! Prelude module for commonly used types and traits.
//!
//! Import everything from this module with `use didcomm_agent_core::prelude::*`.

pub use crate::error::{Error, Result};

pub use crate::anoncreds::{
    AnonCredsBackend, AnonCredsCredential, AnonCredsRegistry, CredentialDefinition, LinkSecret,
    Presentation, ProofRequest, Schema,
};
pub use crate::did::{DidCreateOptions, DidDocument};
pub use crate::plugin::{DIDCommPlugin, DIDRegistrar, DIDResolver, Encryptor, KeyManager, Signer};
pub use crate::router::{DidRouter, RegistryRouter};
pub use crate::storage::{RecordStore, StorageRecord, Tags};

pub use crate::types::{
    Attachment, AttachmentData, Message, MessageId, MessageType, PackedMessage, PackingType,
};

pub use crate::pack::{pack_message, unpack_message, UnpackedMessage};
