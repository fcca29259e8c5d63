//! Plugin system for agent gateway operations.
//!
//! This module provides the traits through which the agent consumes its
//! external collaborators. None of them are implemented by the agent itself;
//! a wallet, key store or ledger client implements them and is handed to the
//! agent at construction.
//!
//! # Plugin Architecture
//!
//! - [`KeyManager`]: creation of key pairs held by the secure store
//! - [`Signer`]: message signing and signature verification
//! - [`Encryptor`]: envelope encryption and decryption
//! - [`DIDResolver`] / [`DIDRegistrar`]: one DID method each, composed by
//!   [`crate::router::DidRouter`]
//!
//! [`KeyManager`], [`Signer`] and [`Encryptor`] are combined through the
//! [`DIDCommPlugin`] trait, which is the crypto and storage gateway of the
//! agent.
//!
//! # Examples
//!
//! ```rust,no_run
//! use didcomm_agent_core::plugin::DIDCommPlugin;
//!
//! async fn sign_hello(plugin: &dyn DIDCommPlugin) -> didcomm_agent_core::Result<Vec<u8>> {
//!     plugin.signer().sign(b"hello", "did:key:z6Mk...").await
//! }
//! ```

use crate::did::{DidCreateOptions, DidCreateResult, DidDocument};
use crate::Result;
use async_trait::async_trait;

/// A key pair created inside the secure store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    /// Raw Ed25519 public key bytes
    pub public_key: Vec<u8>,
    /// Opaque reference to the private key inside the store
    pub key_reference: String,
}

/// Creates key pairs inside the secure store.
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Creates an Ed25519 key pair, deterministically when a seed is given.
    ///
    /// # Errors
    /// - If the store rejects the seed
    /// - If key generation fails
    async fn create_key(&self, seed: Option<&[u8]>) -> Result<KeyInfo>;

    /// Binds an already created key to a DID so that [`Signer`] and
    /// [`Encryptor`] can address it by DID.
    ///
    /// # Errors
    /// - If the key reference is unknown
    async fn assign_did(&self, key_reference: &str, did: &str) -> Result<()>;
}

/// Resolves DIDs of one method to DID Documents.
#[async_trait]
pub trait DIDResolver: Send + Sync {
    /// The DID method this resolver answers for (e.g. `key`, `web`, `indy`).
    fn method(&self) -> &str;

    /// Resolves a DID to its DID Document.
    ///
    /// # Arguments
    /// * `did` - The DID to resolve (e.g., "did:example:123")
    ///
    /// # Errors
    /// - If the DID is invalid
    /// - If resolution fails
    /// - If the DID Document is invalid
    async fn resolve(&self, did: &str) -> Result<DidDocument>;
}

/// Creates DIDs of one method.
#[async_trait]
pub trait DIDRegistrar: Send + Sync {
    /// The DID method this registrar creates.
    fn method(&self) -> &str;

    /// Creates (and, for ledger methods, publishes) a new DID.
    ///
    /// Implementations backed by a ledger return only once the write is
    /// durably accepted, or fail with [`crate::Error::Transient`] so the
    /// router can retry.
    ///
    /// # Errors
    /// - If key creation fails
    /// - If the backend rejects the write
    async fn create(&self, options: &DidCreateOptions) -> Result<DidCreateResult>;
}

/// Signs and verifies messages.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Signs data using a specified key.
    ///
    /// # Arguments
    /// * `data` - The data to sign
    /// * `key_id` - The key ID (or owning DID) to use for signing
    ///
    /// # Errors
    /// - If the key is not found
    /// - If signing fails
    async fn sign(&self, data: &[u8], key_id: &str) -> Result<Vec<u8>>;

    /// Verifies a signature.
    ///
    /// # Arguments
    /// * `data` - The original data that was signed
    /// * `signature` - The signature to verify
    /// * `key_id` - The key ID (or owning DID) to use for verification
    ///
    /// # Errors
    /// - If the key cannot be resolved
    /// - If the data or signature is malformed
    async fn verify(&self, data: &[u8], signature: &[u8], key_id: &str) -> Result<bool>;
}

/// Encrypts and decrypts messages.
#[async_trait]
pub trait Encryptor: Send + Sync {
    /// Encrypts data for one or more recipients.
    ///
    /// # Arguments
    /// * `data` - The data to encrypt
    /// * `recipients` - The recipient DIDs
    /// * `sender` - Optional sender DID for authenticated encryption
    ///
    /// # Errors
    /// - If recipient keys cannot be resolved
    /// - If encryption fails
    async fn encrypt(
        &self,
        data: &[u8],
        recipients: &[&str],
        sender: Option<&str>,
    ) -> Result<Vec<u8>>;

    /// Decrypts data addressed to `recipient`.
    ///
    /// # Errors
    /// - If the recipient key cannot be found
    /// - If decryption or authentication fails
    async fn decrypt(&self, data: &[u8], recipient: &str) -> Result<Vec<u8>>;
}

/// Combined crypto and storage gateway.
///
/// Implementations should provide access to concrete implementations of
/// each capability, usually one wallet object implementing all three.
pub trait DIDCommPlugin: Send + Sync {
    /// Gets the key manager implementation.
    fn keys(&self) -> &dyn KeyManager;

    /// Gets the signer implementation.
    fn signer(&self) -> &dyn Signer;

    /// Gets the encryptor implementation.
    fn encryptor(&self) -> &dyn Encryptor;
}
