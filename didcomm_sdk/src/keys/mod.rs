use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::definitions::{ED25519_KEY_SIZE, Key, KeyType};

mod memory;

pub use memory::InMemoryKeyManager;

/// Size of the nonce used by `crypto_box` (XSalsa20-Poly1305)
pub const BOX_NONCE_SIZE: usize = 24;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("unknown key {0}")]
    UnknownKey(String),
    #[error("unsupported key type {0}")]
    UnsupportedKeyType(KeyType),
    #[error("invalid key material")]
    InvalidKey,
    #[error("signature verification failed for key {0}")]
    Signature(String),
    #[error("key agreement failed")]
    Agreement,
    #[error("no keys known for DID {0}")]
    UnknownDid(String),
    #[error("internal key manager error")]
    Internal,
}

impl<T> From<std::sync::PoisonError<T>> for KeyError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Internal
    }
}

/// Key management capability supplied by the embedding application.
///
/// Private key material stays behind this trait; the agent only ever handles
/// [`Key`]s (public keys) and asks the key manager to sign or to perform key
/// agreement on its behalf.
#[async_trait]
pub trait KeyManager: Send + Sync {
    async fn create_key(&self, key_type: KeyType) -> Result<Key, KeyError>;

    async fn has_key(&self, key: &Key) -> bool;

    async fn sign(&self, key: &Key, data: &[u8]) -> Result<Vec<u8>, KeyError>;

    /// Authenticated encryption (`crypto_box`) from `sender` to `recipient`
    async fn box_encrypt(
        &self,
        sender: &Key,
        recipient: &Key,
        nonce: &[u8; BOX_NONCE_SIZE],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, KeyError>;

    /// Open a `crypto_box` addressed to `recipient`, authenticated by `sender`
    async fn box_decrypt(
        &self,
        recipient: &Key,
        sender: &Key,
        nonce: &[u8; BOX_NONCE_SIZE],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeyError>;

    /// Open an anonymous sealed box addressed to `recipient`
    async fn unseal_box(&self, recipient: &Key, ciphertext: &[u8]) -> Result<Vec<u8>, KeyError>;

    /// Associate keys with a DID we control or have resolved
    async fn bind_did(&self, did: &str, keys: Vec<Key>) -> Result<(), KeyError>;

    async fn resolve_keys_for_did(&self, did: &str) -> Result<Vec<Key>, KeyError>;
}

/// Verify an Ed25519 signature; needs no private material
pub fn verify(key: &Key, data: &[u8], signature: &[u8]) -> Result<(), KeyError> {
    let verifying_key = ed25519_verifying_key(key)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| KeyError::Signature(key.to_base58()))?;

    verifying_key
        .verify(data, &signature)
        .map_err(|_| KeyError::Signature(key.to_base58()))
}

fn ed25519_verifying_key(key: &Key) -> Result<VerifyingKey, KeyError> {
    if key.key_type() != KeyType::Ed25519 {
        return Err(KeyError::UnsupportedKeyType(key.key_type()));
    }

    let bytes: [u8; ED25519_KEY_SIZE] = key
        .public_key()
        .try_into()
        .map_err(|_| KeyError::InvalidKey)?;

    VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidKey)
}

/// The X25519 public key used for key agreement with `key`
pub fn x25519_public_key(key: &Key) -> Result<crypto_box::PublicKey, KeyError> {
    match key.key_type() {
        KeyType::Ed25519 => Ok(crypto_box::PublicKey::from(
            ed25519_verifying_key(key)?.to_montgomery().to_bytes(),
        )),
        KeyType::X25519 => {
            let bytes: [u8; ED25519_KEY_SIZE] = key
                .public_key()
                .try_into()
                .map_err(|_| KeyError::InvalidKey)?;
            Ok(crypto_box::PublicKey::from(bytes))
        }
    }
}

/// Anonymous sealed box to `recipient`
pub fn seal_box(recipient: &Key, plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
    x25519_public_key(recipient)?
        .seal(&mut crypto_box::aead::OsRng, plaintext)
        .map_err(|_| KeyError::Agreement)
}
