use async_trait::async_trait;
use crypto_box::{SalsaBox, SecretKey, aead::Aead};
use ed25519_dalek::{Signer, SigningKey};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use zeroize::Zeroize;

use super::{BOX_NONCE_SIZE, KeyError, KeyManager, x25519_public_key};
use crate::definitions::{ED25519_KEY_SIZE, Key, KeyType, PrivateKeyData};

/// Key manager holding Ed25519 keys in memory; intended for tests, demos and
/// short lived agents.
#[derive(Clone, Default)]
pub struct InMemoryKeyManager {
    keys: Arc<RwLock<HashMap<Key, PrivateKeyData>>>,
    dids: Arc<RwLock<HashMap<String, Vec<Key>>>>,
}

impl std::fmt::Debug for InMemoryKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.keys.read().map(|keys| keys.len()).unwrap_or_default();
        f.debug_struct("InMemoryKeyManager")
            .field("keys", &count)
            .finish()
    }
}

impl Drop for InMemoryKeyManager {
    fn drop(&mut self) {
        if Arc::strong_count(&self.keys) == 1 {
            if let Ok(mut keys) = self.keys.write() {
                keys.values_mut().for_each(Zeroize::zeroize);
            }
        }
    }
}

impl InMemoryKeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Import an Ed25519 key pair from its 32 byte seed
    pub fn import_ed25519_seed(&self, seed: [u8; ED25519_KEY_SIZE]) -> Result<Key, KeyError> {
        let signing_key = SigningKey::from_bytes(&seed);
        let key = Key::ed25519(signing_key.verifying_key().to_bytes());

        self.keys
            .write()?
            .insert(key.clone(), PrivateKeyData::from(seed.to_vec()));

        Ok(key)
    }

    fn signing_key(&self, key: &Key) -> Result<SigningKey, KeyError> {
        let keys = self.keys.read()?;
        let private = keys
            .get(key)
            .ok_or_else(|| KeyError::UnknownKey(key.to_base58()))?;

        let seed: [u8; ED25519_KEY_SIZE] = private
            .as_ref()
            .try_into()
            .map_err(|_| KeyError::InvalidKey)?;

        Ok(SigningKey::from_bytes(&seed))
    }

    fn x25519_secret_key(&self, key: &Key) -> Result<SecretKey, KeyError> {
        match key.key_type() {
            KeyType::Ed25519 => Ok(SecretKey::from(self.signing_key(key)?.to_scalar_bytes())),
            other => Err(KeyError::UnsupportedKeyType(other)),
        }
    }
}

#[async_trait]
impl KeyManager for InMemoryKeyManager {
    async fn create_key(&self, key_type: KeyType) -> Result<Key, KeyError> {
        if key_type != KeyType::Ed25519 {
            return Err(KeyError::UnsupportedKeyType(key_type));
        }

        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        self.import_ed25519_seed(signing_key.to_bytes())
    }

    async fn has_key(&self, key: &Key) -> bool {
        self.keys
            .read()
            .map(|keys| keys.contains_key(key))
            .unwrap_or(false)
    }

    async fn sign(&self, key: &Key, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        Ok(self.signing_key(key)?.sign(data).to_bytes().to_vec())
    }

    async fn box_encrypt(
        &self,
        sender: &Key,
        recipient: &Key,
        nonce: &[u8; BOX_NONCE_SIZE],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, KeyError> {
        let sender_box = SalsaBox::new(
            &x25519_public_key(recipient)?,
            &self.x25519_secret_key(sender)?,
        );

        sender_box
            .encrypt(nonce.into(), plaintext)
            .map_err(|_| KeyError::Agreement)
    }

    async fn box_decrypt(
        &self,
        recipient: &Key,
        sender: &Key,
        nonce: &[u8; BOX_NONCE_SIZE],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeyError> {
        let receiver_box = SalsaBox::new(
            &x25519_public_key(sender)?,
            &self.x25519_secret_key(recipient)?,
        );

        receiver_box
            .decrypt(nonce.into(), ciphertext)
            .map_err(|_| KeyError::Agreement)
    }

    async fn unseal_box(&self, recipient: &Key, ciphertext: &[u8]) -> Result<Vec<u8>, KeyError> {
        self.x25519_secret_key(recipient)?
            .unseal(ciphertext)
            .map_err(|_| KeyError::Agreement)
    }

    async fn bind_did(&self, did: &str, keys: Vec<Key>) -> Result<(), KeyError> {
        self.dids.write()?.insert(did.to_string(), keys);

        Ok(())
    }

    async fn resolve_keys_for_did(&self, did: &str) -> Result<Vec<Key>, KeyError> {
        if let Some(keys) = self.dids.read()?.get(did) {
            return Ok(keys.clone());
        }

        // did:key carries its own key
        if did.starts_with("did:key:") {
            return Ok(vec![Key::parse(did).map_err(|_| KeyError::UnknownDid(did.to_string()))?]);
        }

        Err(KeyError::UnknownDid(did.to_string()))
    }
}
