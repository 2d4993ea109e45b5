//! DIDComm v1 envelopes: one XChaCha20-Poly1305 encrypted payload, the
//! content key wrapped once per recipient with `crypto_box`.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zeroize::Zeroize;

mod error;
mod jwe;
mod key_agreement;

pub use error::CryptoError;
pub use jwe::{ENVELOPE_CONTENT_TYPE, EncryptedEnvelope, PackingAlgorithm, WireFormat, detect};
pub use key_agreement::KeyAgreementCodec;

pub(crate) use jwe::{b64_decode, b64_encode};

use jwe::{ENC_XCHACHA20POLY1305, ProtectedHeader, TYP_JWM};
use key_agreement::CEK_SIZE;

use crate::{
    definitions::{Key, PlaintextMessage},
    keys::KeyManager,
    message_type::ROUTING,
};

const TAG_SIZE: usize = 16;
const XNONCE_SIZE: usize = 24;

/// Result of opening an envelope, before the plaintext is interpreted
#[derive(Debug)]
pub struct DecryptedMessage {
    pub plaintext: Vec<u8>,
    pub sender_key: Option<Key>,
    pub recipient_key: Key,
}

/// An opened envelope with its plaintext parsed
#[derive(Debug)]
pub struct OpenedMessage {
    pub message: PlaintextMessage,
    pub sender_key: Option<Key>,
    pub recipient_key: Key,
}

/// Keys needed to pack a message for a peer service
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvelopeKeys {
    pub recipient_keys: Vec<Key>,
    pub routing_keys: Vec<Key>,
    pub sender_key: Option<Key>,
}

/// Body of a `routing/1.0/forward` message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardBody {
    pub to: String,
    pub msg: EncryptedEnvelope,
}

#[derive(Clone)]
pub struct EnvelopeService {
    codec: KeyAgreementCodec,
}

impl EnvelopeService {
    pub fn new(keys: Arc<dyn KeyManager>) -> Self {
        Self {
            codec: KeyAgreementCodec::new(keys),
        }
    }

    pub fn key_manager(&self) -> &Arc<dyn KeyManager> {
        self.codec.key_manager()
    }

    /// Encrypt `message` for every key in `recipient_keys`. The message is
    /// authcrypted when `sender_key` is given and anoncrypted otherwise.
    pub async fn seal(
        &self,
        message: &PlaintextMessage,
        recipient_keys: &[Key],
        sender_key: Option<&Key>,
    ) -> Result<EncryptedEnvelope, CryptoError> {
        if recipient_keys.is_empty() {
            return Err(CryptoError::Encryption("no recipient keys".to_string()));
        }

        let mut plaintext = message
            .to_json()
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut cek = [0u8; CEK_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut cek);

        let mut recipients = Vec::with_capacity(recipient_keys.len());
        for recipient in recipient_keys {
            match self.codec.wrap(&cek, recipient, sender_key).await {
                Ok(entry) => recipients.push(entry),
                Err(e) => {
                    cek.zeroize();
                    return Err(e);
                }
            }
        }

        let header = ProtectedHeader {
            enc: ENC_XCHACHA20POLY1305.to_string(),
            typ: TYP_JWM.to_string(),
            alg: if sender_key.is_some() {
                PackingAlgorithm::Authcrypt
            } else {
                PackingAlgorithm::Anoncrypt
            },
            recipients,
        };
        let protected = b64_encode(
            &serde_json::to_vec(&header).map_err(|e| CryptoError::Encryption(e.to_string()))?,
        );

        let cipher = XChaCha20Poly1305::new((&cek).into());
        cek.zeroize();

        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let tag = cipher
            .encrypt_in_place_detached(&nonce, protected.as_bytes(), &mut plaintext)
            .map_err(|_| CryptoError::Encryption("content encryption failed".to_string()))?;

        tracing::trace!(
            "sealed {} for {} recipient(s)",
            message.message_type,
            recipient_keys.len()
        );

        Ok(EncryptedEnvelope {
            protected,
            iv: b64_encode(&nonce),
            ciphertext: b64_encode(&plaintext),
            tag: b64_encode(&tag),
        })
    }

    /// Decrypt `envelope` with the first of `candidate_keys` it is addressed
    /// to. Any failure is reported as [`CryptoError::Decryption`] and no
    /// plaintext is returned unless the content tag verified.
    pub async fn open_raw(
        &self,
        envelope: &EncryptedEnvelope,
        candidate_keys: &[Key],
    ) -> Result<DecryptedMessage, CryptoError> {
        let header = envelope.protected_header()?;

        let mut unwrapped = None;
        for entry in &header.recipients {
            let Ok(recipient) = Key::from_base58(&entry.header.kid) else {
                continue;
            };

            if !candidate_keys.contains(&recipient) {
                continue;
            }

            if let Ok((cek, sender)) = self.codec.unwrap(header.alg, &recipient, entry).await {
                unwrapped = Some((cek, sender, recipient));
                break;
            }
        }

        let (mut cek, sender_key, recipient_key) = unwrapped.ok_or(CryptoError::Decryption)?;

        let plaintext = decrypt_content(envelope, &cek);
        cek.zeroize();

        Ok(DecryptedMessage {
            plaintext: plaintext?,
            sender_key,
            recipient_key,
        })
    }

    /// Open and parse an envelope. A plaintext that is not a valid message is
    /// reported as [`crate::Error::InvalidMessage`], not as a decryption failure.
    pub async fn open(
        &self,
        envelope: &EncryptedEnvelope,
        candidate_keys: &[Key],
    ) -> Result<OpenedMessage, crate::Error> {
        let decrypted = self.open_raw(envelope, candidate_keys).await?;
        let message = PlaintextMessage::from_json(&decrypted.plaintext)
            .map_err(|e| crate::Error::InvalidMessage(e.to_string()))?;

        Ok(OpenedMessage {
            message,
            sender_key: decrypted.sender_key,
            recipient_key: decrypted.recipient_key,
        })
    }

    /// Keys of `envelope` recipients that our key manager holds
    pub async fn local_recipient_keys(&self, envelope: &EncryptedEnvelope) -> Vec<Key> {
        let Ok(recipients) = envelope.recipient_keys() else {
            return Vec::new();
        };

        let mut local = Vec::new();
        for key in recipients {
            if self.key_manager().has_key(&key).await {
                local.push(key);
            }
        }

        local
    }

    /// Seal `message` for a service and wrap it in one forward message per
    /// routing key, innermost first.
    pub async fn seal_for_service(
        &self,
        message: &PlaintextMessage,
        keys: &EnvelopeKeys,
    ) -> Result<EncryptedEnvelope, CryptoError> {
        let mut envelope = self
            .seal(message, &keys.recipient_keys, keys.sender_key.as_ref())
            .await?;

        let mut to = keys
            .recipient_keys
            .first()
            .map(Key::to_base58)
            .ok_or_else(|| CryptoError::Encryption("no recipient keys".to_string()))?;

        for routing_key in &keys.routing_keys {
            let forward = forward_message(to, envelope)?;
            envelope = self.seal(&forward, std::slice::from_ref(routing_key), None).await?;
            to = routing_key.to_base58();
        }

        Ok(envelope)
    }
}

fn decrypt_content(envelope: &EncryptedEnvelope, cek: &[u8; CEK_SIZE]) -> Result<Vec<u8>, CryptoError> {
    let nonce: [u8; XNONCE_SIZE] = b64_decode(&envelope.iv)?
        .try_into()
        .map_err(|_| CryptoError::Decryption)?;
    let tag: [u8; TAG_SIZE] = b64_decode(&envelope.tag)?
        .try_into()
        .map_err(|_| CryptoError::Decryption)?;
    let mut content = b64_decode(&envelope.ciphertext)?;

    let cipher = XChaCha20Poly1305::new(cek.into());
    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(&nonce),
            envelope.protected.as_bytes(),
            &mut content,
            (&tag).into(),
        )
        .map_err(|_| CryptoError::Decryption)?;

    Ok(content)
}

/// Build a `forward` message delivering `envelope` to `to`
pub fn forward_message(to: String, envelope: EncryptedEnvelope) -> Result<PlaintextMessage, CryptoError> {
    PlaintextMessage::new(
        ROUTING.message_type("forward"),
        &ForwardBody { to, msg: envelope },
    )
    .map_err(|e| CryptoError::Encryption(e.to_string()))
}
