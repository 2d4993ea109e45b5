use rand::RngCore;
use std::sync::Arc;

use super::{
    CryptoError,
    jwe::{PackingAlgorithm, RecipientEntry, RecipientHeader, b64_decode, b64_encode},
};
use crate::{
    definitions::{Key, KeyType},
    keys::{BOX_NONCE_SIZE, KeyManager, seal_box},
};

pub(crate) const CEK_SIZE: usize = 32;

/// Wraps and unwraps content encryption keys for individual recipients using
/// the key manager's key agreement capability.
#[derive(Clone)]
pub struct KeyAgreementCodec {
    keys: Arc<dyn KeyManager>,
}

impl KeyAgreementCodec {
    pub fn new(keys: Arc<dyn KeyManager>) -> Self {
        Self { keys }
    }

    pub fn key_manager(&self) -> &Arc<dyn KeyManager> {
        &self.keys
    }

    /// Wrap `cek` for `recipient`; authenticated when `sender` is given
    pub(crate) async fn wrap(
        &self,
        cek: &[u8; CEK_SIZE],
        recipient: &Key,
        sender: Option<&Key>,
    ) -> Result<RecipientEntry, CryptoError> {
        if recipient.key_type() != KeyType::Ed25519 {
            return Err(CryptoError::Encryption(format!(
                "unsupported recipient key type {}",
                recipient.key_type()
            )));
        }

        let kid = recipient.to_base58();

        let Some(sender) = sender else {
            let encrypted_key = seal_box(recipient, cek)?;

            return Ok(RecipientEntry {
                encrypted_key: b64_encode(&encrypted_key),
                header: RecipientHeader {
                    kid,
                    sender: None,
                    iv: None,
                },
            });
        };

        let mut iv = [0u8; BOX_NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let encrypted_key = self.keys.box_encrypt(sender, recipient, &iv, cek).await?;
        let sealed_sender = seal_box(recipient, sender.to_base58().as_bytes())?;

        Ok(RecipientEntry {
            encrypted_key: b64_encode(&encrypted_key),
            header: RecipientHeader {
                kid,
                sender: Some(b64_encode(&sealed_sender)),
                iv: Some(b64_encode(&iv)),
            },
        })
    }

    /// Unwrap the content key from `entry`. Every failure collapses into
    /// [`CryptoError::Decryption`].
    pub(crate) async fn unwrap(
        &self,
        algorithm: PackingAlgorithm,
        recipient: &Key,
        entry: &RecipientEntry,
    ) -> Result<([u8; CEK_SIZE], Option<Key>), CryptoError> {
        let encrypted_key = b64_decode(&entry.encrypted_key)?;

        let (cek, sender) = match algorithm {
            PackingAlgorithm::Anoncrypt => {
                let cek = self
                    .keys
                    .unseal_box(recipient, &encrypted_key)
                    .await
                    .map_err(|_| CryptoError::Decryption)?;

                (cek, None)
            }
            PackingAlgorithm::Authcrypt => {
                let sealed_sender = entry
                    .header
                    .sender
                    .as_deref()
                    .ok_or(CryptoError::Decryption)?;
                let iv: [u8; BOX_NONCE_SIZE] = entry
                    .header
                    .iv
                    .as_deref()
                    .map(b64_decode)
                    .transpose()?
                    .and_then(|iv| iv.try_into().ok())
                    .ok_or(CryptoError::Decryption)?;

                let sender = self
                    .keys
                    .unseal_box(recipient, &b64_decode(sealed_sender)?)
                    .await
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                    .and_then(|verkey| Key::from_base58(&verkey).ok())
                    .ok_or(CryptoError::Decryption)?;

                let cek = self
                    .keys
                    .box_decrypt(recipient, &sender, &iv, &encrypted_key)
                    .await
                    .map_err(|_| CryptoError::Decryption)?;

                (cek, Some(sender))
            }
        };

        let cek: [u8; CEK_SIZE] = cek.try_into().map_err(|_| CryptoError::Decryption)?;

        Ok((cek, sender))
    }
}
