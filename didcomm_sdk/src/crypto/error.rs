use crate::keys::KeyError;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encryption(String),
    /// Carries no cause: callers must not learn which recipient or which
    /// step of the unwrap failed.
    #[error("decryption failed")]
    Decryption,
    #[error("key management failed: {0}")]
    Key(#[from] KeyError),
}
