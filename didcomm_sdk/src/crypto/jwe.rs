use base64ct::{Base64UrlUnpadded, Encoding};
use serde::{Deserialize, Serialize};

use super::CryptoError;
use crate::definitions::{Key, PlaintextMessage};

pub(crate) const ENC_XCHACHA20POLY1305: &str = "xchacha20poly1305_ietf";
pub(crate) const TYP_JWM: &str = "JWM/1.0";

/// Media type of an encrypted DIDComm v1 message
pub const ENVELOPE_CONTENT_TYPE: &str = "application/didcomm-envelope-enc";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackingAlgorithm {
    Authcrypt,
    Anoncrypt,
}

/// JWE-shaped encrypted message. The ciphertext and tag are shared by all
/// recipients; each recipient gets its own wrapped content key in the
/// protected header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub protected: String,
    pub iv: String,
    pub ciphertext: String,
    pub tag: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ProtectedHeader {
    pub enc: String,
    pub typ: String,
    pub alg: PackingAlgorithm,
    pub recipients: Vec<RecipientEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct RecipientEntry {
    pub encrypted_key: String,
    pub header: RecipientHeader,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct RecipientHeader {
    pub kid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
}

pub(crate) fn b64_encode(data: &[u8]) -> String {
    Base64UrlUnpadded::encode_string(data)
}

/// Accepts both padded and unpadded base64url
pub(crate) fn b64_decode(data: &str) -> Result<Vec<u8>, CryptoError> {
    Base64UrlUnpadded::decode_vec(data.trim_end_matches('=')).map_err(|_| CryptoError::Decryption)
}

impl EncryptedEnvelope {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub(crate) fn protected_header(&self) -> Result<ProtectedHeader, CryptoError> {
        let header = b64_decode(&self.protected)?;
        let header: ProtectedHeader =
            serde_json::from_slice(&header).map_err(|_| CryptoError::Decryption)?;

        if header.enc != ENC_XCHACHA20POLY1305 {
            return Err(CryptoError::Decryption);
        }

        Ok(header)
    }

    /// Keys this envelope is addressed to, as listed in the protected header
    pub fn recipient_keys(&self) -> Result<Vec<Key>, CryptoError> {
        self.protected_header()?
            .recipients
            .iter()
            .map(|r| Key::from_base58(&r.header.kid).map_err(|_| CryptoError::Decryption))
            .collect()
    }

    pub fn algorithm(&self) -> Result<PackingAlgorithm, CryptoError> {
        Ok(self.protected_header()?.alg)
    }
}

/// A wire message after format detection
#[derive(Debug)]
pub enum WireFormat {
    Encrypted(EncryptedEnvelope),
    Plaintext(PlaintextMessage),
    Unknown,
}

/// Detect whether `bytes` hold an encrypted envelope or a plaintext message
pub fn detect(bytes: &[u8]) -> WireFormat {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
        return WireFormat::Unknown;
    };

    if value.get("protected").is_some() && value.get("ciphertext").is_some() {
        return match serde_json::from_value(value) {
            Ok(envelope) => WireFormat::Encrypted(envelope),
            Err(_) => WireFormat::Unknown,
        };
    }

    if value.get("@type").is_some() {
        return match serde_json::from_value(value) {
            Ok(message) => WireFormat::Plaintext(message),
            Err(_) => WireFormat::Unknown,
        };
    }

    WireFormat::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_wire_format() {
        let envelope = EncryptedEnvelope {
            protected: "e30".into(),
            iv: "aXY".into(),
            ciphertext: "Y3Q".into(),
            tag: "dGFn".into(),
        };
        assert!(matches!(
            detect(&envelope.to_json().unwrap()),
            WireFormat::Encrypted(e) if e == envelope
        ));

        let plaintext = br#"{"@id":"1","@type":"https://didcomm.org/trust_ping/1.0/ping"}"#;
        assert!(matches!(detect(plaintext), WireFormat::Plaintext(m) if m.id == "1"));

        assert!(matches!(detect(b"not json"), WireFormat::Unknown));
        assert!(matches!(detect(br#"{"hello":"world"}"#), WireFormat::Unknown));
    }

    #[test]
    fn test_base64_padding_tolerated() {
        assert_eq!(b64_decode("aGk=").unwrap(), b"hi");
        assert_eq!(b64_decode("aGk").unwrap(), b"hi");
        assert_eq!(b64_decode("a*"), Err(CryptoError::Decryption));
    }
}
