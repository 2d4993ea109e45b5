use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{ED25519_KEY_SIZE, Key, KeyType};

const DID_KEY_PREFIX: &str = "did:key:";
const MULTICODEC_ED25519: [u8; 2] = [0xed, 0x01];
const MULTICODEC_X25519: [u8; 2] = [0xec, 0x01];

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("invalid base58 encoding: {0}")]
    Base58(String),
    #[error("unsupported multicodec prefix")]
    UnknownCodec,
    #[error("unsupported multibase encoding, expected base58btc")]
    Multibase,
    #[error("invalid key length {0}")]
    Length(usize),
}

impl Key {
    /// Raw base58 encoding of the public key, as used by `kid` and legacy
    /// `recipientKeys` entries
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.public_key).into_string()
    }

    /// Parse a raw base58 Ed25519 verkey
    pub fn from_base58(value: &str) -> Result<Self, KeyParseError> {
        let bytes = bs58::decode(value)
            .into_vec()
            .map_err(|e| KeyParseError::Base58(e.to_string()))?;

        if bytes.len() != ED25519_KEY_SIZE {
            return Err(KeyParseError::Length(bytes.len()));
        }

        Ok(Key::new(KeyType::Ed25519, bytes))
    }

    /// Multibase (base58btc) encoded multicodec key, e.g. `z6Mk...`
    pub fn fingerprint(&self) -> String {
        let codec = match self.key_type {
            KeyType::Ed25519 => MULTICODEC_ED25519,
            KeyType::X25519 => MULTICODEC_X25519,
        };

        let mut bytes = Vec::with_capacity(codec.len() + self.public_key.len());
        bytes.extend_from_slice(&codec);
        bytes.extend_from_slice(&self.public_key);

        format!("z{}", bs58::encode(bytes).into_string())
    }

    pub fn from_fingerprint(value: &str) -> Result<Self, KeyParseError> {
        let encoded = value.strip_prefix('z').ok_or(KeyParseError::Multibase)?;
        let bytes = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| KeyParseError::Base58(e.to_string()))?;

        let (key_type, key) = match bytes.split_at_checked(2) {
            Some((codec, key)) if codec == MULTICODEC_ED25519 => (KeyType::Ed25519, key),
            Some((codec, key)) if codec == MULTICODEC_X25519 => (KeyType::X25519, key),
            _ => return Err(KeyParseError::UnknownCodec),
        };

        if key.len() != ED25519_KEY_SIZE {
            return Err(KeyParseError::Length(key.len()));
        }

        Ok(Key::new(key_type, key))
    }

    pub fn to_did_key(&self) -> String {
        format!("{DID_KEY_PREFIX}{}", self.fingerprint())
    }

    /// Accepts `did:key:z...`, optionally with a `#fragment`, a bare
    /// fingerprint or a raw base58 Ed25519 verkey.
    pub fn parse(value: &str) -> Result<Self, KeyParseError> {
        if let Some(rest) = value.strip_prefix(DID_KEY_PREFIX) {
            let fingerprint = rest.split('#').next().unwrap_or(rest);
            return Self::from_fingerprint(fingerprint);
        }

        if value.starts_with("z6") {
            if let Ok(key) = Self::from_fingerprint(value) {
                return Ok(key);
            }
        }

        Self::from_base58(value)
    }
}

impl TryFrom<&str> for Key {
    type Error = KeyParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Key::parse(value)
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_did_key())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Key::parse(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_did_key_fingerprint() {
        // did:key test vector for an Ed25519 key
        let key = Key::parse("did:key:z6MkpTHR8VNsBxYAAWHut2Geadd9jSwuBV8xRoAnwWsdvktH").unwrap();
        assert_eq!(key.key_type(), KeyType::Ed25519);
        assert_eq!(
            key.to_did_key(),
            "did:key:z6MkpTHR8VNsBxYAAWHut2Geadd9jSwuBV8xRoAnwWsdvktH"
        );

        let from_base58 = Key::parse(&key.to_base58()).unwrap();
        assert_eq!(from_base58, key);
    }

    #[test]
    fn test_reject_bad_keys() {
        assert_eq!(Key::parse("did:key:abc"), Err(KeyParseError::Multibase));
        assert!(matches!(Key::parse("0OIl"), Err(KeyParseError::Base58(_))));
        assert_eq!(Key::parse("3mJr7AoUXx2Wqd"), Err(KeyParseError::Length(10)));
    }

    #[test]
    fn test_serde_as_did_key() {
        let key = Key::ed25519([7u8; 32]);
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.starts_with("\"did:key:z6Mk"));
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
