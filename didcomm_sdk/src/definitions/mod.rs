use core::fmt;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt::{Debug, Display};
use zeroize::Zeroize;

use crate::message_type::{MessageTypeError, MessageTypeIdentifier};

mod conversions;

pub use conversions::KeyParseError;

/// Bytes as they travel over a transport: either an encrypted envelope or,
/// for debugging only, a plaintext JSON message.
pub type WireMessage = Vec<u8>;

/// Service endpoint value that marks a queue-only (pickup) service.
pub const QUEUE_ENDPOINT: &str = "didcomm:transport/queue";

pub const ED25519_KEY_SIZE: usize = 32;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum KeyType {
    Ed25519,
    X25519,
}

impl Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Ed25519 => write!(f, "Ed25519"),
            KeyType::X25519 => write!(f, "X25519"),
        }
    }
}

/// A public key, as published in invitations, DID documents and envelope
/// headers. Private material never leaves the [`KeyManager`](crate::keys::KeyManager).
///
/// Keys serialize as `did:key` strings so the key type travels with them.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key {
    key_type: KeyType,
    public_key: Vec<u8>,
}

impl Key {
    pub fn new(key_type: KeyType, public_key: impl Into<Vec<u8>>) -> Self {
        Self {
            key_type,
            public_key: public_key.into(),
        }
    }

    pub fn ed25519(public_key: [u8; ED25519_KEY_SIZE]) -> Self {
        Self::new(KeyType::Ed25519, public_key)
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}, {})", self.key_type, self.to_base58())
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}

#[derive(Clone, Zeroize)]
pub struct PrivateKeyData(Vec<u8>);

impl Debug for PrivateKeyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKeyData([redacted])")
    }
}

impl AsRef<[u8]> for PrivateKeyData {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for PrivateKeyData {
    fn from(data: Vec<u8>) -> PrivateKeyData {
        PrivateKeyData(data)
    }
}

/// `~thread` decorator
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadDecorator {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnRoute {
    None,
    All,
    Thread,
}

/// `~transport` decorator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportDecorator {
    pub return_route: ReturnRoute,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_route_thread: Option<String>,
}

/// A decrypted DIDComm v1 message.
///
/// The protocol specific fields live in `body`; use [`PlaintextMessage::body_as`]
/// to read them into a typed struct.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlaintextMessage {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type")]
    pub message_type: String,
    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadDecorator>,
    #[serde(rename = "~transport", default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportDecorator>,
    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

impl PlaintextMessage {
    /// Build a message of type `message_type` with a fresh id from a serializable body
    pub fn new(message_type: String, body: &impl Serialize) -> Result<Self, serde_json::Error> {
        let body = match serde_json::to_value(body)? {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(serde::ser::Error::custom(format!(
                    "message body must be a JSON object, got {other}"
                )));
            }
        };

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type,
            thread: None,
            transport: None,
            body,
        })
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(serde_json::Value::Object(self.body.clone()))
    }

    pub fn parsed_type(&self) -> Result<MessageTypeIdentifier, MessageTypeError> {
        MessageTypeIdentifier::parse(&self.message_type)
    }

    /// The thread this message belongs to; a message without `~thread.thid`
    /// starts its own thread.
    pub fn thread_id(&self) -> &str {
        self.thread
            .as_ref()
            .and_then(|t| t.thid.as_deref())
            .unwrap_or(&self.id)
    }

    pub fn parent_thread_id(&self) -> Option<&str> {
        self.thread.as_ref().and_then(|t| t.pthid.as_deref())
    }

    pub fn set_thread(&mut self, thid: Option<String>, pthid: Option<String>) {
        self.thread = Some(ThreadDecorator { thid, pthid });
    }

    pub fn with_thread(mut self, thid: impl Into<String>) -> Self {
        let pthid = self.thread.take().and_then(|t| t.pthid);
        self.set_thread(Some(thid.into()), pthid);
        self
    }

    pub fn with_parent_thread(mut self, pthid: impl Into<String>) -> Self {
        let thid = self.thread.take().and_then(|t| t.thid);
        self.set_thread(thid, Some(pthid.into()));
        self
    }

    pub fn set_return_route(&mut self, return_route: ReturnRoute) {
        self.transport = Some(TransportDecorator {
            return_route,
            return_route_thread: None,
        });
    }

    pub fn return_route(&self) -> ReturnRoute {
        self.transport
            .as_ref()
            .map(|t| t.return_route)
            .unwrap_or(ReturnRoute::None)
    }

    pub fn has_any_return_route(&self) -> bool {
        matches!(self.return_route(), ReturnRoute::All | ReturnRoute::Thread)
    }

    /// Whether a reply on thread `thread_id` may use the channel this message arrived on
    pub fn allows_return_route_for(&self, thread_id: &str) -> bool {
        match self.return_route() {
            ReturnRoute::All => true,
            ReturnRoute::Thread => {
                let routed_thread = self
                    .transport
                    .as_ref()
                    .and_then(|t| t.return_route_thread.as_deref())
                    .unwrap_or(self.thread_id());
                routed_thread == thread_id
            }
            ReturnRoute::None => false,
        }
    }
}

/// A DIDComm service entry of a DID document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidCommService {
    pub id: String,
    pub service_endpoint: String,
    pub recipient_keys: Vec<Key>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_keys: Vec<Key>,
    #[serde(default)]
    pub priority: u32,
}

impl DidCommService {
    pub fn is_queue(&self) -> bool {
        self.service_endpoint == QUEUE_ENDPOINT
    }

    /// The URL scheme of the endpoint, e.g. `https` or `ws`
    pub fn scheme(&self) -> Option<&str> {
        self.service_endpoint.split_once(':').map(|(scheme, _)| scheme)
    }
}

/// The subset of a DID document a DIDComm agent needs to reach its peer.
/// Resolving arbitrary DID methods is left to the embedding application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidDoc {
    pub id: String,
    #[serde(default)]
    pub service: Vec<DidCommService>,
}

impl DidDoc {
    pub fn recipient_keys(&self) -> impl Iterator<Item = &Key> {
        self.service.iter().flat_map(|s| s.recipient_keys.iter())
    }
}

/// Status of an outbound send, reported through [`AgentEvent::MessageSent`](crate::events::AgentEvent)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundSendStatus {
    SentToSession,
    SentToTransport,
    QueuedForPickup,
    Undeliverable,
}

/// A message attachment (`~attach`) with inline data
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "mime-type", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub data: AttachmentData,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jws: Option<AttachmentSignature>,
}

/// Detached Ed25519 signature over the `base64` attachment data
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentSignature {
    pub header: SignatureHeader,
    /// base64url signature bytes
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureHeader {
    /// `did:key` of the signing key
    pub kid: String,
}

impl Attachment {
    pub fn json(id: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            mime_type: Some("application/json".to_string()),
            data: AttachmentData {
                json: Some(value),
                ..Default::default()
            },
        }
    }

    pub fn base64(id: impl Into<String>, mime_type: &str, data: &[u8]) -> Self {
        Self {
            id: id.into(),
            mime_type: Some(mime_type.to_string()),
            data: AttachmentData {
                base64: Some(crate::crypto::b64_encode(data)),
                ..Default::default()
            },
        }
    }

    /// The decoded `base64` data
    pub fn decoded(&self) -> Option<Vec<u8>> {
        self.data
            .base64
            .as_deref()
            .and_then(|data| crate::crypto::b64_decode(data).ok())
    }
}

/// Attachment format descriptor used by the credential and proof protocols
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentFormat {
    pub attach_id: String,
    pub format: String,
}
