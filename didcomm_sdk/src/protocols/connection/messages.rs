use serde::{Deserialize, Serialize};

use crate::{
    Error,
    crypto::{b64_decode, b64_encode},
    definitions::{Attachment, DidCommService, DidDoc, Key},
    message_type::{DID_EXCHANGE, OUT_OF_BAND},
};

pub const INVITATION: &str = "invitation";
pub const REQUEST: &str = "request";
pub const RESPONSE: &str = "response";
pub const COMPLETE: &str = "complete";
/// A trust ping completes a connection just like `complete`
pub const PING: &str = "ping";

const INVITATION_QUERY: &str = "oob";
const DID_DOC_MIME_TYPE: &str = "application/json";

/// An out-of-band invitation to a DID exchange
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type")]
    pub message_type: String,
    pub label: String,
    pub handshake_protocols: Vec<String>,
    pub services: Vec<DidCommService>,
}

impl Invitation {
    pub fn new(label: impl Into<String>, services: Vec<DidCommService>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type: OUT_OF_BAND.message_type(INVITATION),
            label: label.into(),
            handshake_protocols: vec![DID_EXCHANGE.uri()],
            services,
        }
    }

    /// The key requests to this invitation are encrypted for
    pub fn recipient_key(&self) -> Option<&Key> {
        self.services.first().and_then(|s| s.recipient_keys.first())
    }

    /// `base_url` with the invitation in its `oob` query parameter
    pub fn to_url(&self, base_url: &str) -> Result<String, Error> {
        let mut url = url::Url::parse(base_url)
            .map_err(|e| Error::InvalidMessage(format!("invalid invitation base url: {e}")))?;
        let encoded = b64_encode(&serde_json::to_vec(self)?);
        url.query_pairs_mut().append_pair(INVITATION_QUERY, &encoded);

        Ok(url.to_string())
    }

    pub fn from_url(invitation_url: &str) -> Result<Self, Error> {
        let url = url::Url::parse(invitation_url)
            .map_err(|e| Error::InvalidMessage(format!("invalid invitation url: {e}")))?;

        let (_, encoded) = url
            .query_pairs()
            .find(|(name, _)| name == INVITATION_QUERY)
            .ok_or_else(|| Error::InvalidMessage("invitation url has no oob parameter".to_string()))?;

        let json = b64_decode(&encoded)
            .map_err(|_| Error::InvalidMessage("invitation is not base64url".to_string()))?;

        Ok(serde_json::from_slice(&json)?)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub label: String,
    pub did: String,
    #[serde(rename = "did_doc~attach")]
    pub did_doc_attach: Attachment,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub did: String,
    #[serde(rename = "did_doc~attach")]
    pub did_doc_attach: Attachment,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Complete {}

pub(crate) fn did_doc_attachment(doc: &DidDoc) -> Result<Attachment, Error> {
    Ok(Attachment::base64(
        uuid::Uuid::new_v4().to_string(),
        DID_DOC_MIME_TYPE,
        &serde_json::to_vec(doc)?,
    ))
}

pub(crate) fn did_doc_from_attachment(attachment: &Attachment) -> Option<DidDoc> {
    attachment
        .decoded()
        .and_then(|json| serde_json::from_slice(&json).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::KeyType;
    use crate::keys::{InMemoryKeyManager, KeyManager};

    #[tokio::test]
    async fn test_invitation_url() {
        let keys = InMemoryKeyManager::default();
        let key = keys.create_key(KeyType::Ed25519).await.unwrap();

        let invitation = Invitation::new(
            "alice",
            vec![DidCommService {
                id: "#inline".to_string(),
                service_endpoint: "https://alice.example/didcomm".to_string(),
                recipient_keys: vec![key.clone()],
                routing_keys: Vec::new(),
                priority: 0,
            }],
        );

        let url = invitation.to_url("https://alice.example/invite").unwrap();
        assert!(url.starts_with("https://alice.example/invite?oob="));

        let parsed = Invitation::from_url(&url).unwrap();
        assert_eq!(parsed, invitation);
        assert_eq!(parsed.recipient_key(), Some(&key));
        assert_eq!(
            parsed.message_type,
            "https://didcomm.org/out-of-band/1.1/invitation"
        );

        assert!(Invitation::from_url("https://alice.example/invite?c_i=abc").is_err());
        assert!(Invitation::from_url("https://alice.example/invite?oob=!!").is_err());
    }

    #[test]
    fn test_did_doc_attachment() {
        let doc = DidDoc {
            id: "did:example:123".to_string(),
            service: Vec::new(),
        };

        let attachment = did_doc_attachment(&doc).unwrap();
        assert_eq!(did_doc_from_attachment(&attachment), Some(doc));
    }
}
