use serde::{Deserialize, Serialize};

use super::{
    messages::Invitation,
    state::{DidExchangeRole, DidExchangeState},
};
use crate::{
    definitions::{DidCommService, DidDoc, Key},
    state_machine::ProtocolRecord,
    storage::{Record, Tags},
};

/// A DID exchange and, once completed, the connection it established
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub state: DidExchangeState,
    pub role: DidExchangeRole,
    /// The invitation id; shared by every message of the exchange
    pub thread_id: String,
    pub my_did: Option<String>,
    pub my_key: Option<Key>,
    /// Key we invited with; only set on the inviter's side
    pub invitation_key: Option<Key>,
    pub invitation: Option<Invitation>,
    pub their_did: Option<String>,
    pub their_did_doc: Option<DidDoc>,
    pub their_label: Option<String>,
    pub error_message: Option<String>,
    pub last_inbound_message_id: Option<String>,
    #[serde(skip)]
    pub version: u64,
}

impl ConnectionRecord {
    pub(crate) fn new(
        role: DidExchangeRole,
        thread_id: impl Into<String>,
        invitation: Invitation,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: DidExchangeState::Start,
            role,
            thread_id: thread_id.into(),
            my_did: None,
            my_key: None,
            invitation_key: None,
            their_label: (role == DidExchangeRole::Requester).then(|| invitation.label.clone()),
            invitation: Some(invitation),
            their_did: None,
            their_did_doc: None,
            error_message: None,
            last_inbound_message_id: None,
            version: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == DidExchangeState::Completed
    }

    /// Where messages to the peer go: their DID document once exchanged,
    /// the invitation's services before that
    pub fn their_services(&self) -> Vec<DidCommService> {
        if let Some(doc) = &self.their_did_doc {
            if !doc.service.is_empty() {
                return doc.service.clone();
            }
        }

        match (&self.invitation, self.role) {
            (Some(invitation), DidExchangeRole::Requester) => invitation.services.clone(),
            _ => Vec::new(),
        }
    }

    pub fn their_key(&self) -> Option<&Key> {
        self.their_did_doc
            .as_ref()
            .and_then(|doc| doc.recipient_keys().next())
    }
}

impl Record for ConnectionRecord {
    const RECORD_TYPE: &'static str = "ConnectionRecord";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> Tags {
        let mut tags = Tags::new();
        tags.insert("thread_id".to_string(), self.thread_id.clone());
        tags.insert("state".to_string(), self.state.to_string());
        tags.insert("role".to_string(), self.role.to_string());

        if let Some(key) = &self.my_key {
            tags.insert("my_key".to_string(), key.to_base58());
        }
        if let Some(key) = self.their_key() {
            tags.insert("their_key".to_string(), key.to_base58());
        }
        if let Some(key) = &self.invitation_key {
            tags.insert("invitation_key".to_string(), key.to_base58());
        }

        tags
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl ProtocolRecord for ConnectionRecord {
    type State = DidExchangeState;
    type Role = DidExchangeRole;

    fn state(&self) -> DidExchangeState {
        self.state
    }

    fn set_state(&mut self, state: DidExchangeState) {
        self.state = state;
    }

    fn role(&self) -> DidExchangeRole {
        self.role
    }

    fn thread_id(&self) -> &str {
        &self.thread_id
    }

    fn last_inbound_message_id(&self) -> Option<&str> {
        self.last_inbound_message_id.as_deref()
    }

    fn set_last_inbound_message_id(&mut self, message_id: Option<String>) {
        self.last_inbound_message_id = message_id;
    }
}
