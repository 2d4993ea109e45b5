use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::{CredentialRole, CredentialState};
use crate::{
    state_machine::ProtocolRecord,
    storage::{Record, Tags},
};

/// One issue-credential exchange with the format payloads of every step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CredentialExchangeRecord {
    pub id: String,
    pub connection_id: String,
    pub thread_id: String,
    pub state: CredentialState,
    pub role: CredentialRole,
    /// Attachment format, e.g. `aries/ld-proof-vc-detail@v1.0`
    pub format: Option<String>,
    pub proposal: Option<Value>,
    pub offer: Option<Value>,
    pub request: Option<Value>,
    pub credential: Option<Value>,
    pub error_message: Option<String>,
    pub last_inbound_message_id: Option<String>,
    #[serde(skip)]
    pub version: u64,
}

impl CredentialExchangeRecord {
    pub(crate) fn new(connection_id: impl Into<String>, thread_id: impl Into<String>, role: CredentialRole) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection_id.into(),
            thread_id: thread_id.into(),
            state: CredentialState::Start,
            role,
            format: None,
            proposal: None,
            offer: None,
            request: None,
            credential: None,
            error_message: None,
            last_inbound_message_id: None,
            version: 0,
        }
    }
}

impl Record for CredentialExchangeRecord {
    const RECORD_TYPE: &'static str = "CredentialExchangeRecord";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> Tags {
        let mut tags = Tags::new();
        tags.insert("thread_id".to_string(), self.thread_id.clone());
        tags.insert("connection_id".to_string(), self.connection_id.clone());
        tags.insert("state".to_string(), self.state.to_string());
        tags.insert("role".to_string(), self.role.to_string());

        tags
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl ProtocolRecord for CredentialExchangeRecord {
    type State = CredentialState;
    type Role = CredentialRole;

    fn state(&self) -> CredentialState {
        self.state
    }

    fn set_state(&mut self, state: CredentialState) {
        self.state = state;
    }

    fn role(&self) -> CredentialRole {
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
