use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::{ProofRole, ProofState};
use crate::{
    state_machine::ProtocolRecord,
    storage::{Record, Tags},
};

/// One present-proof exchange with the format payloads of every step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProofExchangeRecord {
    pub id: String,
    pub connection_id: String,
    pub thread_id: String,
    pub state: ProofState,
    pub role: ProofRole,
    /// Attachment format, e.g. `dif/presentation-exchange/definitions@v1.0`
    pub format: Option<String>,
    pub proposal: Option<Value>,
    pub request: Option<Value>,
    pub presentation: Option<Value>,
    /// Outcome of verifying the presentation; verifier only
    pub verified: Option<bool>,
    pub error_message: Option<String>,
    pub last_inbound_message_id: Option<String>,
    #[serde(skip)]
    pub version: u64,
}

impl ProofExchangeRecord {
    pub(crate) fn new(connection_id: impl Into<String>, thread_id: impl Into<String>, role: ProofRole) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection_id.into(),
            thread_id: thread_id.into(),
            state: ProofState::Start,
            role,
            format: None,
            proposal: None,
            request: None,
            presentation: None,
            verified: None,
            error_message: None,
            last_inbound_message_id: None,
            version: 0,
        }
    }
}

impl Record for ProofExchangeRecord {
    const RECORD_TYPE: &'static str = "ProofExchangeRecord";

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

impl ProtocolRecord for ProofExchangeRecord {
    type State = ProofState;
    type Role = ProofRole;

    fn state(&self) -> ProofState {
        self.state
    }

    fn set_state(&mut self, state: ProofState) {
        self.state = state;
    }

    fn role(&self) -> ProofRole {
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
