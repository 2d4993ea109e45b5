use serde::{Deserialize, Serialize};

use super::state::{MediationRole, MediationState};
use crate::{
    definitions::Key,
    state_machine::ProtocolRecord,
    storage::{Record, Tags},
};

/// A mediation relationship over one connection, kept by both sides
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediationRecord {
    pub id: String,
    pub connection_id: String,
    pub thread_id: String,
    pub state: MediationState,
    pub role: MediationRole,
    /// Where the recipient's messages are sent once granted
    pub endpoint: Option<String>,
    pub routing_keys: Vec<Key>,
    /// base58 keys registered with keylist updates; mediator only
    #[serde(default)]
    pub recipient_keys: Vec<String>,
    pub last_inbound_message_id: Option<String>,
    #[serde(skip)]
    pub version: u64,
}

impl MediationRecord {
    pub(crate) fn new(connection_id: impl Into<String>, thread_id: impl Into<String>, role: MediationRole) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection_id.into(),
            thread_id: thread_id.into(),
            state: MediationState::Start,
            role,
            endpoint: None,
            routing_keys: Vec::new(),
            recipient_keys: Vec::new(),
            last_inbound_message_id: None,
            version: 0,
        }
    }

    pub fn is_granted(&self) -> bool {
        self.state == MediationState::Granted
    }
}

impl Record for MediationRecord {
    const RECORD_TYPE: &'static str = "MediationRecord";

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

impl ProtocolRecord for MediationRecord {
    type State = MediationState;
    type Role = MediationRole;

    fn state(&self) -> MediationState {
        self.state
    }

    fn set_state(&mut self, state: MediationState) {
        self.state = state;
    }

    fn role(&self) -> MediationRole {
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
