use serde::{Deserialize, Serialize};

use crate::definitions::Key;

pub const MEDIATE_REQUEST: &str = "mediate-request";
pub const MEDIATE_GRANT: &str = "mediate-grant";
pub const MEDIATE_DENY: &str = "mediate-deny";
pub const KEYLIST_UPDATE: &str = "keylist-update";
pub const KEYLIST_UPDATE_RESPONSE: &str = "keylist-update-response";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediateRequest {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediateGrant {
    pub endpoint: String,
    pub routing_keys: Vec<Key>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediateDeny {}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeylistAction {
    Add,
    Remove,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeylistResult {
    Success,
    NoChange,
    ClientError,
    ServerError,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistUpdateItem {
    /// base58 or `did:key` recipient key
    pub recipient_key: String,
    pub action: KeylistAction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistUpdate {
    pub updates: Vec<KeylistUpdateItem>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistUpdated {
    pub recipient_key: String,
    pub action: KeylistAction,
    pub result: KeylistResult,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeylistUpdateResponse {
    pub updated: Vec<KeylistUpdated>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keylist_result_names() {
        let response: KeylistUpdateResponse = serde_json::from_value(serde_json::json!({
            "updated": [
                { "recipient_key": "abc", "action": "add", "result": "no_change" },
                { "recipient_key": "def", "action": "remove", "result": "client_error" }
            ]
        }))
        .unwrap();

        assert_eq!(response.updated[0].result, KeylistResult::NoChange);
        assert_eq!(response.updated[1].action, KeylistAction::Remove);
        assert_eq!(
            serde_json::to_value(&MediateRequest::default()).unwrap(),
            serde_json::json!({})
        );
    }
}
