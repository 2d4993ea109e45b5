use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Error, definitions::Key, retry::RetryPolicy};

/// Mediator we route our inbound traffic through, either configured or
/// granted with coordinate-mediation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediatorConfig {
    pub endpoint: String,
    /// Outermost last
    pub routing_keys: Vec<Key>,
    /// Our completed connection with the mediator; keys we publish behind
    /// the mediator are registered over it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

impl MediatorConfig {
    /// The key the mediator's endpoint opens forward messages with
    pub fn routing_key(&self) -> Option<&Key> {
        self.routing_keys.last()
    }
}

/// Agent configuration, typically loaded from a JSON file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub label: String,
    /// Our inbound service endpoints; empty for agents that can only receive
    /// replies on outbound connections
    pub endpoints: Vec<String>,
    pub auto_accept_connections: bool,
    pub auto_accept_credentials: bool,
    pub auto_accept_proofs: bool,
    /// Grant every mediation request
    pub auto_accept_mediation: bool,
    /// Accept unencrypted inbound messages; never enable in production
    pub accept_plaintext: bool,
    /// Send message types in the legacy `did:sov:...;spec` namespace
    pub use_did_sov_prefix: bool,
    pub retry: RetryPolicy,
    /// URL schemes in order of preference
    pub transport_priority: Vec<String>,
    pub mediator: Option<MediatorConfig>,
    /// Number of times a dispatch is retried after a concurrent record update
    pub max_conflict_retries: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            label: "didcomm agent".to_string(),
            endpoints: Vec::new(),
            auto_accept_connections: false,
            auto_accept_credentials: false,
            auto_accept_proofs: false,
            auto_accept_mediation: false,
            accept_plaintext: false,
            use_did_sov_prefix: false,
            retry: RetryPolicy::default(),
            transport_priority: vec![
                "wss".to_string(),
                "https".to_string(),
                "ws".to_string(),
                "http".to_string(),
            ],
            mediator: None,
            max_conflict_retries: 3,
        }
    }
}

impl AgentConfig {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let config = tokio::fs::read_to_string(path).await?;

        serde_json::from_str(&config)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Rank of a URL scheme; lower is preferred, unknown schemes come last
    pub fn scheme_rank(&self, scheme: &str) -> usize {
        self.transport_priority
            .iter()
            .position(|preferred| preferred == scheme)
            .unwrap_or(self.transport_priority.len())
    }

    pub fn has_inbound_endpoint(&self) -> bool {
        !self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "label": "alice",
                "endpoints": ["http://localhost:3000"],
                "auto_accept_connections": true,
                "retry": {{ "max_retries": 1 }}
            }}"#
        )
        .unwrap();

        let config = AgentConfig::from_file(file.path()).await.unwrap();
        assert_eq!(config.label, "alice");
        assert_eq!(config.endpoints, vec!["http://localhost:3000"]);
        assert!(config.auto_accept_connections);
        assert!(!config.accept_plaintext);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.transport_priority, AgentConfig::default().transport_priority);
    }

    #[tokio::test]
    async fn test_from_file_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let Err(Error::Config(_)) = AgentConfig::from_file(file.path()).await else {
            panic!("invalid config should not load");
        };

        let Err(Error::Io(_)) = AgentConfig::from_file("/does/not/exist.json").await else {
            panic!("missing config should not load");
        };
    }

    #[test]
    fn test_scheme_rank() {
        let config = AgentConfig::default();
        assert!(config.scheme_rank("wss") < config.scheme_rank("http"));
        assert_eq!(config.scheme_rank("didcomm"), 4);
    }
}
