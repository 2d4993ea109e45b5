//! In-process agents for tests: a loopback transport connecting agents by
//! name and JSON credential and proof formats.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use url::Url;

use crate::{
    Agent, AgentConfig, Error,
    definitions::WireMessage,
    protocols::{
        connection::ConnectionRecord, credential::CredentialFormatService,
        proof::ProofFormatService,
    },
    retry::RetryPolicy,
    transport::{HttpSession, OutboundTransport, TransportError, TransportSession},
};

pub const SCHEME_LOOPBACK: &str = "loopback";

/// Format identifier of [`JsonCredentialFormat`] and [`JsonProofFormat`]
pub const JSON_FORMAT: &str = "test/json@v1";

/// Delivers messages sent to `loopback://<name>` straight into the agent
/// that joined under that name, like an HTTP POST whose response body
/// carries the synchronous reply
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    agents: Arc<RwLock<HashMap<String, Agent>>>,
    offline: Arc<RwLock<HashSet<String>>>,
    attempts: Arc<AtomicUsize>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(name: &str) -> String {
        format!("{SCHEME_LOOPBACK}://{name}")
    }

    /// Make `agent` reachable under `name`
    pub fn join(&self, name: &str, agent: &Agent) {
        if let Ok(mut agents) = self.agents.write() {
            agents.insert(name.to_string(), agent.clone());
        }
    }

    /// Sends to an offline agent fail as if the host was unreachable
    pub fn set_offline(&self, name: &str, offline: bool) {
        if let Ok(mut names) = self.offline.write() {
            if offline {
                names.insert(name.to_string());
            } else {
                names.remove(name);
            }
        }
    }

    /// Number of sends attempted on the network
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Build an agent that speaks the JSON formats and join it under its label
    pub fn agent(&self, config: AgentConfig) -> Result<Agent, Error> {
        let name = config.label.clone();

        let agent = Agent::builder(config)
            .with_transport(Arc::new(self.clone()))
            .with_credential_format(Arc::new(JsonCredentialFormat))
            .with_proof_format(Arc::new(JsonProofFormat))
            .build()?;

        self.join(&name, &agent);

        Ok(agent)
    }

    fn lookup(&self, name: &str) -> Result<Option<Agent>, TransportError> {
        if self.offline.read()?.contains(name) {
            return Ok(None);
        }

        Ok(self.agents.read()?.get(name).cloned())
    }
}

#[async_trait]
impl OutboundTransport for LoopbackNetwork {
    fn schemes(&self) -> &[&'static str] {
        &[SCHEME_LOOPBACK]
    }

    async fn send(&self, url: &Url, message: &[u8]) -> Result<Option<WireMessage>, TransportError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let Some(agent) = self.lookup(url.host_str().unwrap_or_default())? else {
            return Err(TransportError::Status(url.to_string(), 503));
        };

        let (session, mut reply) = HttpSession::new();
        let session = Arc::new(session);

        let result = agent
            .receive_message(message, Some(session.clone() as Arc<dyn TransportSession>))
            .await;
        session.close().await;

        if let Err(e) = result {
            tracing::debug!("{url} rejected message: {e}");
            return Err(TransportError::Status(url.to_string(), 400));
        }

        Ok(reply.try_recv().ok())
    }
}

/// Configuration of an agent reachable at `loopback://<label>` that accepts
/// connections automatically and retries quickly
pub fn test_config(label: &str) -> AgentConfig {
    let mut config = AgentConfig::new(label);
    config.endpoints = vec![LoopbackNetwork::endpoint(label)];
    config.auto_accept_connections = true;
    config.retry = RetryPolicy {
        max_retries: 2,
        initial_delay: Duration::from_millis(5),
        multiplier: 1.0,
        max_delay: Duration::from_millis(5),
        max_elapsed: Duration::from_secs(1),
    };

    config
}

/// Run a DID exchange between `inviter` and `invitee`, both accepting
/// automatically. Returns the inviter's and the invitee's record.
pub async fn connect(inviter: &Agent, invitee: &Agent) -> Result<(ConnectionRecord, ConnectionRecord), Error> {
    let (record, invitation) = inviter.connections().create_invitation(None).await?;
    let theirs = invitee.connections().receive_invitation(invitation).await?;

    Ok((
        inviter.connections().get(&record.id).await?,
        invitee.connections().get(&theirs.id).await?,
    ))
}

/// Credentials are the offered attributes; a credential carrying
/// `"revoked": true` is refused by the holder
pub struct JsonCredentialFormat;

#[async_trait]
impl CredentialFormatService for JsonCredentialFormat {
    fn format(&self) -> &str {
        JSON_FORMAT
    }

    async fn create_proposal(&self, input: &Value) -> Result<Value, Error> {
        Ok(input.clone())
    }

    async fn create_offer(&self, input: &Value) -> Result<Value, Error> {
        Ok(input.clone())
    }

    async fn create_request(&self, offer: &Value) -> Result<Value, Error> {
        Ok(json!({ "offer": offer }))
    }

    async fn create_credential(&self, offer: &Value, _request: &Value) -> Result<Value, Error> {
        Ok(json!({ "attributes": offer }))
    }

    async fn process_credential(&self, request: &Value, credential: &Value) -> Result<(), Error> {
        if credential["attributes"]["revoked"] == json!(true) {
            return Err(Error::InvalidMessage("credential is revoked".to_string()));
        }

        if credential["attributes"] != request["offer"] {
            return Err(Error::InvalidMessage("credential does not match the offer".to_string()));
        }

        Ok(())
    }
}

/// A presentation reveals the requested attributes; it verifies when they
/// match the request exactly
pub struct JsonProofFormat;

#[async_trait]
impl ProofFormatService for JsonProofFormat {
    fn format(&self) -> &str {
        JSON_FORMAT
    }

    async fn create_proposal(&self, input: &Value) -> Result<Value, Error> {
        Ok(input.clone())
    }

    async fn create_request(&self, input: &Value) -> Result<Value, Error> {
        Ok(json!({ "requested": input }))
    }

    async fn create_presentation(&self, request: &Value) -> Result<Value, Error> {
        Ok(json!({ "revealed": request["requested"] }))
    }

    async fn verify_presentation(&self, request: &Value, presentation: &Value) -> Result<bool, Error> {
        Ok(presentation["revealed"] == request["requested"])
    }
}
