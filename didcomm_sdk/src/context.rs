use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    Error,
    config::{AgentConfig, MediatorConfig},
    crypto::EnvelopeService,
    definitions::{DidCommService, Key, PlaintextMessage, QUEUE_ENDPOINT, WireMessage},
    events::EventBus,
    keys::KeyManager,
    message_type::{MessageTypeIdentifier, ProtocolIdentifier},
    protocols::{
        connection::{ConnectionRecord, DidExchangeState},
        credential::{CredentialExchangeRecord, CredentialFormatService},
        mediation::MediationRecord,
        proof::{ProofExchangeRecord, ProofFormatService},
        routing::MediatorRoutes,
    },
    queue::PickupQueues,
    storage::Repository,
    thread_lock::ThreadLocks,
    transport::{SessionRegistry, Transports},
};

/// Everything one agent instance owns. Built once by
/// [`AgentBuilder`](crate::AgentBuilder) and shared by reference with every
/// handler; dropping the last reference tears the agent down.
pub struct AgentContext {
    pub config: AgentConfig,
    pub envelope: EnvelopeService,
    pub connections: Arc<dyn Repository<ConnectionRecord>>,
    pub credentials: Arc<dyn Repository<CredentialExchangeRecord>>,
    pub proofs: Arc<dyn Repository<ProofExchangeRecord>>,
    pub mediations: Arc<dyn Repository<MediationRecord>>,
    pub credential_formats: Vec<Arc<dyn CredentialFormatService>>,
    pub proof_formats: Vec<Arc<dyn ProofFormatService>>,
    pub events: EventBus,
    pub locks: ThreadLocks,
    pub sessions: SessionRegistry,
    pub queues: PickupQueues,
    pub routes: MediatorRoutes,
    pub transports: Transports,
    /// Protocols of the registered handlers
    pub protocols: Vec<ProtocolIdentifier>,
    /// The mediator we receive through; starts out as the configured one
    pub mediator: RwLock<Option<MediatorConfig>>,
    /// Wire messages queued for receiving, e.g. envelopes a mediator
    /// delivered in a batch
    pub inbound: mpsc::UnboundedSender<WireMessage>,
    /// Cancelled on shutdown; aborts in-flight deliveries
    pub cancel: CancellationToken,
}

impl AgentContext {
    pub fn keys(&self) -> &Arc<dyn KeyManager> {
        self.envelope.key_manager()
    }

    pub fn mediator(&self) -> Option<MediatorConfig> {
        self.mediator
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_mediator(&self, mediator: MediatorConfig) {
        tracing::info!("receiving through mediator {}", mediator.endpoint);

        *self.mediator.write().unwrap_or_else(PoisonError::into_inner) = Some(mediator);
    }

    /// The DIDComm services we publish for `key`
    pub fn services_for(&self, key: &Key) -> Vec<DidCommService> {
        if let Some(mediator) = self.mediator() {
            return vec![DidCommService {
                id: "#didcomm-1".to_string(),
                service_endpoint: mediator.endpoint,
                recipient_keys: vec![key.clone()],
                routing_keys: mediator.routing_keys,
                priority: 0,
            }];
        }

        if self.config.endpoints.is_empty() {
            return vec![DidCommService {
                id: "#didcomm-1".to_string(),
                service_endpoint: QUEUE_ENDPOINT.to_string(),
                recipient_keys: vec![key.clone()],
                routing_keys: Vec::new(),
                priority: 0,
            }];
        }

        self.config
            .endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| DidCommService {
                id: format!("#didcomm-{}", index + 1),
                service_endpoint: endpoint.clone(),
                recipient_keys: vec![key.clone()],
                routing_keys: Vec::new(),
                priority: index as u32,
            })
            .collect()
    }

    pub fn credential_format(&self, format: &str) -> Option<&Arc<dyn CredentialFormatService>> {
        self.credential_formats.iter().find(|f| f.format() == format)
    }

    pub fn proof_format(&self, format: &str) -> Option<&Arc<dyn ProofFormatService>> {
        self.proof_formats.iter().find(|f| f.format() == format)
    }

    /// The connection `connection_id`, which must have completed DID exchange
    pub async fn ready_connection(&self, connection_id: &str) -> Result<ConnectionRecord, Error> {
        let connection = self
            .connections
            .get_by_id(connection_id)
            .await
            .map_err(|_| Error::UnknownConnection(connection_id.to_string()))?;

        if connection.state != DidExchangeState::Completed {
            return Err(Error::ConnectionNotReady(connection_id.to_string()));
        }

        Ok(connection)
    }
}

/// A decrypted inbound message and what is known about where it came from.
/// Lives for one dispatch.
#[derive(Clone)]
pub struct InboundMessageContext {
    pub message: PlaintextMessage,
    pub message_type: MessageTypeIdentifier,
    pub connection: Option<ConnectionRecord>,
    pub sender_key: Option<Key>,
    pub recipient_key: Option<Key>,
    /// Registered session the message arrived on, if a reply may use it
    pub session_id: Option<String>,
    pub agent: Arc<AgentContext>,
}

impl InboundMessageContext {
    /// The connection the message arrived on; it must be completed
    pub fn ready_connection(&self) -> Result<&ConnectionRecord, Error> {
        match &self.connection {
            Some(connection) if connection.state == DidExchangeState::Completed => Ok(connection),
            Some(connection) => Err(Error::ConnectionNotReady(connection.id.clone())),
            None => Err(Error::InvalidMessage(format!(
                "no connection for message {} of type {}",
                self.message.id, self.message.message_type
            ))),
        }
    }

    /// Reply on the same connection and session as this message
    pub fn reply(&self, message: PlaintextMessage) -> OutboundMessageContext {
        let sender_key = self
            .connection
            .as_ref()
            .and_then(|c| c.my_key.clone())
            .or_else(|| self.recipient_key.clone());

        OutboundMessageContext {
            message,
            connection: self.connection.clone(),
            service: None,
            sender_key,
            inbound_session_id: self.session_id.clone(),
            associated_record_id: None,
        }
    }

    /// Whether there is any way to send a reply to this message
    pub fn has_reply_channel(&self) -> bool {
        self.connection.is_some() || (self.session_id.is_some() && self.sender_key.is_some())
    }
}

/// A message to send and where it should go. Lives for one delivery.
#[derive(Clone, Debug)]
pub struct OutboundMessageContext {
    pub message: PlaintextMessage,
    pub connection: Option<ConnectionRecord>,
    /// Explicit destination when there is no connection (or not yet one)
    pub service: Option<DidCommService>,
    /// Key to authcrypt with; defaults to our key of the connection
    pub sender_key: Option<Key>,
    pub inbound_session_id: Option<String>,
    pub associated_record_id: Option<String>,
}

impl OutboundMessageContext {
    pub fn new(message: PlaintextMessage, connection: ConnectionRecord) -> Self {
        Self {
            message,
            sender_key: connection.my_key.clone(),
            connection: Some(connection),
            service: None,
            inbound_session_id: None,
            associated_record_id: None,
        }
    }

    pub fn with_associated_record(mut self, record_id: impl Into<String>) -> Self {
        self.associated_record_id = Some(record_id.into());
        self
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.inbound_session_id = session_id;
        self
    }

    /// Services the message may be delivered to
    pub fn services(&self) -> Vec<DidCommService> {
        match (&self.service, &self.connection) {
            (Some(service), _) => vec![service.clone()],
            (None, Some(connection)) => connection.their_services(),
            (None, None) => Vec::new(),
        }
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.id.as_str())
    }
}
