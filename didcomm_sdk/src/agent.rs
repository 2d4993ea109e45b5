use futures::Stream;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    Error,
    config::AgentConfig,
    context::{AgentContext, InboundMessageContext, OutboundMessageContext},
    crypto::{EncryptedEnvelope, EnvelopeService},
    definitions::{Key, OutboundSendStatus, ReturnRoute, WireMessage},
    dispatch::{Dispatcher, HandlerFn, HandlerResult, MessageHandler, MessageTypeRegistry},
    events::{AgentEvent, EventBus},
    keys::{InMemoryKeyManager, KeyManager},
    message_type::ProtocolIdentifier,
    protocols::{
        self,
        connection::{ConnectionRecord, ConnectionsApi},
        credential::{CredentialExchangeRecord, CredentialFormatService, CredentialsApi},
        discover_features,
        mediation::{KeylistResult, MediationApi, MediationRecord},
        proof::{ProofExchangeRecord, ProofFormatService, ProofsApi},
    },
    queue::PickupQueues,
    receiver::{Inbound, MessageReceiver},
    router::Router,
    storage::{InMemoryRepository, Repository, StorageError},
    thread_lock::ThreadLocks,
    transport::{HttpTransport, OutboundTransport, SessionRegistry, TransportSession, Transports, WsTransport},
};

/// Replies returned synchronously by a peer that are processed in a row
/// before the exchange is cut off
const MAX_SYNC_REPLIES: usize = 8;

/// Outcome of [`Agent::receive_message`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Received {
    pub message_id: Option<String>,
    pub connection_id: Option<String>,
    /// How the reply to the message, if any, was sent
    pub reply_status: Option<OutboundSendStatus>,
    /// The sender asked for every message to come back on its channel
    pub return_route_all: bool,
}

/// Assembles an [`Agent`]. Storage and keys default to the in-memory
/// implementations.
pub struct AgentBuilder {
    config: AgentConfig,
    keys: Option<Arc<dyn KeyManager>>,
    connections: Option<Arc<dyn Repository<ConnectionRecord>>>,
    credentials: Option<Arc<dyn Repository<CredentialExchangeRecord>>>,
    proofs: Option<Arc<dyn Repository<ProofExchangeRecord>>>,
    mediations: Option<Arc<dyn Repository<MediationRecord>>>,
    credential_formats: Vec<Arc<dyn CredentialFormatService>>,
    proof_formats: Vec<Arc<dyn ProofFormatService>>,
    transports: Vec<Arc<dyn OutboundTransport>>,
    handlers: Vec<MessageHandler>,
    fallback: Option<HandlerFn>,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            keys: None,
            connections: None,
            credentials: None,
            proofs: None,
            mediations: None,
            credential_formats: Vec::new(),
            proof_formats: Vec::new(),
            transports: Vec::new(),
            handlers: Vec::new(),
            fallback: None,
        }
    }

    pub fn with_key_manager(mut self, keys: Arc<dyn KeyManager>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_connection_repository(mut self, repository: Arc<dyn Repository<ConnectionRecord>>) -> Self {
        self.connections = Some(repository);
        self
    }

    pub fn with_credential_repository(
        mut self,
        repository: Arc<dyn Repository<CredentialExchangeRecord>>,
    ) -> Self {
        self.credentials = Some(repository);
        self
    }

    pub fn with_proof_repository(mut self, repository: Arc<dyn Repository<ProofExchangeRecord>>) -> Self {
        self.proofs = Some(repository);
        self
    }

    pub fn with_mediation_repository(mut self, repository: Arc<dyn Repository<MediationRecord>>) -> Self {
        self.mediations = Some(repository);
        self
    }

    pub fn with_credential_format(mut self, format: Arc<dyn CredentialFormatService>) -> Self {
        self.credential_formats.push(format);
        self
    }

    pub fn with_proof_format(mut self, format: Arc<dyn ProofFormatService>) -> Self {
        self.proof_formats.push(format);
        self
    }

    /// An additional outbound transport; it replaces a built-in one for the
    /// schemes it claims
    pub fn with_transport(mut self, transport: Arc<dyn OutboundTransport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Handle additional message types
    pub fn with_handler(mut self, handler: MessageHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Handle messages no registered handler accepts
    pub fn with_fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: Fn(InboundMessageContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.fallback = Some(MessageHandler::new("fallback", Vec::new(), fallback).handle);
        self
    }

    /// Build the agent and start feeding it messages pushed on outbound
    /// WebSockets or delivered by a mediator. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Agent, Error> {
        let mut registry = MessageTypeRegistry::new();
        for handler in protocols::default_handlers().into_iter().chain(self.handlers) {
            registry.register(handler)?;
        }

        let (inbound_sender, mut inbound) = mpsc::unbounded_channel::<WireMessage>();

        let mut transports = Transports::default();
        transports.register(Arc::new(HttpTransport));
        transports.register(Arc::new(WsTransport::new(inbound_sender.clone())));
        for transport in self.transports {
            transports.register(transport);
        }

        let keys = self
            .keys
            .unwrap_or_else(|| Arc::new(InMemoryKeyManager::default()));
        let mediator = self.config.mediator.clone();

        let context = Arc::new(AgentContext {
            config: self.config,
            envelope: EnvelopeService::new(keys),
            connections: self
                .connections
                .unwrap_or_else(|| Arc::new(InMemoryRepository::new())),
            credentials: self
                .credentials
                .unwrap_or_else(|| Arc::new(InMemoryRepository::new())),
            proofs: self
                .proofs
                .unwrap_or_else(|| Arc::new(InMemoryRepository::new())),
            mediations: self
                .mediations
                .unwrap_or_else(|| Arc::new(InMemoryRepository::new())),
            credential_formats: self.credential_formats,
            proof_formats: self.proof_formats,
            events: EventBus::default(),
            locks: ThreadLocks::default(),
            sessions: SessionRegistry::default(),
            queues: PickupQueues::default(),
            routes: Default::default(),
            transports,
            protocols: registry.supported_protocols(),
            mediator: RwLock::new(mediator),
            inbound: inbound_sender,
            cancel: CancellationToken::new(),
        });

        tracing::info!(
            "agent '{}' handles {} message types",
            context.config.label,
            registry.len()
        );

        let agent = Agent {
            dispatcher: Dispatcher::new(registry, self.fallback),
            receiver: MessageReceiver::new(context.clone()),
            router: Router::new(context.clone()),
            context,
        };

        let feeder = agent.clone();
        tokio::spawn(async move {
            let cancel = feeder.context.cancel.clone();

            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = inbound.recv() => message,
                };

                let Some(message) = message else {
                    break;
                };

                if let Err(e) = feeder.receive_message(&message, None).await {
                    tracing::warn!("queued inbound message failed: {e}");
                }
            }
        });

        Ok(agent)
    }
}

/// A DIDComm agent: receives, dispatches and sends messages and exposes the
/// built-in protocols. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Agent {
    context: Arc<AgentContext>,
    dispatcher: Dispatcher,
    receiver: MessageReceiver,
    router: Router,
}

impl Agent {
    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.context
    }

    pub fn connections(&self) -> ConnectionsApi<'_> {
        ConnectionsApi::new(self)
    }

    pub fn credentials(&self) -> CredentialsApi<'_> {
        CredentialsApi::new(self)
    }

    pub fn proofs(&self) -> ProofsApi<'_> {
        ProofsApi::new(self)
    }

    pub fn mediation(&self) -> MediationApi<'_> {
        MediationApi::new(self)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.context.events.subscribe()
    }

    /// Events as a stream; events a slow consumer falls behind on are
    /// skipped
    pub fn events(&self) -> impl Stream<Item = AgentEvent> + Send + 'static {
        let mut events = self.subscribe();

        async_stream::stream! {
            loop {
                match events.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("event stream skipped {missed} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    pub fn supported_protocols(&self) -> Vec<ProtocolIdentifier> {
        self.context.protocols.clone()
    }

    /// Ask the peer of `connection_id` which protocols matching `query` it
    /// speaks. The answer arrives as [`AgentEvent::FeaturesDisclosed`] on
    /// the returned thread id.
    pub async fn discover_features(&self, connection_id: &str, query: &str) -> Result<String, Error> {
        let connection = self.context.ready_connection(connection_id).await?;
        let message = discover_features::query(query)?;
        let thread_id = message.thread_id().to_string();

        self.send_message(OutboundMessageContext::new(message, connection))
            .await?;

        Ok(thread_id)
    }

    /// Handle one inbound wire message. `session` is the channel it arrived
    /// on when a reply may be written back to it.
    pub async fn receive_message(
        &self,
        message: &[u8],
        session: Option<Arc<dyn TransportSession>>,
    ) -> Result<Received, Error> {
        let (received, reply) = self.process(message, session).await?;
        self.follow_replies(reply).await;

        Ok(received)
    }

    /// Deliver `outbound`; replies the peer returns on the same exchange
    /// are processed before this returns
    pub async fn send_message(&self, outbound: OutboundMessageContext) -> Result<OutboundSendStatus, Error> {
        let delivered = self.router.deliver(outbound, &self.context.cancel).await?;
        self.follow_replies(delivered.reply).await;

        Ok(delivered.status)
    }

    /// Take up to `limit` queued envelopes for `connection_id`, oldest first
    pub fn pickup_messages(&self, connection_id: &str, limit: usize) -> Result<Vec<EncryptedEnvelope>, Error> {
        Ok(self
            .context
            .queues
            .take(connection_id, limit)?
            .into_iter()
            .map(|queued| queued.envelope)
            .collect())
    }

    /// Relay `forward` messages for `key` to `connection_id`; fails when
    /// the key is routed to another connection
    pub fn add_mediation_route(&self, key: &Key, connection_id: &str) -> Result<(), Error> {
        match self.context.routes.add(key, connection_id)? {
            KeylistResult::Success | KeylistResult::NoChange => Ok(()),
            _ => Err(Error::InvalidMessage(format!(
                "{} is routed to another connection",
                key.to_base58()
            ))),
        }
    }

    /// Cancel in-flight deliveries and close all sessions
    pub async fn shutdown(&self) {
        tracing::info!("shutting down agent '{}'", self.context.config.label);

        self.context.cancel.cancel();
        self.context.sessions.close_all().await;
    }

    async fn process(
        &self,
        message: &[u8],
        session: Option<Arc<dyn TransportSession>>,
    ) -> Result<(Received, Option<WireMessage>), Error> {
        let context = match self.receiver.receive(message, session).await? {
            Inbound::Dispatch(context) => context,
            Inbound::Rejected { report, reason } => {
                if let Some(report) = report
                    && let Err(e) = self.router.deliver(report, &self.context.cancel).await
                {
                    tracing::warn!("could not report parse failure: {e}");
                }

                return Err(Error::InvalidMessage(reason));
            }
        };

        let mut received = Received {
            message_id: Some(context.message.id.clone()),
            connection_id: context.connection.as_ref().map(|c| c.id.clone()),
            reply_status: None,
            return_route_all: context.message.return_route() == ReturnRoute::All,
        };
        let session_id = context.session_id.clone();

        let result = match self.dispatch(context).await {
            Ok(Some(reply)) => match self.router.deliver(reply, &self.context.cancel).await {
                Ok(delivered) => {
                    received.reply_status = Some(delivered.status);
                    Ok((received, delivered.reply))
                }
                Err(e) => {
                    tracing::warn!("reply to {:?} not delivered: {e}", received.message_id);
                    received.reply_status = Some(OutboundSendStatus::Undeliverable);
                    Ok((received, None))
                }
            },
            Ok(None) => Ok((received, None)),
            Err(e) => Err(e),
        };

        if let Some(session_id) = session_id {
            self.context.sessions.remove(&session_id);
        }

        result
    }

    /// Dispatch while holding the lock of the message's thread; a dispatch
    /// that lost a concurrent record update is run again
    async fn dispatch(&self, context: InboundMessageContext) -> HandlerResult {
        let _guard = self.context.locks.lock(context.message.thread_id()).await;
        let mut conflicts = 0;

        loop {
            match self.dispatcher.dispatch(context.clone()).await {
                Err(Error::Storage(StorageError::Conflict { record_type, id }))
                    if conflicts < self.context.config.max_conflict_retries =>
                {
                    conflicts += 1;
                    tracing::debug!(
                        "retrying {} after concurrent update of {record_type} {id}",
                        context.message.id
                    );
                }
                result => return result,
            }
        }
    }

    async fn follow_replies(&self, mut pending: Option<WireMessage>) {
        let mut rounds = 0;

        while let Some(reply) = pending.take() {
            if rounds == MAX_SYNC_REPLIES {
                tracing::warn!("dropping synchronous reply after {rounds} rounds");
                break;
            }
            rounds += 1;

            pending = match self.process(&reply, None).await {
                Ok((_, next)) => next,
                Err(e) => {
                    tracing::warn!("processing synchronous reply failed: {e}");
                    None
                }
            };
        }
    }
}
