//! Outbound delivery: picks a session, transport, pickup queue or mediator
//! for a message and sends it there.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{
    Error,
    config::MediatorConfig,
    context::{AgentContext, OutboundMessageContext},
    crypto::{EncryptedEnvelope, EnvelopeKeys, forward_message},
    definitions::{DidCommService, Key, OutboundSendStatus, ReturnRoute, WireMessage},
    error::DeliveryError,
    events::AgentEvent,
    message_type::to_legacy_prefix,
    retry::BackoffStep,
};

/// Outcome of a successful delivery
#[derive(Debug)]
pub struct DeliveryResult {
    pub status: OutboundSendStatus,
    /// Reply the peer returned on the same exchange, still sealed
    pub reply: Option<WireMessage>,
}

impl DeliveryResult {
    fn new(status: OutboundSendStatus) -> Self {
        Self {
            status,
            reply: None,
        }
    }
}

#[derive(Clone)]
pub struct Router {
    agent: Arc<AgentContext>,
}

impl Router {
    pub fn new(agent: Arc<AgentContext>) -> Self {
        Self { agent }
    }

    /// Deliver `outbound`, trying in order: the session the message answers,
    /// a WebSocket the peer keeps open to us, the peer's service endpoints,
    /// our pickup queue and finally our mediator.
    ///
    /// Records are never rolled back when delivery fails.
    pub async fn deliver(
        &self,
        mut outbound: OutboundMessageContext,
        cancel: &CancellationToken,
    ) -> Result<DeliveryResult, Error> {
        let config = &self.agent.config;

        if config.use_did_sov_prefix {
            outbound.message.message_type = to_legacy_prefix(&outbound.message.message_type);
        }

        if !config.has_inbound_endpoint() && outbound.message.transport.is_none() {
            outbound.message.set_return_route(ReturnRoute::All);
        }

        let result = self.try_deliver(&outbound, cancel).await;

        let status = match &result {
            Ok(delivered) => delivered.status,
            Err(_) => OutboundSendStatus::Undeliverable,
        };

        self.agent.events.emit(AgentEvent::MessageSent {
            message_id: outbound.message.id.clone(),
            connection_id: outbound.connection_id().map(ToString::to_string),
            status,
        });

        result
    }

    async fn try_deliver(
        &self,
        outbound: &OutboundMessageContext,
        cancel: &CancellationToken,
    ) -> Result<DeliveryResult, Error> {
        let agent = &self.agent;
        let services = outbound.services();
        let message = &outbound.message;

        if self.send_to_session(outbound, &services).await? {
            return Ok(DeliveryResult::new(OutboundSendStatus::SentToSession));
        }

        if let (Some(connection_id), Some(service)) = (outbound.connection_id(), services.first())
            && agent.sessions.has_socket(connection_id)
        {
            let envelope = self.seal(outbound, &service.recipient_keys, &[]).await?;

            if agent
                .sessions
                .push_to_connection(connection_id, envelope.to_json()?)
                .is_ok()
            {
                tracing::info!("pushed {} to socket of connection {connection_id}", message.id);
                return Ok(DeliveryResult::new(OutboundSendStatus::SentToSession));
            }
        }

        let mut endpoints = Vec::new();
        for service in self.reachable_services(&services) {
            let envelope = self
                .seal(outbound, &service.recipient_keys, &service.routing_keys)
                .await?;
            endpoints.push((service.service_endpoint.clone(), envelope.to_json()?));
        }

        let mut attempts = 0;
        if !endpoints.is_empty() {
            match self.send_with_retry(&endpoints, cancel, &mut attempts).await {
                Ok(reply) => {
                    return Ok(DeliveryResult {
                        status: OutboundSendStatus::SentToTransport,
                        reply,
                    });
                }
                Err(Error::Delivery(DeliveryError::Cancelled)) => {
                    return Err(DeliveryError::Cancelled.into());
                }
                Err(e) => tracing::warn!("no endpoint of {:?} reachable: {e}", outbound.connection_id()),
            }
        }

        if let (Some(connection_id), Some(service)) = (
            outbound.connection_id(),
            services.iter().find(|s| s.is_queue()),
        ) {
            let envelope = self.seal(outbound, &service.recipient_keys, &[]).await?;
            agent.queues.push(connection_id, envelope)?;

            tracing::info!("queued {} for pickup by connection {connection_id}", message.id);
            return Ok(DeliveryResult::new(OutboundSendStatus::QueuedForPickup));
        }

        if let (Some(mediator), Some(service)) = (agent.mediator(), services.first()) {
            let wrapped = self.through_mediator(outbound, service, &mediator).await?;

            let endpoints = [(mediator.endpoint.clone(), wrapped.to_json()?)];
            match self.send_with_retry(&endpoints, cancel, &mut attempts).await {
                Ok(reply) => {
                    tracing::info!("sent {} through mediator {}", message.id, mediator.endpoint);
                    return Ok(DeliveryResult {
                        status: OutboundSendStatus::SentToTransport,
                        reply,
                    });
                }
                Err(Error::Delivery(DeliveryError::Cancelled)) => {
                    return Err(DeliveryError::Cancelled.into());
                }
                Err(e) => tracing::warn!("mediator {} unreachable: {e}", mediator.endpoint),
            }
        }

        tracing::error!(
            "message {} ({}) for connection {:?} is undeliverable",
            message.id,
            message.message_type,
            outbound.connection_id()
        );

        Err(DeliveryError::Undeliverable {
            connection_id: outbound.connection_id().map(ToString::to_string),
            attempts,
        }
        .into())
    }

    /// Seal `outbound` for `service` and, unless the outermost layer is
    /// already addressed to our mediator, wrap it in a forward to it
    async fn through_mediator(
        &self,
        outbound: &OutboundMessageContext,
        service: &DidCommService,
        mediator: &MediatorConfig,
    ) -> Result<EncryptedEnvelope, Error> {
        let mediator_key = mediator
            .routing_key()
            .ok_or_else(|| Error::Config(format!("mediator {} has no routing key", mediator.endpoint)))?;

        // the layer the first hop opens
        let outermost = service
            .routing_keys
            .last()
            .or_else(|| service.recipient_keys.first())
            .ok_or_else(|| Error::InvalidMessage(format!("service {} has no recipient keys", service.id)))?;

        let envelope = self
            .seal(outbound, &service.recipient_keys, &service.routing_keys)
            .await?;

        if outermost == mediator_key {
            return Ok(envelope);
        }

        let forward = forward_message(outermost.to_base58(), envelope)?;

        Ok(self
            .agent
            .envelope
            .seal(&forward, std::slice::from_ref(mediator_key), None)
            .await?)
    }

    /// Reply on the session the answered message arrived on, if it is still
    /// open, allows this thread and belongs to the recipient
    async fn send_to_session(
        &self,
        outbound: &OutboundMessageContext,
        services: &[DidCommService],
    ) -> Result<bool, Error> {
        let Some(session_id) = &outbound.inbound_session_id else {
            return Ok(false);
        };

        let Some(entry) = self.agent.sessions.get(session_id) else {
            return Ok(false);
        };

        let allowed = match entry.return_route {
            ReturnRoute::All => true,
            ReturnRoute::Thread => entry.thread_id == outbound.message.thread_id(),
            ReturnRoute::None => false,
        };

        let Some(recipient) = entry.sender_key.clone() else {
            return Ok(false);
        };

        let is_recipient = services.is_empty()
            || services
                .iter()
                .any(|service| service.recipient_keys.contains(&recipient));

        if !allowed || !is_recipient || !entry.session.is_open() {
            return Ok(false);
        }

        let envelope = self.seal(outbound, &[recipient], &[]).await?;

        match entry.session.send(envelope.to_json()?).await {
            Ok(()) => {
                tracing::info!("replied {} on session {session_id}", outbound.message.id);
                Ok(true)
            }
            Err(e) => {
                tracing::debug!("session {session_id} unusable: {e}");
                Ok(false)
            }
        }
    }

    /// Services we have a transport for, most preferred first
    fn reachable_services<'a>(&self, services: &'a [DidCommService]) -> Vec<&'a DidCommService> {
        let config = &self.agent.config;

        let mut reachable: Vec<_> = services
            .iter()
            .filter(|service| !service.is_queue())
            .filter(|service| !config.endpoints.contains(&service.service_endpoint))
            .filter(|service| {
                service
                    .scheme()
                    .is_some_and(|scheme| self.agent.transports.supports(scheme))
            })
            .collect();

        reachable.sort_by_key(|service| {
            (
                config.scheme_rank(service.scheme().unwrap_or_default()),
                service.priority,
            )
        });

        reachable
    }

    async fn seal(
        &self,
        outbound: &OutboundMessageContext,
        recipient_keys: &[Key],
        routing_keys: &[Key],
    ) -> Result<EncryptedEnvelope, Error> {
        let keys = EnvelopeKeys {
            recipient_keys: recipient_keys.to_vec(),
            routing_keys: routing_keys.to_vec(),
            sender_key: outbound.sender_key.clone(),
        };

        Ok(self
            .agent
            .envelope
            .seal_for_service(&outbound.message, &keys)
            .await?)
    }

    /// Try every endpoint in turn until one accepts the message; after a
    /// round of transient failures wait for the next backoff step.
    async fn send_with_retry(
        &self,
        endpoints: &[(String, WireMessage)],
        cancel: &CancellationToken,
        attempts: &mut usize,
    ) -> Result<Option<WireMessage>, Error> {
        let mut backoff = self.agent.config.retry.backoff();
        let mut candidates: Vec<&(String, WireMessage)> = endpoints.iter().collect();
        let mut last_error = None;

        while !candidates.is_empty() {
            let mut transient = Vec::new();

            for candidate in candidates {
                let (endpoint, message) = candidate;
                *attempts += 1;

                let result = tokio::select! {
                    _ = cancel.cancelled() => return Err(DeliveryError::Cancelled.into()),
                    result = self.agent.transports.send_message(endpoint, message) => result,
                };

                match result {
                    Ok(reply) => return Ok(reply),
                    Err(e) if e.is_transient() => {
                        tracing::debug!("sending to {endpoint} failed: {e}");
                        transient.push(candidate);
                        last_error = Some(e);
                    }
                    Err(e) => {
                        tracing::warn!("giving up on {endpoint}: {e}");
                        last_error = Some(e);
                    }
                }
            }

            if transient.is_empty() {
                break;
            }

            match backoff.wait(cancel).await {
                BackoffStep::Retry => candidates = transient,
                BackoffStep::Exhausted => break,
                BackoffStep::Cancelled => return Err(DeliveryError::Cancelled.into()),
            }
        }

        match last_error {
            Some(e) => Err(e.into()),
            None => Err(DeliveryError::Undeliverable {
                connection_id: None,
                attempts: *attempts,
            }
            .into()),
        }
    }

    /// Deliver an envelope we relay verbatim to `connection_id`: on a socket
    /// the connection keeps open, to its endpoints, or into its pickup queue
    pub async fn deliver_envelope(
        &self,
        connection_id: &str,
        envelope: EncryptedEnvelope,
        cancel: &CancellationToken,
    ) -> Result<OutboundSendStatus, Error> {
        let agent = &self.agent;
        let bytes = envelope.to_json()?;

        let Err(bytes) = agent.sessions.push_to_connection(connection_id, bytes) else {
            return Ok(OutboundSendStatus::SentToSession);
        };

        let connection = agent.connections.get_by_id(connection_id).await?;
        let services = connection.their_services();
        let endpoints: Vec<_> = self
            .reachable_services(&services)
            .into_iter()
            .map(|service| (service.service_endpoint.clone(), bytes.clone()))
            .collect();

        if !endpoints.is_empty() {
            let mut attempts = 0;
            match self.send_with_retry(&endpoints, cancel, &mut attempts).await {
                Ok(reply) => {
                    if reply.is_some() {
                        tracing::debug!("dropping reply to relayed message");
                    }
                    return Ok(OutboundSendStatus::SentToTransport);
                }
                Err(Error::Delivery(DeliveryError::Cancelled)) => {
                    return Err(DeliveryError::Cancelled.into());
                }
                Err(e) => tracing::debug!("relaying to connection {connection_id} failed: {e}"),
            }
        }

        agent.queues.push(connection_id, envelope)?;

        Ok(OutboundSendStatus::QueuedForPickup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::ForwardBody,
        definitions::KeyType,
        protocols::trust_ping,
        test_utils::{LoopbackNetwork, test_config},
    };

    fn service(recipient_keys: Vec<Key>, routing_keys: Vec<Key>) -> DidCommService {
        DidCommService {
            id: "#didcomm-1".to_string(),
            service_endpoint: LoopbackNetwork::endpoint("bob"),
            recipient_keys,
            routing_keys,
            priority: 0,
        }
    }

    /// The key the forward sealed in `envelope` is addressed to
    async fn forwarded_to(agent: &AgentContext, envelope: &EncryptedEnvelope) -> String {
        let keys = agent.envelope.local_recipient_keys(envelope).await;
        let opened = agent.envelope.open(envelope, &keys).await.unwrap();

        opened.message.body_as::<ForwardBody>().unwrap().to
    }

    #[tokio::test]
    async fn test_mediator_forward_is_addressed_to_outermost_key() {
        let network = LoopbackNetwork::new();
        let alice = network.agent(test_config("alice")).unwrap();
        let agent = alice.context().clone();

        let mut keys = Vec::new();
        for _ in 0..4 {
            keys.push(agent.keys().create_key(KeyType::Ed25519).await.unwrap());
        }
        let [mediator_key, recipient, inner, outer] = <[Key; 4]>::try_from(keys).unwrap();

        let mediator = MediatorConfig {
            endpoint: LoopbackNetwork::endpoint("mediator"),
            routing_keys: vec![mediator_key.clone()],
            connection_id: None,
        };
        let outbound = OutboundMessageContext {
            message: trust_ping::ping(false).unwrap(),
            connection: None,
            service: None,
            sender_key: None,
            inbound_session_id: None,
            associated_record_id: None,
        };
        let router = Router::new(agent.clone());

        let routed = service(vec![recipient.clone()], vec![inner, outer.clone()]);
        let envelope = router.through_mediator(&outbound, &routed, &mediator).await.unwrap();
        assert_eq!(envelope.recipient_keys().unwrap(), vec![mediator_key.clone()]);
        assert_eq!(forwarded_to(&agent, &envelope).await, outer.to_base58());

        let direct = service(vec![recipient.clone()], Vec::new());
        let envelope = router.through_mediator(&outbound, &direct, &mediator).await.unwrap();
        assert_eq!(forwarded_to(&agent, &envelope).await, recipient.to_base58());

        // already routed through our mediator: no second forward
        let shared = service(vec![recipient.clone()], vec![mediator_key.clone()]);
        let envelope = router.through_mediator(&outbound, &shared, &mediator).await.unwrap();
        assert_eq!(envelope.recipient_keys().unwrap(), vec![mediator_key]);
        assert_eq!(forwarded_to(&agent, &envelope).await, recipient.to_base58());

        let Err(Error::InvalidMessage(_)) = router
            .through_mediator(&outbound, &service(Vec::new(), Vec::new()), &mediator)
            .await
        else {
            panic!("a service without keys has no one to forward to");
        };
    }
}
