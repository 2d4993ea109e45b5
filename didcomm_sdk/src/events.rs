use tokio::sync::broadcast;

use crate::{
    definitions::{OutboundSendStatus, PlaintextMessage},
    message_type::ProtocolIdentifier,
    protocols::{
        connection::DidExchangeState, credential::CredentialState, mediation::MediationState,
        proof::ProofState,
    },
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by an agent. Delivery is in-process broadcast: every
/// subscriber that keeps up receives every event once.
#[derive(Clone, Debug)]
pub enum AgentEvent {
    ConnectionStateChanged {
        connection_id: String,
        thread_id: String,
        previous_state: Option<DidExchangeState>,
        state: DidExchangeState,
    },
    CredentialStateChanged {
        credential_exchange_id: String,
        thread_id: String,
        previous_state: Option<CredentialState>,
        state: CredentialState,
    },
    ProofStateChanged {
        proof_exchange_id: String,
        thread_id: String,
        previous_state: Option<ProofState>,
        state: ProofState,
    },
    MediationStateChanged {
        mediation_id: String,
        connection_id: String,
        previous_state: Option<MediationState>,
        state: MediationState,
    },
    /// A peer answered a feature query
    FeaturesDisclosed {
        connection_id: Option<String>,
        thread_id: String,
        protocols: Vec<ProtocolIdentifier>,
    },
    MessageReceived {
        message: PlaintextMessage,
        connection_id: Option<String>,
    },
    MessageSent {
        message_id: String,
        connection_id: Option<String>,
        status: OutboundSendStatus,
    },
    ProblemReportReceived {
        connection_id: Option<String>,
        thread_id: String,
        code: String,
        description: String,
    },
}

#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<AgentEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self { sender }
    }
}

impl EventBus {
    pub fn emit(&self, event: AgentEvent) {
        tracing::trace!("event {event:?}");

        // no subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let bus = EventBus::default();
        bus.emit(AgentEvent::MessageSent {
            message_id: "lost".to_string(),
            connection_id: None,
            status: OutboundSendStatus::Undeliverable,
        });

        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(AgentEvent::MessageSent {
            message_id: "1".to_string(),
            connection_id: None,
            status: OutboundSendStatus::SentToTransport,
        });

        for receiver in [&mut first, &mut second] {
            let Ok(AgentEvent::MessageSent { message_id, status, .. }) = receiver.recv().await
            else {
                panic!("expected a message sent event");
            };
            assert_eq!(message_id, "1");
            assert_eq!(status, OutboundSendStatus::SentToTransport);
        }
    }
}
