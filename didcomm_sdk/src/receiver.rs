//! Turning inbound wire bytes into a dispatchable message: format
//! detection, decryption, parsing and connection lookup.

use std::sync::Arc;

use crate::{
    Error,
    context::{AgentContext, InboundMessageContext, OutboundMessageContext},
    crypto::{WireFormat, detect},
    definitions::PlaintextMessage,
    error::ProblemReportError,
    events::AgentEvent,
    message_type::{MessageTypeIdentifier, NOTIFICATION, replace_legacy_prefix},
    protocols::{
        connection::{self, ConnectionRecord},
        problem_report::{MESSAGE_PARSE_FAILURE, PROBLEM_REPORT, ProblemReport},
    },
    transport::{TransportSession, session::SessionEntry},
};

/// What became of a received wire message
pub(crate) enum Inbound {
    Dispatch(InboundMessageContext),
    /// Decrypted but unparsable; the report goes back to the known sender
    Rejected {
        report: Option<OutboundMessageContext>,
        reason: String,
    },
}

#[derive(Clone)]
pub(crate) struct MessageReceiver {
    agent: Arc<AgentContext>,
}

impl MessageReceiver {
    pub(crate) fn new(agent: Arc<AgentContext>) -> Self {
        Self { agent }
    }

    pub(crate) async fn receive(
        &self,
        bytes: &[u8],
        session: Option<Arc<dyn TransportSession>>,
    ) -> Result<Inbound, Error> {
        let agent = &self.agent;

        let (plaintext, sender_key, recipient_key) = match detect(bytes) {
            WireFormat::Encrypted(envelope) => {
                let candidates = agent.envelope.local_recipient_keys(&envelope).await;

                let decrypted = agent
                    .envelope
                    .open_raw(&envelope, &candidates)
                    .await
                    .inspect_err(|e| tracing::warn!("dropping inbound envelope: {e}"))?;

                (decrypted.plaintext, decrypted.sender_key, Some(decrypted.recipient_key))
            }
            WireFormat::Plaintext(_) if agent.config.accept_plaintext => {
                tracing::warn!("accepting unencrypted message");
                (bytes.to_vec(), None, None)
            }
            WireFormat::Plaintext(_) => {
                return Err(Error::InvalidMessage("unencrypted messages are not accepted".to_string()));
            }
            WireFormat::Unknown => {
                return Err(Error::InvalidMessage("unrecognized wire format".to_string()));
            }
        };

        tracing::trace!("received {}", String::from_utf8_lossy(&plaintext));

        let connection = match &recipient_key {
            Some(recipient) => {
                connection::find_for_inbound(agent.connections.as_ref(), recipient, sender_key.as_ref()).await?
            }
            None => None,
        };

        let (message, message_type) = match parse(&plaintext) {
            Ok(parsed) => parsed,
            Err(reason) => {
                tracing::warn!("cannot parse inbound message: {reason}");

                return Ok(Inbound::Rejected {
                    report: connection.map(|c| parse_failure_report(c, &reason)).transpose()?,
                    reason,
                });
            }
        };

        tracing::info!(
            "received {} ({}) on connection {:?}",
            message.id,
            message.message_type,
            connection.as_ref().map(|c| c.id.as_str())
        );

        agent.events.emit(AgentEvent::MessageReceived {
            message: message.clone(),
            connection_id: connection.as_ref().map(|c| c.id.clone()),
        });

        let session_id = match session {
            Some(session) if message.has_any_return_route() && sender_key.is_some() => {
                let session_id = session.id().to_string();
                agent.sessions.register(SessionEntry {
                    session,
                    sender_key: sender_key.clone(),
                    connection_id: connection.as_ref().map(|c| c.id.clone()),
                    return_route: message.return_route(),
                    thread_id: message.thread_id().to_string(),
                })?;

                Some(session_id)
            }
            _ => None,
        };

        Ok(Inbound::Dispatch(InboundMessageContext {
            message,
            message_type,
            connection,
            sender_key,
            recipient_key,
            session_id,
            agent: agent.clone(),
        }))
    }
}

fn parse(plaintext: &[u8]) -> Result<(PlaintextMessage, MessageTypeIdentifier), String> {
    let mut message = PlaintextMessage::from_json(plaintext).map_err(|e| e.to_string())?;
    message.message_type = replace_legacy_prefix(&message.message_type);

    let message_type = message.parsed_type().map_err(|e| e.to_string())?;

    Ok((message, message_type))
}

fn parse_failure_report(connection: ConnectionRecord, reason: &str) -> Result<OutboundMessageContext, Error> {
    let report = ProblemReportError::new(MESSAGE_PARSE_FAILURE, reason);
    let message = PlaintextMessage::new(NOTIFICATION.message_type(PROBLEM_REPORT), &ProblemReport::from(&report))?;

    Ok(OutboundMessageContext::new(message, connection))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rewrites_legacy_prefix() {
        let (message, message_type) = parse(
            br#"{"@id": "1", "@type": "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/trust_ping/1.0/ping", "response_requested": false}"#,
        )
        .unwrap();

        assert_eq!(message.message_type, "https://didcomm.org/trust_ping/1.0/ping");
        assert_eq!(message_type.protocol_name, "trust_ping");
        assert_eq!(message_type.message_name, "ping");
    }

    #[test]
    fn test_parse_failures() {
        assert!(parse(b"{}").is_err());
        assert!(parse(br#"{"@id": "1", "@type": "not a type"}"#).is_err());
    }
}
