//! Discover Features 1.0: tell a peer which protocols we speak.

use serde::{Deserialize, Serialize};

use crate::{
    Error,
    context::InboundMessageContext,
    definitions::PlaintextMessage,
    dispatch::{HandlerResult, MessageHandler},
    events::AgentEvent,
    message_type::{DISCOVER_FEATURES as PROTOCOL, ProtocolIdentifier, parse_protocol_uri},
};

pub const QUERY: &str = "query";
pub const DISCLOSE: &str = "disclose";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Protocol URI, optionally ending in `*` to match a prefix
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisclosedProtocol {
    pub pid: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disclose {
    pub protocols: Vec<DisclosedProtocol>,
}

pub fn query(query: &str) -> Result<PlaintextMessage, Error> {
    Ok(PlaintextMessage::new(
        PROTOCOL.message_type(QUERY),
        &Query {
            query: query.to_string(),
            comment: None,
        },
    )?)
}

/// Whether protocol URI `pid` matches `query`
pub fn matches(query: &str, pid: &str) -> bool {
    match query.strip_suffix('*') {
        Some(prefix) => pid.starts_with(prefix),
        None => pid == query,
    }
}

fn disclosed(protocols: &[ProtocolIdentifier], query: &str) -> Vec<DisclosedProtocol> {
    protocols
        .iter()
        .map(ToString::to_string)
        .filter(|pid| matches(query, pid))
        .map(|pid| DisclosedProtocol { pid, roles: Vec::new() })
        .collect()
}

async fn process_query(context: InboundMessageContext) -> HandlerResult {
    context.ready_connection()?;
    let query: Query = context
        .message
        .body_as()
        .map_err(|e| Error::InvalidMessage(e.to_string()))?;

    let protocols = disclosed(&context.agent.protocols, &query.query);
    tracing::debug!("disclosing {} protocols for '{}'", protocols.len(), query.query);

    let disclose = PlaintextMessage::new(PROTOCOL.message_type(DISCLOSE), &Disclose { protocols })?
        .with_thread(context.message.thread_id());

    Ok(Some(context.reply(disclose)))
}

async fn process_disclose(context: InboundMessageContext) -> HandlerResult {
    let disclose: Disclose = context
        .message
        .body_as()
        .map_err(|e| Error::InvalidMessage(e.to_string()))?;

    let protocols = disclose
        .protocols
        .iter()
        .filter_map(|protocol| match parse_protocol_uri(&protocol.pid) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::debug!("ignoring disclosed protocol: {e}");
                None
            }
        })
        .collect();

    context.agent.events.emit(AgentEvent::FeaturesDisclosed {
        connection_id: context.connection.as_ref().map(|c| c.id.clone()),
        thread_id: context.message.thread_id().to_string(),
        protocols,
    });

    Ok(None)
}

pub fn handlers() -> Vec<MessageHandler> {
    vec![
        MessageHandler::new("feature query", vec![PROTOCOL.identifier(QUERY)], process_query),
        MessageHandler::new("feature disclosure", vec![PROTOCOL.identifier(DISCLOSE)], process_disclose),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_type::{DID_EXCHANGE, ISSUE_CREDENTIAL, TRUST_PING};

    #[test]
    fn test_query_matching() {
        let protocols: Vec<ProtocolIdentifier> = [DID_EXCHANGE, TRUST_PING, ISSUE_CREDENTIAL]
            .iter()
            .map(|p| ProtocolIdentifier::parse(&p.uri()).unwrap())
            .collect();

        assert_eq!(disclosed(&protocols, "*").len(), 3);
        assert_eq!(
            disclosed(&protocols, "https://didcomm.org/trust_ping/*"),
            vec![DisclosedProtocol {
                pid: TRUST_PING.uri(),
                roles: Vec::new()
            }]
        );
        assert_eq!(disclosed(&protocols, &ISSUE_CREDENTIAL.uri()).len(), 1);
        assert!(disclosed(&protocols, "https://didcomm.org/didexchange/1.0").is_empty());
    }
}
