use serde::{Deserialize, Serialize};

use crate::{
    Error,
    context::InboundMessageContext,
    definitions::PlaintextMessage,
    dispatch::{HandlerResult, MessageHandler},
    message_type::TRUST_PING,
    protocols::connection::{self, DidExchangeRole, DidExchangeState},
};

pub const PING: &str = "ping";
pub const PING_RESPONSE: &str = "ping_response";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    #[serde(default = "response_requested_default")]
    pub response_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn response_requested_default() -> bool {
    true
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

pub fn ping(response_requested: bool) -> Result<PlaintextMessage, Error> {
    Ok(PlaintextMessage::new(
        TRUST_PING.message_type(PING),
        &Ping {
            response_requested,
            comment: None,
        },
    )?)
}

async fn process_ping(context: InboundMessageContext) -> HandlerResult {
    let ping: Ping = context
        .message
        .body_as()
        .map_err(|e| Error::InvalidMessage(e.to_string()))?;

    let mut connection = context.connection.clone();
    if let Some(record) = connection.take() {
        connection = Some(
            if record.role == DidExchangeRole::Responder && record.state == DidExchangeState::ResponseSent {
                connection::complete_by_ping(&context.agent, record, &context.message).await?
            } else {
                record
            },
        );
    }

    if !ping.response_requested {
        return Ok(None);
    }

    if !context.has_reply_channel() {
        tracing::warn!("cannot answer ping {}: no way back to the sender", context.message.id);
        return Ok(None);
    }

    let response = PlaintextMessage::new(TRUST_PING.message_type(PING_RESPONSE), &PingResponse::default())?
        .with_thread(context.message.thread_id());

    let mut outbound = context.reply(response);
    outbound.connection = connection;

    Ok(Some(outbound))
}

async fn process_ping_response(context: InboundMessageContext) -> HandlerResult {
    tracing::info!(
        "ping {} answered on connection {:?}",
        context.message.thread_id(),
        context.connection.as_ref().map(|c| c.id.as_str())
    );

    Ok(None)
}

pub fn handlers() -> Vec<MessageHandler> {
    vec![
        MessageHandler::new("trust ping", vec![TRUST_PING.identifier(PING)], process_ping),
        MessageHandler::new(
            "trust ping response",
            vec![TRUST_PING.identifier(PING_RESPONSE)],
            process_ping_response,
        ),
    ]
}
