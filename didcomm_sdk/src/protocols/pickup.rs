//! Message Pickup 2.0: a recipient without an endpoint of its own fetches
//! the envelopes its mediator queued for it. Queues are kept per
//! connection, a `recipient_key` filter is not supported.

use serde::{Deserialize, Serialize};

use crate::{
    Error,
    context::InboundMessageContext,
    definitions::{Attachment, PlaintextMessage},
    dispatch::{HandlerResult, MessageHandler},
    message_type::MESSAGE_PICKUP as PROTOCOL,
};

pub const STATUS_REQUEST: &str = "status-request";
pub const STATUS: &str = "status";
pub const DELIVERY_REQUEST: &str = "delivery-request";
pub const DELIVERY: &str = "delivery";
pub const MESSAGES_RECEIVED: &str = "messages-received";

/// Messages requested per delivery when the mediator reports a backlog
pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_key: Option<String>,
    /// One sealed envelope per attachment, its id the queued message id
    #[serde(rename = "~attach")]
    pub attachments: Vec<Attachment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesReceived {
    pub message_id_list: Vec<String>,
}

pub fn status_request() -> Result<PlaintextMessage, Error> {
    Ok(PlaintextMessage::new(
        PROTOCOL.message_type(STATUS_REQUEST),
        &StatusRequest::default(),
    )?)
}

pub fn delivery_request(limit: usize) -> Result<PlaintextMessage, Error> {
    Ok(PlaintextMessage::new(
        PROTOCOL.message_type(DELIVERY_REQUEST),
        &DeliveryRequest {
            limit,
            recipient_key: None,
        },
    )?)
}

fn body<T: serde::de::DeserializeOwned>(context: &InboundMessageContext) -> Result<T, Error> {
    context
        .message
        .body_as()
        .map_err(|e| Error::InvalidMessage(e.to_string()))
}

fn status(context: &InboundMessageContext, connection_id: &str) -> Result<PlaintextMessage, Error> {
    let message_count = context.agent.queues.len(connection_id)?;

    Ok(PlaintextMessage::new(
        PROTOCOL.message_type(STATUS),
        &Status {
            message_count,
            recipient_key: None,
        },
    )?
    .with_thread(context.message.thread_id()))
}

async fn process_status_request(context: InboundMessageContext) -> HandlerResult {
    let connection = context.ready_connection()?;
    let _: StatusRequest = body(&context)?;

    let status = status(&context, &connection.id)?;

    Ok(Some(context.reply(status)))
}

/// Queued messages stay queued until the recipient acknowledges them
async fn process_delivery_request(context: InboundMessageContext) -> HandlerResult {
    let connection = context.ready_connection()?;
    let request: DeliveryRequest = body(&context)?;

    let queued = context.agent.queues.peek(&connection.id, request.limit)?;
    if queued.is_empty() {
        let status = status(&context, &connection.id)?;
        return Ok(Some(context.reply(status)));
    }

    let mut attachments = Vec::with_capacity(queued.len());
    for message in queued {
        attachments.push(Attachment::json(message.id, serde_json::to_value(&message.envelope)?));
    }

    tracing::debug!("delivering {} messages to connection {}", attachments.len(), connection.id);

    let delivery = PlaintextMessage::new(
        PROTOCOL.message_type(DELIVERY),
        &Delivery {
            recipient_key: None,
            attachments,
        },
    )?
    .with_thread(context.message.thread_id());

    Ok(Some(context.reply(delivery)))
}

async fn process_messages_received(context: InboundMessageContext) -> HandlerResult {
    let connection = context.ready_connection()?;
    let received: MessagesReceived = body(&context)?;

    context
        .agent
        .queues
        .remove(&connection.id, &received.message_id_list)?;

    let status = status(&context, &connection.id)?;

    Ok(Some(context.reply(status)))
}

/// Ask for the backlog the mediator reports
async fn process_status(context: InboundMessageContext) -> HandlerResult {
    context.ready_connection()?;
    let status: Status = body(&context)?;

    if status.message_count == 0 {
        return Ok(None);
    }

    tracing::debug!("mediator holds {} messages for us", status.message_count);

    let request = delivery_request(DEFAULT_BATCH_SIZE.min(status.message_count))?;

    Ok(Some(context.reply(request)))
}

/// Queue every delivered envelope for receiving, then acknowledge them
async fn process_delivery(context: InboundMessageContext) -> HandlerResult {
    context.ready_connection()?;
    let delivery: Delivery = body(&context)?;

    let mut received = Vec::with_capacity(delivery.attachments.len());
    for attachment in delivery.attachments {
        let Some(envelope) = &attachment.data.json else {
            tracing::warn!("delivered message {} carries no envelope", attachment.id);
            continue;
        };

        if context.agent.inbound.send(serde_json::to_vec(envelope)?).is_err() {
            tracing::warn!("not acknowledging delivery: agent is shut down");
            return Ok(None);
        }
        received.push(attachment.id);
    }

    let ack = PlaintextMessage::new(
        PROTOCOL.message_type(MESSAGES_RECEIVED),
        &MessagesReceived {
            message_id_list: received,
        },
    )?
    .with_thread(context.message.thread_id());

    Ok(Some(context.reply(ack)))
}

pub fn handlers() -> Vec<MessageHandler> {
    vec![
        MessageHandler::new(
            "pickup status request",
            vec![PROTOCOL.identifier(STATUS_REQUEST)],
            process_status_request,
        ),
        MessageHandler::new(
            "pickup delivery request",
            vec![PROTOCOL.identifier(DELIVERY_REQUEST)],
            process_delivery_request,
        ),
        MessageHandler::new(
            "pickup messages received",
            vec![PROTOCOL.identifier(MESSAGES_RECEIVED)],
            process_messages_received,
        ),
        MessageHandler::new("pickup status", vec![PROTOCOL.identifier(STATUS)], process_status),
        MessageHandler::new("pickup delivery", vec![PROTOCOL.identifier(DELIVERY)], process_delivery),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_wire_format() {
        let delivery: Delivery = serde_json::from_value(serde_json::json!({
            "~attach": [
                { "@id": "m1", "data": { "json": { "protected": "e30" } } }
            ]
        }))
        .unwrap();

        assert_eq!(delivery.recipient_key, None);
        assert_eq!(delivery.attachments[0].id, "m1");

        let request = delivery_request(5).unwrap();
        assert_eq!(request.message_type, "https://didcomm.org/messagepickup/2.0/delivery-request");
        assert_eq!(request.body_as::<DeliveryRequest>().unwrap().limit, 5);
    }
}
