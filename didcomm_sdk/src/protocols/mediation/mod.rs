//! Coordinate Mediation 1.0: a recipient asks a mediator to relay its
//! inbound messages, then registers every key it publishes behind the
//! mediator with `keylist-update`.

use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;

use crate::{
    Agent, Error, MediatorConfig, OutboundSendStatus,
    context::{AgentContext, InboundMessageContext, OutboundMessageContext},
    definitions::{Key, KeyType, PlaintextMessage},
    dispatch::{HandlerResult, MessageHandler},
    error::ProblemReportError,
    events::AgentEvent,
    message_type::COORDINATE_MEDIATION as PROTOCOL,
    protocols::pickup,
    router::Router,
    state_machine::{apply_transition, is_replay},
    storage::query,
};

mod messages;
mod record;
mod state;

pub use messages::{
    KEYLIST_UPDATE, KEYLIST_UPDATE_RESPONSE, KeylistAction, KeylistResult, KeylistUpdate, KeylistUpdateItem,
    KeylistUpdateResponse, KeylistUpdated, MEDIATE_DENY, MEDIATE_GRANT, MEDIATE_REQUEST, MediateDeny, MediateGrant,
    MediateRequest,
};
pub use record::MediationRecord;
pub use state::{MEDIATION_GRAPH, MediationRole, MediationState};

pub const REQUEST_NOT_ACCEPTED: &str = "request_not_accepted";

async fn transition(
    agent: &AgentContext,
    record: &mut MediationRecord,
    state: MediationState,
    inbound_message_id: Option<&str>,
) -> Result<(), Error> {
    let previous_state = apply_transition(agent.mediations.as_ref(), record, state, inbound_message_id).await?;

    tracing::info!("mediation {} over connection {} is {state}", record.id, record.connection_id);

    agent.events.emit(AgentEvent::MediationStateChanged {
        mediation_id: record.id.clone(),
        connection_id: record.connection_id.clone(),
        previous_state,
        state,
    });

    Ok(())
}

async fn find_by_thread(
    agent: &AgentContext,
    thread_id: &str,
    connection_id: &str,
) -> Result<Option<MediationRecord>, Error> {
    Ok(agent
        .mediations
        .find_single_by_query(&query([("thread_id", thread_id), ("connection_id", connection_id)]))
        .await?)
}

/// The mediation we granted to `connection_id`, if any
async fn granted_to(agent: &AgentContext, connection_id: &str) -> Result<Option<MediationRecord>, Error> {
    Ok(agent
        .mediations
        .find_by_query(&query([
            ("connection_id", connection_id),
            ("role", MediationRole::Mediator.as_str()),
            ("state", MediationState::Granted.as_str()),
        ]))
        .await?
        .into_iter()
        .next())
}

async fn send_step(
    agent: &AgentContext,
    mut record: MediationRecord,
    next: MediationState,
    message_name: &str,
    body: &impl Serialize,
) -> Result<(MediationRecord, OutboundMessageContext), Error> {
    let connection = agent.ready_connection(&record.connection_id).await?;
    let message = PlaintextMessage::new(PROTOCOL.message_type(message_name), body)?
        .with_thread(record.thread_id.clone());

    transition(agent, &mut record, next, None).await?;

    let outbound = OutboundMessageContext::new(message, connection).with_associated_record(&record.id);

    Ok((record, outbound))
}

pub(crate) async fn create_request(
    agent: &AgentContext,
    connection_id: &str,
) -> Result<(MediationRecord, OutboundMessageContext), Error> {
    agent.ready_connection(connection_id).await?;

    let record = MediationRecord::new(connection_id, uuid::Uuid::new_v4().to_string(), MediationRole::Recipient);
    let next = MEDIATION_GRAPH.assert_send(&record, MEDIATE_REQUEST)?;

    send_step(agent, record, next, MEDIATE_REQUEST, &MediateRequest::default()).await
}

/// Grant with a fresh routing key the recipient's senders wrap forwards to
pub(crate) async fn create_grant(
    agent: &AgentContext,
    mut record: MediationRecord,
) -> Result<(MediationRecord, OutboundMessageContext), Error> {
    let next = MEDIATION_GRAPH.assert_send(&record, MEDIATE_GRANT)?;

    let endpoint = agent
        .config
        .endpoints
        .first()
        .cloned()
        .ok_or_else(|| Error::Config("granting mediation requires an inbound endpoint".to_string()))?;
    let routing_key = agent.keys().create_key(KeyType::Ed25519).await?;

    record.endpoint = Some(endpoint.clone());
    record.routing_keys = vec![routing_key.clone()];

    send_step(
        agent,
        record,
        next,
        MEDIATE_GRANT,
        &MediateGrant {
            endpoint,
            routing_keys: vec![routing_key],
        },
    )
    .await
}

pub(crate) async fn create_deny(
    agent: &AgentContext,
    record: MediationRecord,
) -> Result<(MediationRecord, OutboundMessageContext), Error> {
    let next = MEDIATION_GRAPH.assert_send(&record, MEDIATE_DENY)?;

    send_step(agent, record, next, MEDIATE_DENY, &MediateDeny::default()).await
}

/// Ask our mediator, over `connection_id`, to route messages for `key` to
/// us. The response is received like any other inbound message.
pub(crate) async fn register_route(agent: &Arc<AgentContext>, connection_id: &str, key: &Key) -> Result<(), Error> {
    let connection = agent.ready_connection(connection_id).await?;

    let message = PlaintextMessage::new(
        PROTOCOL.message_type(KEYLIST_UPDATE),
        &KeylistUpdate {
            updates: vec![KeylistUpdateItem {
                recipient_key: key.to_base58(),
                action: KeylistAction::Add,
            }],
        },
    )?;

    let delivered = Router::new(agent.clone())
        .deliver(OutboundMessageContext::new(message, connection), &agent.cancel)
        .await?;

    if let Some(reply) = delivered.reply
        && agent.inbound.send(reply).is_err()
    {
        tracing::warn!("dropping keylist update response: agent is shut down");
    }

    Ok(())
}

fn parse_body<T: DeserializeOwned>(context: &InboundMessageContext) -> Result<T, ProblemReportError> {
    context
        .message
        .body_as()
        .map_err(|e| ProblemReportError::new(REQUEST_NOT_ACCEPTED, e.to_string()))
}

async fn inbound_record(
    context: &InboundMessageContext,
    message_name: &str,
    role: MediationRole,
) -> Result<Option<(MediationRecord, MediationState)>, Error> {
    let connection = context.ready_connection()?;
    let thread_id = context.message.thread_id();

    let record = match find_by_thread(&context.agent, thread_id, &connection.id).await? {
        Some(record) => record,
        None if message_name == MEDIATE_REQUEST => MediationRecord::new(&connection.id, thread_id, role),
        None => {
            return Err(ProblemReportError::new(
                REQUEST_NOT_ACCEPTED,
                format!("no mediation request on thread {thread_id}"),
            )
            .into());
        }
    };

    if is_replay(&record, &context.message) {
        tracing::debug!("ignoring replayed {message_name} {}", context.message.id);
        return Ok(None);
    }

    let next = MEDIATION_GRAPH
        .assert_transition(&record, message_name, &[role])
        .map_err(|e| ProblemReportError::new(REQUEST_NOT_ACCEPTED, e.to_string()))?;

    Ok(Some((record, next)))
}

async fn process_mediate_request(context: InboundMessageContext) -> HandlerResult {
    let Some((mut record, next)) = inbound_record(&context, MEDIATE_REQUEST, MediationRole::Mediator).await? else {
        return Ok(None);
    };

    let _: MediateRequest = parse_body(&context)?;
    transition(&context.agent, &mut record, next, Some(context.message.id.as_str())).await?;

    if !context.agent.config.auto_accept_mediation {
        return Ok(None);
    }

    let (_, outbound) = create_grant(&context.agent, record).await?;

    Ok(Some(outbound.with_session(context.session_id.clone())))
}

async fn process_mediate_grant(context: InboundMessageContext) -> HandlerResult {
    let Some((mut record, next)) = inbound_record(&context, MEDIATE_GRANT, MediationRole::Recipient).await? else {
        return Ok(None);
    };

    let grant: MediateGrant = parse_body(&context)?;
    if grant.routing_keys.is_empty() {
        return Err(ProblemReportError::new(REQUEST_NOT_ACCEPTED, "mediation granted without routing keys").into());
    }

    record.endpoint = Some(grant.endpoint.clone());
    record.routing_keys = grant.routing_keys.clone();
    transition(&context.agent, &mut record, next, Some(context.message.id.as_str())).await?;

    context.agent.set_mediator(MediatorConfig {
        endpoint: grant.endpoint,
        routing_keys: grant.routing_keys,
        connection_id: Some(record.connection_id),
    });

    Ok(None)
}

async fn process_mediate_deny(context: InboundMessageContext) -> HandlerResult {
    let Some((mut record, next)) = inbound_record(&context, MEDIATE_DENY, MediationRole::Recipient).await? else {
        return Ok(None);
    };

    transition(&context.agent, &mut record, next, Some(context.message.id.as_str())).await?;

    Ok(None)
}

/// Keys are only routed for connections we granted mediation, and a key
/// stays with the connection that registered it first
async fn process_keylist_update(context: InboundMessageContext) -> HandlerResult {
    let agent = &context.agent;
    let connection = context.ready_connection()?.clone();
    let update: KeylistUpdate = parse_body(&context)?;

    let Some(mut mediation) = granted_to(agent, &connection.id).await? else {
        return Err(ProblemReportError::new(
            REQUEST_NOT_ACCEPTED,
            format!("no mediation granted to connection {}", connection.id),
        )
        .into());
    };

    let registered = mediation.recipient_keys.clone();
    let mut updated = Vec::with_capacity(update.updates.len());
    for item in update.updates {
        let result = match Key::parse(&item.recipient_key) {
            Ok(key) => {
                let base58 = key.to_base58();
                match item.action {
                    KeylistAction::Add => {
                        let result = agent.routes.add(&key, &connection.id)?;
                        if result != KeylistResult::ClientError && !mediation.recipient_keys.contains(&base58) {
                            mediation.recipient_keys.push(base58);
                        }
                        result
                    }
                    KeylistAction::Remove => {
                        mediation.recipient_keys.retain(|k| *k != base58);
                        agent.routes.remove(&key, &connection.id)?
                    }
                }
            }
            Err(_) => KeylistResult::ClientError,
        };

        updated.push(KeylistUpdated {
            recipient_key: item.recipient_key,
            action: item.action,
            result,
        });
    }

    if mediation.recipient_keys != registered {
        agent.mediations.update(&mut mediation).await?;
    }

    let response = PlaintextMessage::new(
        PROTOCOL.message_type(KEYLIST_UPDATE_RESPONSE),
        &KeylistUpdateResponse { updated },
    )?
    .with_thread(context.message.thread_id());

    Ok(Some(context.reply(response)))
}

async fn process_keylist_update_response(context: InboundMessageContext) -> HandlerResult {
    let response: KeylistUpdateResponse = parse_body(&context)?;

    for item in response.updated {
        match item.result {
            KeylistResult::Success | KeylistResult::NoChange => {
                tracing::debug!("mediator {:?} {}: {:?}", item.action, item.recipient_key, item.result);
            }
            result => tracing::warn!("mediator refused {:?} {}: {result:?}", item.action, item.recipient_key),
        }
    }

    Ok(None)
}

pub fn handlers() -> Vec<MessageHandler> {
    vec![
        MessageHandler::new(
            "mediate request",
            vec![PROTOCOL.identifier(MEDIATE_REQUEST)],
            process_mediate_request,
        ),
        MessageHandler::new(
            "mediate grant",
            vec![PROTOCOL.identifier(MEDIATE_GRANT)],
            process_mediate_grant,
        ),
        MessageHandler::new("mediate deny", vec![PROTOCOL.identifier(MEDIATE_DENY)], process_mediate_deny),
        MessageHandler::new(
            "keylist update",
            vec![PROTOCOL.identifier(KEYLIST_UPDATE)],
            process_keylist_update,
        ),
        MessageHandler::new(
            "keylist update response",
            vec![PROTOCOL.identifier(KEYLIST_UPDATE_RESPONSE)],
            process_keylist_update_response,
        ),
    ]
}

/// Mediation relationships of an [`Agent`], as recipient or mediator
pub struct MediationApi<'a> {
    agent: &'a Agent,
}

impl<'a> MediationApi<'a> {
    pub(crate) fn new(agent: &'a Agent) -> Self {
        Self { agent }
    }

    /// Ask the peer of `connection_id` to mediate for us. A grant returned
    /// on the same exchange is processed before this returns and makes the
    /// peer our mediator.
    pub async fn request(&self, connection_id: &str) -> Result<MediationRecord, Error> {
        let (record, outbound) = create_request(self.agent.context(), connection_id).await?;
        self.agent.send_message(outbound).await?;

        self.get(&record.id).await
    }

    pub async fn grant(&self, id: &str) -> Result<MediationRecord, Error> {
        let record = self.get(id).await?;
        let (record, outbound) = create_grant(self.agent.context(), record).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    pub async fn deny(&self, id: &str) -> Result<MediationRecord, Error> {
        let record = self.get(id).await?;
        let (record, outbound) = create_deny(self.agent.context(), record).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    /// Fetch up to `limit` messages our mediator holds for us over
    /// `connection_id`; they are received as they arrive
    pub async fn pickup(&self, connection_id: &str, limit: usize) -> Result<OutboundSendStatus, Error> {
        let connection = self.agent.context().ready_connection(connection_id).await?;
        let request = pickup::delivery_request(limit)?;

        self.agent
            .send_message(OutboundMessageContext::new(request, connection))
            .await
    }

    pub async fn get(&self, id: &str) -> Result<MediationRecord, Error> {
        Ok(self.agent.context().mediations.get_by_id(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<MediationRecord>, Error> {
        Ok(self.agent.context().mediations.get_all().await?)
    }

    pub async fn delete(&self, id: &str) -> Result<(), Error> {
        Ok(self.agent.context().mediations.delete(id).await?)
    }
}
