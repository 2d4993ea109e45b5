//! Routing 1.0: relaying `forward` messages to the connection registered
//! for their recipient key.

use std::{collections::HashMap, sync::RwLock};

use crate::{
    Error,
    context::InboundMessageContext,
    crypto::ForwardBody,
    definitions::Key,
    dispatch::{HandlerResult, MessageHandler},
    message_type::ROUTING,
    protocols::mediation::KeylistResult,
    router::Router,
    storage::query,
};

pub const FORWARD: &str = "forward";

/// Recipient keys we mediate for, by base58 key, and the connection their
/// messages are delivered on. A key belongs to the first connection that
/// registers it.
#[derive(Debug, Default)]
pub struct MediatorRoutes {
    routes: RwLock<HashMap<String, String>>,
}

impl MediatorRoutes {
    /// Route `key` to `connection_id` unless another connection owns it
    pub fn add(&self, key: &Key, connection_id: &str) -> Result<KeylistResult, Error> {
        let key = key.to_base58();
        let mut routes = self.routes.write()?;

        let result = match routes.get(&key) {
            Some(owner) if owner == connection_id => KeylistResult::NoChange,
            Some(owner) => {
                tracing::warn!("connection {connection_id} tried to take over {key} of connection {owner}");
                KeylistResult::ClientError
            }
            None => {
                tracing::debug!("routing {key} to connection {connection_id}");
                routes.insert(key, connection_id.to_string());
                KeylistResult::Success
            }
        };

        Ok(result)
    }

    /// Stop routing `key`; only its owner may remove it
    pub fn remove(&self, key: &Key, connection_id: &str) -> Result<KeylistResult, Error> {
        let key = key.to_base58();
        let mut routes = self.routes.write()?;

        if routes.get(&key).is_some_and(|owner| owner == connection_id) {
            routes.remove(&key);
            return Ok(KeylistResult::Success);
        }

        Ok(KeylistResult::NoChange)
    }

    pub fn lookup(&self, key: &Key) -> Result<Option<String>, Error> {
        Ok(self.routes.read()?.get(&key.to_base58()).cloned())
    }
}

/// Forward messages the mediator cannot route fail the inbound request, so
/// the sender learns the message was not delivered
async fn process_forward(context: InboundMessageContext) -> HandlerResult {
    let forward: ForwardBody = context
        .message
        .body_as()
        .map_err(|e| Error::InvalidMessage(e.to_string()))?;

    let agent = &context.agent;

    let to = Key::parse(&forward.to)
        .map_err(|e| Error::InvalidMessage(format!("forward to invalid key '{}': {e}", forward.to)))?;

    let connection_id = match agent.routes.lookup(&to)? {
        Some(connection_id) => Some(connection_id),
        None => agent
            .connections
            .find_single_by_query(&query([("their_key", to.to_base58().as_str())]))
            .await?
            .map(|c| c.id),
    };

    let Some(connection_id) = connection_id else {
        tracing::warn!("refusing forward: no route for {}", to.to_base58());
        return Err(Error::NoRoute(to.to_base58()));
    };

    let status = Router::new(agent.clone())
        .deliver_envelope(&connection_id, forward.msg, &agent.cancel)
        .await?;

    tracing::info!("forwarded message for {} to connection {connection_id}: {status:?}", to.to_base58());

    Ok(None)
}

pub fn handlers() -> Vec<MessageHandler> {
    vec![MessageHandler::new("forward", vec![ROUTING.identifier(FORWARD)], process_forward)]
}
