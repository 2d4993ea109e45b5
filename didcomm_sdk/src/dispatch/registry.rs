use futures::future::BoxFuture;
use std::{collections::HashMap, future::Future, sync::Arc};

use super::DispatchError;
use crate::{
    Error,
    context::{InboundMessageContext, OutboundMessageContext},
    message_type::{MessageTypeIdentifier, ProtocolIdentifier},
};

pub type HandlerResult = Result<Option<OutboundMessageContext>, Error>;

pub type HandlerFn =
    Arc<dyn Fn(InboundMessageContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// A protocol handler: a named function value and the message types it
/// accepts.
#[derive(Clone)]
pub struct MessageHandler {
    pub name: &'static str,
    pub supported: Vec<MessageTypeIdentifier>,
    pub handle: HandlerFn,
}

impl MessageHandler {
    pub fn new<F, Fut>(name: &'static str, supported: Vec<MessageTypeIdentifier>, handle: F) -> Self
    where
        F: Fn(InboundMessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            name,
            supported,
            handle: Arc::new(move |context| Box::pin(handle(context))),
        }
    }
}

impl std::fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandler")
            .field("name", &self.name)
            .field("supported", &self.supported)
            .finish()
    }
}

type RoutingKey = (String, u32, String);

/// Routing table from (protocol, major version, message name) to handler.
/// Filled at startup, read-only afterwards.
#[derive(Clone, Default, Debug)]
pub struct MessageTypeRegistry {
    handlers: HashMap<RoutingKey, MessageHandler>,
}

impl MessageTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handler`; fails without registering anything if one of its
    /// message types is already claimed.
    pub fn register(&mut self, handler: MessageHandler) -> Result<(), DispatchError> {
        for message_type in &handler.supported {
            if let Some(existing) = self.handlers.get(&message_type.routing_key()) {
                return Err(DispatchError::DuplicateHandler {
                    message_type: message_type.to_string(),
                    existing: existing.name,
                });
            }
        }

        for message_type in &handler.supported {
            self.handlers
                .insert(message_type.routing_key(), handler.clone());
        }

        Ok(())
    }

    /// The handler for a compatible message type; the minor version is not
    /// considered.
    pub fn resolve(&self, message_type: &MessageTypeIdentifier) -> Result<&MessageHandler, DispatchError> {
        self.handlers
            .get(&message_type.routing_key())
            .ok_or_else(|| DispatchError::NoHandlerFound(message_type.to_string()))
    }

    /// All protocols with at least one registered message type
    pub fn supported_protocols(&self) -> Vec<ProtocolIdentifier> {
        let mut protocols: Vec<ProtocolIdentifier> = Vec::new();

        for handler in self.handlers.values() {
            for message_type in &handler.supported {
                let protocol = message_type.protocol();
                if !protocols.iter().any(|p| p == &protocol) {
                    protocols.push(protocol);
                }
            }
        }

        protocols.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        protocols
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_type::{ProtocolUri, TRUST_PING};

    fn noop(name: &'static str, supported: Vec<MessageTypeIdentifier>) -> MessageHandler {
        MessageHandler::new(name, supported, |_| async { Ok(None) })
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = MessageTypeRegistry::new();
        registry
            .register(noop(
                "trust ping",
                vec![TRUST_PING.identifier("ping"), TRUST_PING.identifier("ping_response")],
            ))
            .unwrap();

        assert_eq!(registry.len(), 2);

        for message_type in [
            "https://didcomm.org/trust_ping/1.0/ping",
            "https://didcomm.org/trust_ping/1.3/ping",
            "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/trust_ping/1.0/ping",
        ] {
            let parsed = MessageTypeIdentifier::parse(message_type).unwrap();
            assert_eq!(registry.resolve(&parsed).unwrap().name, "trust ping");
        }

        let v2 = MessageTypeIdentifier::parse("https://didcomm.org/trust_ping/2.0/ping").unwrap();
        assert_eq!(
            registry.resolve(&v2).unwrap_err(),
            DispatchError::NoHandlerFound("https://didcomm.org/trust_ping/2.0/ping".to_string())
        );
    }

    #[test]
    fn test_duplicate_handler() {
        let mut registry = MessageTypeRegistry::new();
        registry
            .register(noop("first", vec![TRUST_PING.identifier("ping")]))
            .unwrap();

        let other_minor = ProtocolUri::new("trust_ping", 1, 5);
        let Err(DispatchError::DuplicateHandler { existing, .. }) = registry.register(noop(
            "second",
            vec![other_minor.identifier("other"), other_minor.identifier("ping")],
        )) else {
            panic!("duplicate registration should fail");
        };
        assert_eq!(existing, "first");

        // nothing of the failed handler was registered
        let other = other_minor.identifier("other");
        assert!(registry.resolve(&other).is_err());
    }

    #[test]
    fn test_supported_protocols() {
        let mut registry = MessageTypeRegistry::new();
        registry
            .register(noop(
                "trust ping",
                vec![TRUST_PING.identifier("ping"), TRUST_PING.identifier("ping_response")],
            ))
            .unwrap();

        assert_eq!(
            registry
                .supported_protocols()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
            vec![TRUST_PING.uri()]
        );
    }
}
