//! The protocols an agent speaks out of the box.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    definitions::{Attachment, AttachmentFormat},
    dispatch::MessageHandler,
};

pub mod connection;
pub mod credential;
pub mod discover_features;
pub mod mediation;
pub mod pickup;
pub mod problem_report;
pub mod proof;
pub mod routing;
pub mod trust_ping;

/// Handlers of every built-in protocol
pub fn default_handlers() -> Vec<MessageHandler> {
    let mut handlers = vec![problem_report::handler()];
    handlers.extend(connection::handlers());
    handlers.extend(trust_ping::handlers());
    handlers.extend(credential::handlers());
    handlers.extend(proof::handlers());
    handlers.extend(routing::handlers());
    handlers.extend(mediation::handlers());
    handlers.extend(pickup::handlers());
    handlers.extend(discover_features::handlers());

    handlers
}

/// Body of the `ack` closing a credential or proof exchange
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub status: String,
}

impl Default for Ack {
    fn default() -> Self {
        Self {
            status: "OK".to_string(),
        }
    }
}

/// A single JSON attachment of `format` with its format descriptor
pub(crate) fn format_attachment(format: &str, data: Value) -> (Vec<AttachmentFormat>, Vec<Attachment>) {
    let attach_id = uuid::Uuid::new_v4().to_string();

    (
        vec![AttachmentFormat {
            attach_id: attach_id.clone(),
            format: format.to_string(),
        }],
        vec![Attachment::json(attach_id, data)],
    )
}

/// The first attachment that has a format descriptor, with its format
pub(crate) fn formatted_payload(
    formats: &[AttachmentFormat],
    attachments: &[Attachment],
) -> Option<(String, Value)> {
    formats.iter().find_map(|format| {
        attachments
            .iter()
            .find(|a| a.id == format.attach_id)
            .and_then(|a| a.data.json.clone())
            .map(|data| (format.format.clone(), data))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MessageTypeRegistry;

    #[test]
    fn test_default_handlers_register() {
        let mut registry = MessageTypeRegistry::default();
        for handler in default_handlers() {
            registry.register(handler).unwrap();
        }

        assert!(registry.len() >= 25);
        assert!(registry.supported_protocols().iter().any(|p| p.protocol_name == "messagepickup"));
    }

    #[test]
    fn test_formatted_payload() {
        let (formats, attachments) = format_attachment("test/v1", serde_json::json!({ "a": 1 }));
        assert_eq!(
            formatted_payload(&formats, &attachments),
            Some(("test/v1".to_string(), serde_json::json!({ "a": 1 })))
        );

        assert_eq!(formatted_payload(&formats, &[]), None);
        assert_eq!(formatted_payload(&[], &attachments), None);
    }
}
