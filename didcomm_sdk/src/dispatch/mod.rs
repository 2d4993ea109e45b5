//! Resolving inbound messages to protocol handlers.

use crate::{
    context::{InboundMessageContext, OutboundMessageContext},
    error::ProblemReportError,
    protocols::problem_report::{self, UNSUPPORTED_MESSAGE_TYPE},
};

mod registry;

pub use registry::{HandlerFn, HandlerResult, MessageHandler, MessageTypeRegistry};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("message type {message_type} is already handled by '{existing}'")]
    DuplicateHandler {
        message_type: String,
        existing: &'static str,
    },
    #[error("no handler found for message type {0}")]
    NoHandlerFound(String),
}

/// Invokes the handler registered for an inbound message and turns
/// protocol failures into problem reports for the sender.
#[derive(Clone, Default)]
pub struct Dispatcher {
    registry: MessageTypeRegistry,
    fallback: Option<HandlerFn>,
}

impl Dispatcher {
    pub fn new(registry: MessageTypeRegistry, fallback: Option<HandlerFn>) -> Self {
        Self { registry, fallback }
    }

    pub fn registry(&self) -> &MessageTypeRegistry {
        &self.registry
    }

    pub async fn dispatch(&self, context: InboundMessageContext) -> HandlerResult {
        let handle = match self.registry.resolve(&context.message_type) {
            Ok(handler) => {
                tracing::debug!(
                    "dispatching {} to '{}'",
                    context.message_type,
                    handler.name
                );
                handler.handle.clone()
            }
            Err(error) => match &self.fallback {
                Some(fallback) => {
                    tracing::debug!("dispatching {} to fallback", context.message_type);
                    fallback.clone()
                }
                None => return Ok(unhandled(&context, error.to_string())),
            },
        };

        match handle(context.clone()).await {
            Ok(reply) => Ok(reply),
            Err(error) => match error.as_problem_report() {
                Some(report) => {
                    tracing::warn!(
                        "{} on thread {} failed: {report}",
                        context.message_type,
                        context.message.thread_id()
                    );
                    Ok(report_to_sender(&context, &report))
                }
                None => Err(error),
            },
        }
    }
}

fn unhandled(context: &InboundMessageContext, reason: String) -> Option<OutboundMessageContext> {
    if !context.has_reply_channel() {
        tracing::warn!("dropping message {}: {reason}", context.message.id);
        return None;
    }

    report_to_sender(
        context,
        &ProblemReportError::new(UNSUPPORTED_MESSAGE_TYPE, reason),
    )
}

/// The problem report answering `context`; never one in response to a
/// problem report.
pub(crate) fn report_to_sender(
    context: &InboundMessageContext,
    report: &ProblemReportError,
) -> Option<OutboundMessageContext> {
    if problem_report::is_problem_report(&context.message_type) {
        tracing::warn!(
            "not answering problem report {} with '{}'",
            context.message.id,
            report.code
        );
        return None;
    }

    match problem_report::build(&context.message_type, report, context.message.thread_id()) {
        Ok(message) => Some(context.reply(message)),
        Err(e) => {
            tracing::error!("could not build problem report: {e}");
            None
        }
    }
}
