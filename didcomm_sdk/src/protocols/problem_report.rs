//! Problem reports: building them for the protocol a failure happened in and
//! handling the generic `notification/1.0/problem-report`.

use serde::{Deserialize, Serialize};

use crate::{
    Error,
    context::InboundMessageContext,
    definitions::PlaintextMessage,
    dispatch::{HandlerResult, MessageHandler},
    error::ProblemReportError,
    events::AgentEvent,
    message_type::{
        DID_EXCHANGE, ISSUE_CREDENTIAL, MessageTypeIdentifier, NOTIFICATION, PRESENT_PROOF,
    },
};

pub const UNSUPPORTED_MESSAGE_TYPE: &str = "unsupported-message-type";
pub const MESSAGE_PARSE_FAILURE: &str = "message-parse-failure";

pub(crate) const PROBLEM_REPORT: &str = "problem-report";
pub(crate) const DID_EXCHANGE_PROBLEM_REPORT: &str = "problem_report";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDescription {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub en: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemReport {
    pub description: ProblemDescription,
}

impl From<&ProblemReportError> for ProblemReport {
    fn from(report: &ProblemReportError) -> Self {
        Self {
            description: ProblemDescription {
                code: report.code.clone(),
                en: Some(report.description.clone()),
            },
        }
    }
}

pub fn is_problem_report(message_type: &MessageTypeIdentifier) -> bool {
    message_type.message_name == PROBLEM_REPORT
        || message_type.message_name == DID_EXCHANGE_PROBLEM_REPORT
}

/// The problem report type answering a message of `inbound`: protocols that
/// define their own report use it, everything else gets the generic one.
pub fn report_type_for(inbound: &MessageTypeIdentifier) -> String {
    let matches = |protocol: crate::message_type::ProtocolUri| {
        inbound.protocol_name == protocol.name && inbound.major_version == protocol.major
    };

    if matches(DID_EXCHANGE) {
        DID_EXCHANGE.message_type(DID_EXCHANGE_PROBLEM_REPORT)
    } else if matches(ISSUE_CREDENTIAL) {
        ISSUE_CREDENTIAL.message_type(PROBLEM_REPORT)
    } else if matches(PRESENT_PROOF) {
        PRESENT_PROOF.message_type(PROBLEM_REPORT)
    } else {
        NOTIFICATION.message_type(PROBLEM_REPORT)
    }
}

/// A problem report on `thread_id` answering a message of type `inbound`
pub fn build(
    inbound: &MessageTypeIdentifier,
    report: &ProblemReportError,
    thread_id: &str,
) -> Result<PlaintextMessage, serde_json::Error> {
    Ok(PlaintextMessage::new(report_type_for(inbound), &ProblemReport::from(report))?.with_thread(thread_id))
}

/// Read a received problem report and publish it as an event
pub(crate) fn received(context: &InboundMessageContext) -> Result<ProblemReport, Error> {
    let report: ProblemReport = context
        .message
        .body_as()
        .map_err(|e| Error::InvalidMessage(e.to_string()))?;

    tracing::warn!(
        "received problem report '{}' on thread {}",
        report.description.code,
        context.message.thread_id()
    );

    context.agent.events.emit(AgentEvent::ProblemReportReceived {
        connection_id: context.connection.as_ref().map(|c| c.id.clone()),
        thread_id: context.message.thread_id().to_string(),
        code: report.description.code.clone(),
        description: report.description.en.clone().unwrap_or_default(),
    });

    Ok(report)
}

async fn handle(context: InboundMessageContext) -> HandlerResult {
    received(&context)?;

    Ok(None)
}

pub fn handler() -> MessageHandler {
    MessageHandler::new(
        "problem report",
        vec![NOTIFICATION.identifier(PROBLEM_REPORT)],
        handle,
    )
}
