//! Present Proof 2.0 between a prover and a verifier over a completed
//! connection.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::sync::Arc;

use crate::{
    Agent, Error,
    context::{AgentContext, InboundMessageContext, OutboundMessageContext},
    definitions::{Attachment, AttachmentFormat, PlaintextMessage},
    dispatch::{HandlerResult, MessageHandler},
    error::ProblemReportError,
    events::AgentEvent,
    message_type::PRESENT_PROOF as PROTOCOL,
    protocols::{Ack, format_attachment, formatted_payload, problem_report},
    state_machine::{apply_transition, is_replay},
    storage::query,
};

mod format;
mod messages;
mod record;
mod state;

pub use format::ProofFormatService;
pub use messages::{
    ACK, PRESENTATION, PROPOSE_PRESENTATION, Presentation, ProposePresentation, REQUEST_PRESENTATION,
    RequestPresentation,
};
pub use record::ProofExchangeRecord;
pub use state::{LegacyProofState, PROOF_GRAPH, ProofRole, ProofState};

pub const PRESENTATION_ABANDONED: &str = "presentation-abandoned";
pub const INVALID_PRESENTATION: &str = "invalid-presentation";

async fn transition(
    agent: &AgentContext,
    record: &mut ProofExchangeRecord,
    state: ProofState,
    inbound_message_id: Option<&str>,
) -> Result<(), Error> {
    let previous_state = apply_transition(agent.proofs.as_ref(), record, state, inbound_message_id).await?;

    tracing::info!("proof exchange {} is {state}", record.id);

    agent.events.emit(AgentEvent::ProofStateChanged {
        proof_exchange_id: record.id.clone(),
        thread_id: record.thread_id.clone(),
        previous_state,
        state,
    });

    Ok(())
}

async fn find_by_thread(
    agent: &AgentContext,
    thread_id: &str,
    connection_id: &str,
) -> Result<Option<ProofExchangeRecord>, Error> {
    Ok(agent
        .proofs
        .find_single_by_query(&query([("thread_id", thread_id), ("connection_id", connection_id)]))
        .await?)
}

fn format_service(
    agent: &AgentContext,
    record: &ProofExchangeRecord,
) -> Result<Arc<dyn ProofFormatService>, ProblemReportError> {
    let format = record.format.as_deref().unwrap_or_default();

    agent
        .proof_format(format)
        .cloned()
        .ok_or_else(|| ProblemReportError::new(PRESENTATION_ABANDONED, format!("unsupported proof format '{format}'")))
}

async fn send_step(
    agent: &AgentContext,
    mut record: ProofExchangeRecord,
    next: ProofState,
    message_name: &str,
    body: &impl Serialize,
) -> Result<(ProofExchangeRecord, OutboundMessageContext), Error> {
    let connection = agent.ready_connection(&record.connection_id).await?;
    let message = PlaintextMessage::new(PROTOCOL.message_type(message_name), body)?
        .with_thread(record.thread_id.clone());

    transition(agent, &mut record, next, None).await?;

    let outbound = OutboundMessageContext::new(message, connection).with_associated_record(&record.id);

    Ok((record, outbound))
}

pub(crate) async fn create_proposal(
    agent: &AgentContext,
    mut record: ProofExchangeRecord,
    input: &Value,
) -> Result<(ProofExchangeRecord, OutboundMessageContext), Error> {
    let next = PROOF_GRAPH.assert_send(&record, PROPOSE_PRESENTATION)?;
    let service = format_service(agent, &record)?;

    let proposal = service.create_proposal(input).await?;
    let (formats, proposals_attach) = format_attachment(service.format(), proposal.clone());
    record.proposal = Some(proposal);

    send_step(
        agent,
        record,
        next,
        PROPOSE_PRESENTATION,
        &ProposePresentation {
            comment: None,
            formats,
            proposals_attach,
        },
    )
    .await
}

/// Request a presentation; without `input` the received proposal is answered
pub(crate) async fn create_request(
    agent: &AgentContext,
    mut record: ProofExchangeRecord,
    input: Option<&Value>,
) -> Result<(ProofExchangeRecord, OutboundMessageContext), Error> {
    let next = PROOF_GRAPH.assert_send(&record, REQUEST_PRESENTATION)?;
    let service = format_service(agent, &record)?;

    let input = input.or(record.proposal.as_ref()).cloned().unwrap_or_default();
    let request = service.create_request(&input).await?;
    let (formats, request_presentations_attach) = format_attachment(service.format(), request.clone());
    record.request = Some(request);

    send_step(
        agent,
        record,
        next,
        REQUEST_PRESENTATION,
        &RequestPresentation {
            comment: None,
            will_confirm: true,
            formats,
            request_presentations_attach,
        },
    )
    .await
}

pub(crate) async fn create_presentation(
    agent: &AgentContext,
    mut record: ProofExchangeRecord,
) -> Result<(ProofExchangeRecord, OutboundMessageContext), Error> {
    let next = PROOF_GRAPH.assert_send(&record, PRESENTATION)?;
    let service = format_service(agent, &record)?;

    let presentation = service
        .create_presentation(record.request.as_ref().unwrap_or(&Value::Null))
        .await?;
    let (formats, presentations_attach) = format_attachment(service.format(), presentation.clone());
    record.presentation = Some(presentation);

    send_step(
        agent,
        record,
        next,
        PRESENTATION,
        &Presentation {
            comment: None,
            formats,
            presentations_attach,
        },
    )
    .await
}

pub(crate) async fn create_ack(
    agent: &AgentContext,
    record: ProofExchangeRecord,
) -> Result<(ProofExchangeRecord, OutboundMessageContext), Error> {
    let next = PROOF_GRAPH.assert_send(&record, ACK)?;

    send_step(agent, record, next, ACK, &Ack::default()).await
}

async fn inbound_record(
    context: &InboundMessageContext,
    message_name: &str,
    role: ProofRole,
    opens_exchange: bool,
) -> Result<Option<(ProofExchangeRecord, ProofState)>, Error> {
    let connection = context.ready_connection()?;
    let thread_id = context.message.thread_id();

    let record = match find_by_thread(&context.agent, thread_id, &connection.id).await? {
        Some(record) => record,
        None if opens_exchange => ProofExchangeRecord::new(&connection.id, thread_id, role),
        None => {
            return Err(ProblemReportError::new(
                PRESENTATION_ABANDONED,
                format!("no proof exchange on thread {thread_id}"),
            )
            .into());
        }
    };

    if is_replay(&record, &context.message) {
        tracing::debug!("ignoring replayed {message_name} {}", context.message.id);
        return Ok(None);
    }

    let next = PROOF_GRAPH
        .assert_transition(&record, message_name, &[role])
        .map_err(|e| ProblemReportError::new(PRESENTATION_ABANDONED, e.to_string()))?;

    Ok(Some((record, next)))
}

fn checked_payload(
    agent: &AgentContext,
    formats: &[AttachmentFormat],
    attachments: &[Attachment],
) -> Result<(String, Value), ProblemReportError> {
    let (format, payload) = formatted_payload(formats, attachments)
        .ok_or_else(|| ProblemReportError::new(PRESENTATION_ABANDONED, "message has no formatted attachment"))?;

    if agent.proof_format(&format).is_none() {
        return Err(ProblemReportError::new(
            PRESENTATION_ABANDONED,
            format!("unsupported proof format '{format}'"),
        ));
    }

    Ok((format, payload))
}

fn parse_body<T: DeserializeOwned>(context: &InboundMessageContext) -> Result<T, ProblemReportError> {
    context
        .message
        .body_as()
        .map_err(|e| ProblemReportError::new(PRESENTATION_ABANDONED, e.to_string()))
}

async fn abandon(
    agent: &AgentContext,
    mut record: ProofExchangeRecord,
    report: &ProblemReportError,
    inbound_message_id: Option<&str>,
) -> Result<(), Error> {
    match PROOF_GRAPH.assert_abandon(&record) {
        Ok(next) => {
            record.error_message = Some(format!("{}: {}", report.code, report.description));
            transition(agent, &mut record, next, inbound_message_id).await
        }
        Err(e) => {
            tracing::debug!("not abandoning proof exchange {}: {e}", record.id);
            Ok(())
        }
    }
}

async fn process_proposal(context: InboundMessageContext) -> HandlerResult {
    let Some((mut record, next)) =
        inbound_record(&context, PROPOSE_PRESENTATION, ProofRole::Verifier, true).await?
    else {
        return Ok(None);
    };

    let proposal: ProposePresentation = parse_body(&context)?;
    let (format, payload) = checked_payload(&context.agent, &proposal.formats, &proposal.proposals_attach)?;

    record.format = Some(format);
    record.proposal = Some(payload);
    transition(&context.agent, &mut record, next, Some(context.message.id.as_str())).await?;

    if !context.agent.config.auto_accept_proofs {
        return Ok(None);
    }

    let (_, outbound) = create_request(&context.agent, record, None).await?;

    Ok(Some(outbound.with_session(context.session_id.clone())))
}

async fn process_request(context: InboundMessageContext) -> HandlerResult {
    let Some((mut record, next)) =
        inbound_record(&context, REQUEST_PRESENTATION, ProofRole::Prover, true).await?
    else {
        return Ok(None);
    };

    let request: RequestPresentation = parse_body(&context)?;
    let (format, payload) =
        checked_payload(&context.agent, &request.formats, &request.request_presentations_attach)?;

    record.format = Some(format);
    record.request = Some(payload);
    transition(&context.agent, &mut record, next, Some(context.message.id.as_str())).await?;

    if !context.agent.config.auto_accept_proofs {
        return Ok(None);
    }

    let (_, outbound) = create_presentation(&context.agent, record).await?;

    Ok(Some(outbound.with_session(context.session_id.clone())))
}

async fn process_presentation(context: InboundMessageContext) -> HandlerResult {
    let agent = &context.agent;
    let Some((mut record, next)) =
        inbound_record(&context, PRESENTATION, ProofRole::Verifier, false).await?
    else {
        return Ok(None);
    };

    let presentation: Presentation = parse_body(&context)?;
    let (_, payload) = checked_payload(agent, &presentation.formats, &presentation.presentations_attach)?;

    let service = format_service(agent, &record)?;
    let verified = service
        .verify_presentation(record.request.as_ref().unwrap_or(&Value::Null), &payload)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("verifying presentation of exchange {} failed: {e}", record.id);
            false
        });

    record.presentation = Some(payload);
    record.verified = Some(verified);

    if !verified {
        let report = ProblemReportError::new(INVALID_PRESENTATION, "presentation does not satisfy the request");
        abandon(agent, record, &report, Some(context.message.id.as_str())).await?;

        return Err(report.into());
    }

    transition(agent, &mut record, next, Some(context.message.id.as_str())).await?;

    if !agent.config.auto_accept_proofs {
        return Ok(None);
    }

    let (_, outbound) = create_ack(agent, record).await?;

    Ok(Some(outbound.with_session(context.session_id.clone())))
}

async fn process_ack(context: InboundMessageContext) -> HandlerResult {
    let Some((mut record, next)) = inbound_record(&context, ACK, ProofRole::Prover, false).await? else {
        return Ok(None);
    };

    transition(&context.agent, &mut record, next, Some(context.message.id.as_str())).await?;

    Ok(None)
}

async fn process_problem_report(context: InboundMessageContext) -> HandlerResult {
    let report = problem_report::received(&context)?;
    let Some(connection) = &context.connection else {
        return Ok(None);
    };

    if let Some(record) = find_by_thread(&context.agent, context.message.thread_id(), &connection.id).await? {
        let report = ProblemReportError::new(report.description.code, report.description.en.unwrap_or_default());
        abandon(&context.agent, record, &report, Some(context.message.id.as_str())).await?;
    }

    Ok(None)
}

pub fn handlers() -> Vec<MessageHandler> {
    vec![
        MessageHandler::new(
            "presentation proposal",
            vec![PROTOCOL.identifier(PROPOSE_PRESENTATION)],
            process_proposal,
        ),
        MessageHandler::new(
            "presentation request",
            vec![PROTOCOL.identifier(REQUEST_PRESENTATION)],
            process_request,
        ),
        MessageHandler::new(
            "presentation",
            vec![PROTOCOL.identifier(PRESENTATION)],
            process_presentation,
        ),
        MessageHandler::new("presentation ack", vec![PROTOCOL.identifier(ACK)], process_ack),
        MessageHandler::new(
            "presentation problem report",
            vec![PROTOCOL.identifier(problem_report::PROBLEM_REPORT)],
            process_problem_report,
        ),
    ]
}

/// Proof exchanges of an [`Agent`]
pub struct ProofsApi<'a> {
    agent: &'a Agent,
}

impl<'a> ProofsApi<'a> {
    pub(crate) fn new(agent: &'a Agent) -> Self {
        Self { agent }
    }

    async fn start(&self, connection_id: &str, format: &str, role: ProofRole) -> Result<ProofExchangeRecord, Error> {
        let context = self.agent.context();
        context.ready_connection(connection_id).await?;

        if context.proof_format(format).is_none() {
            return Err(Error::InvalidMessage(format!("unsupported proof format '{format}'")));
        }

        let mut record = ProofExchangeRecord::new(connection_id, uuid::Uuid::new_v4().to_string(), role);
        record.format = Some(format.to_string());

        Ok(record)
    }

    /// As prover, propose a presentation described by `input`
    pub async fn propose_presentation(
        &self,
        connection_id: &str,
        format: &str,
        input: &Value,
    ) -> Result<ProofExchangeRecord, Error> {
        let record = self.start(connection_id, format, ProofRole::Prover).await?;
        let (record, outbound) = create_proposal(self.agent.context(), record, input).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    /// As verifier, request the presentation described by `input`
    pub async fn request_presentation(
        &self,
        connection_id: &str,
        format: &str,
        input: &Value,
    ) -> Result<ProofExchangeRecord, Error> {
        let record = self.start(connection_id, format, ProofRole::Verifier).await?;
        let (record, outbound) = create_request(self.agent.context(), record, Some(input)).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    /// Answer a received proposal with a request
    pub async fn accept_proposal(&self, id: &str) -> Result<ProofExchangeRecord, Error> {
        let record = self.get(id).await?;
        let (record, outbound) = create_request(self.agent.context(), record, None).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    /// Present what a received request asks for
    pub async fn accept_request(&self, id: &str) -> Result<ProofExchangeRecord, Error> {
        let record = self.get(id).await?;
        let (record, outbound) = create_presentation(self.agent.context(), record).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    /// Acknowledge a verified presentation
    pub async fn accept_presentation(&self, id: &str) -> Result<ProofExchangeRecord, Error> {
        let record = self.get(id).await?;
        let (record, outbound) = create_ack(self.agent.context(), record).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<ProofExchangeRecord, Error> {
        Ok(self.agent.context().proofs.get_by_id(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<ProofExchangeRecord>, Error> {
        Ok(self.agent.context().proofs.get_all().await?)
    }

    pub async fn find_by_thread(&self, thread_id: &str) -> Result<Option<ProofExchangeRecord>, Error> {
        Ok(self
            .agent
            .context()
            .proofs
            .find_single_by_query(&query([("thread_id", thread_id)]))
            .await?)
    }

    pub async fn delete(&self, id: &str) -> Result<(), Error> {
        Ok(self.agent.context().proofs.delete(id).await?)
    }
}
