//! Issue Credential 2.0 between a holder and an issuer over a completed
//! connection. The attachments of each step are produced by a
//! [`CredentialFormatService`] for the negotiated format.

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
    message_type::ISSUE_CREDENTIAL as PROTOCOL,
    protocols::{Ack, format_attachment, formatted_payload, problem_report},
    state_machine::{apply_transition, is_replay},
    storage::query,
};

mod format;
mod messages;
mod record;
mod state;

pub use format::CredentialFormatService;
pub use messages::{
    ACK, ISSUE_CREDENTIAL, IssueCredential, OFFER_CREDENTIAL, OfferCredential, PROPOSE_CREDENTIAL,
    ProposeCredential, REQUEST_CREDENTIAL, RequestCredential,
};
pub use record::CredentialExchangeRecord;
pub use state::{CREDENTIAL_GRAPH, CredentialRole, CredentialState, LegacyCredentialState};

pub const ISSUANCE_ABANDONED: &str = "issuance-abandoned";

async fn transition(
    agent: &AgentContext,
    record: &mut CredentialExchangeRecord,
    state: CredentialState,
    inbound_message_id: Option<&str>,
) -> Result<(), Error> {
    let previous_state =
        apply_transition(agent.credentials.as_ref(), record, state, inbound_message_id).await?;

    tracing::info!("credential exchange {} is {state}", record.id);

    agent.events.emit(AgentEvent::CredentialStateChanged {
        credential_exchange_id: record.id.clone(),
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
) -> Result<Option<CredentialExchangeRecord>, Error> {
    Ok(agent
        .credentials
        .find_single_by_query(&query([("thread_id", thread_id), ("connection_id", connection_id)]))
        .await?)
}

fn format_service(
    agent: &AgentContext,
    record: &CredentialExchangeRecord,
) -> Result<Arc<dyn CredentialFormatService>, ProblemReportError> {
    let format = record.format.as_deref().unwrap_or_default();

    agent
        .credential_format(format)
        .cloned()
        .ok_or_else(|| ProblemReportError::new(ISSUANCE_ABANDONED, format!("unsupported credential format '{format}'")))
}

/// Move `record` along a sent edge and build the message for it
async fn send_step(
    agent: &AgentContext,
    mut record: CredentialExchangeRecord,
    next: CredentialState,
    message_name: &str,
    body: &impl Serialize,
) -> Result<(CredentialExchangeRecord, OutboundMessageContext), Error> {
    let connection = agent.ready_connection(&record.connection_id).await?;
    let message = PlaintextMessage::new(PROTOCOL.message_type(message_name), body)?
        .with_thread(record.thread_id.clone());

    transition(agent, &mut record, next, None).await?;

    let outbound = OutboundMessageContext::new(message, connection).with_associated_record(&record.id);

    Ok((record, outbound))
}

pub(crate) async fn create_proposal(
    agent: &AgentContext,
    mut record: CredentialExchangeRecord,
    input: &Value,
) -> Result<(CredentialExchangeRecord, OutboundMessageContext), Error> {
    let next = CREDENTIAL_GRAPH.assert_send(&record, PROPOSE_CREDENTIAL)?;
    let service = format_service(agent, &record)?;

    let proposal = service.create_proposal(input).await?;
    let (formats, filters_attach) = format_attachment(service.format(), proposal.clone());
    record.proposal = Some(proposal);

    send_step(
        agent,
        record,
        next,
        PROPOSE_CREDENTIAL,
        &ProposeCredential {
            comment: None,
            formats,
            filters_attach,
        },
    )
    .await
}

/// Offer a credential; without `input` the received proposal is answered
pub(crate) async fn create_offer(
    agent: &AgentContext,
    mut record: CredentialExchangeRecord,
    input: Option<&Value>,
) -> Result<(CredentialExchangeRecord, OutboundMessageContext), Error> {
    let next = CREDENTIAL_GRAPH.assert_send(&record, OFFER_CREDENTIAL)?;
    let service = format_service(agent, &record)?;

    let input = input.or(record.proposal.as_ref()).cloned().unwrap_or_default();
    let offer = service.create_offer(&input).await?;
    let (formats, offers_attach) = format_attachment(service.format(), offer.clone());
    record.offer = Some(offer);

    send_step(
        agent,
        record,
        next,
        OFFER_CREDENTIAL,
        &OfferCredential {
            comment: None,
            formats,
            offers_attach,
        },
    )
    .await
}

pub(crate) async fn create_request(
    agent: &AgentContext,
    mut record: CredentialExchangeRecord,
) -> Result<(CredentialExchangeRecord, OutboundMessageContext), Error> {
    let next = CREDENTIAL_GRAPH.assert_send(&record, REQUEST_CREDENTIAL)?;
    let service = format_service(agent, &record)?;

    let request = service
        .create_request(record.offer.as_ref().unwrap_or(&Value::Null))
        .await?;
    let (formats, requests_attach) = format_attachment(service.format(), request.clone());
    record.request = Some(request);

    send_step(
        agent,
        record,
        next,
        REQUEST_CREDENTIAL,
        &RequestCredential {
            comment: None,
            formats,
            requests_attach,
        },
    )
    .await
}

pub(crate) async fn create_credential(
    agent: &AgentContext,
    mut record: CredentialExchangeRecord,
) -> Result<(CredentialExchangeRecord, OutboundMessageContext), Error> {
    let next = CREDENTIAL_GRAPH.assert_send(&record, ISSUE_CREDENTIAL)?;
    let service = format_service(agent, &record)?;

    let credential = service
        .create_credential(
            record.offer.as_ref().unwrap_or(&Value::Null),
            record.request.as_ref().unwrap_or(&Value::Null),
        )
        .await?;
    let (formats, credentials_attach) = format_attachment(service.format(), credential.clone());
    record.credential = Some(credential);

    send_step(
        agent,
        record,
        next,
        ISSUE_CREDENTIAL,
        &IssueCredential {
            comment: None,
            formats,
            credentials_attach,
        },
    )
    .await
}

pub(crate) async fn create_ack(
    agent: &AgentContext,
    record: CredentialExchangeRecord,
) -> Result<(CredentialExchangeRecord, OutboundMessageContext), Error> {
    let next = CREDENTIAL_GRAPH.assert_send(&record, ACK)?;

    send_step(agent, record, next, ACK, &Ack::default()).await
}

/// The record an inbound `message_name` moves and the state it moves to;
/// `None` for a replay. Only messages that may open an exchange create a
/// record.
async fn inbound_record(
    context: &InboundMessageContext,
    message_name: &str,
    role: CredentialRole,
    opens_exchange: bool,
) -> Result<Option<(CredentialExchangeRecord, CredentialState)>, Error> {
    let connection = context.ready_connection()?;
    let thread_id = context.message.thread_id();

    let record = match find_by_thread(&context.agent, thread_id, &connection.id).await? {
        Some(record) => record,
        None if opens_exchange => CredentialExchangeRecord::new(&connection.id, thread_id, role),
        None => {
            return Err(ProblemReportError::new(
                ISSUANCE_ABANDONED,
                format!("no credential exchange on thread {thread_id}"),
            )
            .into());
        }
    };

    if is_replay(&record, &context.message) {
        tracing::debug!("ignoring replayed {message_name} {}", context.message.id);
        return Ok(None);
    }

    let next = CREDENTIAL_GRAPH
        .assert_transition(&record, message_name, &[role])
        .map_err(|e| ProblemReportError::new(ISSUANCE_ABANDONED, e.to_string()))?;

    Ok(Some((record, next)))
}

/// The payload of the first attachment, in a format we support
fn checked_payload(
    agent: &AgentContext,
    formats: &[AttachmentFormat],
    attachments: &[Attachment],
) -> Result<(String, Value), ProblemReportError> {
    let (format, payload) = formatted_payload(formats, attachments)
        .ok_or_else(|| ProblemReportError::new(ISSUANCE_ABANDONED, "message has no formatted attachment"))?;

    if agent.credential_format(&format).is_none() {
        return Err(ProblemReportError::new(
            ISSUANCE_ABANDONED,
            format!("unsupported credential format '{format}'"),
        ));
    }

    Ok((format, payload))
}

fn parse_body<T: DeserializeOwned>(context: &InboundMessageContext) -> Result<T, ProblemReportError> {
    context
        .message
        .body_as()
        .map_err(|e| ProblemReportError::new(ISSUANCE_ABANDONED, e.to_string()))
}

fn auto_accept(context: &InboundMessageContext, outbound: OutboundMessageContext) -> HandlerResult {
    Ok(Some(outbound.with_session(context.session_id.clone())))
}

async fn process_proposal(context: InboundMessageContext) -> HandlerResult {
    let Some((mut record, next)) =
        inbound_record(&context, PROPOSE_CREDENTIAL, CredentialRole::Issuer, true).await?
    else {
        return Ok(None);
    };

    let proposal: ProposeCredential = parse_body(&context)?;
    let (format, payload) = checked_payload(&context.agent, &proposal.formats, &proposal.filters_attach)?;

    record.format = Some(format);
    record.proposal = Some(payload);
    transition(&context.agent, &mut record, next, Some(context.message.id.as_str())).await?;

    if !context.agent.config.auto_accept_credentials {
        return Ok(None);
    }

    let (_, outbound) = create_offer(&context.agent, record, None).await?;

    auto_accept(&context, outbound)
}

async fn process_offer(context: InboundMessageContext) -> HandlerResult {
    let Some((mut record, next)) =
        inbound_record(&context, OFFER_CREDENTIAL, CredentialRole::Holder, true).await?
    else {
        return Ok(None);
    };

    let offer: OfferCredential = parse_body(&context)?;
    let (format, payload) = checked_payload(&context.agent, &offer.formats, &offer.offers_attach)?;

    record.format = Some(format);
    record.offer = Some(payload);
    transition(&context.agent, &mut record, next, Some(context.message.id.as_str())).await?;

    if !context.agent.config.auto_accept_credentials {
        return Ok(None);
    }

    let (_, outbound) = create_request(&context.agent, record).await?;

    auto_accept(&context, outbound)
}

async fn process_request(context: InboundMessageContext) -> HandlerResult {
    let Some((mut record, next)) =
        inbound_record(&context, REQUEST_CREDENTIAL, CredentialRole::Issuer, false).await?
    else {
        return Ok(None);
    };

    let request: RequestCredential = parse_body(&context)?;
    let (_, payload) = checked_payload(&context.agent, &request.formats, &request.requests_attach)?;

    record.request = Some(payload);
    transition(&context.agent, &mut record, next, Some(context.message.id.as_str())).await?;

    if !context.agent.config.auto_accept_credentials {
        return Ok(None);
    }

    let (_, outbound) = create_credential(&context.agent, record).await?;

    auto_accept(&context, outbound)
}

async fn process_credential(context: InboundMessageContext) -> HandlerResult {
    let agent = &context.agent;
    let Some((mut record, next)) =
        inbound_record(&context, ISSUE_CREDENTIAL, CredentialRole::Holder, false).await?
    else {
        return Ok(None);
    };

    let issued: IssueCredential = parse_body(&context)?;
    let (_, credential) = checked_payload(agent, &issued.formats, &issued.credentials_attach)?;

    let service = format_service(agent, &record)?;
    if let Err(e) = service
        .process_credential(record.request.as_ref().unwrap_or(&Value::Null), &credential)
        .await
    {
        let report = ProblemReportError::new(ISSUANCE_ABANDONED, format!("credential rejected: {e}"));
        abandon(agent, record, &report, Some(context.message.id.as_str())).await?;

        return Err(report.into());
    }

    record.credential = Some(credential);
    transition(agent, &mut record, next, Some(context.message.id.as_str())).await?;

    if !agent.config.auto_accept_credentials {
        return Ok(None);
    }

    let (_, outbound) = create_ack(agent, record).await?;

    auto_accept(&context, outbound)
}

async fn process_ack(context: InboundMessageContext) -> HandlerResult {
    let Some((mut record, next)) = inbound_record(&context, ACK, CredentialRole::Issuer, false).await? else {
        return Ok(None);
    };

    transition(&context.agent, &mut record, next, Some(context.message.id.as_str())).await?;

    Ok(None)
}

async fn abandon(
    agent: &AgentContext,
    mut record: CredentialExchangeRecord,
    report: &ProblemReportError,
    inbound_message_id: Option<&str>,
) -> Result<(), Error> {
    match CREDENTIAL_GRAPH.assert_abandon(&record) {
        Ok(next) => {
            record.error_message = Some(format!("{}: {}", report.code, report.description));
            transition(agent, &mut record, next, inbound_message_id).await
        }
        Err(e) => {
            tracing::debug!("not abandoning credential exchange {}: {e}", record.id);
            Ok(())
        }
    }
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
            "credential proposal",
            vec![PROTOCOL.identifier(PROPOSE_CREDENTIAL)],
            process_proposal,
        ),
        MessageHandler::new(
            "credential offer",
            vec![PROTOCOL.identifier(OFFER_CREDENTIAL)],
            process_offer,
        ),
        MessageHandler::new(
            "credential request",
            vec![PROTOCOL.identifier(REQUEST_CREDENTIAL)],
            process_request,
        ),
        MessageHandler::new(
            "credential issue",
            vec![PROTOCOL.identifier(ISSUE_CREDENTIAL)],
            process_credential,
        ),
        MessageHandler::new("credential ack", vec![PROTOCOL.identifier(ACK)], process_ack),
        MessageHandler::new(
            "credential problem report",
            vec![PROTOCOL.identifier(problem_report::PROBLEM_REPORT)],
            process_problem_report,
        ),
    ]
}

/// Credential exchanges of an [`Agent`]
pub struct CredentialsApi<'a> {
    agent: &'a Agent,
}

impl<'a> CredentialsApi<'a> {
    pub(crate) fn new(agent: &'a Agent) -> Self {
        Self { agent }
    }

    async fn start(
        &self,
        connection_id: &str,
        format: &str,
        role: CredentialRole,
    ) -> Result<CredentialExchangeRecord, Error> {
        let context = self.agent.context();
        context.ready_connection(connection_id).await?;

        if context.credential_format(format).is_none() {
            return Err(Error::InvalidMessage(format!("unsupported credential format '{format}'")));
        }

        let mut record = CredentialExchangeRecord::new(connection_id, uuid::Uuid::new_v4().to_string(), role);
        record.format = Some(format.to_string());

        Ok(record)
    }

    /// As holder, propose the credential described by `input`
    pub async fn propose_credential(
        &self,
        connection_id: &str,
        format: &str,
        input: &Value,
    ) -> Result<CredentialExchangeRecord, Error> {
        let record = self.start(connection_id, format, CredentialRole::Holder).await?;
        let (record, outbound) = create_proposal(self.agent.context(), record, input).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    /// As issuer, offer the credential described by `input`
    pub async fn offer_credential(
        &self,
        connection_id: &str,
        format: &str,
        input: &Value,
    ) -> Result<CredentialExchangeRecord, Error> {
        let record = self.start(connection_id, format, CredentialRole::Issuer).await?;
        let (record, outbound) = create_offer(self.agent.context(), record, Some(input)).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    /// Answer a received proposal with an offer
    pub async fn accept_proposal(&self, id: &str) -> Result<CredentialExchangeRecord, Error> {
        let record = self.get(id).await?;
        let (record, outbound) = create_offer(self.agent.context(), record, None).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    /// Answer a received offer with a request
    pub async fn accept_offer(&self, id: &str) -> Result<CredentialExchangeRecord, Error> {
        let record = self.get(id).await?;
        let (record, outbound) = create_request(self.agent.context(), record).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    /// Issue the credential a received request asks for
    pub async fn accept_request(&self, id: &str) -> Result<CredentialExchangeRecord, Error> {
        let record = self.get(id).await?;
        let (record, outbound) = create_credential(self.agent.context(), record).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    /// Acknowledge a received credential
    pub async fn accept_credential(&self, id: &str) -> Result<CredentialExchangeRecord, Error> {
        let record = self.get(id).await?;
        let (record, outbound) = create_ack(self.agent.context(), record).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<CredentialExchangeRecord, Error> {
        Ok(self.agent.context().credentials.get_by_id(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<CredentialExchangeRecord>, Error> {
        Ok(self.agent.context().credentials.get_all().await?)
    }

    pub async fn find_by_thread(&self, thread_id: &str) -> Result<Option<CredentialExchangeRecord>, Error> {
        Ok(self
            .agent
            .context()
            .credentials
            .find_single_by_query(&query([("thread_id", thread_id)]))
            .await?)
    }

    pub async fn delete(&self, id: &str) -> Result<(), Error> {
        Ok(self.agent.context().credentials.delete(id).await?)
    }
}
