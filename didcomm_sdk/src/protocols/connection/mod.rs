//! DID Exchange 1.1: an out-of-band invitation, request, response and
//! complete establish a pairwise connection with fresh keys on both sides.
//!
//! The inviter plays the responder role and answers requests; the invitee
//! is the requester. Every message of an exchange carries the invitation id
//! as its thread id.

use std::sync::Arc;

use crate::{
    Agent, Error,
    context::{AgentContext, InboundMessageContext, OutboundMessageContext},
    crypto::{b64_decode, b64_encode},
    definitions::{
        Attachment, AttachmentSignature, DidCommService, DidDoc, Key, KeyType, PlaintextMessage,
        SignatureHeader,
    },
    dispatch::{HandlerResult, MessageHandler},
    error::ProblemReportError,
    events::AgentEvent,
    keys,
    message_type::DID_EXCHANGE,
    protocols::{mediation, problem_report, trust_ping},
    state_machine::{Direction, apply_transition, is_replay},
    storage::{Repository, query},
};

mod messages;
mod record;
mod state;

pub use messages::{COMPLETE, Complete, INVITATION, Invitation, PING, REQUEST, RESPONSE, Request, Response};
pub use record::ConnectionRecord;
pub use state::{ConnectionState, DID_EXCHANGE_GRAPH, DidExchangeRole, DidExchangeState};

use messages::{did_doc_attachment, did_doc_from_attachment};

pub const REQUEST_NOT_ACCEPTED: &str = "request_not_accepted";
pub const REQUEST_PROCESSING_ERROR: &str = "request_processing_error";
pub const RESPONSE_NOT_ACCEPTED: &str = "response_not_accepted";
pub const RESPONSE_PROCESSING_ERROR: &str = "response_processing_error";
pub const COMPLETE_REJECTED: &str = "complete_rejected";

async fn transition(
    agent: &AgentContext,
    record: &mut ConnectionRecord,
    state: DidExchangeState,
    inbound_message_id: Option<&str>,
) -> Result<(), Error> {
    let previous_state =
        apply_transition(agent.connections.as_ref(), record, state, inbound_message_id).await?;

    tracing::info!("connection {} is {state}", record.id);

    agent.events.emit(AgentEvent::ConnectionStateChanged {
        connection_id: record.id.clone(),
        thread_id: record.thread_id.clone(),
        previous_state,
        state,
    });

    Ok(())
}

/// Services to publish for `key`; behind a mediator the key is registered
/// there first
async fn publish_services(agent: &Arc<AgentContext>, key: &Key) -> Result<Vec<DidCommService>, Error> {
    if let Some(connection_id) = agent.mediator().and_then(|m| m.connection_id) {
        mediation::register_route(agent, &connection_id, key).await?;
    }

    Ok(agent.services_for(key))
}

/// A fresh `did:key` with a DID document listing our services
async fn new_did(agent: &Arc<AgentContext>) -> Result<(String, Key, DidDoc), Error> {
    let key = agent.keys().create_key(KeyType::Ed25519).await?;
    let did = key.to_did_key();
    agent.keys().bind_did(&did, vec![key.clone()]).await?;

    let doc = DidDoc {
        id: did.clone(),
        service: publish_services(agent, &key).await?,
    };

    Ok((did, key, doc))
}

async fn find_by_thread(
    agent: &AgentContext,
    message: &PlaintextMessage,
    role: DidExchangeRole,
) -> Result<Option<ConnectionRecord>, Error> {
    for thread_id in [Some(message.thread_id()), message.parent_thread_id()]
        .into_iter()
        .flatten()
    {
        let found = agent
            .connections
            .find_single_by_query(&query([("thread_id", thread_id), ("role", role.as_str())]))
            .await?;

        if found.is_some() {
            return Ok(found);
        }
    }

    Ok(None)
}

/// The connection an envelope from `sender` to our `recipient` key belongs to
pub(crate) async fn find_for_inbound(
    repository: &dyn Repository<ConnectionRecord>,
    recipient: &Key,
    sender: Option<&Key>,
) -> Result<Option<ConnectionRecord>, Error> {
    let recipient = recipient.to_base58();

    if let Some(record) = repository
        .find_single_by_query(&query([("my_key", recipient.as_str())]))
        .await?
    {
        match (sender, record.their_key()) {
            (Some(sender), Some(theirs)) if sender != theirs => {
                tracing::warn!("sender of message for connection {} does not match", record.id);
            }
            _ => return Ok(Some(record)),
        }
    }

    Ok(repository
        .find_single_by_query(&query([("invitation_key", recipient.as_str())]))
        .await?)
}

pub(crate) async fn create_invitation(
    agent: &Arc<AgentContext>,
    label: Option<&str>,
) -> Result<(ConnectionRecord, Invitation), Error> {
    let key = agent.keys().create_key(KeyType::Ed25519).await?;
    let services = publish_services(agent, &key).await?;
    let invitation = Invitation::new(label.unwrap_or(&agent.config.label), services);

    let mut record = ConnectionRecord::new(
        DidExchangeRole::Responder,
        invitation.id.clone(),
        invitation.clone(),
    );
    record.invitation_key = Some(key);

    let state = DID_EXCHANGE_GRAPH.initial(
        DidExchangeState::Start,
        INVITATION,
        Direction::Sent,
        DidExchangeRole::Responder,
    )?;
    transition(agent, &mut record, state, None).await?;

    Ok((record, invitation))
}

pub(crate) async fn receive_invitation(
    agent: &AgentContext,
    invitation: Invitation,
) -> Result<ConnectionRecord, Error> {
    if invitation.recipient_key().is_none() {
        return Err(Error::InvalidMessage(format!(
            "invitation {} has no service with a recipient key",
            invitation.id
        )));
    }

    let existing = agent
        .connections
        .find_single_by_query(&query([
            ("thread_id", invitation.id.as_str()),
            ("role", DidExchangeRole::Requester.as_str()),
        ]))
        .await?;

    if let Some(record) = existing {
        tracing::debug!("invitation {} was already received", invitation.id);
        return Ok(record);
    }

    let mut record = ConnectionRecord::new(
        DidExchangeRole::Requester,
        invitation.id.clone(),
        invitation,
    );

    let state = DID_EXCHANGE_GRAPH.initial(
        DidExchangeState::Start,
        INVITATION,
        Direction::Received,
        DidExchangeRole::Requester,
    )?;
    transition(agent, &mut record, state, None).await?;

    Ok(record)
}

pub(crate) async fn create_request(
    agent: &Arc<AgentContext>,
    mut record: ConnectionRecord,
) -> Result<(ConnectionRecord, OutboundMessageContext), Error> {
    let next = DID_EXCHANGE_GRAPH.assert_send(&record, REQUEST)?;
    let (did, key, doc) = new_did(agent).await?;

    let message = PlaintextMessage::new(
        DID_EXCHANGE.message_type(REQUEST),
        &Request {
            label: agent.config.label.clone(),
            did: did.clone(),
            did_doc_attach: did_doc_attachment(&doc)?,
        },
    )?
    .with_thread(record.thread_id.clone())
    .with_parent_thread(record.thread_id.clone());

    record.my_did = Some(did);
    record.my_key = Some(key);
    transition(agent, &mut record, next, None).await?;

    let outbound = OutboundMessageContext::new(message, record.clone()).with_associated_record(&record.id);

    Ok((record, outbound))
}

pub(crate) async fn create_response(
    agent: &Arc<AgentContext>,
    mut record: ConnectionRecord,
) -> Result<(ConnectionRecord, OutboundMessageContext), Error> {
    let next = DID_EXCHANGE_GRAPH.assert_send(&record, RESPONSE)?;
    let invitation_key = record
        .invitation_key
        .clone()
        .ok_or_else(|| Error::InvalidMessage(format!("connection {} has no invitation key", record.id)))?;

    let (did, key, doc) = new_did(agent).await?;

    let mut attachment = did_doc_attachment(&doc)?;
    let signature = agent
        .keys()
        .sign(&invitation_key, signed_payload(&attachment))
        .await?;
    attachment.data.jws = Some(AttachmentSignature {
        header: SignatureHeader {
            kid: invitation_key.to_did_key(),
        },
        signature: b64_encode(&signature),
    });

    let message = PlaintextMessage::new(
        DID_EXCHANGE.message_type(RESPONSE),
        &Response {
            did: did.clone(),
            did_doc_attach: attachment,
        },
    )?
    .with_thread(record.thread_id.clone());

    record.my_did = Some(did);
    record.my_key = Some(key);
    transition(agent, &mut record, next, None).await?;

    let outbound = OutboundMessageContext::new(message, record.clone()).with_associated_record(&record.id);

    Ok((record, outbound))
}

pub(crate) async fn create_complete(
    agent: &AgentContext,
    mut record: ConnectionRecord,
) -> Result<(ConnectionRecord, OutboundMessageContext), Error> {
    let next = DID_EXCHANGE_GRAPH.assert_send(&record, COMPLETE)?;

    let message = PlaintextMessage::new(DID_EXCHANGE.message_type(COMPLETE), &Complete {})?
        .with_thread(record.thread_id.clone())
        .with_parent_thread(record.thread_id.clone());

    transition(agent, &mut record, next, None).await?;

    let outbound = OutboundMessageContext::new(message, record.clone()).with_associated_record(&record.id);

    Ok((record, outbound))
}

/// Complete the exchange of a requester that sends a trust ping instead of `complete`
pub(crate) async fn complete_with_ping(
    agent: &AgentContext,
    mut record: ConnectionRecord,
) -> Result<ConnectionRecord, Error> {
    let next = DID_EXCHANGE_GRAPH.assert_send(&record, PING)?;
    transition(agent, &mut record, next, None).await?;

    Ok(record)
}

/// Complete the exchange of a responder that received a trust ping
pub(crate) async fn complete_by_ping(
    agent: &AgentContext,
    mut record: ConnectionRecord,
    message: &PlaintextMessage,
) -> Result<ConnectionRecord, Error> {
    if is_replay(&record, message) {
        return Ok(record);
    }

    let next = DID_EXCHANGE_GRAPH.assert_transition(&record, PING, &[DidExchangeRole::Responder])?;
    transition(agent, &mut record, next, Some(message.id.as_str())).await?;

    Ok(record)
}

fn signed_payload(attachment: &Attachment) -> &[u8] {
    attachment.data.base64.as_deref().unwrap_or_default().as_bytes()
}

/// Check the response signature of the responder's DID document against the
/// key we were invited with
fn verify_did_doc_signature(record: &ConnectionRecord, attachment: &Attachment) -> Result<(), String> {
    let invitation_key = record
        .invitation
        .as_ref()
        .and_then(Invitation::recipient_key)
        .ok_or("connection has no invitation key")?;

    let jws = attachment.data.jws.as_ref().ok_or("did_doc~attach is not signed")?;

    if Key::parse(&jws.header.kid).ok().as_ref() != Some(invitation_key) {
        return Err("did_doc~attach is not signed by the invitation key".to_string());
    }

    let signature = b64_decode(&jws.signature).map_err(|_| "malformed signature")?;

    keys::verify(invitation_key, signed_payload(attachment), &signature)
        .map_err(|_| "invalid did_doc~attach signature".to_string())
}

fn checked_did_doc(context: &InboundMessageContext, attachment: &Attachment, code: &str) -> Result<DidDoc, ProblemReportError> {
    let doc = did_doc_from_attachment(attachment)
        .ok_or_else(|| ProblemReportError::new(code, "invalid did_doc~attach"))?;

    if doc.recipient_keys().next().is_none() {
        return Err(ProblemReportError::new(code, "DID document has no recipient keys"));
    }

    if let Some(sender) = &context.sender_key {
        if !doc.recipient_keys().any(|k| k == sender) {
            return Err(ProblemReportError::new(code, "message was not sent with a key of the DID document"));
        }
    }

    Ok(doc)
}

async fn process_request(context: InboundMessageContext) -> HandlerResult {
    let agent = &context.agent;

    let Some(mut record) = find_by_thread(agent, &context.message, DidExchangeRole::Responder).await? else {
        return Err(ProblemReportError::new(REQUEST_NOT_ACCEPTED, "request does not answer an invitation of ours").into());
    };

    if is_replay(&record, &context.message) {
        tracing::debug!("ignoring replayed request {}", context.message.id);
        return Ok(None);
    }

    let next = DID_EXCHANGE_GRAPH
        .assert_transition(&record, REQUEST, &[DidExchangeRole::Responder])
        .map_err(|e| ProblemReportError::new(REQUEST_PROCESSING_ERROR, e.to_string()))?;

    let request: Request = context
        .message
        .body_as()
        .map_err(|e| ProblemReportError::new(REQUEST_NOT_ACCEPTED, e.to_string()))?;
    let doc = checked_did_doc(&context, &request.did_doc_attach, REQUEST_NOT_ACCEPTED)?;

    record.their_did = Some(request.did);
    record.their_did_doc = Some(doc);
    record.their_label = Some(request.label);
    transition(agent, &mut record, next, Some(context.message.id.as_str())).await?;

    if !agent.config.auto_accept_connections {
        return Ok(None);
    }

    let (_, outbound) = create_response(agent, record).await?;

    Ok(Some(outbound.with_session(context.session_id.clone())))
}

async fn process_response(context: InboundMessageContext) -> HandlerResult {
    let agent = &context.agent;

    let Some(mut record) = find_by_thread(agent, &context.message, DidExchangeRole::Requester).await? else {
        return Err(ProblemReportError::new(RESPONSE_NOT_ACCEPTED, "response does not answer a request of ours").into());
    };

    if is_replay(&record, &context.message) {
        tracing::debug!("ignoring replayed response {}", context.message.id);
        return Ok(None);
    }

    let next = DID_EXCHANGE_GRAPH
        .assert_transition(&record, RESPONSE, &[DidExchangeRole::Requester])
        .map_err(|e| ProblemReportError::new(RESPONSE_PROCESSING_ERROR, e.to_string()))?;

    let response: Response = context
        .message
        .body_as()
        .map_err(|e| ProblemReportError::new(RESPONSE_NOT_ACCEPTED, e.to_string()))?;

    verify_did_doc_signature(&record, &response.did_doc_attach)
        .map_err(|e| ProblemReportError::new(RESPONSE_NOT_ACCEPTED, e))?;
    let doc = checked_did_doc(&context, &response.did_doc_attach, RESPONSE_NOT_ACCEPTED)?;

    record.their_did = Some(response.did);
    record.their_did_doc = Some(doc);
    transition(agent, &mut record, next, Some(context.message.id.as_str())).await?;

    if !agent.config.auto_accept_connections {
        return Ok(None);
    }

    let (_, outbound) = create_complete(agent, record).await?;

    Ok(Some(outbound.with_session(context.session_id.clone())))
}

async fn process_complete(context: InboundMessageContext) -> HandlerResult {
    let agent = &context.agent;

    let Some(mut record) = find_by_thread(agent, &context.message, DidExchangeRole::Responder).await? else {
        return Err(ProblemReportError::new(COMPLETE_REJECTED, "complete does not belong to an exchange of ours").into());
    };

    if is_replay(&record, &context.message) {
        tracing::debug!("ignoring replayed complete {}", context.message.id);
        return Ok(None);
    }

    let next = DID_EXCHANGE_GRAPH
        .assert_transition(&record, COMPLETE, &[DidExchangeRole::Responder])
        .map_err(|e| ProblemReportError::new(COMPLETE_REJECTED, e.to_string()))?;

    transition(agent, &mut record, next, Some(context.message.id.as_str())).await?;

    Ok(None)
}

async fn process_problem_report(context: InboundMessageContext) -> HandlerResult {
    let report = problem_report::received(&context)?;
    let agent = &context.agent;

    let Some(mut record) = agent
        .connections
        .find_single_by_query(&query([("thread_id", context.message.thread_id())]))
        .await?
    else {
        return Ok(None);
    };

    match DID_EXCHANGE_GRAPH.assert_abandon(&record) {
        Ok(next) => {
            record.error_message = Some(format!(
                "{}: {}",
                report.description.code,
                report.description.en.unwrap_or_default()
            ));
            transition(agent, &mut record, next, Some(context.message.id.as_str())).await?;
        }
        Err(e) => tracing::debug!("not abandoning connection {}: {e}", record.id),
    }

    Ok(None)
}

pub fn handlers() -> Vec<MessageHandler> {
    vec![
        MessageHandler::new(
            "didexchange request",
            vec![DID_EXCHANGE.identifier(REQUEST)],
            process_request,
        ),
        MessageHandler::new(
            "didexchange response",
            vec![DID_EXCHANGE.identifier(RESPONSE)],
            process_response,
        ),
        MessageHandler::new(
            "didexchange complete",
            vec![DID_EXCHANGE.identifier(COMPLETE)],
            process_complete,
        ),
        MessageHandler::new(
            "didexchange problem report",
            vec![DID_EXCHANGE.identifier(problem_report::DID_EXCHANGE_PROBLEM_REPORT)],
            process_problem_report,
        ),
    ]
}

/// Connection management of an [`Agent`]
pub struct ConnectionsApi<'a> {
    agent: &'a Agent,
}

impl<'a> ConnectionsApi<'a> {
    pub(crate) fn new(agent: &'a Agent) -> Self {
        Self { agent }
    }

    /// Create an invitation; the returned record waits for a request
    pub async fn create_invitation(&self, label: Option<&str>) -> Result<(ConnectionRecord, Invitation), Error> {
        create_invitation(self.agent.context(), label).await
    }

    /// Store a received invitation. With `auto_accept_connections` the
    /// request is sent right away.
    pub async fn receive_invitation(&self, invitation: Invitation) -> Result<ConnectionRecord, Error> {
        let context = self.agent.context();
        let record = receive_invitation(context, invitation).await?;

        if context.config.auto_accept_connections && record.state == DidExchangeState::InvitationReceived {
            return self.accept_invitation(&record.id).await;
        }

        Ok(record)
    }

    pub async fn receive_invitation_url(&self, invitation_url: &str) -> Result<ConnectionRecord, Error> {
        self.receive_invitation(Invitation::from_url(invitation_url)?).await
    }

    /// Send a request for a received invitation
    pub async fn accept_invitation(&self, connection_id: &str) -> Result<ConnectionRecord, Error> {
        let record = self.get(connection_id).await?;
        let (record, outbound) = create_request(self.agent.context(), record).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    /// Send a response to a received request
    pub async fn accept_request(&self, connection_id: &str) -> Result<ConnectionRecord, Error> {
        let record = self.get(connection_id).await?;
        let (record, outbound) = create_response(self.agent.context(), record).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    /// Acknowledge a received response, completing the exchange
    pub async fn send_complete(&self, connection_id: &str) -> Result<ConnectionRecord, Error> {
        let record = self.get(connection_id).await?;
        let (record, outbound) = create_complete(self.agent.context(), record).await?;
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    /// Send a trust ping asking for a response. A requester that received a
    /// response completes the exchange with it.
    pub async fn send_ping(&self, connection_id: &str) -> Result<ConnectionRecord, Error> {
        let context = self.agent.context();
        let mut record = self.get(connection_id).await?;

        if record.role == DidExchangeRole::Requester && record.state == DidExchangeState::ResponseReceived {
            record = complete_with_ping(context, record).await?;
        }

        let outbound = OutboundMessageContext::new(trust_ping::ping(true)?, record.clone());
        self.agent.send_message(outbound).await?;

        Ok(record)
    }

    pub async fn get(&self, connection_id: &str) -> Result<ConnectionRecord, Error> {
        self.agent
            .context()
            .connections
            .get_by_id(connection_id)
            .await
            .map_err(|_| Error::UnknownConnection(connection_id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<ConnectionRecord>, Error> {
        Ok(self.agent.context().connections.get_all().await?)
    }

    pub async fn find_by_thread(&self, thread_id: &str) -> Result<Option<ConnectionRecord>, Error> {
        Ok(self
            .agent
            .context()
            .connections
            .find_single_by_query(&query([("thread_id", thread_id)]))
            .await?)
    }

    pub async fn delete(&self, connection_id: &str) -> Result<(), Error> {
        Ok(self.agent.context().connections.delete(connection_id).await?)
    }
}
