use serde_json::json;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::broadcast;

use crate::{
    Agent, AgentEvent, Error, Key, OutboundMessageContext, PlaintextMessage,
    crypto::forward_message,
    definitions::{DidCommService, KeyType, OutboundSendStatus},
    dispatch::MessageHandler,
    error::DeliveryError,
    keys::{InMemoryKeyManager, KeyManager},
    message_type::{COORDINATE_MEDIATION, DID_EXCHANGE, ISSUE_CREDENTIAL, MessageTypeIdentifier, TRUST_PING},
    protocols::{
        connection::{DidExchangeRole, DidExchangeState, REQUEST, REQUEST_PROCESSING_ERROR},
        credential::{CredentialRole, CredentialState, ISSUANCE_ABANDONED, PROPOSE_CREDENTIAL, ProposeCredential},
        format_attachment,
        mediation::{
            KEYLIST_UPDATE, KEYLIST_UPDATE_RESPONSE, KeylistAction, KeylistResult, KeylistUpdate, KeylistUpdateItem,
            KeylistUpdateResponse, MediationRole, MediationState, REQUEST_NOT_ACCEPTED,
        },
        pickup,
        problem_report::UNSUPPORTED_MESSAGE_TYPE,
        proof::{INVALID_PRESENTATION, ProofRole, ProofState},
        trust_ping::{self, PING_RESPONSE},
    },
    retry::RetryPolicy,
    test_utils::{JSON_FORMAT, LoopbackNetwork, connect, test_config},
};

fn drain(events: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }

    received
}

fn problem_codes(events: Vec<AgentEvent>) -> Vec<String> {
    events
        .into_iter()
        .filter_map(|event| match event {
            AgentEvent::ProblemReportReceived { code, .. } => Some(code),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_did_exchange() {
    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();

    let mut alice_events = alice.subscribe();

    let (alice_record, bob_record) = connect(&alice, &bob).await.unwrap();

    assert_eq!(alice_record.state, DidExchangeState::Completed);
    assert_eq!(bob_record.state, DidExchangeState::Completed);
    assert_eq!(alice_record.role, DidExchangeRole::Responder);
    assert_eq!(bob_record.role, DidExchangeRole::Requester);
    assert_eq!(alice_record.thread_id, bob_record.thread_id);

    assert_eq!(alice_record.their_key(), bob_record.my_key.as_ref());
    assert_eq!(bob_record.their_key(), alice_record.my_key.as_ref());
    assert_eq!(alice_record.their_label.as_deref(), Some("bob"));

    let states: Vec<_> = drain(&mut alice_events)
        .into_iter()
        .filter_map(|event| match event {
            AgentEvent::ConnectionStateChanged { state, .. } => Some(state),
            _ => None,
        })
        .collect();

    assert_eq!(
        states,
        vec![
            DidExchangeState::InvitationSent,
            DidExchangeState::RequestReceived,
            DidExchangeState::ResponseSent,
            DidExchangeState::Completed,
        ]
    );
}

#[tokio::test]
async fn test_event_stream() {
    use futures::StreamExt;

    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();

    let events = bob.events();
    let (_, bob_record) = connect(&alice, &bob).await.unwrap();

    let completed = events
        .filter_map(|event| async move {
            match event {
                AgentEvent::ConnectionStateChanged { connection_id, state, .. } => {
                    (state == DidExchangeState::Completed).then_some(connection_id)
                }
                _ => None,
            }
        })
        .boxed()
        .next()
        .await;

    assert_eq!(completed, Some(bob_record.id));
}

#[tokio::test]
async fn test_did_exchange_without_inbound_endpoint() {
    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();

    let mut config = test_config("bob");
    config.endpoints.clear();
    let bob = network.agent(config).unwrap();

    let (alice_record, bob_record) = connect(&alice, &bob).await.unwrap();

    assert_eq!(alice_record.state, DidExchangeState::Completed);
    assert_eq!(bob_record.state, DidExchangeState::Completed);

    // bob can only be reached through his queue
    let services = alice_record.their_services();
    assert_eq!(services.len(), 1);
    assert!(services[0].is_queue());
}

#[tokio::test]
async fn test_did_exchange_legacy_prefix() {
    let network = LoopbackNetwork::new();

    let mut config = test_config("alice");
    config.use_did_sov_prefix = true;
    let alice = network.agent(config).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();

    let (alice_record, bob_record) = connect(&alice, &bob).await.unwrap();

    assert_eq!(alice_record.state, DidExchangeState::Completed);
    assert_eq!(bob_record.state, DidExchangeState::Completed);
}

#[tokio::test]
async fn test_manual_did_exchange() {
    let network = LoopbackNetwork::new();

    let mut config = test_config("alice");
    config.auto_accept_connections = false;
    let alice = network.agent(config).unwrap();

    let mut config = test_config("bob");
    config.auto_accept_connections = false;
    let bob = network.agent(config).unwrap();

    let (alice_record, invitation) = alice.connections().create_invitation(None).await.unwrap();
    let url = invitation.to_url("https://example.org").unwrap();

    let bob_record = bob.connections().receive_invitation_url(&url).await.unwrap();
    assert_eq!(bob_record.state, DidExchangeState::InvitationReceived);

    bob.connections().accept_invitation(&bob_record.id).await.unwrap();
    let alice_record = alice.connections().get(&alice_record.id).await.unwrap();
    assert_eq!(alice_record.state, DidExchangeState::RequestReceived);

    alice.connections().accept_request(&alice_record.id).await.unwrap();
    let bob_record = bob.connections().get(&bob_record.id).await.unwrap();
    assert_eq!(bob_record.state, DidExchangeState::ResponseReceived);

    // a trust ping completes the exchange on both sides
    let bob_record = bob.connections().send_ping(&bob_record.id).await.unwrap();
    assert_eq!(bob_record.state, DidExchangeState::Completed);

    let alice_record = alice.connections().get(&alice_record.id).await.unwrap();
    assert_eq!(alice_record.state, DidExchangeState::Completed);
}

#[tokio::test]
async fn test_request_after_completion() {
    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();

    let (alice_record, bob_record) = connect(&alice, &bob).await.unwrap();
    let mut bob_events = bob.subscribe();

    let request = PlaintextMessage::new(DID_EXCHANGE.message_type(REQUEST), &json!({}))
        .unwrap()
        .with_thread(alice_record.thread_id.clone())
        .with_parent_thread(alice_record.thread_id.clone());

    let envelope = bob
        .context()
        .envelope
        .seal(
            &request,
            std::slice::from_ref(alice_record.invitation_key.as_ref().unwrap()),
            bob_record.my_key.as_ref(),
        )
        .await
        .unwrap();

    alice
        .receive_message(&envelope.to_json().unwrap(), None)
        .await
        .unwrap();

    let alice_record = alice.connections().get(&alice_record.id).await.unwrap();
    let bob_record = bob.connections().get(&bob_record.id).await.unwrap();
    assert_eq!(alice_record.state, DidExchangeState::Completed);
    assert_eq!(bob_record.state, DidExchangeState::Completed);

    assert_eq!(problem_codes(drain(&mut bob_events)), vec![REQUEST_PROCESSING_ERROR]);
}

#[tokio::test]
async fn test_trust_ping() {
    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();

    let (alice_record, _) = connect(&alice, &bob).await.unwrap();
    let mut alice_events = alice.subscribe();

    alice.connections().send_ping(&alice_record.id).await.unwrap();

    let responses = drain(&mut alice_events)
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                AgentEvent::MessageReceived { message, .. } if message.message_type == TRUST_PING.message_type(PING_RESPONSE)
            )
        })
        .count();

    assert_eq!(responses, 1);
}

#[tokio::test]
async fn test_unsupported_message_type() {
    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();

    let (alice_record, _) = connect(&alice, &bob).await.unwrap();
    let mut alice_events = alice.subscribe();

    let message = PlaintextMessage::new("https://example.org/chess/1.0/move".to_string(), &json!({ "move": "e4" })).unwrap();
    let status = alice
        .send_message(OutboundMessageContext::new(message, alice_record))
        .await
        .unwrap();

    assert_eq!(status, OutboundSendStatus::SentToTransport);
    assert_eq!(problem_codes(drain(&mut alice_events)), vec![UNSUPPORTED_MESSAGE_TYPE]);
}

#[tokio::test]
async fn test_custom_handler_and_fallback() {
    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();

    let unhandled = Arc::new(AtomicUsize::new(0));
    let counter = unhandled.clone();

    let bob = Agent::builder(test_config("bob"))
        .with_transport(Arc::new(network.clone()))
        .with_handler(MessageHandler::new(
            "chess",
            vec![MessageTypeIdentifier::parse("https://example.org/chess/1.0/move").unwrap()],
            |context| async move {
                let reply = PlaintextMessage::new("https://example.org/chess/1.0/move".to_string(), &json!({ "move": "e5" }))?
                    .with_thread(context.message.thread_id());

                Ok::<_, Error>(Some(context.reply(reply)))
            },
        ))
        .with_fallback(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        })
        .build()
        .unwrap();
    network.join("bob", &bob);

    let (alice_record, _) = connect(&alice, &bob).await.unwrap();
    let mut alice_events = alice.subscribe();

    let message = PlaintextMessage::new("https://example.org/chess/1.0/move".to_string(), &json!({ "move": "e4" })).unwrap();
    alice
        .send_message(OutboundMessageContext::new(message, alice_record.clone()))
        .await
        .unwrap();

    let events = drain(&mut alice_events);
    assert!(events.iter().any(|event| matches!(
        event,
        AgentEvent::MessageReceived { message, .. } if message.body.get("move") == Some(&json!("e5"))
    )));
    assert_eq!(unhandled.load(Ordering::SeqCst), 0);

    let message = PlaintextMessage::new("https://example.org/go/1.0/move".to_string(), &json!({})).unwrap();
    alice
        .send_message(OutboundMessageContext::new(message, alice_record))
        .await
        .unwrap();

    assert_eq!(unhandled.load(Ordering::SeqCst), 1);
    assert!(problem_codes(drain(&mut alice_events)).is_empty());
    assert!(bob.supported_protocols().iter().any(|p| p.protocol_name == "chess"));
}

#[tokio::test]
async fn test_credential_issuance() {
    let network = LoopbackNetwork::new();

    let mut config = test_config("alice");
    config.auto_accept_credentials = true;
    let alice = network.agent(config).unwrap();

    let mut config = test_config("bob");
    config.auto_accept_credentials = true;
    let bob = network.agent(config).unwrap();

    let (_, bob_connection) = connect(&alice, &bob).await.unwrap();

    let proposed = bob
        .credentials()
        .propose_credential(&bob_connection.id, JSON_FORMAT, &json!({ "name": "bob", "age": 42 }))
        .await
        .unwrap();

    let holder = bob.credentials().get(&proposed.id).await.unwrap();
    assert_eq!(holder.state, CredentialState::Done);
    assert_eq!(holder.role, CredentialRole::Holder);
    assert_eq!(
        holder.credential,
        Some(json!({ "attributes": { "name": "bob", "age": 42 } }))
    );

    let issuer = alice
        .credentials()
        .find_by_thread(&holder.thread_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(issuer.state, CredentialState::Done);
    assert_eq!(issuer.role, CredentialRole::Issuer);
    assert_eq!(issuer.credential, holder.credential);
}

#[tokio::test]
async fn test_manual_credential_issuance() {
    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();

    let (alice_connection, _) = connect(&alice, &bob).await.unwrap();

    let issuer = alice
        .credentials()
        .offer_credential(&alice_connection.id, JSON_FORMAT, &json!({ "degree": "MSc" }))
        .await
        .unwrap();
    assert_eq!(issuer.state, CredentialState::OfferSent);

    let holder = bob
        .credentials()
        .find_by_thread(&issuer.thread_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(holder.state, CredentialState::OfferReceived);
    assert_eq!(serde_json::to_value(holder.state.legacy()).unwrap(), json!("offer_received"));

    let holder = bob.credentials().accept_offer(&holder.id).await.unwrap();
    assert_eq!(holder.state, CredentialState::RequestSent);
    assert_eq!(
        alice.credentials().get(&issuer.id).await.unwrap().state,
        CredentialState::RequestReceived
    );

    alice.credentials().accept_request(&issuer.id).await.unwrap();
    assert_eq!(
        bob.credentials().get(&holder.id).await.unwrap().state,
        CredentialState::CredentialReceived
    );

    bob.credentials().accept_credential(&holder.id).await.unwrap();
    assert_eq!(bob.credentials().get(&holder.id).await.unwrap().state, CredentialState::Done);
    assert_eq!(alice.credentials().get(&issuer.id).await.unwrap().state, CredentialState::Done);

    // a finished exchange cannot be acknowledged twice
    let Err(Error::State(_)) = bob.credentials().accept_credential(&holder.id).await else {
        panic!("accepting a done credential exchange should fail");
    };
}

#[tokio::test]
async fn test_rejected_credential_abandons_both_sides() {
    let network = LoopbackNetwork::new();

    let mut config = test_config("alice");
    config.auto_accept_credentials = true;
    let alice = network.agent(config).unwrap();

    let mut config = test_config("bob");
    config.auto_accept_credentials = true;
    let bob = network.agent(config).unwrap();

    let (alice_connection, _) = connect(&alice, &bob).await.unwrap();
    let mut alice_events = alice.subscribe();

    let issuer = alice
        .credentials()
        .offer_credential(&alice_connection.id, JSON_FORMAT, &json!({ "revoked": true }))
        .await
        .unwrap();

    let holder = bob
        .credentials()
        .find_by_thread(&issuer.thread_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(holder.state, CredentialState::Abandoned);
    assert!(holder.error_message.unwrap().starts_with(ISSUANCE_ABANDONED));

    let issuer = alice.credentials().get(&issuer.id).await.unwrap();
    assert_eq!(issuer.state, CredentialState::Abandoned);
    assert_eq!(problem_codes(drain(&mut alice_events)), vec![ISSUANCE_ABANDONED]);
}

#[tokio::test]
async fn test_credential_requires_ready_connection() {
    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();

    let (record, _) = alice.connections().create_invitation(None).await.unwrap();

    let Err(Error::ConnectionNotReady(_)) = alice
        .credentials()
        .offer_credential(&record.id, JSON_FORMAT, &json!({}))
        .await
    else {
        panic!("offer on an incomplete connection should fail");
    };

    let Err(Error::UnknownConnection(_)) = alice
        .credentials()
        .offer_credential("nope", JSON_FORMAT, &json!({}))
        .await
    else {
        panic!("offer on an unknown connection should fail");
    };
}

#[tokio::test]
async fn test_replayed_message_is_ignored() {
    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();

    let (alice_connection, bob_connection) = connect(&alice, &bob).await.unwrap();

    let (formats, filters_attach) = format_attachment(JSON_FORMAT, json!({ "name": "bob" }));
    let proposal = PlaintextMessage::new(
        ISSUE_CREDENTIAL.message_type(PROPOSE_CREDENTIAL),
        &ProposeCredential {
            comment: None,
            formats,
            filters_attach,
        },
    )
    .unwrap();

    let envelope = bob
        .context()
        .envelope
        .seal(
            &proposal,
            std::slice::from_ref(alice_connection.my_key.as_ref().unwrap()),
            bob_connection.my_key.as_ref(),
        )
        .await
        .unwrap()
        .to_json()
        .unwrap();

    let first = alice.receive_message(&envelope, None).await.unwrap();
    let second = alice.receive_message(&envelope, None).await.unwrap();

    assert_eq!(first.message_id, second.message_id);
    assert_eq!(first.connection_id.as_deref(), Some(alice_connection.id.as_str()));
    assert_eq!(second.reply_status, None);

    let records = alice.credentials().list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, CredentialState::ProposalReceived);
    assert_eq!(records[0].last_inbound_message_id.as_deref(), Some(proposal.id.as_str()));
}

#[tokio::test]
async fn test_presentation() {
    let network = LoopbackNetwork::new();

    let mut config = test_config("alice");
    config.auto_accept_proofs = true;
    let alice = network.agent(config).unwrap();

    let mut config = test_config("bob");
    config.auto_accept_proofs = true;
    let bob = network.agent(config).unwrap();

    let (alice_connection, _) = connect(&alice, &bob).await.unwrap();

    let verifier = alice
        .proofs()
        .request_presentation(&alice_connection.id, JSON_FORMAT, &json!({ "over_18": true }))
        .await
        .unwrap();

    let verifier = alice.proofs().get(&verifier.id).await.unwrap();
    assert_eq!(verifier.state, ProofState::Done);
    assert_eq!(verifier.role, ProofRole::Verifier);
    assert_eq!(verifier.verified, Some(true));

    let prover = bob
        .proofs()
        .find_by_thread(&verifier.thread_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(prover.state, ProofState::Done);
    assert_eq!(prover.role, ProofRole::Prover);
    assert_eq!(prover.presentation, verifier.presentation);
}

#[tokio::test]
async fn test_manual_presentation_from_proposal() {
    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();

    let (_, bob_connection) = connect(&alice, &bob).await.unwrap();

    let prover = bob
        .proofs()
        .propose_presentation(&bob_connection.id, JSON_FORMAT, &json!({ "name": "bob" }))
        .await
        .unwrap();
    assert_eq!(prover.state, ProofState::ProposalSent);

    let verifier = alice
        .proofs()
        .find_by_thread(&prover.thread_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(verifier.state, ProofState::ProposalReceived);

    alice.proofs().accept_proposal(&verifier.id).await.unwrap();
    assert_eq!(
        bob.proofs().get(&prover.id).await.unwrap().state,
        ProofState::RequestReceived
    );

    bob.proofs().accept_request(&prover.id).await.unwrap();
    let verifier = alice.proofs().get(&verifier.id).await.unwrap();
    assert_eq!(verifier.state, ProofState::PresentationReceived);
    assert_eq!(verifier.verified, Some(true));

    alice.proofs().accept_presentation(&verifier.id).await.unwrap();
    assert_eq!(bob.proofs().get(&prover.id).await.unwrap().state, ProofState::Done);
    assert_eq!(alice.proofs().get(&verifier.id).await.unwrap().state, ProofState::Done);
}

#[tokio::test]
async fn test_invalid_presentation_is_reported() {
    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();

    let (alice_connection, _) = connect(&alice, &bob).await.unwrap();
    let mut bob_events = bob.subscribe();

    let verifier = alice
        .proofs()
        .request_presentation(&alice_connection.id, JSON_FORMAT, &json!({ "over_18": true }))
        .await
        .unwrap();

    let prover = bob
        .proofs()
        .find_by_thread(&verifier.thread_id)
        .await
        .unwrap()
        .unwrap();

    // tamper with the stored request so the presentation no longer matches
    let mut tampered = prover.clone();
    tampered.request = Some(json!({ "requested": { "over_21": true } }));
    bob.context().proofs.update(&mut tampered).await.unwrap();

    bob.proofs().accept_request(&prover.id).await.unwrap();

    let verifier = alice.proofs().get(&verifier.id).await.unwrap();
    assert_eq!(verifier.state, ProofState::Abandoned);
    assert_eq!(verifier.verified, Some(false));

    assert_eq!(bob.proofs().get(&prover.id).await.unwrap().state, ProofState::Abandoned);
    assert_eq!(problem_codes(drain(&mut bob_events)), vec![INVALID_PRESENTATION]);
}

#[tokio::test]
async fn test_delivery_retries_then_fails() {
    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();

    let (alice_connection, _) = connect(&alice, &bob).await.unwrap();
    let mut alice_events = alice.subscribe();

    network.set_offline("bob", true);
    let before = network.attempts();

    let Err(Error::Delivery(DeliveryError::Undeliverable { attempts, .. })) =
        alice.connections().send_ping(&alice_connection.id).await
    else {
        panic!("sending to an offline agent should fail");
    };

    // one attempt and two retries
    assert_eq!(attempts, 3);
    assert_eq!(network.attempts() - before, 3);

    let statuses: Vec<_> = drain(&mut alice_events)
        .into_iter()
        .filter_map(|event| match event {
            AgentEvent::MessageSent { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![OutboundSendStatus::Undeliverable]);

    network.set_offline("bob", false);
    alice.connections().send_ping(&alice_connection.id).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_cancels_delivery() {
    let network = LoopbackNetwork::new();

    let mut config = test_config("alice");
    config.retry = RetryPolicy {
        max_retries: 10,
        initial_delay: std::time::Duration::from_secs(5),
        multiplier: 1.0,
        max_delay: std::time::Duration::from_secs(5),
        max_elapsed: std::time::Duration::from_secs(60),
    };
    let alice = network.agent(config).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();

    let (alice_connection, _) = connect(&alice, &bob).await.unwrap();
    network.set_offline("bob", true);

    let sender = alice.clone();
    let pending = tokio::spawn(async move { sender.connections().send_ping(&alice_connection.id).await });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    alice.shutdown().await;

    let Err(Error::Delivery(DeliveryError::Cancelled)) = pending.await.unwrap() else {
        panic!("shutdown should cancel the delivery");
    };
}

#[tokio::test]
async fn test_concurrent_redelivery_is_processed_once() {
    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();

    let (alice_connection, bob_connection) = connect(&alice, &bob).await.unwrap();
    let mut alice_events = alice.subscribe();

    let (formats, filters_attach) = format_attachment(JSON_FORMAT, json!({ "name": "bob" }));
    let proposal = PlaintextMessage::new(
        ISSUE_CREDENTIAL.message_type(PROPOSE_CREDENTIAL),
        &ProposeCredential {
            comment: None,
            formats,
            filters_attach,
        },
    )
    .unwrap();

    let envelope = bob
        .context()
        .envelope
        .seal(
            &proposal,
            std::slice::from_ref(alice_connection.my_key.as_ref().unwrap()),
            bob_connection.my_key.as_ref(),
        )
        .await
        .unwrap()
        .to_json()
        .unwrap();

    let (first, second) = tokio::join!(
        alice.receive_message(&envelope, None),
        alice.receive_message(&envelope, None)
    );
    assert_eq!(first.unwrap().message_id, second.unwrap().message_id);

    let records = alice.credentials().list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, CredentialState::ProposalReceived);

    let transitions = drain(&mut alice_events)
        .into_iter()
        .filter(|event| matches!(event, AgentEvent::CredentialStateChanged { .. }))
        .count();
    assert_eq!(transitions, 1);
}

#[tokio::test]
async fn test_mediated_delivery_and_pickup() {
    let network = LoopbackNetwork::new();
    let mut config = test_config("mediator");
    config.auto_accept_mediation = true;
    let mediator = network.agent(config).unwrap();
    let alice = network.agent(test_config("alice")).unwrap();

    // bob has no endpoint of his own
    let mut config = test_config("bob");
    config.endpoints.clear();
    let bob = network.agent(config).unwrap();

    let (mediator_connection, bob_mediator_connection) = connect(&mediator, &bob).await.unwrap();

    let mediation = bob.mediation().request(&bob_mediator_connection.id).await.unwrap();
    assert_eq!(mediation.state, MediationState::Granted);
    assert_eq!(mediation.role, MediationRole::Recipient);
    assert_eq!(mediation.routing_keys.len(), 1);

    let granted = mediator.mediation().list().await.unwrap();
    assert_eq!(granted.len(), 1);
    assert_eq!(granted[0].role, MediationRole::Mediator);
    assert_eq!(granted[0].connection_id, mediator_connection.id);
    assert_eq!(granted[0].routing_keys, mediation.routing_keys);

    let current = bob.context().mediator().unwrap();
    assert_eq!(current.endpoint, LoopbackNetwork::endpoint("mediator"));
    assert_eq!(current.routing_keys, mediation.routing_keys);

    let (alice_connection, bob_connection) = connect(&alice, &bob).await.unwrap();
    assert_eq!(alice_connection.state, DidExchangeState::Completed);
    assert_eq!(bob_connection.state, DidExchangeState::Completed);

    // alice reaches bob only through the mediator, which routes bob's key
    let services = alice_connection.their_services();
    assert_eq!(services[0].service_endpoint, LoopbackNetwork::endpoint("mediator"));
    assert_eq!(services[0].routing_keys, mediation.routing_keys);

    let bob_key = bob_connection.my_key.clone().unwrap();
    assert_eq!(
        mediator.context().routes.lookup(&bob_key).unwrap().as_deref(),
        Some(mediator_connection.id.as_str())
    );
    let granted = mediator.mediation().get(&granted[0].id).await.unwrap();
    assert!(granted.recipient_keys.contains(&bob_key.to_base58()));

    let mut alice_events = alice.subscribe();
    let status = alice
        .send_message(OutboundMessageContext::new(trust_ping::ping(true).unwrap(), alice_connection))
        .await
        .unwrap();
    assert_eq!(status, OutboundSendStatus::SentToTransport);
    assert_eq!(mediator.context().queues.len(&mediator_connection.id).unwrap(), 1);

    // delivery, acknowledgement and the final status all ride on this exchange
    let status = bob
        .mediation()
        .pickup(&bob_mediator_connection.id, pickup::DEFAULT_BATCH_SIZE)
        .await
        .unwrap();
    assert_eq!(status, OutboundSendStatus::SentToTransport);
    assert_eq!(mediator.context().queues.len(&mediator_connection.id).unwrap(), 0);

    let response = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match alice_events.recv().await {
                Ok(AgentEvent::MessageReceived { message, connection_id })
                    if message.message_type == TRUST_PING.message_type(PING_RESPONSE) =>
                {
                    break connection_id;
                }
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .unwrap();
    assert!(response.is_some());
}

#[tokio::test]
async fn test_forward_without_route_is_refused() {
    let network = LoopbackNetwork::new();
    let mediator = network.agent(test_config("mediator")).unwrap();
    let alice = network.agent(test_config("alice")).unwrap();

    let routing_key = mediator.context().keys().create_key(KeyType::Ed25519).await.unwrap();
    let stranger = InMemoryKeyManager::new().create_key(KeyType::Ed25519).await.unwrap();

    let envelope = &mediator.context().envelope;
    let inner = envelope
        .seal(&trust_ping::ping(false).unwrap(), std::slice::from_ref(&stranger), None)
        .await
        .unwrap();
    let forward = forward_message(stranger.to_base58(), inner).unwrap();
    let wire = envelope
        .seal(&forward, std::slice::from_ref(&routing_key), None)
        .await
        .unwrap()
        .to_json()
        .unwrap();

    let Err(Error::NoRoute(key)) = mediator.receive_message(&wire, None).await else {
        panic!("a forward for an unknown key should be refused");
    };
    assert_eq!(key, stranger.to_base58());

    // the sender learns the message went nowhere
    let outbound = OutboundMessageContext {
        message: trust_ping::ping(false).unwrap(),
        connection: None,
        service: Some(DidCommService {
            id: "#didcomm-1".to_string(),
            service_endpoint: LoopbackNetwork::endpoint("mediator"),
            recipient_keys: vec![stranger],
            routing_keys: vec![routing_key],
            priority: 0,
        }),
        sender_key: None,
        inbound_session_id: None,
        associated_record_id: None,
    };
    let Err(Error::Delivery(DeliveryError::Undeliverable { attempts, .. })) = alice.send_message(outbound).await
    else {
        panic!("a refused forward should be undeliverable");
    };
    assert_eq!(attempts, 1);
}

fn keylist_add(key: &Key) -> PlaintextMessage {
    PlaintextMessage::new(
        COORDINATE_MEDIATION.message_type(KEYLIST_UPDATE),
        &KeylistUpdate {
            updates: vec![KeylistUpdateItem {
                recipient_key: key.to_base58(),
                action: KeylistAction::Add,
            }],
        },
    )
    .unwrap()
}

fn keylist_results(events: Vec<AgentEvent>) -> Vec<KeylistResult> {
    events
        .into_iter()
        .filter_map(|event| match event {
            AgentEvent::MessageReceived { message, .. }
                if message.message_type == COORDINATE_MEDIATION.message_type(KEYLIST_UPDATE_RESPONSE) =>
            {
                message.body_as::<KeylistUpdateResponse>().ok()
            }
            _ => None,
        })
        .flat_map(|response| response.updated.into_iter().map(|updated| updated.result))
        .collect()
}

#[tokio::test]
async fn test_keylist_update_needs_grant_and_ownership() {
    let network = LoopbackNetwork::new();
    let mut config = test_config("mediator");
    config.auto_accept_mediation = true;
    let mediator = network.agent(config).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();
    let mallory = network.agent(test_config("mallory")).unwrap();

    let (mediator_bob, bob_connection) = connect(&mediator, &bob).await.unwrap();
    let (mediator_mallory, mallory_connection) = connect(&mediator, &mallory).await.unwrap();

    bob.mediation().request(&bob_connection.id).await.unwrap();
    let (_, invitation) = bob.connections().create_invitation(None).await.unwrap();
    let bob_key = invitation.recipient_key().unwrap().clone();
    assert_eq!(invitation.services[0].service_endpoint, LoopbackNetwork::endpoint("mediator"));
    assert_eq!(
        mediator.context().routes.lookup(&bob_key).unwrap().as_deref(),
        Some(mediator_bob.id.as_str())
    );

    // no mediation granted to mallory yet
    let mut mallory_events = mallory.subscribe();
    mallory
        .send_message(OutboundMessageContext::new(keylist_add(&bob_key), mallory_connection.clone()))
        .await
        .unwrap();
    assert_eq!(problem_codes(drain(&mut mallory_events)), vec![REQUEST_NOT_ACCEPTED]);

    let mediation = mallory.mediation().request(&mallory_connection.id).await.unwrap();
    assert!(mediation.is_granted());
    drain(&mut mallory_events);

    mallory
        .send_message(OutboundMessageContext::new(keylist_add(&bob_key), mallory_connection))
        .await
        .unwrap();
    assert_eq!(keylist_results(drain(&mut mallory_events)), vec![KeylistResult::ClientError]);

    assert_eq!(
        mediator.context().routes.lookup(&bob_key).unwrap().as_deref(),
        Some(mediator_bob.id.as_str())
    );
    let mallory_grant = mediator
        .mediation()
        .list()
        .await
        .unwrap()
        .into_iter()
        .find(|record| record.connection_id == mediator_mallory.id)
        .unwrap();
    assert!(mallory_grant.recipient_keys.is_empty());
}

#[tokio::test]
async fn test_mediation_denied() {
    let network = LoopbackNetwork::new();
    let mediator = network.agent(test_config("mediator")).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();

    let (_, bob_connection) = connect(&mediator, &bob).await.unwrap();

    let requested = bob.mediation().request(&bob_connection.id).await.unwrap();
    assert_eq!(requested.state, MediationState::Requested);

    let pending = mediator.mediation().list().await.unwrap();
    assert_eq!(pending[0].state, MediationState::Requested);

    let denied = mediator.mediation().deny(&pending[0].id).await.unwrap();
    assert_eq!(denied.state, MediationState::Denied);
    assert_eq!(bob.mediation().get(&requested.id).await.unwrap().state, MediationState::Denied);
    assert!(bob.context().mediator().is_none());

    let Err(Error::State(_)) = mediator.mediation().grant(&pending[0].id).await else {
        panic!("a denied request cannot be granted");
    };
}

#[tokio::test]
async fn test_discover_features() {
    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();
    let bob = network.agent(test_config("bob")).unwrap();

    let (alice_connection, _) = connect(&alice, &bob).await.unwrap();
    let mut alice_events = alice.subscribe();

    let disclosed = |events: Vec<AgentEvent>, thread: &str| {
        events.into_iter().find_map(|event| match event {
            AgentEvent::FeaturesDisclosed {
                thread_id,
                protocols,
                connection_id,
            } if thread_id == thread => Some((connection_id, protocols)),
            _ => None,
        })
    };

    let thread_id = alice
        .discover_features(&alice_connection.id, "https://didcomm.org/*")
        .await
        .unwrap();
    let (connection_id, protocols) = disclosed(drain(&mut alice_events), &thread_id).unwrap();
    assert_eq!(connection_id.as_deref(), Some(alice_connection.id.as_str()));

    let pids: Vec<String> = protocols.iter().map(ToString::to_string).collect();
    assert!(pids.contains(&DID_EXCHANGE.uri()));
    assert!(pids.contains(&COORDINATE_MEDIATION.uri()));
    assert_eq!(pids.len(), bob.supported_protocols().len());

    let thread_id = alice
        .discover_features(&alice_connection.id, "https://didcomm.org/chess/*")
        .await
        .unwrap();
    let (_, protocols) = disclosed(drain(&mut alice_events), &thread_id).unwrap();
    assert!(protocols.is_empty());
}

#[tokio::test]
async fn test_garbage_is_rejected() {
    let network = LoopbackNetwork::new();
    let alice = network.agent(test_config("alice")).unwrap();

    let Err(Error::InvalidMessage(_)) = alice.receive_message(b"hello", None).await else {
        panic!("garbage should be rejected");
    };

    let plaintext = trust_ping::ping(false).unwrap().to_json().unwrap();
    let Err(Error::InvalidMessage(_)) = alice.receive_message(&plaintext, None).await else {
        panic!("plaintext should be rejected");
    };
}
