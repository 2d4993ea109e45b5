//! Inbound HTTP and WebSocket endpoints of an agent, as an axum router.

use axum::{
    Router,
    body::Bytes,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{HttpSession, TransportSession, WsSession};
use crate::{Agent, Error, crypto::ENVELOPE_CONTENT_TYPE, definitions::WireMessage};

/// Routes: `POST /` takes one message per request and answers with the
/// reply when the sender asked for one; `GET /ws` upgrades to a WebSocket
/// carrying messages both ways.
pub fn router(agent: Agent) -> Router {
    Router::new()
        .route("/", post(new_message))
        .route("/ws", get(websocket_handler))
        .with_state(agent)
}

async fn new_message(State(agent): State<Agent>, body: Bytes) -> Response {
    let (session, mut reply) = HttpSession::new();
    let session = Arc::new(session);

    let result = agent
        .receive_message(&body, Some(session.clone() as Arc<dyn TransportSession>))
        .await;
    session.close().await;

    if let Err(e) = result {
        tracing::error!("inbound message failed: {e}");
        return (status_for(&e), e.to_string()).into_response();
    }

    match reply.try_recv() {
        Ok(message) => ([(header::CONTENT_TYPE, ENVELOPE_CONTENT_TYPE)], message).into_response(),
        Err(_) => StatusCode::OK.into_response(),
    }
}

/// Messages that can never succeed are refused with a client error so the
/// sender does not retry them
fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::InvalidMessage(_) | Error::NoRoute(_) | Error::Crypto(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn websocket_handler(ws: WebSocketUpgrade, State(agent): State<Agent>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(agent, socket))
}

async fn handle_socket(agent: Agent, socket: WebSocket) {
    let (mut ws_send, mut ws_receive) = socket.split();
    let (outgoing, mut pending) = mpsc::unbounded_channel::<WireMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = pending.recv().await {
            if ws_send.send(Message::Binary(Bytes::from(message))).await.is_err() {
                break;
            }
        }
    });

    let cancel = agent.context().cancel.clone();

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = ws_receive.next() => message,
        };

        let data = match message {
            Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        };

        let session: Arc<dyn TransportSession> = Arc::new(WsSession::new(outgoing.clone()));

        match agent.receive_message(&data, Some(session)).await {
            Ok(received) => {
                if received.return_route_all
                    && let Some(connection_id) = received.connection_id
                {
                    attach(&agent, &connection_id, outgoing.clone());
                }
            }
            Err(e) => tracing::warn!("inbound websocket message failed: {e}"),
        }
    }

    writer.abort();
    tracing::debug!("inbound websocket closed");
}

/// Keep the socket for pushing to `connection_id` and flush what queued up
/// while it was away
fn attach(agent: &Agent, connection_id: &str, socket: mpsc::UnboundedSender<WireMessage>) {
    let sessions = &agent.context().sessions;

    if !sessions.has_socket(connection_id)
        && let Err(e) = sessions.attach_socket(connection_id, socket)
    {
        tracing::warn!("could not keep websocket of {connection_id}: {e}");
        return;
    }

    let queued = match agent.pickup_messages(connection_id, usize::MAX) {
        Ok(queued) => queued,
        Err(e) => {
            tracing::warn!("could not read queue of {connection_id}: {e}");
            return;
        }
    };

    let mut queued = queued.into_iter();
    while let Some(envelope) = queued.next() {
        let Ok(message) = envelope.to_json() else {
            continue;
        };

        if sessions.push_to_connection(connection_id, message).is_err() {
            tracing::warn!("websocket of {connection_id} closed while flushing its queue");

            for envelope in std::iter::once(envelope).chain(queued) {
                if let Err(e) = agent.context().queues.push(connection_id, envelope) {
                    tracing::warn!("dropping queued message of {connection_id}: {e}");
                }
            }
            break;
        }
    }
}
