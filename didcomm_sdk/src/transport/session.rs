use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{mpsc, oneshot};

use super::TransportError;
use crate::definitions::{Key, ReturnRoute, WireMessage};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionKind {
    Http,
    WebSocket,
}

/// A duplex channel an inbound message arrived on. A session carries at
/// most one reply: the second `send` fails with
/// [`TransportError::SessionClosed`].
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> SessionKind;

    fn is_open(&self) -> bool;

    async fn send(&self, message: WireMessage) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Session backed by a pending HTTP response
pub struct HttpSession {
    id: String,
    reply: Mutex<Option<oneshot::Sender<WireMessage>>>,
}

impl HttpSession {
    /// Create a session and the receiver the HTTP handler awaits the reply on
    pub fn new() -> (Self, oneshot::Receiver<WireMessage>) {
        let (sender, receiver) = oneshot::channel();

        (
            Self {
                id: uuid::Uuid::new_v4().to_string(),
                reply: Mutex::new(Some(sender)),
            },
            receiver,
        )
    }
}

#[async_trait]
impl TransportSession for HttpSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SessionKind {
        SessionKind::Http
    }

    fn is_open(&self) -> bool {
        self.reply
            .lock()
            .map(|reply| reply.as_ref().is_some_and(|sender| !sender.is_closed()))
            .unwrap_or(false)
    }

    async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        let sender = self
            .reply
            .lock()?
            .take()
            .ok_or_else(|| TransportError::SessionClosed(self.id.clone()))?;

        sender
            .send(message)
            .map_err(|_| TransportError::SessionClosed(self.id.clone()))
    }

    async fn close(&self) {
        if let Ok(mut reply) = self.reply.lock() {
            reply.take();
        }
    }
}

/// Session for one message received on a WebSocket; replies are written to
/// the socket's outgoing channel
pub struct WsSession {
    id: String,
    socket: mpsc::UnboundedSender<WireMessage>,
    replied: AtomicBool,
}

impl WsSession {
    pub fn new(socket: mpsc::UnboundedSender<WireMessage>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            socket,
            replied: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TransportSession for WsSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SessionKind {
        SessionKind::WebSocket
    }

    fn is_open(&self) -> bool {
        !self.replied.load(Ordering::Acquire) && !self.socket.is_closed()
    }

    async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        if self.replied.swap(true, Ordering::AcqRel) {
            return Err(TransportError::SessionClosed(self.id.clone()));
        }

        self.socket
            .send(message)
            .map_err(|_| TransportError::SessionClosed(self.id.clone()))
    }

    async fn close(&self) {
        self.replied.store(true, Ordering::Release);
    }
}

/// A session together with what we learned from the message that opened it
#[derive(Clone)]
pub struct SessionEntry {
    pub session: Arc<dyn TransportSession>,
    /// Key that authenticated the inbound message; replies on the session
    /// may only go to this key
    pub sender_key: Option<Key>,
    pub connection_id: Option<String>,
    pub return_route: ReturnRoute,
    pub thread_id: String,
}

/// Live sessions and WebSocket connections of an agent
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    sockets: RwLock<HashMap<String, mpsc::UnboundedSender<WireMessage>>>,
}

impl SessionRegistry {
    pub fn register(&self, entry: SessionEntry) -> Result<(), TransportError> {
        self.sessions
            .write()?
            .insert(entry.session.id().to_string(), entry);

        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions
            .read()
            .ok()
            .and_then(|sessions| sessions.get(session_id).cloned())
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions
            .write()
            .ok()
            .and_then(|mut sessions| sessions.remove(session_id))
    }

    /// Keep a WebSocket of `connection_id` for pushing messages to it
    pub fn attach_socket(
        &self,
        connection_id: &str,
        socket: mpsc::UnboundedSender<WireMessage>,
    ) -> Result<(), TransportError> {
        self.sockets
            .write()?
            .insert(connection_id.to_string(), socket);

        Ok(())
    }

    pub fn has_socket(&self, connection_id: &str) -> bool {
        self.sockets
            .read()
            .map(|sockets| sockets.get(connection_id).is_some_and(|s| !s.is_closed()))
            .unwrap_or(false)
    }

    /// Push `message` on the WebSocket attached for `connection_id`; returns
    /// the message back if there is no open socket
    pub fn push_to_connection(
        &self,
        connection_id: &str,
        message: WireMessage,
    ) -> Result<(), WireMessage> {
        let Ok(mut sockets) = self.sockets.write() else {
            return Err(message);
        };

        let Some(socket) = sockets.get(connection_id) else {
            return Err(message);
        };

        match socket.send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(message)) => {
                sockets.remove(connection_id);
                Err(message)
            }
        }
    }

    pub async fn close_all(&self) {
        let sessions: Vec<_> = match self.sessions.write() {
            Ok(mut sessions) => sessions.drain().map(|(_, entry)| entry).collect(),
            Err(_) => Vec::new(),
        };

        for entry in sessions {
            entry.session.close().await;
        }

        if let Ok(mut sockets) = self.sockets.write() {
            sockets.clear();
        }
    }
}
