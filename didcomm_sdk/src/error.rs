use crate::{
    crypto::CryptoError, definitions::KeyParseError, dispatch::DispatchError, keys::KeyError,
    message_type::MessageTypeError, state_machine::StateError, storage::StorageError,
    transport::TransportError,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Error: {0}")]
    Key(#[from] KeyError),
    #[error("Error: {0}")]
    KeyParse(#[from] KeyParseError),
    #[error("Error: {0}")]
    MessageType(#[from] MessageTypeError),
    #[error("Error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Error: {0}")]
    State(#[from] StateError),
    #[error("Error: {0}")]
    Transport(#[from] TransportError),
    #[error("Error: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("Error: {0}")]
    Storage(#[from] StorageError),
    #[error("Error: {0}")]
    ProblemReport(#[from] ProblemReportError),
    #[error("Error: {0}")]
    Config(String),
    #[error("Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Error: invalid message: {0}")]
    InvalidMessage(String),
    #[error("Error: no route for recipient key {0}")]
    NoRoute(String),
    #[error("Error: unknown connection {0}")]
    UnknownConnection(String),
    #[error("Error: connection {0} is not completed")]
    ConnectionNotReady(String),
    #[error("Internal error")]
    Internal,
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Internal
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DeliveryError {
    #[error("message for connection {connection_id:?} undeliverable after {attempts} attempt(s)")]
    Undeliverable {
        connection_id: Option<String>,
        attempts: usize,
    },
    #[error("delivery cancelled")]
    Cancelled,
}

/// A protocol level failure that is reported to the peer as a
/// `problem-report` message instead of being propagated to the application.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("problem report '{code}': {description}")]
pub struct ProblemReportError {
    pub code: String,
    pub description: String,
}

impl ProblemReportError {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
        }
    }
}

impl Error {
    /// The problem report a peer should receive for this error, if any
    pub(crate) fn as_problem_report(&self) -> Option<ProblemReportError> {
        match self {
            Error::ProblemReport(report) => Some(report.clone()),
            _ => None,
        }
    }
}
