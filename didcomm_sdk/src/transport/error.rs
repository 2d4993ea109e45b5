#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("fetching '{0}' failed: {1}")]
    Http(String, reqwest::Error),
    #[error("'{0}' responded with status {1}")]
    Status(String, u16),
    #[error("websocket '{0}' failed: {1}")]
    Websocket(String, Box<tokio_tungstenite::tungstenite::Error>),
    #[error("invalid address '{0}'")]
    InvalidTransportAddress(String),
    #[error("invalid transport scheme '{0}'")]
    InvalidTransportScheme(String),
    #[error("invalid message received '{0}'")]
    InvalidMessageReceived(String),
    #[error("session '{0}' is closed or already replied")]
    SessionClosed(String),
    #[error("internal error")]
    Internal,
}

impl TransportError {
    /// Whether retrying the same send may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Http(_, e) => e.is_connect() || e.is_timeout() || e.is_request(),
            TransportError::Status(_, status) => *status >= 500 || *status == 429,
            TransportError::Websocket(..) => true,
            _ => false,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for TransportError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(TransportError::Status("http://a".into(), 503).is_transient());
        assert!(TransportError::Status("http://a".into(), 429).is_transient());
        assert!(!TransportError::Status("http://a".into(), 400).is_transient());
        assert!(!TransportError::InvalidTransportScheme("ftp".into()).is_transient());
        assert!(!TransportError::SessionClosed("1".into()).is_transient());
    }
}
