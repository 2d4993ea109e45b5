use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use url::Url;

use crate::definitions::WireMessage;

pub mod error;
mod http;
#[cfg(feature = "inbound")]
pub mod inbound;
pub mod session;
mod ws;

pub use error::TransportError;
pub use http::HttpTransport;
pub use session::{HttpSession, SessionKind, SessionRegistry, TransportSession, WsSession};
pub use ws::WsTransport;

/// Sends sealed messages to a peer's service endpoint
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// URL schemes this transport handles
    fn schemes(&self) -> &[&'static str];

    /// Send `message` to `endpoint`. A synchronous reply carried back on the
    /// same exchange (e.g. an HTTP response body) is returned.
    async fn send(
        &self,
        endpoint: &Url,
        message: &[u8],
    ) -> Result<Option<WireMessage>, TransportError>;
}

/// Outbound transports indexed by URL scheme
#[derive(Clone, Default)]
pub struct Transports {
    by_scheme: HashMap<&'static str, Arc<dyn OutboundTransport>>,
}

impl Transports {
    pub fn register(&mut self, transport: Arc<dyn OutboundTransport>) {
        for scheme in transport.schemes() {
            self.by_scheme.insert(scheme, transport.clone());
        }
    }

    pub fn supports(&self, scheme: &str) -> bool {
        self.by_scheme.contains_key(scheme)
    }

    pub async fn send_message(
        &self,
        endpoint: &str,
        message: &[u8],
    ) -> Result<Option<WireMessage>, TransportError> {
        let url = Url::parse(endpoint)
            .map_err(|_| TransportError::InvalidTransportAddress(endpoint.to_string()))?;

        let transport = self
            .by_scheme
            .get(url.scheme())
            .ok_or_else(|| TransportError::InvalidTransportScheme(url.scheme().to_string()))?;

        tracing::info!("sending message to {endpoint}");

        transport.send(&url, message).await
    }
}

impl std::fmt::Debug for Transports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.by_scheme.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_scheme() {
        let transports = Transports::default();
        assert!(!transports.supports("http"));

        let Err(TransportError::InvalidTransportScheme(scheme)) =
            transports.send_message("ftp://example.com", b"hi").await
        else {
            panic!("ftp should not be supported");
        };
        assert_eq!(scheme, "ftp");

        let Err(TransportError::InvalidTransportAddress(_)) =
            transports.send_message("not a url", b"hi").await
        else {
            panic!("invalid url should not be accepted");
        };
    }
}
