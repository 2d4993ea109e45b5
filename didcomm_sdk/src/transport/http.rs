use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use url::Url;

use super::{OutboundTransport, TransportError};
use crate::{crypto::ENVELOPE_CONTENT_TYPE, definitions::WireMessage};

pub(crate) const SCHEME_HTTP: &str = "http";
pub(crate) const SCHEME_HTTPS: &str = "https";

/// HTTP(S) POST of sealed messages
#[derive(Debug, Default, Clone)]
pub struct HttpTransport;

#[async_trait]
impl OutboundTransport for HttpTransport {
    fn schemes(&self) -> &[&'static str] {
        &[SCHEME_HTTP, SCHEME_HTTPS]
    }

    async fn send(
        &self,
        url: &Url,
        message: &[u8],
    ) -> Result<Option<WireMessage>, TransportError> {
        let client = crate::http_client::reqwest_client()?;

        let response = client
            .post(url.clone())
            .header(CONTENT_TYPE, ENVELOPE_CONTENT_TYPE)
            .body(message.to_vec())
            .send()
            .await
            .map_err(|e| TransportError::Http(url.to_string(), e))?;

        let status = response.status();
        if !status.is_success() {
            if let Ok(text) = response.text().await {
                tracing::error!("{url} responded {status}: {text}");
            }
            return Err(TransportError::Status(url.to_string(), status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Http(url.to_string(), e))?;

        if body.is_empty() {
            Ok(None)
        } else {
            tracing::debug!("received synchronous reply from {url}");
            Ok(Some(body.to_vec()))
        }
    }
}
