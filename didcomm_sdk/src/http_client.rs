use once_cell::sync::OnceCell;
use std::time::Duration;

use crate::transport::TransportError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared HTTP client for outbound delivery
pub(crate) fn reqwest_client() -> Result<&'static reqwest::Client, TransportError> {
    static CLIENT: OnceCell<reqwest::Client> = OnceCell::new();

    CLIENT.get_or_try_init(|| {
        reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("didcomm_sdk/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Http("client build".to_string(), e))
    })
}
