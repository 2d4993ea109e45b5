use async_trait::async_trait;
use serde_json::Value;

use crate::Error;

/// Produces and verifies the format specific attachments of a
/// present-proof exchange
#[async_trait]
pub trait ProofFormatService: Send + Sync {
    fn format(&self) -> &str;

    async fn create_proposal(&self, input: &Value) -> Result<Value, Error>;

    /// `input` is the application's request, or the proposal being answered
    async fn create_request(&self, input: &Value) -> Result<Value, Error>;

    async fn create_presentation(&self, request: &Value) -> Result<Value, Error>;

    /// Whether `presentation` satisfies `request`
    async fn verify_presentation(&self, request: &Value, presentation: &Value) -> Result<bool, Error>;
}
