use async_trait::async_trait;
use serde_json::Value;

use crate::Error;

/// Produces and checks the format specific attachments of an
/// issue-credential exchange. The protocol only moves the JSON payloads
/// these methods return between the parties.
#[async_trait]
pub trait CredentialFormatService: Send + Sync {
    /// Format identifier carried in the `formats` list of each message
    fn format(&self) -> &str;

    async fn create_proposal(&self, input: &Value) -> Result<Value, Error>;

    /// `input` is the application's offer, or the proposal being answered
    async fn create_offer(&self, input: &Value) -> Result<Value, Error>;

    async fn create_request(&self, offer: &Value) -> Result<Value, Error>;

    async fn create_credential(&self, offer: &Value, request: &Value) -> Result<Value, Error>;

    /// Check and store a received credential
    async fn process_credential(&self, request: &Value, credential: &Value) -> Result<(), Error>;
}
