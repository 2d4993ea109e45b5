use serde::{Deserialize, Serialize};

use crate::definitions::{Attachment, AttachmentFormat};

pub const PROPOSE_PRESENTATION: &str = "propose-presentation";
pub const REQUEST_PRESENTATION: &str = "request-presentation";
pub const PRESENTATION: &str = "presentation";
pub const ACK: &str = "ack";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposePresentation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub formats: Vec<AttachmentFormat>,
    #[serde(rename = "proposals~attach")]
    pub proposals_attach: Vec<Attachment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPresentation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub will_confirm: bool,
    pub formats: Vec<AttachmentFormat>,
    #[serde(rename = "request_presentations~attach")]
    pub request_presentations_attach: Vec<Attachment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presentation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub formats: Vec<AttachmentFormat>,
    #[serde(rename = "presentations~attach")]
    pub presentations_attach: Vec<Attachment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_attachment_name() {
        let request: RequestPresentation = serde_json::from_value(serde_json::json!({
            "formats": [{ "attach_id": "a", "format": "test/v1" }],
            "request_presentations~attach": [
                { "@id": "a", "data": { "json": { "attr": "name" } } }
            ]
        }))
        .unwrap();

        assert!(!request.will_confirm);
        assert_eq!(request.request_presentations_attach[0].id, "a");
    }
}
