use std::fmt::{self, Display};

/// Namespace of the community maintained DIDComm protocols
pub const DIDCOMM_ORG: &str = "https://didcomm.org";

/// Legacy namespace still sent by older agents
pub const LEGACY_DID_SOV_PREFIX: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageTypeError {
    #[error("malformed message type '{0}'")]
    Malformed(String),
}

/// Decomposed `@type` of a message:
/// `<document-uri>/<protocol-name>/<major>.<minor>/<message-name>`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageTypeIdentifier {
    pub document_uri: String,
    pub protocol_name: String,
    pub major_version: u32,
    pub minor_version: u32,
    pub message_name: String,
}

/// A protocol without a message name, e.g. `https://didcomm.org/didexchange/1.1`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolIdentifier {
    pub document_uri: String,
    pub protocol_name: String,
    pub major_version: u32,
    pub minor_version: u32,
}

/// Replace the legacy `did:sov:...;spec` namespace by `https://didcomm.org`
pub fn replace_legacy_prefix(message_type: &str) -> String {
    match message_type.strip_prefix(LEGACY_DID_SOV_PREFIX) {
        Some(rest) => format!("{DIDCOMM_ORG}{rest}"),
        None => message_type.to_string(),
    }
}

/// Replace `https://didcomm.org` by the legacy `did:sov:...;spec` namespace
pub fn to_legacy_prefix(message_type: &str) -> String {
    match message_type.strip_prefix(DIDCOMM_ORG) {
        Some(rest) => format!("{LEGACY_DID_SOV_PREFIX}{rest}"),
        None => message_type.to_string(),
    }
}

fn parse_version(value: &str) -> Option<(u32, u32)> {
    let (major, minor) = value.split_once('.')?;

    let is_number = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !is_number(major) || !is_number(minor) {
        return None;
    }

    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.chars().any(char::is_whitespace)
}

fn parse_protocol_parts(value: &str) -> Option<(&str, &str, u32, u32)> {
    let (rest, version) = value.rsplit_once('/')?;
    let (major, minor) = parse_version(version)?;
    let (document_uri, protocol_name) = rest.rsplit_once('/')?;

    if !valid_segment(document_uri) || !valid_segment(protocol_name) {
        return None;
    }

    Some((document_uri, protocol_name, major, minor))
}

impl MessageTypeIdentifier {
    pub fn parse(message_type: &str) -> Result<Self, MessageTypeError> {
        let malformed = || MessageTypeError::Malformed(message_type.to_string());

        let (protocol, message_name) = message_type.rsplit_once('/').ok_or_else(malformed)?;
        if !valid_segment(message_name) {
            return Err(malformed());
        }

        let (document_uri, protocol_name, major_version, minor_version) =
            parse_protocol_parts(protocol).ok_or_else(malformed)?;

        Ok(Self {
            document_uri: document_uri.to_string(),
            protocol_name: protocol_name.to_string(),
            major_version,
            minor_version,
            message_name: message_name.to_string(),
        })
    }

    /// Compatible types share protocol name, major version and message name;
    /// the minor version never gates dispatch.
    pub fn is_compatible(&self, other: &MessageTypeIdentifier) -> bool {
        self.protocol_name == other.protocol_name
            && self.major_version == other.major_version
            && self.message_name == other.message_name
    }

    /// Key under which handlers are registered
    pub(crate) fn routing_key(&self) -> (String, u32, String) {
        (
            self.protocol_name.clone(),
            self.major_version,
            self.message_name.clone(),
        )
    }

    pub fn protocol(&self) -> ProtocolIdentifier {
        ProtocolIdentifier {
            document_uri: self.document_uri.clone(),
            protocol_name: self.protocol_name.clone(),
            major_version: self.major_version,
            minor_version: self.minor_version,
        }
    }

    pub fn protocol_uri(&self) -> String {
        self.protocol().to_string()
    }

    pub fn message_type_uri(&self) -> String {
        self.to_string()
    }
}

impl Display for MessageTypeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}.{}/{}",
            self.document_uri,
            self.protocol_name,
            self.major_version,
            self.minor_version,
            self.message_name
        )
    }
}

impl std::str::FromStr for MessageTypeIdentifier {
    type Err = MessageTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl ProtocolIdentifier {
    pub fn parse(protocol_uri: &str) -> Result<Self, MessageTypeError> {
        let (document_uri, protocol_name, major_version, minor_version) =
            parse_protocol_parts(protocol_uri)
                .ok_or_else(|| MessageTypeError::Malformed(protocol_uri.to_string()))?;

        Ok(Self {
            document_uri: document_uri.to_string(),
            protocol_name: protocol_name.to_string(),
            major_version,
            minor_version,
        })
    }

    pub fn is_compatible(&self, other: &ProtocolIdentifier) -> bool {
        self.protocol_name == other.protocol_name && self.major_version == other.major_version
    }
}

impl Display for ProtocolIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}.{}",
            self.document_uri, self.protocol_name, self.major_version, self.minor_version
        )
    }
}

/// Parse a protocol URI (`<document-uri>/<protocol>/<major>.<minor>`)
pub fn parse_protocol_uri(protocol_uri: &str) -> Result<ProtocolIdentifier, MessageTypeError> {
    ProtocolIdentifier::parse(protocol_uri)
}

/// A protocol known at compile time; message types are produced from it with
/// [`ProtocolUri::message_type`] so the URI shape is defined in one place.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProtocolUri {
    pub name: &'static str,
    pub major: u32,
    pub minor: u32,
}

impl ProtocolUri {
    pub const fn new(name: &'static str, major: u32, minor: u32) -> Self {
        Self { name, major, minor }
    }

    pub fn uri(&self) -> String {
        format!("{DIDCOMM_ORG}/{}/{}.{}", self.name, self.major, self.minor)
    }

    pub fn message_type(&self, message_name: &str) -> String {
        format!("{}/{message_name}", self.uri())
    }

    pub fn identifier(&self, message_name: &str) -> MessageTypeIdentifier {
        MessageTypeIdentifier {
            document_uri: DIDCOMM_ORG.to_string(),
            protocol_name: self.name.to_string(),
            major_version: self.major,
            minor_version: self.minor,
            message_name: message_name.to_string(),
        }
    }
}

pub const DID_EXCHANGE: ProtocolUri = ProtocolUri::new("didexchange", 1, 1);
pub const TRUST_PING: ProtocolUri = ProtocolUri::new("trust_ping", 1, 0);
pub const NOTIFICATION: ProtocolUri = ProtocolUri::new("notification", 1, 0);
pub const ROUTING: ProtocolUri = ProtocolUri::new("routing", 1, 0);
pub const COORDINATE_MEDIATION: ProtocolUri = ProtocolUri::new("coordinate-mediation", 1, 0);
pub const MESSAGE_PICKUP: ProtocolUri = ProtocolUri::new("messagepickup", 2, 0);
pub const DISCOVER_FEATURES: ProtocolUri = ProtocolUri::new("discover-features", 1, 0);
pub const OUT_OF_BAND: ProtocolUri = ProtocolUri::new("out-of-band", 1, 1);
pub const ISSUE_CREDENTIAL: ProtocolUri = ProtocolUri::new("issue-credential", 2, 0);
pub const PRESENT_PROOF: ProtocolUri = ProtocolUri::new("present-proof", 2, 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_type() {
        let parsed =
            MessageTypeIdentifier::parse("https://didcomm.org/didexchange/1.1/request").unwrap();

        assert_eq!(parsed.document_uri, "https://didcomm.org");
        assert_eq!(parsed.protocol_name, "didexchange");
        assert_eq!(parsed.major_version, 1);
        assert_eq!(parsed.minor_version, 1);
        assert_eq!(parsed.message_name, "request");
        assert_eq!(parsed.protocol_uri(), "https://didcomm.org/didexchange/1.1");
        assert_eq!(
            parsed.message_type_uri(),
            "https://didcomm.org/didexchange/1.1/request"
        );
    }

    #[test]
    fn test_malformed_message_types() {
        for malformed in [
            "",
            "request",
            "https://didcomm.org/didexchange/request",
            "https://didcomm.org/didexchange/1/request",
            "https://didcomm.org/didexchange/1.x/request",
            "https://didcomm.org/didexchange/1.1/",
            "didexchange/1.1/request",
            "https://didcomm.org/didexchange/1.1/req uest",
        ] {
            assert_eq!(
                MessageTypeIdentifier::parse(malformed),
                Err(MessageTypeError::Malformed(malformed.to_string())),
                "{malformed} should not parse"
            );
        }
    }

    #[test]
    fn test_minor_version_is_ignored() {
        let v10 = MessageTypeIdentifier::parse("https://didcomm.org/didexchange/1.0/request").unwrap();
        let v17 = MessageTypeIdentifier::parse("https://didcomm.org/didexchange/1.7/request").unwrap();
        let v20 = MessageTypeIdentifier::parse("https://didcomm.org/didexchange/2.0/request").unwrap();
        let other = MessageTypeIdentifier::parse("https://didcomm.org/didexchange/1.1/response").unwrap();

        assert!(v10.is_compatible(&v17));
        assert!(!v10.is_compatible(&v20));
        assert!(!v10.is_compatible(&other));
        assert_eq!(v10.routing_key(), v17.routing_key());
    }

    #[test]
    fn test_legacy_prefix() {
        let legacy = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/trust_ping/1.0/ping";
        assert_eq!(
            replace_legacy_prefix(legacy),
            "https://didcomm.org/trust_ping/1.0/ping"
        );
        assert_eq!(to_legacy_prefix(&replace_legacy_prefix(legacy)), legacy);
        assert_eq!(
            replace_legacy_prefix("https://example.org/a/1.0/b"),
            "https://example.org/a/1.0/b"
        );

        let parsed = MessageTypeIdentifier::parse(legacy).unwrap();
        assert_eq!(parsed.document_uri, LEGACY_DID_SOV_PREFIX);
        assert_eq!(parsed.protocol_name, "trust_ping");
    }

    #[test]
    fn test_protocol_uri() {
        let protocol = parse_protocol_uri("https://didcomm.org/issue-credential/2.3").unwrap();
        assert_eq!(protocol.protocol_name, "issue-credential");
        assert_eq!(protocol.minor_version, 3);
        assert!(protocol.is_compatible(&parse_protocol_uri(&ISSUE_CREDENTIAL.uri()).unwrap()));
        assert!(parse_protocol_uri("https://didcomm.org/issue-credential").is_err());

        assert_eq!(
            DID_EXCHANGE.message_type("complete"),
            "https://didcomm.org/didexchange/1.1/complete"
        );
        assert_eq!(
            DID_EXCHANGE.identifier("complete").to_string(),
            DID_EXCHANGE.message_type("complete")
        );
    }
}
