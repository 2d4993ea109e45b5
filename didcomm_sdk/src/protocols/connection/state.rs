use serde::{Deserialize, Serialize};
use std::fmt;

use crate::state_machine::{StateGraph, Transition};

use super::messages::{COMPLETE, INVITATION, PING, REQUEST, RESPONSE};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DidExchangeState {
    Start,
    InvitationSent,
    InvitationReceived,
    RequestSent,
    RequestReceived,
    ResponseSent,
    ResponseReceived,
    Completed,
    Abandoned,
}

impl DidExchangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DidExchangeState::Start => "start",
            DidExchangeState::InvitationSent => "invitation-sent",
            DidExchangeState::InvitationReceived => "invitation-received",
            DidExchangeState::RequestSent => "request-sent",
            DidExchangeState::RequestReceived => "request-received",
            DidExchangeState::ResponseSent => "response-sent",
            DidExchangeState::ResponseReceived => "response-received",
            DidExchangeState::Completed => "completed",
            DidExchangeState::Abandoned => "abandoned",
        }
    }

    /// The RFC 0160 connection state this state corresponds to
    pub fn legacy(&self) -> ConnectionState {
        match self {
            DidExchangeState::Start | DidExchangeState::Abandoned => ConnectionState::Null,
            DidExchangeState::InvitationSent | DidExchangeState::InvitationReceived => {
                ConnectionState::Invited
            }
            DidExchangeState::RequestSent | DidExchangeState::RequestReceived => {
                ConnectionState::Requested
            }
            DidExchangeState::ResponseSent | DidExchangeState::ResponseReceived => {
                ConnectionState::Responded
            }
            DidExchangeState::Completed => ConnectionState::Complete,
        }
    }
}

impl fmt::Display for DidExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection states of the 1.0 connection protocol
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Null,
    Invited,
    Requested,
    Responded,
    Complete,
}

/// The inviter answers requests, the invitee sends them
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DidExchangeRole {
    Requester,
    Responder,
}

impl DidExchangeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DidExchangeRole::Requester => "requester",
            DidExchangeRole::Responder => "responder",
        }
    }
}

impl fmt::Display for DidExchangeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use DidExchangeRole::{Requester, Responder};
use DidExchangeState::*;

pub static DID_EXCHANGE_GRAPH: StateGraph<DidExchangeState, DidExchangeRole> = StateGraph {
    protocol: "didexchange",
    transitions: &[
        // inviter
        Transition::sent(&[Start], INVITATION, Responder, InvitationSent),
        Transition::received(&[InvitationSent], REQUEST, Responder, RequestReceived),
        Transition::sent(&[RequestReceived], RESPONSE, Responder, ResponseSent),
        Transition::received(&[ResponseSent], COMPLETE, Responder, Completed),
        Transition::received(&[ResponseSent], PING, Responder, Completed),
        // invitee
        Transition::received(&[Start], INVITATION, Requester, InvitationReceived),
        Transition::sent(&[InvitationReceived], REQUEST, Requester, RequestSent),
        Transition::received(&[RequestSent], RESPONSE, Requester, ResponseReceived),
        Transition::sent(&[ResponseReceived], COMPLETE, Requester, Completed),
        Transition::sent(&[ResponseReceived], PING, Requester, Completed),
    ],
    abandoned: Abandoned,
    terminal: &[Completed, Abandoned],
};

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [DidExchangeState; 9] = [
        Start,
        InvitationSent,
        InvitationReceived,
        RequestSent,
        RequestReceived,
        ResponseSent,
        ResponseReceived,
        Completed,
        Abandoned,
    ];

    #[test]
    fn test_roles_never_share_an_edge() {
        for a in DID_EXCHANGE_GRAPH.transitions {
            for b in DID_EXCHANGE_GRAPH.transitions {
                if a.role != b.role && a.message == b.message {
                    assert_ne!(a.direction, b.direction);
                }
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        for state in ALL {
            assert_eq!(
                DID_EXCHANGE_GRAPH.is_terminal(state),
                matches!(state, Completed | Abandoned)
            );
        }
    }

    #[test]
    fn test_legacy_projection_is_total() {
        let projected: Vec<_> = ALL.iter().map(DidExchangeState::legacy).collect();

        assert_eq!(
            projected,
            vec![
                ConnectionState::Null,
                ConnectionState::Invited,
                ConnectionState::Invited,
                ConnectionState::Requested,
                ConnectionState::Requested,
                ConnectionState::Responded,
                ConnectionState::Responded,
                ConnectionState::Complete,
                ConnectionState::Null,
            ]
        );
    }

    #[test]
    fn test_display_matches_serde() {
        for state in ALL {
            assert_eq!(
                serde_json::to_value(state).unwrap(),
                serde_json::Value::String(state.to_string())
            );
        }
    }
}
