use serde::{Deserialize, Serialize};
use std::fmt;

use super::messages::{ACK, ISSUE_CREDENTIAL, OFFER_CREDENTIAL, PROPOSE_CREDENTIAL, REQUEST_CREDENTIAL};
use crate::state_machine::{StateGraph, Transition};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialState {
    Start,
    ProposalSent,
    ProposalReceived,
    OfferSent,
    OfferReceived,
    RequestSent,
    RequestReceived,
    CredentialIssued,
    CredentialReceived,
    Done,
    Abandoned,
}

impl CredentialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialState::Start => "start",
            CredentialState::ProposalSent => "proposal-sent",
            CredentialState::ProposalReceived => "proposal-received",
            CredentialState::OfferSent => "offer-sent",
            CredentialState::OfferReceived => "offer-received",
            CredentialState::RequestSent => "request-sent",
            CredentialState::RequestReceived => "request-received",
            CredentialState::CredentialIssued => "credential-issued",
            CredentialState::CredentialReceived => "credential-received",
            CredentialState::Done => "done",
            CredentialState::Abandoned => "abandoned",
        }
    }

    /// The issue-credential 1.0 state name
    pub fn legacy(&self) -> LegacyCredentialState {
        match self {
            CredentialState::Start | CredentialState::ProposalSent => LegacyCredentialState::ProposalSent,
            CredentialState::ProposalReceived => LegacyCredentialState::ProposalReceived,
            CredentialState::OfferSent => LegacyCredentialState::OfferSent,
            CredentialState::OfferReceived => LegacyCredentialState::OfferReceived,
            CredentialState::RequestSent => LegacyCredentialState::RequestSent,
            CredentialState::RequestReceived => LegacyCredentialState::RequestReceived,
            CredentialState::CredentialIssued => LegacyCredentialState::CredentialIssued,
            CredentialState::CredentialReceived => LegacyCredentialState::CredentialReceived,
            CredentialState::Done => LegacyCredentialState::CredentialAcked,
            CredentialState::Abandoned => LegacyCredentialState::Abandoned,
        }
    }
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyCredentialState {
    ProposalSent,
    ProposalReceived,
    OfferSent,
    OfferReceived,
    RequestSent,
    RequestReceived,
    CredentialIssued,
    CredentialReceived,
    CredentialAcked,
    Abandoned,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialRole {
    Issuer,
    Holder,
}

impl CredentialRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialRole::Issuer => "issuer",
            CredentialRole::Holder => "holder",
        }
    }
}

impl fmt::Display for CredentialRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use CredentialRole::{Holder, Issuer};
use CredentialState::*;

pub static CREDENTIAL_GRAPH: StateGraph<CredentialState, CredentialRole> = StateGraph {
    protocol: "issue-credential",
    transitions: &[
        Transition::sent(&[Start, OfferReceived], PROPOSE_CREDENTIAL, Holder, ProposalSent),
        Transition::received(&[Start, ProposalSent], OFFER_CREDENTIAL, Holder, OfferReceived),
        Transition::sent(&[OfferReceived], REQUEST_CREDENTIAL, Holder, RequestSent),
        Transition::received(&[RequestSent], ISSUE_CREDENTIAL, Holder, CredentialReceived),
        Transition::sent(&[CredentialReceived], ACK, Holder, Done),
        Transition::received(&[Start, OfferSent], PROPOSE_CREDENTIAL, Issuer, ProposalReceived),
        Transition::sent(&[Start, ProposalReceived], OFFER_CREDENTIAL, Issuer, OfferSent),
        Transition::received(&[OfferSent], REQUEST_CREDENTIAL, Issuer, RequestReceived),
        Transition::sent(&[RequestReceived], ISSUE_CREDENTIAL, Issuer, CredentialIssued),
        Transition::received(&[CredentialIssued], ACK, Issuer, Done),
    ],
    abandoned: Abandoned,
    terminal: &[Done, Abandoned],
};
