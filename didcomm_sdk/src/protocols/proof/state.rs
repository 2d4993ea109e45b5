use serde::{Deserialize, Serialize};
use std::fmt;

use super::messages::{ACK, PRESENTATION, PROPOSE_PRESENTATION, REQUEST_PRESENTATION};
use crate::state_machine::{StateGraph, Transition};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProofState {
    Start,
    ProposalSent,
    ProposalReceived,
    RequestSent,
    RequestReceived,
    PresentationSent,
    PresentationReceived,
    Done,
    Abandoned,
}

impl ProofState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofState::Start => "start",
            ProofState::ProposalSent => "proposal-sent",
            ProofState::ProposalReceived => "proposal-received",
            ProofState::RequestSent => "request-sent",
            ProofState::RequestReceived => "request-received",
            ProofState::PresentationSent => "presentation-sent",
            ProofState::PresentationReceived => "presentation-received",
            ProofState::Done => "done",
            ProofState::Abandoned => "abandoned",
        }
    }

    /// The present-proof 1.0 state name
    pub fn legacy(&self) -> LegacyProofState {
        match self {
            ProofState::Start | ProofState::ProposalSent => LegacyProofState::ProposalSent,
            ProofState::ProposalReceived => LegacyProofState::ProposalReceived,
            ProofState::RequestSent => LegacyProofState::RequestSent,
            ProofState::RequestReceived => LegacyProofState::RequestReceived,
            ProofState::PresentationSent => LegacyProofState::PresentationSent,
            ProofState::PresentationReceived => LegacyProofState::PresentationReceived,
            ProofState::Done => LegacyProofState::PresentationAcked,
            ProofState::Abandoned => LegacyProofState::Abandoned,
        }
    }
}

impl fmt::Display for ProofState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyProofState {
    ProposalSent,
    ProposalReceived,
    RequestSent,
    RequestReceived,
    PresentationSent,
    PresentationReceived,
    PresentationAcked,
    Abandoned,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofRole {
    Prover,
    Verifier,
}

impl ProofRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofRole::Prover => "prover",
            ProofRole::Verifier => "verifier",
        }
    }
}

impl fmt::Display for ProofRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use ProofRole::{Prover, Verifier};
use ProofState::*;

pub static PROOF_GRAPH: StateGraph<ProofState, ProofRole> = StateGraph {
    protocol: "present-proof",
    transitions: &[
        Transition::sent(&[Start, RequestReceived], PROPOSE_PRESENTATION, Prover, ProposalSent),
        Transition::received(&[Start, ProposalSent], REQUEST_PRESENTATION, Prover, RequestReceived),
        Transition::sent(&[RequestReceived], PRESENTATION, Prover, PresentationSent),
        Transition::received(&[PresentationSent], ACK, Prover, Done),
        Transition::received(&[Start, RequestSent], PROPOSE_PRESENTATION, Verifier, ProposalReceived),
        Transition::sent(&[Start, ProposalReceived], REQUEST_PRESENTATION, Verifier, RequestSent),
        Transition::received(&[RequestSent], PRESENTATION, Verifier, PresentationReceived),
        Transition::sent(&[PresentationReceived], ACK, Verifier, Done),
    ],
    abandoned: Abandoned,
    terminal: &[Done, Abandoned],
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Direction;

    #[test]
    fn test_verifier_opens_with_request() {
        assert_eq!(
            PROOF_GRAPH.initial(Start, REQUEST_PRESENTATION, Direction::Sent, Verifier),
            Ok(RequestSent)
        );
        assert!(PROOF_GRAPH
            .initial(Start, PRESENTATION, Direction::Received, Verifier)
            .is_err());
    }

    #[test]
    fn test_legacy_names() {
        assert_eq!(
            serde_json::to_value(Done.legacy()).unwrap(),
            serde_json::json!("presentation_acked")
        );
        assert_eq!(
            serde_json::to_value(PresentationReceived.legacy()).unwrap(),
            serde_json::json!("presentation_received")
        );
    }
}
