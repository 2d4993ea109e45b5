use serde::{Deserialize, Serialize};
use std::fmt;

use super::messages::{MEDIATE_DENY, MEDIATE_GRANT, MEDIATE_REQUEST};
use crate::state_machine::{StateGraph, Transition};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediationState {
    Start,
    Requested,
    Granted,
    Denied,
}

impl MediationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediationState::Start => "start",
            MediationState::Requested => "requested",
            MediationState::Granted => "granted",
            MediationState::Denied => "denied",
        }
    }
}

impl fmt::Display for MediationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediationRole {
    Mediator,
    Recipient,
}

impl MediationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediationRole::Mediator => "mediator",
            MediationRole::Recipient => "recipient",
        }
    }
}

impl fmt::Display for MediationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use MediationRole::{Mediator, Recipient};
use MediationState::*;

pub static MEDIATION_GRAPH: StateGraph<MediationState, MediationRole> = StateGraph {
    protocol: "coordinate-mediation",
    transitions: &[
        Transition::sent(&[Start], MEDIATE_REQUEST, Recipient, Requested),
        Transition::received(&[Requested], MEDIATE_GRANT, Recipient, Granted),
        Transition::received(&[Requested], MEDIATE_DENY, Recipient, Denied),
        Transition::received(&[Start], MEDIATE_REQUEST, Mediator, Requested),
        Transition::sent(&[Requested], MEDIATE_GRANT, Mediator, Granted),
        Transition::sent(&[Requested], MEDIATE_DENY, Mediator, Denied),
    ],
    abandoned: Denied,
    terminal: &[Granted, Denied],
};
