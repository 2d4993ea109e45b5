#![deny(rustdoc::broken_intra_doc_links)]

//! # DIDComm agent
//!
//! A DIDComm v1 agent: it seals and opens encrypted envelopes, dispatches
//! inbound messages to protocol handlers, drives each protocol through its
//! state machine and delivers replies over HTTP, WebSockets, a pickup queue
//! or a mediator.
//!
//! The primary API is the [Agent] struct, created with an [AgentBuilder].
//! It exposes the built-in protocols:
//!
//! - DID exchange 1.1 through [Agent::connections]
//! - issue-credential 2.0 through [Agent::credentials]
//! - present-proof 2.0 through [Agent::proofs]
//! - coordinate-mediation 1.0 and message pickup 2.0 through [Agent::mediation]
//!
//! Trust ping, problem reports, discover-features and `forward` relaying
//! are handled without further setup. Additional message types are plugged
//! in with [AgentBuilder::with_handler].
//!
//! With the `inbound` feature (on by default) [transport::inbound::router]
//! serves an agent over HTTP and WebSockets using axum.
//!
//! ## Example
//!
//! ```no_run
//! use didcomm_sdk::{Agent, AgentConfig, Error};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let mut config = AgentConfig::new("alice");
//!     config.endpoints = vec!["http://localhost:3000".to_string()];
//!     config.auto_accept_connections = true;
//!
//!     let agent = Agent::builder(config).build()?;
//!
//!     let (_, invitation) = agent.connections().create_invitation(None).await?;
//!     println!("{}", invitation.to_url("http://localhost:3000")?);
//!
//!     Ok(())
//! }
//! ```

mod agent;
pub mod config;
pub mod context;

/// Envelope encryption: the `authcrypt` / `anoncrypt` JWE format, key
/// agreement and the `forward` wrapping of routed messages
pub mod crypto;

/// Common data structures used throughout the crate: keys, DIDComm
/// services, plaintext messages and their decorators
pub mod definitions;
pub mod dispatch;
mod error;
pub mod events;
mod http_client;
pub mod keys;

/// Message type URIs: parsing, the legacy `did:sov` namespace and the
/// protocols known to the agent
pub mod message_type;
pub mod protocols;
pub mod queue;
mod receiver;
pub mod retry;
mod router;
pub mod state_machine;
pub mod storage;
pub mod thread_lock;

/// Outbound transports (HTTP, WebSockets), inbound sessions and, with the
/// `inbound` feature, the axum endpoints
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(test)]
mod test;

pub use agent::{Agent, AgentBuilder, Received};
pub use config::{AgentConfig, MediatorConfig};
pub use context::{AgentContext, InboundMessageContext, OutboundMessageContext};
pub use definitions::{Key, OutboundSendStatus, PlaintextMessage};
pub use error::{DeliveryError, Error, ProblemReportError};
pub use events::AgentEvent;
pub use router::DeliveryResult;
