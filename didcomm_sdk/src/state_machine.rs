//! Transition tables shared by all threaded protocols.
//!
//! A protocol describes its graph once as a static table of [`Transition`]s.
//! Handlers check an inbound message with [`StateGraph::assert_transition`]
//! before any side effect, and persist the new state together with every
//! other record change in a single [`apply_transition`] call.

use std::fmt::{Debug, Display};

use crate::{
    Error,
    definitions::PlaintextMessage,
    storage::{Record, Repository},
};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid {protocol} transition: '{message}' is not allowed in state {state} for role {role}")]
    InvalidTransition {
        protocol: &'static str,
        state: String,
        message: String,
        role: String,
    },
    #[error("{protocol} record is already in terminal state {state}")]
    Terminal {
        protocol: &'static str,
        state: String,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// One edge of a protocol graph: `role` moves from any of `from` to `to`
/// when it sends or receives `message`.
#[derive(Debug)]
pub struct Transition<S: 'static, R: 'static> {
    pub from: &'static [S],
    pub message: &'static str,
    pub direction: Direction,
    pub role: R,
    pub to: S,
}

impl<S, R> Transition<S, R> {
    pub const fn sent(from: &'static [S], message: &'static str, role: R, to: S) -> Self {
        Self {
            from,
            message,
            direction: Direction::Sent,
            role,
            to,
        }
    }

    pub const fn received(from: &'static [S], message: &'static str, role: R, to: S) -> Self {
        Self {
            from,
            message,
            direction: Direction::Received,
            role,
            to,
        }
    }
}

/// The complete state graph of a protocol
#[derive(Debug)]
pub struct StateGraph<S: 'static, R: 'static> {
    pub protocol: &'static str,
    pub transitions: &'static [Transition<S, R>],
    /// Reachable from every state that is not terminal
    pub abandoned: S,
    pub terminal: &'static [S],
}

/// A persisted record driven by a [`StateGraph`]
pub trait ProtocolRecord: Record {
    type State: Copy + Eq + Debug + Display + Send + Sync + 'static;
    type Role: Copy + Eq + Debug + Display + Send + Sync + 'static;

    fn state(&self) -> Self::State;

    fn set_state(&mut self, state: Self::State);

    fn role(&self) -> Self::Role;

    fn thread_id(&self) -> &str;

    /// Id of the last inbound message that moved this record
    fn last_inbound_message_id(&self) -> Option<&str>;

    fn set_last_inbound_message_id(&mut self, message_id: Option<String>);
}

impl<S, R> StateGraph<S, R>
where
    S: Copy + Eq + Debug + Display,
    R: Copy + Eq + Debug + Display,
{
    fn edge(&self, state: S, message: &str, direction: Direction, role: R) -> Option<S> {
        self.transitions
            .iter()
            .find(|t| {
                t.message == message
                    && t.direction == direction
                    && t.role == role
                    && t.from.contains(&state)
            })
            .map(|t| t.to)
    }

    fn invalid(&self, state: S, message: &str, role: R) -> StateError {
        StateError::InvalidTransition {
            protocol: self.protocol,
            state: state.to_string(),
            message: message.to_string(),
            role: role.to_string(),
        }
    }

    pub fn is_terminal(&self, state: S) -> bool {
        self.terminal.contains(&state)
    }

    /// Check that `record` may receive `message`; returns the state the
    /// record moves to. Does not modify the record.
    pub fn assert_transition<P>(
        &self,
        record: &P,
        message: &str,
        expected_roles: &[R],
    ) -> Result<S, StateError>
    where
        P: ProtocolRecord<State = S, Role = R>,
    {
        let (state, role) = (record.state(), record.role());

        if !expected_roles.contains(&role) {
            return Err(self.invalid(state, message, role));
        }

        self.edge(state, message, Direction::Received, role)
            .ok_or_else(|| self.invalid(state, message, role))
    }

    /// Check that `record` may send `message`; returns the state the record
    /// moves to.
    pub fn assert_send<P>(&self, record: &P, message: &str) -> Result<S, StateError>
    where
        P: ProtocolRecord<State = S, Role = R>,
    {
        let (state, role) = (record.state(), record.role());

        self.edge(state, message, Direction::Sent, role)
            .ok_or_else(|| self.invalid(state, message, role))
    }

    /// The initial state of a record that starts by sending or receiving
    /// `message` as `role`
    pub fn initial(&self, start: S, message: &str, direction: Direction, role: R) -> Result<S, StateError> {
        self.edge(start, message, direction, role)
            .ok_or_else(|| self.invalid(start, message, role))
    }

    pub fn assert_abandon<P>(&self, record: &P) -> Result<S, StateError>
    where
        P: ProtocolRecord<State = S, Role = R>,
    {
        if self.is_terminal(record.state()) {
            return Err(StateError::Terminal {
                protocol: self.protocol,
                state: record.state().to_string(),
            });
        }

        Ok(self.abandoned)
    }
}

/// Whether `message` is an identical copy of the message that last moved `record`
pub fn is_replay<P: ProtocolRecord>(record: &P, message: &PlaintextMessage) -> bool {
    record.last_inbound_message_id() == Some(message.id.as_str())
}

/// Move `record` to `state` and persist it, including all other changes the
/// caller made to it, in one write. Returns the previous state; `None` when
/// the record was newly created.
pub async fn apply_transition<P: ProtocolRecord>(
    repository: &dyn Repository<P>,
    record: &mut P,
    state: P::State,
    inbound_message_id: Option<&str>,
) -> Result<Option<P::State>, Error> {
    let previous = record.state();
    record.set_state(state);
    if let Some(id) = inbound_message_id {
        record.set_last_inbound_message_id(Some(id.to_string()));
    }

    let created = record.version() == 0;
    if created {
        repository.save(record).await?;
    } else {
        repository.update(record).await?;
    }

    tracing::debug!(
        "{} {} {previous} -> {state}",
        P::RECORD_TYPE,
        record.id()
    );

    Ok((!created).then_some(previous))
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::fmt;

    use super::*;
    use crate::storage::{InMemoryRepository, StorageError, Tags};

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    enum Light {
        Off,
        On,
        Broken,
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    enum Side {
        Switch,
        Lamp,
    }

    impl fmt::Display for Light {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl fmt::Display for Side {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    static LIGHT: StateGraph<Light, Side> = StateGraph {
        protocol: "light",
        transitions: &[
            Transition {
                from: &[Light::Off],
                message: "on",
                direction: Direction::Sent,
                role: Side::Switch,
                to: Light::On,
            },
            Transition {
                from: &[Light::Off],
                message: "on",
                direction: Direction::Received,
                role: Side::Lamp,
                to: Light::On,
            },
            Transition {
                from: &[Light::On],
                message: "off",
                direction: Direction::Received,
                role: Side::Lamp,
                to: Light::Off,
            },
        ],
        abandoned: Light::Broken,
        terminal: &[Light::Broken],
    };

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct LampRecord {
        id: String,
        state: Light,
        role: Side,
        last: Option<String>,
        #[serde(skip)]
        version: u64,
    }

    impl Record for LampRecord {
        const RECORD_TYPE: &'static str = "LampRecord";

        fn id(&self) -> &str {
            &self.id
        }

        fn tags(&self) -> Tags {
            Tags::new()
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
    }

    impl ProtocolRecord for LampRecord {
        type State = Light;
        type Role = Side;

        fn state(&self) -> Light {
            self.state
        }

        fn set_state(&mut self, state: Light) {
            self.state = state;
        }

        fn role(&self) -> Side {
            self.role
        }

        fn thread_id(&self) -> &str {
            &self.id
        }

        fn last_inbound_message_id(&self) -> Option<&str> {
            self.last.as_deref()
        }

        fn set_last_inbound_message_id(&mut self, message_id: Option<String>) {
            self.last = message_id;
        }
    }

    fn lamp(state: Light) -> LampRecord {
        LampRecord {
            id: "lamp".to_string(),
            state,
            role: Side::Lamp,
            last: None,
            version: 0,
        }
    }

    #[test]
    fn test_assert_transition() {
        assert_eq!(
            LIGHT.assert_transition(&lamp(Light::Off), "on", &[Side::Lamp]),
            Ok(Light::On)
        );

        // wrong state
        assert!(matches!(
            LIGHT.assert_transition(&lamp(Light::On), "on", &[Side::Lamp]),
            Err(StateError::InvalidTransition { .. })
        ));

        // wrong role
        assert!(LIGHT.assert_transition(&lamp(Light::Off), "on", &[Side::Switch]).is_err());

        // the switch never receives
        let mut switch = lamp(Light::Off);
        switch.role = Side::Switch;
        assert!(LIGHT.assert_transition(&switch, "on", &[Side::Switch]).is_err());
        assert_eq!(LIGHT.assert_send(&switch, "on"), Ok(Light::On));
    }

    #[test]
    fn test_abandon() {
        assert_eq!(LIGHT.assert_abandon(&lamp(Light::On)), Ok(Light::Broken));
        assert!(matches!(
            LIGHT.assert_abandon(&lamp(Light::Broken)),
            Err(StateError::Terminal { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_transition_single_write() {
        let repository = InMemoryRepository::<LampRecord>::new();
        let mut record = lamp(Light::Off);

        let previous = apply_transition(&repository, &mut record, Light::Off, None)
            .await
            .unwrap();
        assert_eq!(previous, None);
        assert_eq!(record.version, 1);

        let message = PlaintextMessage::new("https://x.org/light/1.0/on".to_string(), &serde_json::json!({})).unwrap();
        assert!(!is_replay(&record, &message));

        let next = LIGHT.assert_transition(&record, "on", &[Side::Lamp]).unwrap();
        let previous = apply_transition(&repository, &mut record, next, Some(message.id.as_str()))
            .await
            .unwrap();
        assert_eq!(previous, Some(Light::Off));
        assert!(is_replay(&record, &message));

        let stored = repository.get_by_id("lamp").await.unwrap();
        assert_eq!(stored.state, Light::On);
        assert_eq!(stored.version, 2);

        // a stale copy loses
        let mut stale = lamp(Light::Off);
        stale.version = 1;
        let Err(Error::Storage(StorageError::Conflict { .. })) =
            apply_transition(&repository, &mut stale, Light::On, None).await
        else {
            panic!("stale update should conflict");
        };
    }
}
