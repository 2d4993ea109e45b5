use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Instant,
};

use crate::{Error, crypto::EncryptedEnvelope};

/// A sealed message held for a recipient that had no open channel
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Identifies the message to the recipient acknowledging its receipt
    pub id: String,
    pub envelope: EncryptedEnvelope,
    pub queued_at: Instant,
}

/// FIFO of the sealed messages waiting for one recipient
///
/// ```
/// use didcomm_sdk::{crypto::EncryptedEnvelope, queue::MessageQueue};
///
/// let mut queue = MessageQueue::default();
/// queue.push(EncryptedEnvelope {
///     protected: "e30".into(),
///     iv: String::new(),
///     ciphertext: String::new(),
///     tag: String::new(),
/// });
///
/// assert_eq!(queue.take(10).len(), 1);
/// assert!(queue.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct MessageQueue {
    messages: VecDeque<QueuedMessage>,
}

impl MessageQueue {
    pub fn push(&mut self, envelope: EncryptedEnvelope) {
        self.messages.push_back(QueuedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            envelope,
            queued_at: Instant::now(),
        });
    }

    /// Remove up to `limit` messages, oldest first
    pub fn take(&mut self, limit: usize) -> Vec<QueuedMessage> {
        let count = limit.min(self.messages.len());
        self.messages.drain(..count).collect()
    }

    /// Copies of up to `limit` messages, oldest first; they stay queued
    pub fn peek(&self, limit: usize) -> Vec<QueuedMessage> {
        self.messages.iter().take(limit).cloned().collect()
    }

    /// Remove the messages with the given ids; returns how many were found
    pub fn remove(&mut self, ids: &[String]) -> usize {
        let before = self.messages.len();
        self.messages.retain(|message| !ids.contains(&message.id));

        before - self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

/// Pickup queues of all connections that receive through us
#[derive(Debug, Default)]
pub struct PickupQueues {
    queues: Mutex<HashMap<String, MessageQueue>>,
}

impl PickupQueues {
    pub fn push(&self, connection_id: &str, envelope: EncryptedEnvelope) -> Result<(), Error> {
        self.queues
            .lock()?
            .entry(connection_id.to_string())
            .or_default()
            .push(envelope);

        Ok(())
    }

    pub fn take(&self, connection_id: &str, limit: usize) -> Result<Vec<QueuedMessage>, Error> {
        let mut queues = self.queues.lock()?;

        let Some(queue) = queues.get_mut(connection_id) else {
            return Ok(Vec::new());
        };

        let messages = queue.take(limit);
        if queue.is_empty() {
            queues.remove(connection_id);
        }

        if let Some(oldest) = messages.first() {
            tracing::debug!(
                "picked up {} messages of {connection_id}, oldest queued {:?} ago",
                messages.len(),
                oldest.queued_at.elapsed()
            );
        }

        Ok(messages)
    }

    pub fn peek(&self, connection_id: &str, limit: usize) -> Result<Vec<QueuedMessage>, Error> {
        Ok(self
            .queues
            .lock()?
            .get(connection_id)
            .map(|queue| queue.peek(limit))
            .unwrap_or_default())
    }

    /// Drop acknowledged messages of `connection_id`
    pub fn remove(&self, connection_id: &str, ids: &[String]) -> Result<usize, Error> {
        let mut queues = self.queues.lock()?;

        let Some(queue) = queues.get_mut(connection_id) else {
            return Ok(0);
        };

        let removed = queue.remove(ids);
        if queue.is_empty() {
            queues.remove(connection_id);
        }

        tracing::debug!("{removed} of {} acknowledged messages of {connection_id} removed", ids.len());

        Ok(removed)
    }

    pub fn len(&self, connection_id: &str) -> Result<usize, Error> {
        Ok(self
            .queues
            .lock()?
            .get(connection_id)
            .map(MessageQueue::len)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(n: u8) -> EncryptedEnvelope {
        EncryptedEnvelope {
            protected: n.to_string(),
            iv: String::new(),
            ciphertext: String::new(),
            tag: String::new(),
        }
    }

    #[test]
    fn test_queue_is_fifo() {
        let mut queue = MessageQueue::default();
        assert!(queue.is_empty());

        for n in 1..=3 {
            queue.push(envelope(n));
        }
        assert_eq!(queue.len(), 3);

        let first = queue.take(2);
        assert_eq!(first[0].envelope, envelope(1));
        assert_eq!(first[1].envelope, envelope(2));

        let rest = queue.take(usize::MAX);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].envelope, envelope(3));
        assert!(queue.is_empty());
        assert!(queue.take(1).is_empty());
    }

    #[test]
    fn test_pickup_per_connection() {
        let queues = PickupQueues::default();
        for n in 0..5 {
            queues.push("alice", envelope(n)).unwrap();
        }
        queues.push("bob", envelope(9)).unwrap();

        let first = queues.take("alice", 3).unwrap();
        assert_eq!(
            first.iter().map(|m| m.envelope.clone()).collect::<Vec<_>>(),
            vec![envelope(0), envelope(1), envelope(2)]
        );
        assert_eq!(queues.len("alice").unwrap(), 2);
        assert_eq!(queues.take("alice", 10).unwrap().len(), 2);
        assert_eq!(queues.len("alice").unwrap(), 0);
        assert_eq!(queues.len("bob").unwrap(), 1);
        assert!(queues.take("carol", 10).unwrap().is_empty());
    }

    #[test]
    fn test_peek_then_acknowledge() {
        let queues = PickupQueues::default();
        for n in 0..3 {
            queues.push("alice", envelope(n)).unwrap();
        }

        let peeked = queues.peek("alice", 2).unwrap();
        assert_eq!(peeked.len(), 2);
        assert_eq!(queues.len("alice").unwrap(), 3);
        assert_eq!(queues.peek("alice", 2).unwrap()[0].id, peeked[0].id);

        let mut ids: Vec<String> = peeked.iter().map(|m| m.id.clone()).collect();
        ids.push("unknown".to_string());
        assert_eq!(queues.remove("alice", &ids).unwrap(), 2);
        assert_eq!(queues.remove("alice", &ids).unwrap(), 0);

        let rest = queues.peek("alice", 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].envelope, envelope(2));
        assert_eq!(queues.remove("carol", &ids).unwrap(), 0);
    }
}
