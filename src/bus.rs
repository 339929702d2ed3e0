//! Priority message bus between the supervisor, workers and observers.
//!
//! Every registered endpoint owns a bounded mailbox. Mailboxes deliver
//! higher priority first and, within one priority, in send order. Sending to
//! a full mailbox fails with [`Error::QueueFull`] instead of dropping.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{clog_trace, clog_warn, Error, Result};

/// Endpoint the supervisor receives on.
pub const SUPERVISOR: &str = "supervisor";

/// Message priority. `High` is delivered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// What a message is about. Observers filter on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    StatusChange,
    HealthAlert,
    WorkerReport,
    Control,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Endpoint(String),
    Broadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender: String,
    pub recipient: Recipient,
    pub priority: Priority,
    pub category: Category,
    /// Opaque to the bus.
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sender: &str,
        recipient: &str,
        category: Category,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.to_string(),
            recipient: Recipient::Endpoint(recipient.to_string()),
            priority: Priority::Normal,
            category,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn broadcast(sender: &str, category: Category, payload: serde_json::Value) -> Self {
        Self {
            recipient: Recipient::Broadcast,
            ..Self::new(sender, "", category, payload)
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

struct Queued {
    seq: u64,
    message: Message,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Mailbox {
    queue: BinaryHeap<Queued>,
    notify: Arc<Notify>,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

#[derive(Default)]
struct BusInner {
    mailboxes: HashMap<String, Mailbox>,
    next_seq: u64,
}

impl BusInner {
    fn push(&mut self, endpoint: &str, message: Message, capacity: usize) -> Result<()> {
        let seq = self.next_seq;
        let mailbox = self
            .mailboxes
            .get_mut(endpoint)
            .ok_or_else(|| Error::UnknownRecipient(endpoint.to_string()))?;
        if mailbox.queue.len() >= capacity {
            return Err(Error::QueueFull {
                recipient: endpoint.to_string(),
                capacity,
            });
        }
        mailbox.queue.push(Queued { seq, message });
        mailbox.notify.notify_one();
        self.next_seq += 1;
        Ok(())
    }
}

pub struct MessageBus {
    inner: Mutex<BusInner>,
    capacity: usize,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register an endpoint. Registering twice keeps the existing mailbox.
    pub fn register(&self, endpoint: &str) {
        self.lock()
            .mailboxes
            .entry(endpoint.to_string())
            .or_insert_with(Mailbox::new);
    }

    /// Remove an endpoint, returning how many undelivered messages it held.
    pub fn unregister(&self, endpoint: &str) -> usize {
        match self.lock().mailboxes.remove(endpoint) {
            Some(mailbox) => {
                mailbox.notify.notify_waiters();
                mailbox.queue.len()
            }
            None => 0,
        }
    }

    pub fn is_registered(&self, endpoint: &str) -> bool {
        self.lock().mailboxes.contains_key(endpoint)
    }

    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().mailboxes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages waiting for `endpoint`.
    pub fn pending(&self, endpoint: &str) -> usize {
        self.lock()
            .mailboxes
            .get(endpoint)
            .map(|m| m.queue.len())
            .unwrap_or(0)
    }

    /// Enqueue a message. Never blocks.
    pub fn send(&self, message: Message) -> Result<()> {
        let endpoint = match &message.recipient {
            Recipient::Broadcast => return self.broadcast(message).map(|_| ()),
            Recipient::Endpoint(name) => name.clone(),
        };
        clog_trace!(
            "bus: {} -> {} {:?} {:?}",
            message.sender,
            endpoint,
            message.category,
            message.priority
        );
        self.lock().push(&endpoint, message, self.capacity)
    }

    /// Deliver a copy to every endpoint registered now, except the sender.
    ///
    /// Full mailboxes are skipped and the first one (by name) is reported as
    /// `QueueFull` once every other endpoint has its copy. Returns the
    /// number of copies delivered.
    pub fn broadcast(&self, mut message: Message) -> Result<usize> {
        message.recipient = Recipient::Broadcast;
        let mut inner = self.lock();
        let mut endpoints: Vec<String> = inner
            .mailboxes
            .keys()
            .filter(|name| **name != message.sender)
            .cloned()
            .collect();
        endpoints.sort();

        let mut delivered = 0;
        let mut first_full = None;
        for endpoint in endpoints {
            match inner.push(&endpoint, message.clone(), self.capacity) {
                Ok(()) => delivered += 1,
                Err(e @ Error::QueueFull { .. }) => {
                    clog_warn!("bus: broadcast skipped full mailbox {}", endpoint);
                    first_full.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        match first_full {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }

    /// Take the next message for `endpoint` without waiting.
    pub fn try_receive(&self, endpoint: &str) -> Option<Message> {
        self.lock()
            .mailboxes
            .get_mut(endpoint)
            .and_then(|m| m.queue.pop())
            .map(|q| q.message)
    }

    /// Wait up to `timeout` for the next message for `endpoint`.
    ///
    /// Returns `None` on timeout or when the endpoint is not registered.
    pub async fn receive(&self, endpoint: &str, timeout: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notify = {
                let mut inner = self.lock();
                let mailbox = inner.mailboxes.get_mut(endpoint)?;
                if let Some(queued) = mailbox.queue.pop() {
                    return Some(queued.message);
                }
                Arc::clone(&mailbox.notify)
            };
            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return self.try_receive(endpoint);
            }
        }
    }
}
