//! Per-handle message cache.
//!
//! Holds the FIFO of messages awaiting first dispatch and the per-endpoint
//! maps of in-flight messages. A uuid lives in exactly one of the two until
//! the message terminates. Retries move owned values back to the front of
//! the new queue; that priority requeue is the only permitted reorder.
//!
//! With a blob store attached, plain enqueues commit the message before it
//! becomes visible and terminal removals delete the blob, so accepted work
//! survives a crash.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::warn;

use crate::endpoint::Endpoint;
use crate::error::DealerError;
use crate::message::{Message, MessagePath};
use crate::storage::BlobStore;

/// Why [`MessageCache::collect_expired`] returned a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryReason {
    /// Absolute deadline passed. Never retried.
    Deadline,
    /// Sent, unacknowledged, and past the ACK window. Retryable.
    AckTimeout,
}

/// A message pulled out of the cache by the expiry sweep.
#[derive(Debug)]
pub struct Expired {
    pub message: Message,
    pub reason: ExpiryReason,
}

/// Outcome of a priority requeue attempt for an in-flight message.
#[derive(Debug)]
pub enum RequeueOutcome {
    /// Retries remained; the message is back at the front of the new queue.
    Requeued,
    /// The retry budget is spent; the message left the cache.
    RetriesExhausted(Message),
    /// No in-flight message under that uuid.
    NotFound,
}

#[derive(Default)]
struct Inner {
    new_q: VecDeque<Message>,
    sent: HashMap<Endpoint, HashMap<String, Message>>,
    index: HashMap<String, Endpoint>,
}

/// The cache itself. All operations are O(1) queue and map work behind one
/// mutex.
pub struct MessageCache {
    store: Option<Arc<BlobStore>>,
    inner: Mutex<Inner>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::with_store(None)
    }

    pub fn with_store(store: Option<Arc<BlobStore>>) -> Self {
        MessageCache {
            store,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Accept a new message. With a store attached the blob is committed
    /// before the message becomes visible; a failed commit aborts the
    /// enqueue. Messages already committed upstream (orphan splices,
    /// restores) are recognized by their blob and not rewritten.
    pub fn enqueue(&self, message: Message) -> Result<(), DealerError> {
        if let Some(store) = &self.store {
            if !store.contains(message.uuid()) {
                store.commit(&message).map_err(|e| {
                    DealerError::Internal(format!("persistent commit failed: {}", e))
                })?;
            }
        }
        self.inner.lock().new_q.push_back(message);
        Ok(())
    }

    /// Put a retried message at the front of the new queue. The blob, if
    /// any, is already on disk from the original enqueue.
    pub fn enqueue_priority(&self, message: Message) {
        self.inner.lock().new_q.push_front(message);
    }

    /// Splice a whole queue (an orphan queue, or a retired handle's
    /// leftovers) onto the back, preserving its order.
    pub fn append_queue(&self, queue: VecDeque<Message>) {
        if queue.is_empty() {
            return;
        }
        self.inner.lock().new_q.extend(queue);
    }

    /// The handle thread's main driver.
    pub fn pop_new(&self) -> Option<Message> {
        self.inner.lock().new_q.pop_front()
    }

    /// Stamp the message as sent to `endpoint` and file it in-flight.
    pub fn move_to_sent(&self, endpoint: Endpoint, mut message: Message) {
        message.mark_sent(endpoint.clone());
        let mut inner = self.inner.lock();
        inner.index.insert(message.uuid().to_owned(), endpoint.clone());
        inner
            .sent
            .entry(endpoint)
            .or_default()
            .insert(message.uuid().to_owned(), message);
    }

    /// Record a worker ACK. The message stays in flight.
    pub fn on_ack(&self, uuid: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(endpoint) = inner.index.get(uuid).cloned() else {
            return false;
        };
        if let Some(message) = inner.sent.get_mut(&endpoint).and_then(|m| m.get_mut(uuid)) {
            message.set_ack_received();
            true
        } else {
            false
        }
    }

    /// Path of an in-flight message, if any.
    pub fn sent_path(&self, uuid: &str) -> Option<MessagePath> {
        let inner = self.inner.lock();
        let endpoint = inner.index.get(uuid)?;
        inner
            .sent
            .get(endpoint)
            .and_then(|m| m.get(uuid))
            .map(|m| m.path().clone())
    }

    /// Drop an in-flight message on a terminal frame. Deletes the blob.
    pub fn on_terminal(&self, uuid: &str) -> Option<Message> {
        let message = {
            let mut inner = self.inner.lock();
            let endpoint = inner.index.remove(uuid)?;
            let map = inner.sent.get_mut(&endpoint)?;
            let message = map.remove(uuid);
            if map.is_empty() {
                inner.sent.remove(&endpoint);
            }
            message
        }?;
        self.delete_blob(uuid);
        Some(message)
    }

    /// Move an in-flight message back to the front of the new queue if its
    /// retry budget allows, bumping the retry count.
    pub fn try_requeue_priority(&self, uuid: &str) -> RequeueOutcome {
        let mut message = {
            let mut inner = self.inner.lock();
            let Some(endpoint) = inner.index.remove(uuid) else {
                return RequeueOutcome::NotFound;
            };
            let Some(message) = inner.sent.get_mut(&endpoint).and_then(|m| m.remove(uuid)) else {
                return RequeueOutcome::NotFound;
            };
            if inner.sent.get(&endpoint).is_some_and(|m| m.is_empty()) {
                inner.sent.remove(&endpoint);
            }
            message
        };

        if message.can_retry() {
            message.bump_retries();
            message.mark_unsent();
            self.inner.lock().new_q.push_front(message);
            RequeueOutcome::Requeued
        } else {
            self.delete_blob(uuid);
            RequeueOutcome::RetriesExhausted(message)
        }
    }

    /// Requeue everything in flight against one endpoint, front of queue.
    /// Used when an endpoint disappears and its route state goes stale.
    pub fn requeue_endpoint(&self, endpoint: &Endpoint) -> usize {
        let mut inner = self.inner.lock();
        let Some(map) = inner.sent.remove(endpoint) else {
            return 0;
        };
        let mut moved = 0;
        for (uuid, mut message) in map {
            inner.index.remove(&uuid);
            message.mark_unsent();
            inner.new_q.push_front(message);
            moved += 1;
        }
        moved
    }

    /// Flush everything in flight back to the new queue. Used on
    /// disconnect and handle retirement.
    pub fn make_all_new(&self) {
        let mut inner = self.inner.lock();
        let sent = std::mem::take(&mut inner.sent);
        inner.index.clear();
        for (_, map) in sent {
            for (_, mut message) in map {
                message.mark_unsent();
                inner.new_q.push_front(message);
            }
        }
    }

    /// Take the whole new queue, e.g. to merge into an orphan queue.
    pub fn drain_new(&self) -> VecDeque<Message> {
        std::mem::take(&mut self.inner.lock().new_q)
    }

    /// Pull out everything whose lifetime ended at `now`: messages past
    /// their deadline (anywhere) and in-flight messages whose ACK window
    /// closed. Deadline-expired blobs are deleted here; ACK timeouts keep
    /// theirs since the caller may retry.
    pub fn collect_expired(&self, now: Instant) -> Vec<Expired> {
        let mut out = Vec::new();
        {
            let inner = &mut *self.inner.lock();

            let mut drained = Vec::new();
            for (endpoint, map) in inner.sent.iter_mut() {
                let uuids: Vec<String> = map
                    .iter()
                    .filter(|(_, m)| m.is_expired(now) || m.ack_timed_out(now))
                    .map(|(u, _)| u.clone())
                    .collect();
                for uuid in uuids {
                    let message = map.remove(&uuid).unwrap();
                    inner.index.remove(&uuid);
                    let reason = if message.is_expired(now) {
                        ExpiryReason::Deadline
                    } else {
                        ExpiryReason::AckTimeout
                    };
                    out.push(Expired { message, reason });
                }
                if map.is_empty() {
                    drained.push(endpoint.clone());
                }
            }
            for endpoint in drained {
                inner.sent.remove(&endpoint);
            }

            let mut keep = VecDeque::with_capacity(inner.new_q.len());
            for message in inner.new_q.drain(..) {
                if message.is_expired(now) {
                    out.push(Expired {
                        message,
                        reason: ExpiryReason::Deadline,
                    });
                } else {
                    keep.push_back(message);
                }
            }
            inner.new_q = keep;
        }

        for expired in &out {
            if expired.reason == ExpiryReason::Deadline {
                self.delete_blob(expired.message.uuid());
            }
        }
        out
    }

    /// Delete the blob of a message the caller just terminated outside the
    /// cache, e.g. after a spent retry budget.
    pub fn discard(&self, message: &Message) {
        self.delete_blob(message.uuid());
    }

    pub fn new_count(&self) -> usize {
        self.inner.lock().new_q.len()
    }

    pub fn sent_count(&self) -> usize {
        self.inner.lock().sent.values().map(|m| m.len()).sum()
    }

    fn delete_blob(&self, uuid: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(uuid) {
                warn!(uuid, error = %e, "blob removal failed");
            }
        }
    }
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new()
    }
}
