//! The message model: paths, delivery policies and cached messages.

use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::DealerError;

/// Logical destination of a message: `(service, handle)`. Immutable after
/// construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessagePath {
    service: String,
    handle: String,
}

impl MessagePath {
    pub fn new(service: impl Into<String>, handle: impl Into<String>) -> Self {
        MessagePath {
            service: service.into(),
            handle: handle.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }
}

impl fmt::Display for MessagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.handle)
    }
}

/// Delivery policy attached to each message.
#[derive(Clone, Debug, PartialEq)]
pub struct MessagePolicy {
    /// Fan the message out to every live endpoint rather than one. Carried
    /// on the wire for compatibility; the dealer itself never sets it.
    pub send_to_all_hosts: bool,
    /// Bypass ordering where possible.
    pub urgent: bool,
    /// Queue at the server even if no worker is free.
    pub mailboxed: bool,
    /// Single-attempt ACK window.
    pub timeout: Duration,
    /// Absolute expiry measured from enqueue. Zero means never.
    pub deadline: Duration,
    /// Cap on reschedules after ACK timeouts.
    pub max_timeout_retries: u32,
}

impl Default for MessagePolicy {
    fn default() -> Self {
        MessagePolicy {
            send_to_all_hosts: false,
            urgent: false,
            mailboxed: false,
            timeout: Duration::from_secs(10),
            deadline: Duration::ZERO,
            max_timeout_retries: 0,
        }
    }
}

/// The positional policy tuple as packed onto the worker wire. The deadline
/// here is absolute wall-clock seconds, derived from the enqueue time.
pub type WirePolicy = (bool, bool, bool, f64, f64, u32);

/// Largest accepted payload, in bytes.
pub const MAX_PAYLOAD_BYTES: u64 = dray_wire::MAX_ITEM_BYTES;

/// One message owned by the dealer until a terminal event.
///
/// A message lives in exactly one place at any time: the new queue, the
/// sent map of one endpoint, or nowhere once terminated.
#[derive(Clone, Debug)]
pub struct Message {
    uuid: String,
    path: MessagePath,
    policy: MessagePolicy,
    payload: Bytes,
    enqueued_at: SystemTime,
    enqueued_instant: Instant,
    sent_at: Option<Instant>,
    ack_received: bool,
    retry_count: u32,
    endpoint: Option<Endpoint>,
}

impl Message {
    pub fn new(
        path: MessagePath,
        policy: MessagePolicy,
        payload: Bytes,
    ) -> Result<Self, DealerError> {
        if !dray_wire::fits_item_limit(payload.len() as u64) {
            return Err(DealerError::DataTooBig {
                size: payload.len() as u64,
            });
        }

        Ok(Message {
            uuid: Uuid::new_v4().to_string(),
            path,
            policy,
            payload,
            enqueued_at: SystemTime::now(),
            enqueued_instant: Instant::now(),
            sent_at: None,
            ack_received: false,
            retry_count: 0,
            endpoint: None,
        })
    }

    /// Rebuild a message restored from the persistent store. The monotonic
    /// enqueue stamp is back-dated by the wall-clock age so deadlines keep
    /// counting from the original enqueue.
    pub fn restored(
        uuid: String,
        path: MessagePath,
        policy: MessagePolicy,
        payload: Bytes,
        enqueued_at: SystemTime,
    ) -> Self {
        let age = SystemTime::now()
            .duration_since(enqueued_at)
            .unwrap_or(Duration::ZERO);
        let enqueued_instant = Instant::now()
            .checked_sub(age)
            .unwrap_or_else(Instant::now);

        Message {
            uuid,
            path,
            policy,
            payload,
            enqueued_at,
            enqueued_instant,
            sent_at: None,
            ack_received: false,
            retry_count: 0,
            endpoint: None,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn path(&self) -> &MessagePath {
        &self.path
    }

    pub fn policy(&self) -> &MessagePolicy {
        &self.policy
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn enqueued_at(&self) -> SystemTime {
        self.enqueued_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn ack_received(&self) -> bool {
        self.ack_received
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    pub(crate) fn mark_sent(&mut self, endpoint: Endpoint) {
        self.sent_at = Some(Instant::now());
        self.ack_received = false;
        self.endpoint = Some(endpoint);
    }

    pub(crate) fn mark_unsent(&mut self) {
        self.sent_at = None;
        self.ack_received = false;
        self.endpoint = None;
    }

    pub(crate) fn set_ack_received(&mut self) {
        self.ack_received = true;
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.policy.max_timeout_retries
    }

    pub(crate) fn bump_retries(&mut self) {
        self.retry_count += 1;
    }

    /// Whether the absolute deadline has passed. A zero deadline never
    /// expires.
    pub fn is_expired(&self, now: Instant) -> bool {
        if self.policy.deadline.is_zero() {
            return false;
        }
        now.duration_since(self.enqueued_instant) > self.policy.deadline
    }

    /// Whether the message was sent, is still unacknowledged, and its ACK
    /// window has closed.
    pub fn ack_timed_out(&self, now: Instant) -> bool {
        match self.sent_at {
            Some(sent_at) if !self.ack_received => {
                now.duration_since(sent_at) > self.policy.timeout
            }
            _ => false,
        }
    }

    /// The policy tuple as sent to the worker. The relative deadline is
    /// converted to an absolute wall-clock time based on the enqueue
    /// stamp, so retries never extend the remote-side lifetime.
    pub fn wire_policy(&self) -> WirePolicy {
        let deadline_epoch = if self.policy.deadline.is_zero() {
            0.0
        } else {
            let absolute = self.enqueued_at + self.policy.deadline;
            absolute
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0)
        };

        (
            self.policy.send_to_all_hosts,
            self.policy.urgent,
            self.policy.mailboxed,
            self.policy.timeout.as_secs_f64(),
            deadline_epoch,
            self.policy.max_timeout_retries,
        )
    }
}
