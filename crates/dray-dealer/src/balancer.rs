//! Round-robin balancing over the live endpoint set.
//!
//! The balancer owns the router socket of one handle: it keeps the sorted
//! endpoint list, connects and reconnects as the heartbeat view changes,
//! spreads sends round-robin, and classifies worker replies. When an
//! endpoint disappears from an update the whole socket is rebuilt; the
//! per-route state a worker keeps for this handle identity would be stale
//! otherwise.

use bytes::Bytes;
use dray_protocol::worker;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::message::Message;
use crate::socket::RouterSocket;

/// One classified reply from a worker.
#[derive(Debug)]
pub struct WorkerReply {
    pub address: String,
    pub route: String,
    pub uuid: String,
    pub kind: ReplyKind,
}

#[derive(Debug, PartialEq)]
pub enum ReplyKind {
    Ack,
    Chunk(Bytes),
    Error { code: i32, message: String },
    Choke,
}

pub struct Balancer {
    identity: String,
    endpoints: Vec<Endpoint>,
    cursor: usize,
    socket: RouterSocket,
}

impl Balancer {
    pub fn new(identity: String) -> Self {
        Balancer {
            identity,
            endpoints: Vec::new(),
            cursor: 0,
            socket: RouterSocket::new(),
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Connect to every endpoint in the list.
    pub async fn connect(&mut self, mut endpoints: Vec<Endpoint>) {
        debug!(identity = %self.identity, count = endpoints.len(), "balancer connect");
        endpoints.sort();
        endpoints.dedup();
        for endpoint in &endpoints {
            self.socket.connect(&endpoint.address).await;
        }
        self.endpoints = endpoints;
        self.cursor = 0;
    }

    pub async fn disconnect(&mut self) {
        debug!(identity = %self.identity, "balancer disconnect");
        self.socket.disconnect_all();
        self.endpoints.clear();
        self.cursor = 0;
    }

    /// Apply a fresh endpoint view. Additions connect in place; any
    /// removal tears the socket down and rebuilds it against the new set.
    /// Returns `(added, removed)`.
    pub async fn update_endpoints(
        &mut self,
        endpoints: Vec<Endpoint>,
    ) -> (Vec<Endpoint>, Vec<Endpoint>) {
        let mut fresh = endpoints;
        fresh.sort();
        fresh.dedup();

        let (added, removed) = endpoint_diff(&self.endpoints, &fresh);
        if added.is_empty() && removed.is_empty() {
            debug!(identity = %self.identity, "no endpoint changes");
            return (added, removed);
        }

        if removed.is_empty() {
            debug!(identity = %self.identity, added = added.len(), "new endpoints");
            for endpoint in &added {
                self.socket.connect(&endpoint.address).await;
            }
        } else {
            debug!(
                identity = %self.identity,
                added = added.len(),
                removed = removed.len(),
                "endpoints removed, rebuilding socket"
            );
            self.socket.disconnect_all();
            for endpoint in &fresh {
                self.socket.connect(&endpoint.address).await;
            }
        }

        self.endpoints = fresh;
        self.cursor = 0;
        (added, removed)
    }

    /// Send one message to the next live endpoint in rotation. Returns the
    /// endpoint it went to, or `None` when nothing is reachable.
    pub async fn send(&mut self, message: &Message) -> Option<Endpoint> {
        if self.endpoints.is_empty() {
            return None;
        }

        let uuid = dray_wire::pack(&message.uuid()).ok()?;
        let policy = dray_wire::pack(&message.wire_policy()).ok()?;

        for _ in 0..self.endpoints.len() {
            let endpoint = self.endpoints[self.cursor % self.endpoints.len()].clone();
            self.cursor = (self.cursor + 1) % self.endpoints.len();

            if !self.socket.is_connected(&endpoint.address) {
                // The endpoint may have come back since the last attempt.
                if !self.socket.connect(&endpoint.address).await {
                    continue;
                }
            }

            let parts = [
                Bytes::copy_from_slice(endpoint.route.as_bytes()),
                Bytes::new(),
                Bytes::from(uuid.clone()),
                Bytes::from(policy.clone()),
                message.payload().clone(),
            ];
            if self.socket.send_to(&endpoint.address, &parts) {
                return Some(endpoint);
            }
        }
        None
    }

    /// Wait for the next worker reply and classify it. Malformed replies
    /// are logged and reported as `None`.
    pub async fn recv(&mut self) -> Option<WorkerReply> {
        let (address, parts) = self.socket.recv().await?;
        match parse_reply(&address, &parts) {
            Some(reply) => Some(reply),
            None => {
                warn!(identity = %self.identity, address = %address, parts = parts.len(), "malformed worker reply dropped");
                None
            }
        }
    }
}

fn parse_reply(address: &str, parts: &[Bytes]) -> Option<WorkerReply> {
    if parts.len() < 4 {
        return None;
    }
    let route = String::from_utf8_lossy(&parts[0]).into_owned();
    if !parts[1].is_empty() {
        return None;
    }
    let uuid: String = dray_wire::unpack(&parts[2]).ok()?;
    let code: u32 = dray_wire::unpack(&parts[3]).ok()?;

    let kind = match code {
        worker::ACK => ReplyKind::Ack,
        worker::CHUNK => ReplyKind::Chunk(parts.get(4)?.clone()),
        worker::ERROR => {
            let code: i32 = dray_wire::unpack(parts.get(4)?).ok()?;
            let message: String = dray_wire::unpack(parts.get(5)?).ok()?;
            ReplyKind::Error { code, message }
        }
        worker::CHOKE => ReplyKind::Choke,
        _ => return None,
    };

    Some(WorkerReply {
        address: address.to_owned(),
        route,
        uuid,
        kind,
    })
}

/// Sorted-set difference: `(in fresh but not current, in current but not
/// fresh)`. Both inputs must be sorted.
fn endpoint_diff(current: &[Endpoint], fresh: &[Endpoint]) -> (Vec<Endpoint>, Vec<Endpoint>) {
    let added = fresh
        .iter()
        .filter(|e| current.binary_search(e).is_err())
        .cloned()
        .collect();
    let removed = current
        .iter()
        .filter(|e| fresh.binary_search(e).is_err())
        .cloned()
        .collect();
    (added, removed)
}
