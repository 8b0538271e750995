//! Typed outbound stream bound to one channel.

use std::sync::{Arc, Weak};

use dray_protocol::{Graph, Tag, Transition};
use parking_lot::Mutex;
use rmpv::Value;

use crate::error::SessionError;
use crate::session::Session;

/// An upstream feeds outbound messages along one channel.
///
/// It is typed by a protocol graph: each send must name a slot of the
/// current graph, and the send moves the upstream down the graph per the
/// event's dispatch transition. After a terminal event the upstream refuses
/// further sends. Cloning yields handles to the same conversation state.
#[derive(Clone)]
pub struct Upstream {
    inner: Arc<Inner>,
}

struct Inner {
    session: Weak<Session>,
    channel: u64,
    graph: Mutex<Option<&'static Graph>>,
}

impl Upstream {
    pub(crate) fn new(session: Weak<Session>, channel: u64, graph: Option<&'static Graph>) -> Self {
        Upstream {
            inner: Arc::new(Inner {
                session,
                channel,
                graph: Mutex::new(graph),
            }),
        }
    }

    pub fn channel(&self) -> u64 {
        self.inner.channel
    }

    /// Whether the conversation still accepts sends.
    pub fn is_open(&self) -> bool {
        self.inner.graph.lock().is_some()
    }

    /// Send one event along the channel.
    pub fn send(&self, slot: u32, args: Vec<Value>) -> Result<(), SessionError> {
        let session = self
            .inner
            .session
            .upgrade()
            .ok_or(SessionError::NotConnected)?;

        let next = {
            let mut graph = self.inner.graph.lock();
            let current = graph.ok_or(SessionError::ChannelClosed)?;
            let event = current
                .get(slot)
                .ok_or(SessionError::Protocol { slot })?;

            let next = event.dispatch.map(|t| match t {
                Transition::Recursive => current,
                Transition::To(tag) => tag.graph(),
            });
            *graph = next;
            next
        };

        session.push_on(self.inner.channel, slot, args)?;

        if next.is_none() {
            session.on_upstream_terminal(self.inner.channel);
        }
        Ok(())
    }

    /// Send by event name; a lookup convenience for tests and handlers.
    pub fn send_named(&self, name: &str, args: Vec<Value>) -> Result<(), SessionError> {
        let slot = {
            let graph = self.inner.graph.lock();
            let current = graph.ok_or(SessionError::ChannelClosed)?;
            current
                .event_named(name)
                .map(|e| e.id)
                .ok_or(SessionError::Protocol { slot: u32::MAX })?
        };
        self.send(slot, args)
    }

    /// Rebind the upstream to a tag. Used when a caller knows the
    /// conversation restarts, e.g. after a protocol handshake.
    pub fn retype(&self, tag: Tag) {
        *self.inner.graph.lock() = Some(tag.graph());
    }
}
