//! The callee side of a channel conversation.

use std::sync::Arc;

use dray_protocol::{EventDescription, Graph};
use rmpv::Value;

use crate::error::SessionError;
use crate::upstream::Upstream;

/// What the channel does after a dispatch processed an event.
pub enum Flow {
    /// Keep the current dispatch. Only meaningful while the event's own
    /// dispatch transition is recursive.
    Stay,
    /// Switch the channel to a new dispatch for the transitioned protocol.
    Become(Arc<dyn Dispatch>),
    /// The conversation is over; the channel id is revoked.
    Terminal,
}

/// A dispatch implements the callee side of one protocol graph.
///
/// The session invokes it from the reader task, so implementations must not
/// block for long. The `upstream` handed to [`Dispatch::invoke`] is typed by
/// the event's upstream transition and may be kept for replying later.
pub trait Dispatch: Send + Sync {
    /// Name used in logs and channel listings.
    fn name(&self) -> &str;

    /// The protocol graph governing inbound slots for this dispatch.
    fn graph(&self) -> &'static Graph;

    /// Process one inbound event.
    fn invoke(
        &self,
        event: &EventDescription,
        args: Vec<Value>,
        upstream: Upstream,
    ) -> Result<Flow, SessionError>;

    /// The session is going away; called exactly once per live channel.
    fn discard(&self, error: &SessionError) {
        let _ = error;
    }
}
