//! Session and channel multiplexing.
//!
//! A [`Session`] owns one bidirectional byte-stream transport and hosts many
//! concurrent channels on it. Inbound frames are routed to the per-channel
//! [`Dispatch`]; outbound frames funnel through a single writer task so
//! frames sent via one [`Upstream`] keep their send order. Channels advance
//! through the protocol graphs from `dray-protocol`; a terminal transition
//! revokes the channel id for new inbound traffic while outbound upstreams
//! stay valid until dropped.

pub mod dispatch;
pub mod error;
pub mod session;
pub mod upstream;

pub use dispatch::{Dispatch, Flow};
pub use error::SessionError;
pub use session::{ChannelState, Session};
pub use upstream::Upstream;
