//! Wire codecs for the dray messaging runtime.
//!
//! Two framings live here:
//!
//! * [`frame`] carries the multiplexed RPC unit: a length-prefixed msgpack
//!   array `[channel_id, message_id, args]`. Sessions speak this.
//! * [`multipart`] carries router-style messages: a counted sequence of
//!   length-prefixed binary parts. The dealer's worker wire and the
//!   heartbeat probe speak this.
//!
//! Both decoders are incremental: partial input is retained across feeds so
//! a reader can push whatever the transport produced and drain complete
//! units as they materialize.

pub mod error;
pub mod frame;
pub mod multipart;
pub mod pack;

pub use error::{DecodeError, EncodeError};
pub use frame::{Frame, FrameDecoder};
pub use multipart::{Multipart, MultipartDecoder};
pub use pack::{pack, unpack};

/// Largest binary item accepted anywhere on the wire: 2 GiB.
pub const MAX_ITEM_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Whether a single wire item of `len` bytes is within the transferable
/// limit. The limit itself is accepted; one byte past it is not.
pub fn fits_item_limit(len: u64) -> bool {
    len <= MAX_ITEM_BYTES
}
