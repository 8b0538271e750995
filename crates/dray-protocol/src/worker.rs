//! Numeric reply codes on the dealer-to-worker wire.
//!
//! Workers answer dispatched requests with multipart messages whose second
//! packed part is one of these codes.

/// Worker accepted the request; the message stays in flight.
pub const ACK: u32 = 1;
/// One payload fragment of the reply stream.
pub const CHUNK: u32 = 5;
/// Terminal failure, followed by a packed error code and message.
pub const ERROR: u32 = 6;
/// Terminal success, end of the reply stream.
pub const CHOKE: u32 = 7;

/// Human-readable name for a reply code, if known.
pub fn name(code: u32) -> Option<&'static str> {
    match code {
        ACK => Some("ack"),
        CHUNK => Some("chunk"),
        ERROR => Some("error"),
        CHOKE => Some("choke"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_wire() {
        assert_eq!(ACK, 1);
        assert_eq!(CHUNK, 5);
        assert_eq!(ERROR, 6);
        assert_eq!(CHOKE, 7);
    }

    #[test]
    fn names() {
        assert_eq!(name(ACK), Some("ack"));
        assert_eq!(name(CHOKE), Some("choke"));
        assert_eq!(name(2), None);
    }
}
