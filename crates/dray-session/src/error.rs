use std::fmt;

use dray_wire::DecodeError;

/// Errors surfaced by the session layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The session has been detached; no further work is accepted.
    NotConnected,
    /// The transport produced bytes the frame codec cannot understand.
    Parse(DecodeError),
    /// A frame referenced a slot the current protocol graph does not have.
    Protocol { slot: u32 },
    /// The channel's conversation already reached a terminal event.
    ChannelClosed,
    /// An outbound frame could not be encoded.
    Encode(String),
    /// The underlying transport failed or was closed by the peer.
    Transport(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotConnected => write!(f, "session is not connected"),
            SessionError::Parse(e) => write!(f, "frame decode failed: {}", e),
            SessionError::Protocol { slot } => {
                write!(f, "slot {} is not part of the active protocol", slot)
            }
            SessionError::ChannelClosed => write!(f, "channel conversation is complete"),
            SessionError::Encode(detail) => write!(f, "frame encode failed: {}", detail),
            SessionError::Transport(detail) => write!(f, "transport failure: {}", detail),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DecodeError> for SessionError {
    fn from(e: DecodeError) -> Self {
        SessionError::Parse(e)
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}
