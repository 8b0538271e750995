//! Responses delivered back to user callbacks.

use std::time::SystemTime;

use bytes::Bytes;

use crate::message::MessagePath;

/// Kind of a response event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    /// One payload fragment; more events follow.
    Chunk,
    /// Terminal success, end of the stream.
    Choke,
    /// Terminal failure.
    Error,
}

impl ResponseCode {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ResponseCode::Chunk)
    }
}

/// One response event for a message uuid.
#[derive(Clone, Debug)]
pub struct Response {
    pub uuid: String,
    pub path: MessagePath,
    /// Route token of the producing worker; empty for synthetic responses.
    pub route: String,
    pub code: ResponseCode,
    /// Payload bytes; empty on choke and error.
    pub payload: Bytes,
    /// Error code and message, present on error only.
    pub error: Option<(i32, String)>,
    pub received_at: SystemTime,
}

impl Response {
    pub fn chunk(uuid: String, path: MessagePath, route: String, payload: Bytes) -> Self {
        Response {
            uuid,
            path,
            route,
            code: ResponseCode::Chunk,
            payload,
            error: None,
            received_at: SystemTime::now(),
        }
    }

    pub fn choke(uuid: String, path: MessagePath, route: String) -> Self {
        Response {
            uuid,
            path,
            route,
            code: ResponseCode::Choke,
            payload: Bytes::new(),
            error: None,
            received_at: SystemTime::now(),
        }
    }

    pub fn error(uuid: String, path: MessagePath, route: String, code: i32, message: impl Into<String>) -> Self {
        Response {
            uuid,
            path,
            route,
            code: ResponseCode::Error,
            payload: Bytes::new(),
            error: Some((code, message.into())),
            received_at: SystemTime::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.code.is_terminal()
    }
}

/// User-side receiver for response events.
///
/// Callbacks for one uuid are serialized and always invoked with the
/// dealer's locks released. The dealer holds the sink weakly; dropping the
/// owning `Arc` implicitly unregisters it.
pub trait ResponseSink: Send + Sync {
    fn on_response(&self, response: &Response);
}
