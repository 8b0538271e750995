//! Error surface of the dealer.
//!
//! Errors travel as `(category, code, message)` triples. The codes are
//! stable and appear both at the user API and inside synthetic error
//! responses.

use thiserror::Error;

/// Stable integer codes for user-visible errors.
pub mod code {
    /// No ACK after the retry cap.
    pub const REQUEST: i32 = 400;
    /// No such service configured.
    pub const LOCATION: i32 = 404;
    /// Message deadline passed.
    pub const DEADLINE: i32 = 408;
    /// Payload past the 2 GiB limit.
    pub const DATA_TOO_BIG: i32 = 413;
    /// Invariant violation.
    pub const INTERNAL: i32 = 500;
    /// Remote resource exhaustion; retryable.
    pub const RESOURCE: i32 = 503;
}

/// Which subsystem produced an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Wire,
    Resolver,
    Transport,
    Protocol,
    Dealer,
}

#[derive(Debug, Error)]
pub enum DealerError {
    #[error("no service configured for '{path}'")]
    Location { path: String },

    #[error("{message}")]
    Request { message: String },

    #[error("message deadline passed")]
    Deadline,

    #[error("message payload of {size} bytes exceeds the 2 GiB limit")]
    DataTooBig { size: u64 },

    #[error("invariant violation: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("resolver error: {0}")]
    Resolver(String),

    #[error("wire error: {0}")]
    Wire(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl DealerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DealerError::Wire(_) => ErrorCategory::Wire,
            DealerError::Resolver(_) => ErrorCategory::Resolver,
            DealerError::Io(_) => ErrorCategory::Transport,
            _ => ErrorCategory::Dealer,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            DealerError::Location { .. } => code::LOCATION,
            DealerError::Request { .. } => code::REQUEST,
            DealerError::Deadline => code::DEADLINE,
            DealerError::DataTooBig { .. } => code::DATA_TOO_BIG,
            _ => code::INTERNAL,
        }
    }

    /// The `(category, code, message)` triple carried to the user.
    pub fn triple(&self) -> (ErrorCategory, i32, String) {
        (self.category(), self.code(), self.to_string())
    }
}

impl From<dray_wire::EncodeError> for DealerError {
    fn from(e: dray_wire::EncodeError) -> Self {
        match e {
            dray_wire::EncodeError::OversizedItem { size } => DealerError::DataTooBig { size },
            other => DealerError::Wire(other.to_string()),
        }
    }
}

impl From<dray_wire::DecodeError> for DealerError {
    fn from(e: dray_wire::DecodeError) -> Self {
        DealerError::Wire(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            DealerError::Location { path: "a.b".into() }.code(),
            code::LOCATION
        );
        assert_eq!(DealerError::Deadline.code(), code::DEADLINE);
        assert_eq!(DealerError::DataTooBig { size: 1 }.code(), code::DATA_TOO_BIG);
        assert_eq!(DealerError::Internal("x".into()).code(), code::INTERNAL);
    }

    #[test]
    fn triples_carry_category() {
        let (category, code, message) = DealerError::Resolver("fetch failed".into()).triple();
        assert_eq!(category, ErrorCategory::Resolver);
        assert_eq!(code, self::code::INTERNAL);
        assert!(message.contains("fetch failed"));
    }
}
