//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur while encoding or decoding packets.
///
/// Every variant except [`ProtocolError::IncompleteFrame`] is fatal for the
/// connection that produced it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u32),

    #[error("opcode {0:?} is not valid in this direction")]
    UnexpectedOpcode(crate::opcode::Opcode),

    #[error("field too large: {size} bytes (max {max})")]
    FieldTooLarge { size: u32, max: u32 },

    #[error("incomplete frame: need {needed} more bytes")]
    IncompleteFrame { needed: usize },

    #[error("{count} trailing bytes after packet")]
    TrailingBytes { count: usize },

    #[error("invalid boolean value: {0}")]
    InvalidBool(u32),

    #[error("invalid {field} discriminant: {value}")]
    InvalidEnum { field: &'static str, value: u32 },

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("malformed parameter block: {0}")]
    MalformedBlock(String),

    #[error("malformed info buffer: {0}")]
    MalformedInfo(String),

    #[error("message does not match format: {0}")]
    FormatMismatch(String),

    #[error("invalid wire cipher key")]
    InvalidKey,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether more input could complete the frame.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::IncompleteFrame { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnknownOpcode(9999);
        assert!(err.to_string().contains("9999"));

        let err = ProtocolError::FieldTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::IncompleteFrame { needed: 10 };
        assert!(err.to_string().contains("10"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));

        let err = ProtocolError::InvalidEnum {
            field: "fetch op",
            value: 42,
        };
        let msg = err.to_string();
        assert!(msg.contains("fetch op") && msg.contains("42"));
    }

    #[test]
    fn test_incomplete_is_not_fatal() {
        assert!(ProtocolError::IncompleteFrame { needed: 1 }.is_incomplete());
        assert!(!ProtocolError::UnknownOpcode(1).is_incomplete());
        assert!(!ProtocolError::InvalidBool(7).is_incomplete());
    }
}
