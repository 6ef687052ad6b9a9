use thiserror::Error;

/// Errors that can occur while establishing a trainer connection
#[derive(Error, Debug)]
pub enum ConnectError {
    /// TCP connection attempt timed out
    #[error("Connect timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Transport-level failure (refused, unreachable, reset)
    #[error("Connect failed: {0}")]
    Io(#[from] std::io::Error),

    /// The trainer answered but FTMS initialization failed
    #[error("FTMS handshake failed: {0}")]
    Handshake(String),
}

/// Errors that can occur while issuing a control command
#[derive(Error, Debug)]
pub enum CommandError {
    /// No response arrived within the command timeout
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// A request with the same correlation key is still pending
    #[error("Command with opcode {opcode:#04X} is already pending")]
    Busy {
        /// Control point opcode of the pending request
        opcode: u8,
    },

    /// The connection dropped before a response arrived
    #[error("Connection lost")]
    Disconnected,

    /// The trainer rejected the request at the WFTNP layer
    #[error("Request rejected by trainer: response code {code:#04X}")]
    Rejected {
        /// WFTNP response code returned by the trainer
        code: u8,
    },
}

/// Errors raised while decoding wire data
///
/// These are recovered internally: the frame decoder resynchronizes past
/// corrupt bytes and malformed payloads decode to `Unknown` variants. They
/// never cross the session boundary as fatal errors.
#[derive(Error, Debug)]
pub enum FrameError {
    /// Declared payload length exceeds the protocol maximum
    #[error("Frame payload length {len} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Declared payload length
        len: usize,
        /// Maximum allowed payload length
        max: usize,
    },

    /// Payload is shorter than the structure it claims to carry
    #[error("Malformed payload: {0}")]
    Malformed(String),
}

/// Top-level error type for WFTNP operations
#[derive(Error, Debug)]
pub enum WftnpError {
    /// Connection establishment failed
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Control command failed
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Wire decoding failed
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// IO error outside connection establishment
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected but non-corrupt protocol data
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for WFTNP operations
pub type Result<T> = std::result::Result<T, WftnpError>;

impl WftnpError {
    /// Check if this error indicates a lost or unusable connection
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Command(CommandError::Disconnected) | Self::Io(_)
        )
    }

    /// Check if retrying the same operation may succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Command(CommandError::Timeout { .. } | CommandError::Busy { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let disconnected = WftnpError::Command(CommandError::Disconnected);
        assert!(disconnected.is_connection_error());
        assert!(!disconnected.is_recoverable());

        let timeout = WftnpError::Command(CommandError::Timeout { timeout_ms: 2000 });
        assert!(!timeout.is_connection_error());
        assert!(timeout.is_recoverable());

        let busy = WftnpError::Command(CommandError::Busy { opcode: 0x05 });
        assert!(busy.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = CommandError::Rejected { code: 0x02 };
        let error_string = format!("{error}");
        assert!(error_string.contains("rejected"));
        assert!(error_string.contains("0x02"));
    }
}
