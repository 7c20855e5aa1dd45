//! Error definitions for the fdfs client.
//!
//! Every failure the crate can surface is a variant of [`FdfsError`]; nothing
//! is swallowed. Dial failures are additionally recorded by the connection
//! pool so its circuit breaker can replay the last one while tripped.

use thiserror::Error;

/// Result type alias for fdfs operations
pub type Result<T> = std::result::Result<T, FdfsError>;

/// Base error type for all fdfs client errors
#[derive(Error, Debug)]
pub enum FdfsError {
    /// Pool (or the client owning it) has been closed
    #[error("client is closed")]
    PoolClosed,

    /// No admission slot became free within the configured pool timeout
    #[error("connection pool timeout")]
    PoolTimeout,

    /// Underlying connect failed; the pool records and may replay this error
    /// while its dial circuit breaker is tripped
    #[error("dial failed: {0}")]
    Dial(String),

    /// File ID is not `"<group>/<remote-name>"` with a structurally valid
    /// remote name
    #[error("invalid file id: {0}")]
    InvalidFileId(String),

    /// Response header carried a command other than the expected one
    #[error("unexpected response command {actual}, expected {expected}")]
    UnexpectedCommand {
        /// Command the exchange was waiting for
        expected: u8,
        /// Command the peer actually sent
        actual: u8,
    },

    /// Response declared a body length other than the expected one
    #[error("unexpected body length {actual}, expected {expected}")]
    LengthMismatch {
        /// Body length the caller required
        expected: i64,
        /// Body length the header declared
        actual: i64,
    },

    /// Response header declared a negative body length
    #[error("corrupt response header: body length {0} < 0")]
    NegativeBodyLength(i64),

    /// Peer answered with a nonzero status byte
    #[error("server returned status {0}")]
    Remote(u8),

    /// Stream ended before the declared body length was received
    #[error("short package: got {actual} of {expected} bytes")]
    ShortPackage {
        /// Body length the header declared
        expected: u64,
        /// Bytes actually received before end of stream
        actual: u64,
    },

    /// Sink stopped accepting bytes mid-stream
    #[error("short write to download sink")]
    ShortWrite,

    /// Metadata fragment decode saw an effective symbol count that is not a
    /// multiple of 4
    #[error("base64 input not an even multiple of 4 characters")]
    MalformedBase64,

    /// Response body has an impossible shape for its record layout
    #[error("invalid response from server: {0}")]
    InvalidResponse(String),

    /// Invalid argument was provided
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
