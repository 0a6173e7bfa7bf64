//! Crate-wide error type.
//!
//! Mirrors the taxonomy a peer or a timer can actually produce: protocol
//! violations, timer-driven session failures, and per-stream terminal
//! conditions are each their own variant rather than a single opaque string,
//! so callers can match on cause instead of parsing messages.

use std::io;
use thiserror::Error;

/// Errors surfaced by [`crate::Session`] and [`crate::Stream`] operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying pipe failed (read, write, or the peer closed it).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A decoded header carried a version other than [`crate::frame::VERSION`].
    #[error("invalid frame version")]
    InvalidVersion,

    /// A decoded header carried an unrecognized `type` byte.
    #[error("invalid frame type")]
    InvalidMsgType,

    /// A frame carried a flag combination its stream state does not allow.
    #[error("unexpected flag for current stream state")]
    UnexpectedFlag,

    /// The session has shut down; all further operations fail with this.
    #[error("session shut down")]
    SessionShutdown,

    /// The local stream ID counter wrapped past `u32::MAX`.
    #[error("stream id space exhausted")]
    StreamsExhausted,

    /// Peer sent a SYN for a stream ID already present in the registry.
    #[error("duplicate stream id")]
    DuplicateStream,

    /// Peer sent more Data payload than the receive window it was granted.
    #[error("peer exceeded advertised receive window")]
    RecvWindowExceeded,

    /// Operation attempted on a stream that has already reached a closed state.
    #[error("stream closed")]
    StreamClosed,

    /// Operation attempted on, or pending on, a stream that was reset.
    #[error("connection reset")]
    ConnectionReset,

    /// A queued frame write did not complete within `connection_write_timeout`.
    #[error("write timed out")]
    ConnectionWriteTimeout,

    /// Two consecutive keep-alive pings went unanswered.
    #[error("keep-alive timed out")]
    KeepAliveTimeout,

    /// A stream stayed in `SynSent` past `stream_open_timeout`.
    #[error("stream open timed out")]
    StreamOpenTimeout,

    /// The peer sent GoAway; new local opens fail with this.
    #[error("remote sent go away")]
    RemoteGoAway,

    /// A header addressed a stream-level frame to id 0, or a session-level
    /// frame (Ping/GoAway) to a nonzero id.
    #[error("frame type {0:?} used with invalid stream id {1}")]
    InvalidStreamId(crate::frame::FrameType, u32),
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;
