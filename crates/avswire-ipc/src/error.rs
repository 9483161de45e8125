//! Error types for the IPC substrate.

use thiserror::Error;

use crate::command::CommandType;

/// Error type for all transport, heap, and codec operations.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Fatal transport error.
    #[error("{0}")]
    Ipc(String),

    /// The heap could not satisfy an allocation. Recoverable; callers may
    /// free and retry.
    #[error("heap full: requested {requested} bytes, {available} available")]
    HeapFull {
        /// Bytes requested by the failed allocation.
        requested: u32,
        /// Free bytes remaining in the arena.
        available: u32,
    },

    /// A queue write would exceed the ring capacity.
    #[error("queue overflow: requested {requested} bytes, {available} available")]
    QueueOverflow {
        /// Bytes the write needed.
        requested: u32,
        /// Free bytes remaining in the ring.
        available: u32,
    },

    /// A framed message violated an envelope invariant (magic or size).
    #[error("bad frame: {0}")]
    BadFrame(&'static str),

    /// The peer process is gone.
    #[error("remote process exited")]
    RemoteExit,

    /// The peer answered a command with `ERR`.
    #[error("command failed on the remote side")]
    CommandFailed,

    /// The peer answered with an unexpected command kind. Per-call, not
    /// fatal to the transport.
    #[error("unexpected reply: expected {expected:?}, got {actual:?}")]
    Protocol {
        /// The reply kind the caller required.
        expected: CommandType,
        /// The kind that actually arrived.
        actual: CommandType,
    },

    /// A heap offset did not point at a live heap block.
    #[error("pointer not a heap block")]
    BadPointer,

    /// An offset fell outside the structure it indexes.
    #[error("pointer out of bounds")]
    OutOfBounds,

    /// An OS call failed.
    #[error("os error: {0}")]
    Os(#[from] std::io::Error),
}
