//! Shared-memory IPC substrate for bridging two video-filtering hosts of
//! incompatible ABIs.
//!
//! The master process owns a single shared segment containing two framed
//! byte queues (one per direction) and a best-fit heap used to pass
//! variable-sized payloads (scripts, strings, frame pixels) by offset
//! instead of copying them through the queues.
//!
//! # Architecture
//!
//! - [`layout`] - the segment header and the control structures of the
//!   queues and the heap, all co-located inside one mapped region
//! - [`queue`] - one-directional framed byte ring with drain-all reads
//! - [`heap`] - best-fit allocator over a contiguous arena
//! - [`command`] - the closed command set with a common envelope
//! - [`client`] - the transport client: receive thread, pending-callback
//!   table, `send_async`/`send_sync`
//! - [`runloop`] - reentrant send/wait helper that services inbound frame
//!   requests while awaiting its own reply
//!
//! All cross-process pointers inside the segment are 32-bit offsets
//! relative to a documented base; [`NULL_OFFSET`] is the null sentinel.

pub mod client;
pub mod command;
pub mod error;
pub mod heap;
pub mod layout;
pub mod queue;
pub mod runloop;
pub mod sys;
pub mod video;

pub use client::IpcClient;
pub use command::{Command, CommandBody, CommandType, INVALID_TRANSACTION};
pub use error::IpcError;
pub use runloop::Runloop;
pub use video::{Clip, ColorFamily, FrameLayout, FrameRequest, Value, VideoFrame, VideoInfo};

/// Null sentinel for every 32-bit offset field in the shared segment.
pub const NULL_OFFSET: u32 = u32::MAX;

/// Protocol version stamped into the segment header; a mismatch fails the
/// slave-side attach.
pub const VERSION: u32 = 1;

/// Total size of each queue structure (header plus ring buffer).
pub const QUEUE_SIZE: u32 = 4096;

/// Default size of the shared segment.
pub const DEFAULT_SEGMENT_SIZE: u32 = 256 * (1 << 20);
