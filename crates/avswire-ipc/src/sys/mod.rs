//! OS primitives behind the transport: the shared mapping, the auto-reset
//! notification signal, the cross-process mutex, and the remote-process
//! watch.
//!
//! Both backends expose the same surface. Handles round-trip through `u32`
//! values so they can be stored in the segment headers and passed to the
//! slave on its command line as decimal integers.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{wait_signal_or_exit, Mapping, MutexGuard, ProcessWatch, ShMutex, Signal};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::{wait_signal_or_exit, Mapping, MutexGuard, ProcessWatch, ShMutex, Signal};

/// Outcome of waiting on a queue signal together with the remote process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The peer signaled data available.
    Signal,
    /// The peer process terminated.
    RemoteExit,
}

pub(crate) fn abandoned_mutex_error() -> io::Error {
    io::Error::other("remote process abandoned mutex")
}
