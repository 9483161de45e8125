//! Slave-side runtime for the avswire IPC bridge.
//!
//! The host executable attaches to the master's shared segment and runs a
//! [`session::Session`]: commands received by the transport are pumped onto
//! a session thread and dispatched to a [`host::ScriptHost`]
//! implementation. The real video host adapter is an external collaborator;
//! the built-in [`host::SyntheticHost`] implements just enough scripting to
//! drive the bridge end to end.

pub mod host;
pub mod session;
