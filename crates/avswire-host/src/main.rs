//! Slave executable: attaches to the master's shared segment and services
//! commands until the connection breaks.
//!
//! Invoked by the master as
//! `avswire-host <master-pid> <segment-handle> <segment-size>`, all
//! decimal. The segment handle is inherited; any validation failure exits
//! nonzero.

use std::process::ExitCode;

use avswire_host::host::SyntheticHost;
use avswire_host::session::{self, Session};
use avswire_ipc::{IpcClient, IpcError};
use clap::Parser;

#[derive(Parser)]
#[command(name = "avswire-host")]
#[command(about = "Slave-side host process for the avswire IPC bridge")]
#[command(version)]
struct Args {
    /// PID of the master process.
    master_pid: u32,

    /// Inherited shared-segment handle, as passed by the master.
    segment_handle: u32,

    /// Total size of the shared segment in bytes.
    segment_size: u32,
}

fn run(args: &Args) -> Result<(), IpcError> {
    let client = IpcClient::slave(args.master_pid, args.segment_handle, args.segment_size)?;
    let session = Session::new(client, SyntheticHost::new());
    session.run()
}

fn main() -> ExitCode {
    session::init_logging();
    let args = Args::parse();
    tracing::debug!(
        master_pid = args.master_pid,
        segment_handle = args.segment_handle,
        segment_size = args.segment_size,
        "host starting"
    );

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "host session failed");
            ExitCode::FAILURE
        }
    }
}
