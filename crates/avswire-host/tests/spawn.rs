//! Tests that exercise the real handshake: the master spawns the built
//! host binary, exchanges commands with it, and observes its death.

use std::path::PathBuf;
use std::sync::Arc;

use avswire_ipc::{
    Clip, Command, CommandBody, CommandType, FrameRequest, IpcClient, IpcError, Value,
};

fn host_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_avswire-host"))
}

fn send_expect(
    master: &Arc<IpcClient>,
    body: CommandBody,
    expected: CommandType,
) -> Result<Command, IpcError> {
    let reply = master.send_sync(Command::new(body))?;
    master.check_reply(reply, expected)
}

#[test]
fn spawned_host_serves_the_full_sequence() {
    let master = IpcClient::master(&host_path()).unwrap();
    master.start(|_| {}).unwrap();

    send_expect(
        &master,
        CommandBody::LoadAvisynth(String::new()),
        CommandType::Ack,
    )
    .unwrap();

    let offset = master.allocate_str("BlankClip()\r\n").unwrap();
    let reply = send_expect(
        &master,
        CommandBody::EvalScript(offset),
        CommandType::SetScriptVar,
    )
    .unwrap();
    let clip = match reply.into_body() {
        CommandBody::SetScriptVar {
            value: Value::Clip(clip),
            ..
        } => clip,
        other => panic!("expected a clip, got {other:?}"),
    };
    let Clip { clip_id, info } = clip;
    assert_eq!(info.width, 640);
    assert_eq!(info.height, 480);

    let reply = send_expect(
        &master,
        CommandBody::GetFrame(FrameRequest { clip_id, frame_number: 0 }),
        CommandType::SetFrame,
    )
    .unwrap();
    let CommandBody::SetFrame(frame) = reply.into_body() else {
        unreachable!();
    };
    assert_eq!(frame.stride[0] % 64, 0);
    assert_eq!(frame.height[0], 480);
    master.deallocate(frame.heap_offset).unwrap();
    assert_eq!(master.heap_usage(), 0);

    master.stop().unwrap();
}

#[test]
fn slave_exits_nonzero_on_a_bad_handshake() {
    // Bogus handle and size: the host must fail validation and exit
    // nonzero rather than touch anything.
    let status = std::process::Command::new(host_path())
        .arg(std::process::id().to_string())
        .arg("999999")
        .arg("65536")
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn slave_requires_exactly_three_arguments() {
    let status = std::process::Command::new(host_path())
        .arg("1")
        .arg("2")
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn abrupt_peer_exit_surfaces_as_remote_exit() {
    let master = IpcClient::master(&host_path()).unwrap();
    master.start(|_| {}).unwrap();

    send_expect(
        &master,
        CommandBody::LoadAvisynth(String::new()),
        CommandType::Ack,
    )
    .unwrap();

    // The synthetic host's abort() kills the slave without a reply.
    let offset = master.allocate_str("abort()").unwrap();
    let result = send_expect(
        &master,
        CommandBody::EvalScript(offset),
        CommandType::SetScriptVar,
    );
    assert!(matches!(result, Err(IpcError::RemoteExit)), "{result:?}");

    // The captured receive-thread error surfaces on the next call...
    let result = master.send_sync(Command::new(CommandBody::NewScriptEnv));
    assert!(result.is_err());

    // ...after which stop completes without error.
    master.stop().unwrap();
}
