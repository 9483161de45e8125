//! Master-side driver: spawns the slave host, evaluates a script there,
//! and pulls frames back across the shared segment.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use avswire_ipc::{
    Command, CommandBody, CommandType, FrameRequest, IpcClient, IpcError, Runloop, Value,
};
use clap::Parser;
use colored::Colorize;

#[derive(Parser)]
#[command(name = "avswire")]
#[command(about = "Bridge to a video-filtering host running in a slave process")]
#[command(version)]
struct Args {
    /// Script to evaluate on the slave host
    #[arg(short, long, default_value = "BlankClip()")]
    script: String,

    /// Path to the slave executable (defaults to avswire-host next to this
    /// binary)
    #[arg(long)]
    slave: Option<PathBuf>,

    /// Number of frames to request when the script returns a clip
    #[arg(short, long, default_value_t = 1)]
    frames: i32,

    /// Redirect the slave's log output to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    println!();
    println!("{}", "AVSWIRE".cyan().bold());
    println!("{}", "Shared-memory bridge to a slave video host".white());
    println!();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {}", "[ERROR]".red(), err);
            ExitCode::FAILURE
        }
    }
}

fn slave_path(args: &Args) -> Result<PathBuf, IpcError> {
    if let Some(path) = &args.slave {
        return Ok(path.clone());
    }
    let exe = std::env::current_exe().map_err(IpcError::Os)?;
    Ok(exe
        .parent()
        .unwrap_or(&exe)
        .join(format!("avswire-host{}", std::env::consts::EXE_SUFFIX)))
}

fn send_expect(
    master: &Arc<IpcClient>,
    body: CommandBody,
    expected: CommandType,
) -> Result<Command, IpcError> {
    let reply = master.send_sync(Command::new(body))?;
    master.check_reply(reply, expected)
}

fn run(args: &Args) -> Result<(), IpcError> {
    let slave = slave_path(args)?;
    println!("{} Starting slave: {}", "[INFO]".blue(), slave.display());

    let master = IpcClient::master(&slave)?;
    let runloop = Runloop::new();
    master.start(runloop.handler())?;

    if let Some(log_file) = &args.log_file {
        send_expect(
            &master,
            CommandBody::SetLogFile(log_file.display().to_string()),
            CommandType::Ack,
        )?;
    }

    println!("{} Loading script host...", "[INFO]".blue());
    send_expect(
        &master,
        CommandBody::LoadAvisynth(String::new()),
        CommandType::Ack,
    )?;
    println!("{} Script host loaded", "[OK]".green());

    println!("{} Evaluating script", "[INFO]".blue());
    let script_offset = master.allocate_str(&args.script)?;
    let reply = send_expect(
        &master,
        CommandBody::EvalScript(script_offset),
        CommandType::SetScriptVar,
    )?;
    let CommandBody::SetScriptVar { value, .. } = reply.into_body() else {
        unreachable!();
    };

    match value {
        Value::Clip(clip) => {
            println!(
                "{} Received clip {}: {}x{}, {} frames at {}/{} fps",
                "[OK]".green(),
                clip.clip_id,
                clip.info.width,
                clip.info.height,
                clip.info.num_frames,
                clip.info.fps_num,
                clip.info.fps_den,
            );
            request_frames(&master, &runloop, clip.clip_id, args.frames.min(clip.info.num_frames))?;
        }
        Value::Bool(b) => println!("{} Result: {}", "[OK]".green(), b),
        Value::Int(i) => println!("{} Result: {}", "[OK]".green(), i),
        Value::Float(f) => println!("{} Result: {}", "[OK]".green(), f),
        Value::Str(offset) => {
            let s = master.take_str(offset)?;
            println!("{} Result: {:?}", "[OK]".green(), s);
        }
    }

    master.stop()?;
    Ok(())
}

fn request_frames(
    master: &Arc<IpcClient>,
    runloop: &Runloop,
    clip_id: u32,
    frames: i32,
) -> Result<(), IpcError> {
    for frame_number in 0..frames {
        let reply = runloop.run(
            master,
            Command::new(CommandBody::GetFrame(FrameRequest { clip_id, frame_number })),
            // This driver registers no clips of its own, so nothing is
            // serviceable in the reentrant direction.
            |_, request| {
                Err(IpcError::Ipc(format!(
                    "no local clip {} to serve",
                    request.clip_id
                )))
            },
        )?;
        let reply = master.check_reply(reply, CommandType::SetFrame)?;
        let CommandBody::SetFrame(frame) = reply.into_body() else {
            unreachable!();
        };

        let total: i64 = (0..4)
            .map(|p| frame.stride[p] as i64 * frame.height[p] as i64)
            .sum();
        master.deallocate(frame.heap_offset)?;
        println!(
            "{} Frame {}: {} bytes, luma stride {}",
            "[OK]".green(),
            frame_number,
            total,
            frame.stride[0],
        );
    }
    Ok(())
}
