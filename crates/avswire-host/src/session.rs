//! The command pump of the slave process.
//!
//! The transport's receive thread must never execute host work inline - a
//! frame render can itself issue synchronous requests back to the master.
//! The session therefore queues every inbound command and dispatches from
//! its own thread: handler errors become `ERR` replies, handled commands
//! that carried a transaction id and produced no reply of their own are
//! acknowledged automatically, and a `None` from the transport ends the
//! loop.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use avswire_ipc::{Command, CommandBody, IpcClient, IpcError, Value, INVALID_TRANSACTION};

use crate::host::{HostError, ScriptHost};

/// Log file installed by `SET_LOG_FILE`. Only the first request wins, like
/// the original host.
static LOG_FILE: OnceLock<File> = OnceLock::new();

/// Writer that targets the `SET_LOG_FILE` destination once one is set, and
/// stderr before that.
struct SessionLogWriter;

impl Write for SessionLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match LOG_FILE.get() {
            Some(mut file) => file.write(buf),
            None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match LOG_FILE.get() {
            Some(mut file) => file.flush(),
            None => io::stderr().flush(),
        }
    }
}

/// Install the process-wide subscriber used by the host binary.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(|| SessionLogWriter)
        .with_ansi(false)
        .init();
}

fn set_log_file(path: &str) {
    if LOG_FILE.get().is_some() {
        return;
    }
    match File::create(path) {
        Ok(file) => {
            let _ = LOG_FILE.set(file);
        }
        Err(err) => tracing::warn!(path, %err, "could not open log file"),
    }
}

struct Inbox {
    state: Mutex<InboxState>,
    cond: Condvar,
}

struct InboxState {
    commands: VecDeque<Command>,
    exit: bool,
}

/// What a handled command still needs from the session.
enum Outcome {
    /// Send an `ACK` if the command carried a transaction id.
    Ack,
    /// A reply was already produced (or deliberately withheld).
    Replied,
}

/// Errors that end the session rather than a single command.
fn is_fatal(err: &IpcError) -> bool {
    matches!(
        err,
        IpcError::Ipc(_)
            | IpcError::RemoteExit
            | IpcError::BadFrame(_)
            | IpcError::QueueOverflow { .. }
            | IpcError::Os(_)
    )
}

/// Drives a [`ScriptHost`] from the commands arriving on an [`IpcClient`].
pub struct Session<H: ScriptHost> {
    client: Arc<IpcClient>,
    host: H,
    inbox: Arc<Inbox>,
}

impl<H: ScriptHost> Session<H> {
    pub fn new(client: Arc<IpcClient>, host: H) -> Self {
        Self {
            client,
            host,
            inbox: Arc::new(Inbox {
                state: Mutex::new(InboxState {
                    commands: VecDeque::new(),
                    exit: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Run until the connection breaks or a fatal transport error occurs.
    pub fn run(mut self) -> Result<(), IpcError> {
        let inbox = Arc::clone(&self.inbox);
        self.client.start(move |command| {
            {
                let mut state = inbox.state.lock().unwrap();
                match command {
                    Some(command) => state.commands.push_back(command),
                    None => state.exit = true,
                }
            }
            inbox.cond.notify_all();
        })?;

        loop {
            let command = {
                let mut state = self.inbox.state.lock().unwrap();
                loop {
                    if state.exit {
                        tracing::debug!("exit after broken connection");
                        return Ok(());
                    }
                    if let Some(command) = state.commands.pop_front() {
                        break command;
                    }
                    state = self.inbox.cond.wait(state).unwrap();
                }
            };

            self.dispatch(command)?;
        }
    }

    fn dispatch(&mut self, command: Command) -> Result<(), IpcError> {
        let transaction_id = command.transaction_id();
        let kind = command.command_type();

        match self.handle(command) {
            Ok(Outcome::Ack) => {
                if transaction_id != INVALID_TRANSACTION {
                    self.client.send_ack(transaction_id)?;
                }
                Ok(())
            }
            Ok(Outcome::Replied) => Ok(()),
            Err(HostError::Ipc(err)) if is_fatal(&err) => Err(err),
            Err(err) => {
                tracing::debug!(?kind, %err, "command failed");
                self.client.send_err(transaction_id)?;
                Ok(())
            }
        }
    }

    fn handle(&mut self, command: Command) -> Result<Outcome, HostError> {
        let transaction_id = command.transaction_id();

        match command.into_body() {
            CommandBody::Ack | CommandBody::Err => Ok(Outcome::Replied),
            CommandBody::SetLogFile(path) => {
                set_log_file(&path);
                Ok(Outcome::Ack)
            }
            CommandBody::LoadAvisynth(path) => {
                self.host.load(&self.client, &path)?;
                Ok(Outcome::Ack)
            }
            CommandBody::NewScriptEnv => {
                self.host.new_env()?;
                Ok(Outcome::Ack)
            }
            CommandBody::GetScriptVar(name) => {
                let value = self.host.get_var(&self.client, &name)?;
                self.reply_value(transaction_id, value)
            }
            CommandBody::SetScriptVar { name, value } => {
                self.host.set_var(&self.client, &name, value)?;
                Ok(Outcome::Ack)
            }
            CommandBody::EvalScript(offset) => {
                let script = self.client.take_str(offset)?;
                tracing::debug!(script, "eval script");
                let value = self.host.eval(&self.client, &script)?;
                self.reply_value(transaction_id, value)
            }
            CommandBody::GetFrame(request) => {
                tracing::debug!(
                    clip = request.clip_id,
                    frame = request.frame_number,
                    "frame request"
                );
                let frame = self.host.get_frame(&self.client, request)?;
                self.client
                    .send_async(Command::reply_to(transaction_id, CommandBody::SetFrame(frame)), None)?;
                Ok(Outcome::Replied)
            }
            CommandBody::SetFrame(frame) => {
                self.host.set_frame(&self.client, frame)?;
                Ok(Outcome::Ack)
            }
        }
    }

    /// Answer a variable query. With no transaction to answer, the value is
    /// discarded; a string value must release its heap payload then.
    fn reply_value(&self, transaction_id: u32, value: Value) -> Result<Outcome, HostError> {
        if transaction_id == INVALID_TRANSACTION {
            if let Value::Str(offset) = value {
                self.client.deallocate(offset)?;
            }
            return Ok(Outcome::Replied);
        }

        let reply = Command::reply_to(
            transaction_id,
            CommandBody::SetScriptVar {
                name: String::new(),
                value,
            },
        );
        self.client.send_async(reply, None)?;
        Ok(Outcome::Replied)
    }
}
