//! The closed command set and its wire codec.
//!
//! Every command shares a 20-byte envelope:
//! ```text
//! magic "cmdx" | u32 size | u32 transaction_id | u32 response_id | i32 type
//! ```
//! followed by a kind-specific payload. `size` covers envelope plus
//! payload, which is how the receive loop parses frames out of a drained
//! queue buffer.
//!
//! Commands whose payload references a heap block (`EVAL_SCRIPT`,
//! `SET_FRAME`, and any `STRING` value) own that block from construction
//! until it is either committed to the send queue (ownership passes to the
//! peer) or explicitly released. Dropping a command that still owns a live
//! offset logs a leak.

use crate::client::IpcClient;
use crate::error::IpcError;
use crate::video::{
    self, FrameRequest, Value, VideoFrame, FRAME_REQUEST_SIZE, VALUE_ALIGN, VALUE_SIZE,
    VIDEO_FRAME_SIZE,
};
use crate::NULL_OFFSET;

pub const COMMAND_MAGIC: [u8; 4] = *b"cmdx";
pub const ENVELOPE_SIZE: usize = 20;

/// Sentinel for "no transaction": the command expects no reply, or answers
/// none.
pub const INVALID_TRANSACTION: u32 = u32::MAX;

/// Discriminator over the closed command set. The numeric values are wire
/// protocol; never reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CommandType {
    Ack = 0,
    Err = 1,
    SetLogFile = 2,
    LoadAvisynth = 3,
    NewScriptEnv = 4,
    GetScriptVar = 5,
    SetScriptVar = 6,
    EvalScript = 7,
    GetFrame = 8,
    SetFrame = 9,
}

impl CommandType {
    fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Ack,
            1 => Self::Err,
            2 => Self::SetLogFile,
            3 => Self::LoadAvisynth,
            4 => Self::NewScriptEnv,
            5 => Self::GetScriptVar,
            6 => Self::SetScriptVar,
            7 => Self::EvalScript,
            8 => Self::GetFrame,
            9 => Self::SetFrame,
            _ => return None,
        })
    }
}

/// Kind-specific payload of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandBody {
    Ack,
    Err,
    /// Path the slave should append its log to. UTF-16 on the wire.
    SetLogFile(String),
    /// Path of the scripting library to load; empty means the default.
    /// UTF-16 on the wire.
    LoadAvisynth(String),
    NewScriptEnv,
    GetScriptVar(String),
    SetScriptVar { name: String, value: Value },
    /// Heap offset of a serialized UTF-8 script.
    EvalScript(u32),
    GetFrame(FrameRequest),
    SetFrame(VideoFrame),
}

impl CommandBody {
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandBody::Ack => CommandType::Ack,
            CommandBody::Err => CommandType::Err,
            CommandBody::SetLogFile(_) => CommandType::SetLogFile,
            CommandBody::LoadAvisynth(_) => CommandType::LoadAvisynth,
            CommandBody::NewScriptEnv => CommandType::NewScriptEnv,
            CommandBody::GetScriptVar(_) => CommandType::GetScriptVar,
            CommandBody::SetScriptVar { .. } => CommandType::SetScriptVar,
            CommandBody::EvalScript(_) => CommandType::EvalScript,
            CommandBody::GetFrame(_) => CommandType::GetFrame,
            CommandBody::SetFrame(_) => CommandType::SetFrame,
        }
    }
}

/// A command together with its envelope ids.
#[derive(Debug)]
pub struct Command {
    transaction_id: u32,
    response_id: u32,
    body: CommandBody,
}

impl Command {
    pub fn new(body: CommandBody) -> Self {
        Self {
            transaction_id: INVALID_TRANSACTION,
            response_id: INVALID_TRANSACTION,
            body,
        }
    }

    /// Build a reply to the transaction `response_id`.
    pub fn reply_to(response_id: u32, body: CommandBody) -> Self {
        Self {
            transaction_id: INVALID_TRANSACTION,
            response_id,
            body,
        }
    }

    pub fn transaction_id(&self) -> u32 {
        self.transaction_id
    }

    pub fn response_id(&self) -> u32 {
        self.response_id
    }

    pub fn set_transaction_id(&mut self, id: u32) {
        self.transaction_id = id;
    }

    pub fn set_response_id(&mut self, id: u32) {
        self.response_id = id;
    }

    pub fn command_type(&self) -> CommandType {
        self.body.command_type()
    }

    pub fn body(&self) -> &CommandBody {
        &self.body
    }

    /// Take the payload, disarming the leak check; heap ownership moves to
    /// the caller along with it.
    pub fn into_body(mut self) -> CommandBody {
        std::mem::replace(&mut self.body, CommandBody::Ack)
    }

    fn heap_offset_slot(&mut self) -> Option<&mut u32> {
        match &mut self.body {
            CommandBody::EvalScript(offset) => Some(offset),
            CommandBody::SetFrame(frame) => Some(&mut frame.heap_offset),
            CommandBody::SetScriptVar {
                value: Value::Str(offset),
                ..
            } => Some(offset),
            _ => None,
        }
    }

    /// Heap offset this command currently owns, if any.
    pub fn owned_heap_offset(&self) -> Option<u32> {
        match &self.body {
            CommandBody::EvalScript(offset) => Some(*offset),
            CommandBody::SetFrame(frame) => Some(frame.heap_offset),
            CommandBody::SetScriptVar {
                value: Value::Str(offset),
                ..
            } => Some(*offset),
            _ => None,
        }
        .filter(|offset| *offset != NULL_OFFSET)
    }

    /// Give up ownership of the referenced heap block without freeing it:
    /// it now belongs to the peer.
    pub fn relinquish_heap_resources(&mut self) {
        if let Some(slot) = self.heap_offset_slot() {
            *slot = NULL_OFFSET;
        }
    }

    /// Free the referenced heap block against `client`'s heap. Used when a
    /// command is dropped without ever reaching the send queue.
    pub fn deallocate_heap_resources(&mut self, client: &IpcClient) {
        if let Some(offset) = self.owned_heap_offset() {
            if let Err(err) = client.deallocate(offset) {
                tracing::warn!(offset, %err, "failed to release heap block of dropped command");
            }
        }
        self.relinquish_heap_resources();
    }

    /// Size of the serialized command, envelope included.
    pub fn serialized_size(&self) -> usize {
        let payload = match &self.body {
            CommandBody::Ack | CommandBody::Err | CommandBody::NewScriptEnv => 0,
            CommandBody::SetLogFile(path) | CommandBody::LoadAvisynth(path) => {
                video::wstr_serialized_len(path)
            }
            CommandBody::GetScriptVar(name) => video::str_serialized_len(name),
            CommandBody::SetScriptVar { name, .. } => {
                video::str_serialized_len(name).next_multiple_of(VALUE_ALIGN) + VALUE_SIZE
            }
            CommandBody::EvalScript(_) => 4,
            CommandBody::GetFrame(_) => FRAME_REQUEST_SIZE,
            CommandBody::SetFrame(_) => VIDEO_FRAME_SIZE,
        };
        ENVELOPE_SIZE + payload
    }

    /// Append the serialized command to `out`.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        let total = self.serialized_size();
        let start = out.len();
        out.resize(start + total, 0);

        let frame = &mut out[start..];
        frame[0..4].copy_from_slice(&COMMAND_MAGIC);
        frame[4..8].copy_from_slice(&(total as u32).to_le_bytes());
        frame[8..12].copy_from_slice(&self.transaction_id.to_le_bytes());
        frame[12..16].copy_from_slice(&self.response_id.to_le_bytes());
        frame[16..20].copy_from_slice(&(self.command_type() as i32).to_le_bytes());

        let payload = &mut frame[ENVELOPE_SIZE..];
        match &self.body {
            CommandBody::Ack | CommandBody::Err | CommandBody::NewScriptEnv => {}
            CommandBody::SetLogFile(path) | CommandBody::LoadAvisynth(path) => {
                video::put_wstr(payload, path);
            }
            CommandBody::GetScriptVar(name) => {
                video::put_str(payload, name);
            }
            CommandBody::SetScriptVar { name, value } => {
                let written = video::put_str(payload, name);
                let padded = written.next_multiple_of(VALUE_ALIGN);
                video::put_value(&mut payload[padded..], value);
            }
            CommandBody::EvalScript(offset) => {
                payload[0..4].copy_from_slice(&offset.to_le_bytes());
            }
            CommandBody::GetFrame(request) => {
                video::put_frame_request(payload, request);
            }
            CommandBody::SetFrame(frame) => {
                video::put_video_frame(payload, frame);
            }
        }
    }

    /// Parse one command out of `frame`, which must be exactly the bytes
    /// declared by the envelope. Returns `None` for an unknown type tag;
    /// the caller skips the frame by its declared size.
    pub fn deserialize(frame: &[u8]) -> Result<Option<Command>, IpcError> {
        let envelope = Envelope::peek(frame)?;
        let payload = &frame[ENVELOPE_SIZE..envelope.size as usize];

        let Some(command_type) = CommandType::from_i32(envelope.type_tag) else {
            return Ok(None);
        };

        let body = match command_type {
            CommandType::Ack => CommandBody::Ack,
            CommandType::Err => CommandBody::Err,
            CommandType::NewScriptEnv => CommandBody::NewScriptEnv,
            CommandType::SetLogFile => CommandBody::SetLogFile(video::get_wstr(payload)?.0),
            CommandType::LoadAvisynth => CommandBody::LoadAvisynth(video::get_wstr(payload)?.0),
            CommandType::GetScriptVar => CommandBody::GetScriptVar(video::get_str(payload)?.0),
            CommandType::SetScriptVar => {
                let (name, consumed) = video::get_str(payload)?;
                let padded = consumed.next_multiple_of(VALUE_ALIGN);
                if payload.len() < padded + VALUE_SIZE {
                    return Err(IpcError::BadFrame("truncated value"));
                }
                let value = video::get_value(&payload[padded..])?;
                CommandBody::SetScriptVar { name, value }
            }
            CommandType::EvalScript => {
                if payload.len() < 4 {
                    return Err(IpcError::BadFrame("truncated script offset"));
                }
                CommandBody::EvalScript(u32::from_le_bytes(payload[0..4].try_into().unwrap()))
            }
            CommandType::GetFrame => CommandBody::GetFrame(video::get_frame_request(payload)?),
            CommandType::SetFrame => CommandBody::SetFrame(video::get_video_frame(payload)?),
        };

        Ok(Some(Command {
            transaction_id: envelope.transaction_id,
            response_id: envelope.response_id,
            body,
        }))
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if let Some(offset) = self.owned_heap_offset() {
            tracing::warn!(offset, "leaking heap allocation");
        }
    }
}

/// The decoded envelope fields of a framed command.
pub(crate) struct Envelope {
    pub size: u32,
    pub transaction_id: u32,
    pub response_id: u32,
    pub type_tag: i32,
}

impl Envelope {
    /// Validate and decode the envelope at the start of `buf` without
    /// consuming the payload.
    pub fn peek(buf: &[u8]) -> Result<Envelope, IpcError> {
        if buf.len() < ENVELOPE_SIZE {
            return Err(IpcError::BadFrame("truncated envelope"));
        }
        if buf[0..4] != COMMAND_MAGIC {
            return Err(IpcError::BadFrame("bad command header"));
        }
        let size = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if (size as usize) < ENVELOPE_SIZE || size as usize > buf.len() {
            return Err(IpcError::BadFrame("command size out of bounds"));
        }
        Ok(Envelope {
            size,
            transaction_id: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            response_id: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            type_tag: i32::from_le_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}
