//! The script-host seam and the built-in synthetic host.
//!
//! [`ScriptHost`] is the interface the real video-host adapter implements;
//! script evaluation, rendering, and color conversion live behind it and
//! outside this crate. [`SyntheticHost`] is a miniature stand-in that makes
//! the bridge runnable and testable without a scripting engine:
//!
//! - `BlankClip()` evaluates to a 640x480 YUV 4:2:0 clip of 240 black
//!   frames at 24/1 fps
//! - a bare variable name evaluates to that variable; a variable holding a
//!   remote clip yields a local pass-through clip whose frames are fetched
//!   from the master on demand
//! - integer, float, `true`/`false`, and double-quoted string literals
//!   evaluate to themselves
//! - `abort()` terminates the process without replying, for
//!   failure-injection tests

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use avswire_ipc::{
    Clip, ColorFamily, Command, CommandBody, CommandType, FrameLayout, FrameRequest, IpcClient,
    IpcError, Value, VideoFrame, VideoInfo,
};
use thiserror::Error;

/// Error type for script-host operations. Everything except a fatal
/// transport error is reported to the peer as an `ERR` reply.
#[derive(Debug, Error)]
pub enum HostError {
    /// The script could not be evaluated.
    #[error("script error: {0}")]
    Script(String),

    /// A variable query named something undefined.
    #[error("variable not defined: {0}")]
    NotFound(String),

    /// A frame request named an unknown clip.
    #[error("unknown clip {0}")]
    UnknownClip(u32),

    /// A command arrived before the scripting library was loaded.
    #[error("script host not loaded")]
    NotLoaded,

    /// Transport failure while servicing the command.
    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// The slave-side video-host adapter interface.
pub trait ScriptHost {
    /// Load the scripting library; an empty path selects the default.
    fn load(&mut self, client: &Arc<IpcClient>, path: &str) -> Result<(), HostError>;

    /// Throw away all script state and start over.
    fn new_env(&mut self) -> Result<(), HostError>;

    fn get_var(&mut self, client: &Arc<IpcClient>, name: &str) -> Result<Value, HostError>;

    /// Store a variable. A `Value::Str` hands over ownership of its heap
    /// block; a `Value::Clip` registers a master-owned clip.
    fn set_var(&mut self, client: &Arc<IpcClient>, name: &str, value: Value)
        -> Result<(), HostError>;

    /// Evaluate a script and return its result.
    fn eval(&mut self, client: &Arc<IpcClient>, script: &str) -> Result<Value, HostError>;

    /// Render one frame of a local clip into a fresh heap block.
    fn get_frame(
        &mut self,
        client: &Arc<IpcClient>,
        request: FrameRequest,
    ) -> Result<VideoFrame, HostError>;

    /// Accept a frame pushed by the master for one of its clips.
    fn set_frame(&mut self, client: &Arc<IpcClient>, frame: VideoFrame) -> Result<(), HostError>;
}

#[derive(Debug, Clone)]
enum VarValue {
    RemoteClip(u32),
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

enum ClipSource {
    Blank,
    Remote(u32),
}

struct LocalClip {
    info: VideoInfo,
    source: ClipSource,
}

/// Frames fetched from the master, keyed by local clip and frame number.
/// Small LRU bounded by total pixel bytes.
struct FrameCache {
    entries: VecDeque<((u32, i32), CachedFrame)>,
    usage: usize,
}

struct CachedFrame {
    stride: [i32; 4],
    height: [i32; 4],
    data: Vec<u8>,
}

const CACHE_MAX: usize = 8 << 20;

impl FrameCache {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            usage: 0,
        }
    }

    fn insert(&mut self, key: (u32, i32), frame: CachedFrame) {
        if frame.data.len() > CACHE_MAX {
            return;
        }
        while self.usage + frame.data.len() > CACHE_MAX {
            let (_, evicted) = self.entries.pop_back().expect("usage out of sync");
            self.usage -= evicted.data.len();
        }
        self.usage += frame.data.len();
        self.entries.push_front((key, frame));
    }

    fn find(&mut self, key: (u32, i32)) -> Option<&CachedFrame> {
        let index = self.entries.iter().position(|(k, _)| *k == key)?;
        let entry = self.entries.remove(index).unwrap();
        self.entries.push_front(entry);
        self.entries.front().map(|(_, frame)| frame)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.usage = 0;
    }
}

/// Built-in stand-in for a real scripting host.
pub struct SyntheticHost {
    loaded: bool,
    vars: HashMap<String, VarValue>,
    local_clips: HashMap<u32, LocalClip>,
    remote_clips: HashMap<u32, Clip>,
    next_clip_id: u32,
    cache: FrameCache,
}

impl Default for SyntheticHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticHost {
    pub fn new() -> Self {
        Self {
            loaded: false,
            vars: HashMap::new(),
            local_clips: HashMap::new(),
            remote_clips: HashMap::new(),
            next_clip_id: 0,
            cache: FrameCache::new(),
        }
    }

    fn check_loaded(&self) -> Result<(), HostError> {
        if self.loaded {
            Ok(())
        } else {
            Err(HostError::NotLoaded)
        }
    }

    fn register_local_clip(&mut self, info: VideoInfo, source: ClipSource) -> Clip {
        let clip_id = self.next_clip_id;
        self.next_clip_id += 1;
        self.local_clips.insert(clip_id, LocalClip { info, source });
        tracing::debug!(clip_id, width = info.width, height = info.height, "local clip");
        Clip { clip_id, info }
    }

    /// Resolve a variable into a protocol value, materializing remote clips
    /// as local pass-through clips.
    fn value_of_var(
        &mut self,
        client: &Arc<IpcClient>,
        name: &str,
    ) -> Result<Value, HostError> {
        let var = self
            .vars
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::NotFound(name.to_string()))?;

        Ok(match var {
            VarValue::RemoteClip(remote_id) => {
                let remote = self
                    .remote_clips
                    .get(&remote_id)
                    .copied()
                    .ok_or(HostError::UnknownClip(remote_id))?;
                let clip = self.register_local_clip(remote.info, ClipSource::Remote(remote_id));
                Value::Clip(clip)
            }
            VarValue::Bool(b) => Value::Bool(b),
            VarValue::Int(i) => Value::Int(i),
            VarValue::Float(f) => Value::Float(f),
            VarValue::Str(s) => Value::Str(client.allocate_str(&s)?),
        })
    }

    fn blank_clip_info() -> VideoInfo {
        VideoInfo {
            width: 640,
            height: 480,
            fps_num: 24,
            fps_den: 1,
            num_frames: 240,
            color_family: ColorFamily::Yuv,
            subsample_w: 1,
            subsample_h: 1,
        }
    }

    /// Render a black frame of `info` into a fresh heap block.
    fn render_blank(
        client: &IpcClient,
        info: &VideoInfo,
        request: FrameRequest,
    ) -> Result<VideoFrame, HostError> {
        let layout = FrameLayout::for_info(info);
        let mut data = Vec::with_capacity(layout.total as usize);
        for plane in 0..info.plane_count() {
            let fill = match (info.color_family, plane) {
                (ColorFamily::Yuv, 0) | (ColorFamily::Gray, 0) => 16,
                (ColorFamily::Yuv, _) => 128,
                _ => 0,
            };
            data.resize(data.len() + (layout.stride[plane] * layout.height[plane]) as usize, fill);
        }

        let offset = client.allocate(layout.total)?;
        client.copy_to_heap(offset, &data)?;
        Ok(VideoFrame {
            request,
            heap_offset: offset,
            stride: layout.stride,
            height: layout.height,
        })
    }

    /// Fetch a remote frame through the transport, caching the pixels.
    fn fetch_remote_frame(
        &mut self,
        client: &Arc<IpcClient>,
        request: FrameRequest,
        remote_id: u32,
    ) -> Result<&CachedFrame, HostError> {
        let key = (request.clip_id, request.frame_number);
        if self.cache.find(key).is_none() {
            tracing::debug!(
                clip = request.clip_id,
                frame = request.frame_number,
                "frame not prefetched"
            );

            let remote_request = FrameRequest {
                clip_id: remote_id,
                frame_number: request.frame_number,
            };
            let reply = client.send_sync(Command::new(CommandBody::GetFrame(remote_request)))?;
            let reply = client.check_reply(reply, CommandType::SetFrame)?;
            let CommandBody::SetFrame(frame) = reply.into_body() else {
                unreachable!();
            };

            if frame.request != remote_request {
                client.deallocate(frame.heap_offset)?;
                return Err(HostError::Script(
                    "remote get frame returned wrong frame".into(),
                ));
            }

            let total: i64 = (0..4).map(|p| (frame.stride[p] as i64) * frame.height[p] as i64).sum();
            let data = client.copy_from_heap(frame.heap_offset, total as usize);
            client.deallocate(frame.heap_offset)?;
            self.cache.insert(
                key,
                CachedFrame {
                    stride: frame.stride,
                    height: frame.height,
                    data: data?,
                },
            );
        }

        Ok(self.cache.find(key).expect("frame just inserted"))
    }
}

impl ScriptHost for SyntheticHost {
    fn load(&mut self, _client: &Arc<IpcClient>, path: &str) -> Result<(), HostError> {
        if self.loaded {
            tracing::debug!("script host already loaded");
            return Err(HostError::Script("already loaded".into()));
        }
        tracing::debug!(path, "load script host");
        self.loaded = true;
        Ok(())
    }

    fn new_env(&mut self) -> Result<(), HostError> {
        self.check_loaded()?;
        tracing::debug!("new script environment");
        self.vars.clear();
        self.local_clips.clear();
        self.remote_clips.clear();
        self.cache.clear();
        self.next_clip_id = 0;
        Ok(())
    }

    fn get_var(&mut self, client: &Arc<IpcClient>, name: &str) -> Result<Value, HostError> {
        self.check_loaded()?;
        tracing::debug!(name, "get script var");
        self.value_of_var(client, name)
    }

    fn set_var(
        &mut self,
        client: &Arc<IpcClient>,
        name: &str,
        value: Value,
    ) -> Result<(), HostError> {
        self.check_loaded()?;
        tracing::debug!(name, "set script var");

        let stored = match value {
            Value::Clip(clip) => {
                self.remote_clips.insert(clip.clip_id, clip);
                VarValue::RemoteClip(clip.clip_id)
            }
            Value::Bool(b) => VarValue::Bool(b),
            Value::Int(i) => VarValue::Int(i),
            Value::Float(f) => VarValue::Float(f),
            Value::Str(offset) => VarValue::Str(client.take_str(offset)?),
        };
        self.vars.insert(name.to_string(), stored);
        Ok(())
    }

    fn eval(&mut self, client: &Arc<IpcClient>, script: &str) -> Result<Value, HostError> {
        self.check_loaded()?;
        let script = script.trim();

        if script == "BlankClip()" {
            let clip = self.register_local_clip(Self::blank_clip_info(), ClipSource::Blank);
            return Ok(Value::Clip(clip));
        }
        if script == "abort()" {
            // Failure injection: die without answering.
            std::process::exit(2);
        }
        if script == "true" || script == "false" {
            return Ok(Value::Bool(script == "true"));
        }
        if let Ok(i) = script.parse::<i64>() {
            return Ok(Value::Int(i));
        }
        if let Ok(f) = script.parse::<f64>() {
            return Ok(Value::Float(f));
        }
        if script.len() >= 2 && script.starts_with('"') && script.ends_with('"') {
            let literal = &script[1..script.len() - 1];
            return Ok(Value::Str(client.allocate_str(literal)?));
        }
        if !script.is_empty() && script.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return self.value_of_var(client, script);
        }

        Err(HostError::Script(format!("cannot evaluate: {script}")))
    }

    fn get_frame(
        &mut self,
        client: &Arc<IpcClient>,
        request: FrameRequest,
    ) -> Result<VideoFrame, HostError> {
        self.check_loaded()?;

        let (info, source) = {
            let clip = self
                .local_clips
                .get(&request.clip_id)
                .ok_or(HostError::UnknownClip(request.clip_id))?;
            (
                clip.info,
                match clip.source {
                    ClipSource::Blank => None,
                    ClipSource::Remote(remote_id) => Some(remote_id),
                },
            )
        };

        match source {
            None => Self::render_blank(client, &info, request),
            Some(remote_id) => {
                let (stride, height, data) = {
                    let cached = self.fetch_remote_frame(client, request, remote_id)?;
                    (cached.stride, cached.height, cached.data.clone())
                };
                let offset = client.allocate(data.len() as u32)?;
                client.copy_to_heap(offset, &data)?;
                Ok(VideoFrame {
                    request,
                    heap_offset: offset,
                    stride,
                    height,
                })
            }
        }
    }

    fn set_frame(&mut self, client: &Arc<IpcClient>, frame: VideoFrame) -> Result<(), HostError> {
        self.check_loaded()?;
        tracing::debug!(
            clip = frame.request.clip_id,
            frame = frame.request.frame_number,
            "frame pushed"
        );

        // Pushed frames arrive keyed by the master's clip id; they prefill
        // the cache of every local pass-through of that clip.
        let local_ids: Vec<u32> = self
            .local_clips
            .iter()
            .filter_map(|(id, clip)| match clip.source {
                ClipSource::Remote(remote_id) if remote_id == frame.request.clip_id => Some(*id),
                _ => None,
            })
            .collect();

        let total: i64 = (0..4).map(|p| (frame.stride[p] as i64) * frame.height[p] as i64).sum();
        let data = client.copy_from_heap(frame.heap_offset, total as usize);
        client.deallocate(frame.heap_offset)?;
        let data = data?;

        if local_ids.is_empty() {
            return Err(HostError::UnknownClip(frame.request.clip_id));
        }
        for local_id in local_ids {
            self.cache.insert(
                (local_id, frame.request.frame_number),
                CachedFrame {
                    stride: frame.stride,
                    height: frame.height,
                    data: data.clone(),
                },
            );
        }
        Ok(())
    }
}
