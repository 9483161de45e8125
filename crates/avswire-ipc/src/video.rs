//! Video metadata and script-value types carried inside commands, plus the
//! length-prefixed string codec used for heap payloads and command
//! arguments.
//!
//! Wire layouts (little-endian):
//! ```text
//! VideoInfo (24 bytes)   i32 width | i32 height | u32 fps_num |
//!                        u32 fps_den | i32 num_frames | i8 color_family |
//!                        i8 subsample_w | i8 subsample_h | pad
//! FrameRequest (8)       u32 clip_id | i32 frame_number
//! VideoFrame (44)        FrameRequest | u32 heap_offset |
//!                        i32 stride[4] | i32 height[4]
//! Value (40)             i8 tag | pad to 8 | payload (Clip / i8 / i64 /
//!                        f64 / u32 heap offset)
//! string                 u32 code-unit count | units | NUL
//! ```

use crate::error::IpcError;
use crate::NULL_OFFSET;

pub const VIDEO_INFO_SIZE: usize = 24;
pub const FRAME_REQUEST_SIZE: usize = 8;
pub const VIDEO_FRAME_SIZE: usize = 44;
pub const VALUE_SIZE: usize = 40;
pub const VALUE_ALIGN: usize = 8;

/// Secondary cap on deserialized string lengths, in code units. Counts
/// beyond this are treated as corrupt frames.
pub const MAX_STRING_LEN: usize = 1 << 20;

/// Color family of a clip. Subsampling is the log2 of the chroma-to-luma
/// divisor per axis and only meaningful for planar families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ColorFamily {
    /// Generic planar RGB; reserved for high-bit-depth extension and never
    /// emitted by this crate.
    Rgb = 0,
    Yuv = 1,
    Gray = 2,
    /// Packed 3-byte RGB rows.
    Rgb24 = 3,
    /// Packed 4-byte RGB rows with alpha.
    Rgb32 = 4,
    /// Packed 4:2:2 YUV.
    Yuy2 = 5,
}

impl ColorFamily {
    fn from_i8(value: i8) -> Result<Self, IpcError> {
        Ok(match value {
            0 => Self::Rgb,
            1 => Self::Yuv,
            2 => Self::Gray,
            3 => Self::Rgb24,
            4 => Self::Rgb32,
            5 => Self::Yuy2,
            _ => return Err(IpcError::BadFrame("unknown color family")),
        })
    }

    /// Whether rows carry interleaved components rather than one plane per
    /// component.
    pub fn is_packed(self) -> bool {
        matches!(self, Self::Rgb24 | Self::Rgb32 | Self::Yuy2)
    }

    /// Bytes per pixel of a packed row; 1 for planar families.
    pub fn bytes_per_pixel(self) -> i32 {
        match self {
            Self::Rgb24 => 3,
            Self::Rgb32 => 4,
            Self::Yuy2 => 2,
            _ => 1,
        }
    }
}

/// Format and length metadata of a clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    pub width: i32,
    pub height: i32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub num_frames: i32,
    pub color_family: ColorFamily,
    pub subsample_w: i8,
    pub subsample_h: i8,
}

impl VideoInfo {
    /// Planes a frame of this format occupies in the heap payload.
    pub fn plane_count(&self) -> usize {
        match self.color_family {
            ColorFamily::Rgb | ColorFamily::Yuv => 3,
            _ => 1,
        }
    }

    /// Row bytes and row count of plane `plane`.
    pub fn plane_dimensions(&self, plane: usize) -> (i32, i32) {
        let subsample = if plane == 0 { (0, 0) } else { (self.subsample_w, self.subsample_h) };
        let row_bytes = (self.width >> subsample.0) * self.color_family.bytes_per_pixel();
        let rows = self.height >> subsample.1;
        (row_bytes, rows)
    }
}

pub(crate) fn put_video_info(buf: &mut [u8], info: &VideoInfo) {
    buf[0..4].copy_from_slice(&info.width.to_le_bytes());
    buf[4..8].copy_from_slice(&info.height.to_le_bytes());
    buf[8..12].copy_from_slice(&info.fps_num.to_le_bytes());
    buf[12..16].copy_from_slice(&info.fps_den.to_le_bytes());
    buf[16..20].copy_from_slice(&info.num_frames.to_le_bytes());
    buf[20] = info.color_family as i8 as u8;
    buf[21] = info.subsample_w as u8;
    buf[22] = info.subsample_h as u8;
    buf[23] = 0;
}

pub(crate) fn get_video_info(buf: &[u8]) -> Result<VideoInfo, IpcError> {
    if buf.len() < VIDEO_INFO_SIZE {
        return Err(IpcError::BadFrame("truncated video info"));
    }
    Ok(VideoInfo {
        width: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
        height: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
        fps_num: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        fps_den: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        num_frames: i32::from_le_bytes(buf[16..20].try_into().unwrap()),
        color_family: ColorFamily::from_i8(buf[20] as i8)?,
        subsample_w: buf[21] as i8,
        subsample_h: buf[22] as i8,
    })
}

/// Identifies one frame of one clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameRequest {
    pub clip_id: u32,
    pub frame_number: i32,
}

pub(crate) fn put_frame_request(buf: &mut [u8], request: &FrameRequest) {
    buf[0..4].copy_from_slice(&request.clip_id.to_le_bytes());
    buf[4..8].copy_from_slice(&request.frame_number.to_le_bytes());
}

pub(crate) fn get_frame_request(buf: &[u8]) -> Result<FrameRequest, IpcError> {
    if buf.len() < FRAME_REQUEST_SIZE {
        return Err(IpcError::BadFrame("truncated frame request"));
    }
    Ok(FrameRequest {
        clip_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        frame_number: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
    })
}

/// Packed pixel data passed by heap offset plus per-plane stride and
/// height. Planes are contiguous at `heap_offset` in Y, U, V order; packed
/// formats use `stride[0]`/`height[0]` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFrame {
    pub request: FrameRequest,
    pub heap_offset: u32,
    pub stride: [i32; 4],
    pub height: [i32; 4],
}

pub(crate) fn put_video_frame(buf: &mut [u8], frame: &VideoFrame) {
    put_frame_request(&mut buf[0..8], &frame.request);
    buf[8..12].copy_from_slice(&frame.heap_offset.to_le_bytes());
    for (i, stride) in frame.stride.iter().enumerate() {
        buf[12 + i * 4..16 + i * 4].copy_from_slice(&stride.to_le_bytes());
    }
    for (i, height) in frame.height.iter().enumerate() {
        buf[28 + i * 4..32 + i * 4].copy_from_slice(&height.to_le_bytes());
    }
}

pub(crate) fn get_video_frame(buf: &[u8]) -> Result<VideoFrame, IpcError> {
    if buf.len() < VIDEO_FRAME_SIZE {
        return Err(IpcError::BadFrame("truncated video frame"));
    }
    let mut stride = [0i32; 4];
    let mut height = [0i32; 4];
    for i in 0..4 {
        stride[i] = i32::from_le_bytes(buf[12 + i * 4..16 + i * 4].try_into().unwrap());
        height[i] = i32::from_le_bytes(buf[28 + i * 4..32 + i * 4].try_into().unwrap());
    }
    Ok(VideoFrame {
        request: get_frame_request(&buf[0..8])?,
        heap_offset: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        stride,
        height,
    })
}

/// Per-plane strides, heights, and total payload size of a frame. Rows are
/// stride-aligned to a multiple of 64 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub stride: [i32; 4],
    pub height: [i32; 4],
    pub total: u32,
}

impl FrameLayout {
    /// Compute the heap layout for one frame of `info`.
    pub fn for_info(info: &VideoInfo) -> FrameLayout {
        let mut stride = [0i32; 4];
        let mut height = [0i32; 4];
        let mut total = 0u32;

        for plane in 0..info.plane_count() {
            let (row_bytes, rows) = info.plane_dimensions(plane);
            stride[plane] = ((row_bytes + 63) / 64) * 64;
            height[plane] = rows;
            total += (stride[plane] * rows) as u32;
        }

        FrameLayout { stride, height, total }
    }
}

/// An opaque reference to a remote clip together with its format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clip {
    pub clip_id: u32,
    pub info: VideoInfo,
}

/// A script variable: the tagged union exchanged by `GET_SCRIPT_VAR`,
/// `SET_SCRIPT_VAR`, and script evaluation replies.
///
/// `Str` carries the heap offset of a serialized UTF-8 string; the command
/// holding the value owns that allocation until it is sent or released.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Clip(Clip),
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(u32),
}

const TAG_CLIP: u8 = b'c';
const TAG_BOOL: u8 = b'b';
const TAG_INT: u8 = b'i';
const TAG_FLOAT: u8 = b'f';
const TAG_STRING: u8 = b's';

pub(crate) fn put_value(buf: &mut [u8], value: &Value) {
    buf[..VALUE_SIZE].fill(0);
    match value {
        Value::Clip(clip) => {
            buf[0] = TAG_CLIP;
            buf[8..12].copy_from_slice(&clip.clip_id.to_le_bytes());
            put_video_info(&mut buf[12..12 + VIDEO_INFO_SIZE], &clip.info);
        }
        Value::Bool(b) => {
            buf[0] = TAG_BOOL;
            buf[8] = *b as u8;
        }
        Value::Int(i) => {
            buf[0] = TAG_INT;
            buf[8..16].copy_from_slice(&i.to_le_bytes());
        }
        Value::Float(f) => {
            buf[0] = TAG_FLOAT;
            buf[8..16].copy_from_slice(&f.to_le_bytes());
        }
        Value::Str(offset) => {
            buf[0] = TAG_STRING;
            buf[8..12].copy_from_slice(&offset.to_le_bytes());
        }
    }
}

pub(crate) fn get_value(buf: &[u8]) -> Result<Value, IpcError> {
    if buf.len() < VALUE_SIZE {
        return Err(IpcError::BadFrame("truncated value"));
    }
    Ok(match buf[0] {
        TAG_CLIP => Value::Clip(Clip {
            clip_id: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            info: get_video_info(&buf[12..12 + VIDEO_INFO_SIZE])?,
        }),
        TAG_BOOL => Value::Bool(buf[8] != 0),
        TAG_INT => Value::Int(i64::from_le_bytes(buf[8..16].try_into().unwrap())),
        TAG_FLOAT => Value::Float(f64::from_le_bytes(buf[8..16].try_into().unwrap())),
        TAG_STRING => Value::Str(u32::from_le_bytes(buf[8..12].try_into().unwrap())),
        _ => return Err(IpcError::BadFrame("unknown value tag")),
    })
}

impl Value {
    /// Heap offset owned by this value, if it is a non-null string.
    pub fn heap_offset(&self) -> Option<u32> {
        match self {
            Value::Str(offset) if *offset != NULL_OFFSET => Some(*offset),
            _ => None,
        }
    }
}

/// Serialized size of `s` as a UTF-8 string payload.
pub fn str_serialized_len(s: &str) -> usize {
    4 + s.len() + 1
}

/// Write `s` as a length-prefixed, NUL-terminated UTF-8 string. Returns the
/// bytes written.
pub fn put_str(buf: &mut [u8], s: &str) -> usize {
    buf[0..4].copy_from_slice(&(s.len() as u32).to_le_bytes());
    buf[4..4 + s.len()].copy_from_slice(s.as_bytes());
    buf[4 + s.len()] = 0;
    str_serialized_len(s)
}

/// Read a length-prefixed UTF-8 string; returns the string and the bytes
/// consumed.
pub fn get_str(buf: &[u8]) -> Result<(String, usize), IpcError> {
    if buf.len() < 5 {
        return Err(IpcError::BadFrame("truncated string"));
    }
    let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    if len > MAX_STRING_LEN || buf.len() < 4 + len + 1 {
        return Err(IpcError::BadFrame("string length out of bounds"));
    }
    let s = String::from_utf8_lossy(&buf[4..4 + len]).into_owned();
    Ok((s, 4 + len + 1))
}

/// Serialized size of `s` as a UTF-16 string payload.
pub fn wstr_serialized_len(s: &str) -> usize {
    4 + s.encode_utf16().count() * 2 + 2
}

/// Write `s` as a length-prefixed, NUL-terminated UTF-16 string. Returns
/// the bytes written.
pub fn put_wstr(buf: &mut [u8], s: &str) -> usize {
    let mut pos = 4;
    let mut count = 0u32;
    for unit in s.encode_utf16() {
        buf[pos..pos + 2].copy_from_slice(&unit.to_le_bytes());
        pos += 2;
        count += 1;
    }
    buf[0..4].copy_from_slice(&count.to_le_bytes());
    buf[pos] = 0;
    buf[pos + 1] = 0;
    pos + 2
}

/// Read a length-prefixed UTF-16 string; returns the string and the bytes
/// consumed.
pub fn get_wstr(buf: &[u8]) -> Result<(String, usize), IpcError> {
    if buf.len() < 6 {
        return Err(IpcError::BadFrame("truncated string"));
    }
    let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    if len > MAX_STRING_LEN || buf.len() < 4 + len * 2 + 2 {
        return Err(IpcError::BadFrame("string length out of bounds"));
    }
    let units: Vec<u16> = buf[4..4 + len * 2]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok((String::from_utf16_lossy(&units), 4 + len * 2 + 2))
}
