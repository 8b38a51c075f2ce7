//! Task/result envelopes and the framed wire protocol spoken between the
//! front-end pool and worker processes.
//!
//! Everything crossing the process boundary is an explicitly tagged serde
//! type serialized with bincode, so a payload shape mismatch fails loudly at
//! decode time instead of as a missing dictionary key.

use std::io::{self, Read, Write};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Bumped on any incompatible change to the envelope types below.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a single frame (a screenshot payload is a few MB at most).
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Recognition request payload. Opaque to the pool; consumed by workers.
///
/// Exactly one of `image_base64` / `image_path` is expected. When both are
/// present the base64 data wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrRequest {
    pub image_base64: Option<String>,
    pub image_path: Option<String>,
    /// Optional `[x, y, w, h]` crop applied before recognition. Negative
    /// origins are clamped to the image.
    pub region: Option<[i64; 4]>,
    /// Keep only lines whose text contains this substring.
    pub target_text: Option<String>,
    /// Downscale so the longer image side does not exceed this.
    pub max_side: Option<u32>,
    pub use_angle_cls: bool,
    /// Detection-side resize limit handed to the engine.
    pub limit_side_len: Option<u32>,
}

impl OcrRequest {
    /// True if the request carries any image source at all.
    pub fn has_image_source(&self) -> bool {
        self.image_base64.is_some() || self.image_path.is_some()
    }
}

/// One recognized text line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    pub text: String,
    pub confidence: f32,
    /// Four `[x, y]` corner points of the detected box.
    #[serde(rename = "box")]
    pub points: [[f32; 2]; 4],
}

/// Task-level failure classes. Each maps to a fixed HTTP status at the
/// service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Malformed or missing input (bad base64, degenerate region, no image).
    Decode,
    /// Referenced image path does not exist.
    NotFound,
    /// The worker failed to load its model state and is degraded.
    Init,
    /// Anything else raised while handling the task.
    Internal,
}

impl FailureKind {
    pub fn http_status(self) -> u16 {
        match self {
            FailureKind::Decode => 400,
            FailureKind::NotFound => 404,
            FailureKind::Init | FailureKind::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of one task: either the recognized lines or a structured failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Success(Vec<TextLine>),
    Failure(TaskFailure),
}

/// A submitted task, tagged with its correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub request: OcrRequest,
}

/// What a worker reads off its pipe: a task, or the shutdown sentinel.
/// `Stop` produces no result envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerRequest {
    Task(TaskEnvelope),
    Stop,
}

/// What a worker writes back. Carries the original correlation id so the
/// collector can route it to the waiting caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub id: Uuid,
    pub outcome: TaskOutcome,
}

/// Write one framed message: version byte, u32-LE body length, bincode body.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> io::Result<()> {
    let body = bincode::serialize(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if body.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", body.len()),
        ));
    }
    writer.write_all(&[PROTOCOL_VERSION])?;
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()
}

/// Read one framed message. `UnexpectedEof` on the version byte means the
/// peer closed the pipe cleanly.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != PROTOCOL_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "protocol version mismatch: got {}, expected {}",
                version[0], PROTOCOL_VERSION
            ),
        ));
    }
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    bincode::deserialize(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip_preserves_envelope() {
        let envelope = ResultEnvelope {
            id: Uuid::new_v4(),
            outcome: TaskOutcome::Success(vec![TextLine {
                text: "hello".into(),
                confidence: 0.97,
                points: [[0.0, 0.0], [10.0, 0.0], [10.0, 5.0], [0.0, 5.0]],
            }]),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &envelope).unwrap();

        let decoded: ResultEnvelope = read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.id, envelope.id);
        assert_eq!(decoded.outcome, envelope.outcome);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &WorkerRequest::Stop).unwrap();
        buf[0] = PROTOCOL_VERSION + 1;

        let err = read_frame::<_, WorkerRequest>(&mut buf.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn eof_surfaces_as_unexpected_eof() {
        let err = read_frame::<_, WorkerRequest>(&mut [].as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn text_line_uses_box_as_json_key() {
        let line = TextLine {
            text: "score".into(),
            confidence: 0.5,
            points: [[1.0, 2.0], [3.0, 2.0], [3.0, 4.0], [1.0, 4.0]],
        };
        let json = serde_json::to_value(&line).unwrap();
        assert!(json.get("box").is_some());
        assert!(json.get("points").is_none());
    }

    #[test]
    fn failure_kinds_map_to_expected_statuses() {
        assert_eq!(FailureKind::Decode.http_status(), 400);
        assert_eq!(FailureKind::NotFound.http_status(), 404);
        assert_eq!(FailureKind::Init.http_status(), 500);
        assert_eq!(FailureKind::Internal.http_status(), 500);
    }
}
