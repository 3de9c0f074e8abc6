//! Wire frames of the live-sync socket: `{type, timestamp, payload}`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    InvalidFrame(String),
    #[error("unsafe path '{0}'")]
    InvalidPath(String),
    #[error("chunk {index} outside 0..{total_chunks}")]
    InvalidChunk { index: i64, total_chunks: i64 },
    #[error("checksum mismatch for '{0}'")]
    ChecksumMismatch(String),
    #[error("'{path}' exceeds {limit} bytes")]
    FileTooLarge { path: String, limit: usize },
    #[error("{0}")]
    WriteFailed(String),
    #[error("more than {limit} {what} in flight")]
    TooManyInFlight { what: &'static str, limit: usize },
}

impl ProtocolError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFrame(_) => "invalid_frame",
            Self::InvalidPath(_) => "invalid_path",
            Self::InvalidChunk { .. } => "invalid_chunk",
            Self::ChecksumMismatch(_) => "checksum_mismatch",
            Self::FileTooLarge { .. } => "file_too_large",
            Self::WriteFailed(_) => "write_failed",
            Self::TooManyInFlight { .. } => "too_many_in_flight",
        }
    }

    /// Broken framing ends the session; per-file failures only fail the file.
    #[must_use]
    pub fn closes_session(&self) -> bool {
        matches!(
            self,
            Self::InvalidFrame(_) | Self::InvalidChunk { .. } | Self::TooManyInFlight { .. }
        )
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileChange {
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub checksum: String,
    pub operation: FileOperation,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct RawChunk {
    path: String,
    index: i64,
    total_chunks: i64,
    checksum: String,
    data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub path: String,
    pub index: i64,
    pub total_chunks: i64,
    pub checksum: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileDelete {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    FileChange(FileChange),
    FileContent(FileChunk),
    FileDelete(FileDelete),
    Ping,
}

impl ClientMessage {
    /// # Errors
    /// Returns `InvalidFrame` for unknown types or payloads of the wrong shape.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let frame = serde_json::from_str::<RawFrame>(text)
            .map_err(|error| ProtocolError::InvalidFrame(error.to_string()))?;
        let invalid = |error: serde_json::Error| ProtocolError::InvalidFrame(format!("{}: {error}", frame.kind));

        match frame.kind.as_str() {
            "ping" => Ok(Self::Ping),
            "file_change" => serde_json::from_value(frame.payload.clone())
                .map(Self::FileChange)
                .map_err(invalid),
            "file_delete" => serde_json::from_value(frame.payload.clone())
                .map(Self::FileDelete)
                .map_err(invalid),
            "file_content" => {
                let raw = serde_json::from_value::<RawChunk>(frame.payload.clone()).map_err(invalid)?;
                let bytes = STANDARD
                    .decode(raw.data.as_bytes())
                    .map_err(|error| ProtocolError::InvalidFrame(format!("chunk data: {error}")))?;
                Ok(Self::FileContent(FileChunk {
                    path: raw.path,
                    index: raw.index,
                    total_chunks: raw.total_chunks,
                    checksum: raw.checksum,
                    bytes,
                }))
            }
            other => Err(ProtocolError::InvalidFrame(format!("unknown frame type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: i64,
    pub payload: Value,
}

impl ServerFrame {
    fn new(kind: &'static str, payload: Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now().timestamp_millis(),
            payload,
        }
    }

    #[must_use]
    pub fn pong() -> Self {
        Self::new("pong", Value::Null)
    }

    #[must_use]
    pub fn ack(path: &str, checksum: &str) -> Self {
        Self::new("ack", json!({ "path": path, "checksum": checksum }))
    }

    #[must_use]
    pub fn error(code: &str, message: &str, path: Option<&str>) -> Self {
        Self::new("error", json!({ "code": code, "message": message, "path": path }))
    }

    #[must_use]
    pub fn from_error(error: &ProtocolError, path: Option<&str>) -> Self {
        Self::error(error.code(), &error.to_string(), path)
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","timestamp":0,"payload":null}"#.to_string())
    }
}
