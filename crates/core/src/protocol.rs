use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::progress::UploadProgress;
use crate::{Error, Result};

/// Largest NDJSON frame accepted on a channel. Fits a maximum-size archive
/// after base64 expansion plus the envelope.
pub const MAX_FRAME_BYTES: usize = 72 * 1024 * 1024;

/// Unit exchanged over a [`ConnectionChannel`](crate::channel::ConnectionChannel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Message {
    // UI -> background
    ArchiveReady(ArchiveReady),
    SetCommitMessage { message: String },
    ContentScriptReady,
    DebugLog { level: LogLevel, message: String },

    // background -> UI
    UploadStatus(UploadProgress),
    SettingsChanged { version: u64, ready: bool },
    Rejected { code: String, message: String },
    HostShutdown,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ArchiveReady(_) => "archive-ready",
            Self::SetCommitMessage { .. } => "set-commit-message",
            Self::ContentScriptReady => "content-script-ready",
            Self::DebugLog { .. } => "debug-log",
            Self::UploadStatus(_) => "upload-status",
            Self::SettingsChanged { .. } => "settings-changed",
            Self::Rejected { .. } => "rejected",
            Self::HostShutdown => "host-shutdown",
        }
    }

    pub fn rejected(err: &Error) -> Self {
        Self::Rejected {
            code: err.code().to_string(),
            message: err.user_message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveReady {
    /// Archive bytes, base64 (standard alphabet, padded).
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Configuration version the sender last saw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_version: Option<u64>,
}

impl ArchiveReady {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            commit_message: None,
            project_id: None,
            config_version: None,
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(self.data.trim())
            .map_err(|e| Error::Protocol {
                message: format!("archive data is not valid base64: {e}"),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One message as a single JSON line, newline included.
pub fn encode_line(message: &Message) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message).map_err(|e| Error::Protocol {
        message: format!("encode {} failed: {e}", message.kind()),
    })?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_line(line: &[u8]) -> Result<Message> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    serde_json::from_slice(line).map_err(|e| Error::Protocol {
        message: format!("invalid message: {e}"),
    })
}
