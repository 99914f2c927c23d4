use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    Queued,
    Extracting,
    Validating,
    BranchCheck,
    Uploading,
    Success,
    Error,
    Idle,
}

impl SyncPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Extracting => "extracting",
            Self::Validating => "validating",
            Self::BranchCheck => "branch-check",
            Self::Uploading => "uploading",
            Self::Success => "success",
            Self::Error => "error",
            Self::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub phase: SyncPhase,
    pub percent: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_done: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_total: Option<u64>,
}

impl UploadProgress {
    pub fn new(phase: SyncPhase, percent: u8, message: impl Into<String>) -> Self {
        Self {
            phase,
            percent: percent.min(100),
            message: message.into(),
            files_done: None,
            files_total: None,
        }
    }

    pub fn idle() -> Self {
        Self::new(SyncPhase::Idle, 0, "")
    }

    pub fn with_files(mut self, done: u64, total: u64) -> Self {
        self.files_done = Some(done);
        self.files_total = Some(total);
        self
    }
}

/// Share of the overall progress budget reserved for per-file uploads.
pub const UPLOAD_PERCENT_START: u8 = 20;
pub const UPLOAD_PERCENT_END: u8 = 90;

/// Linear map of completed files into the upload sub-range.
pub fn upload_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return UPLOAD_PERCENT_END;
    }
    let span = u64::from(UPLOAD_PERCENT_END - UPLOAD_PERCENT_START);
    let done = done.min(total);
    UPLOAD_PERCENT_START + (done * span / total) as u8
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: UploadProgress);
}

/// Records every event, for tests and for the CLI's final summary.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<UploadProgress>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UploadProgress> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<UploadProgress> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }
}

impl ProgressSink for RecordingSink {
    fn on_progress(&self, progress: UploadProgress) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(progress);
    }
}
