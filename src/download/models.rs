//! 下载相关的数据模型定义。
//!
//! 包含任务（Job）及其状态机、进度、提交选项、影片元数据与错误类型。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::quality::Quality;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownloadResult {
    pub success: u32,
    pub failed: u32,
    pub canceled: u32,
}

impl DownloadResult {
    pub fn record(&mut self, state: JobState) {
        match state {
            JobState::Completed => self.success += 1,
            JobState::Failed => self.failed += 1,
            JobState::Cancelled => self.canceled += 1,
            _ => {}
        }
    }

    pub fn total(&self) -> u32 {
        self.success + self.failed + self.canceled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    FetchingMetadata,
    Downloading,
    PostProcessing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// 非终态在生命周期中的先后顺序。
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::FetchingMetadata => 1,
            Self::Downloading => 2,
            Self::PostProcessing => 3,
            Self::Completed | Self::Failed | Self::Cancelled => 4,
        }
    }

    /// 是否允许从 `self` 迁移到 `next`：终态不可离开；失败/取消可从任意非终态进入；
    /// 其余只能前进。
    pub fn can_advance_to(self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed | Self::Cancelled => true,
            _ => next.rank() > self.rank(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "等待中",
            Self::FetchingMetadata => "获取信息",
            Self::Downloading => "下载中",
            Self::PostProcessing => "处理中",
            Self::Completed => "已完成",
            Self::Failed => "失败",
            Self::Cancelled => "已取消",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Progress {
    pub percent: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed_bytes_per_sec: Option<f64>,
    pub eta_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Downloading,
    Processing,
}

/// 一次进度事件的内容。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub progress: Progress,
    pub filename: Option<String>,
    pub phase: ProgressPhase,
}

/// 一次提交的公共参数。
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub quality: Quality,
    pub destination: PathBuf,
    pub use_accelerator: bool,
}

impl SubmitOptions {
    pub fn new(quality: Quality, destination: PathBuf, use_accelerator: bool) -> Self {
        Self {
            quality,
            destination,
            use_accelerator,
        }
    }
}

#[derive(Debug, Clone)]
struct JobRecord {
    state: JobState,
    title: String,
    progress: Progress,
    filename: Option<String>,
    status: String,
    error: Option<String>,
    updated_ms: u64,
}

/// 一个 URL 的下载任务。
///
/// 可变字段只由驱动它的下载线程写入；调度器与界面只读快照。
/// 取消标记是唯一的例外，任何线程都可以设置。
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub quality: Quality,
    pub destination: PathBuf,
    pub use_accelerator: bool,
    pub created_ms: u64,
    cancel: Arc<AtomicBool>,
    record: Mutex<JobRecord>,
}

impl Job {
    pub fn new(id: String, options: &SubmitOptions) -> Self {
        let now = now_ms();
        Self {
            id,
            quality: options.quality,
            destination: options.destination.clone(),
            use_accelerator: options.use_accelerator,
            created_ms: now,
            cancel: Arc::new(AtomicBool::new(false)),
            record: Mutex::new(JobRecord {
                state: JobState::Pending,
                title: String::new(),
                progress: Progress::default(),
                filename: None,
                status: String::new(),
                error: None,
                updated_ms: now,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn title(&self) -> String {
        self.lock().title.clone()
    }

    pub fn progress(&self) -> Progress {
        self.lock().progress
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    /// 迁移状态；不允许的迁移（回退、离开终态）返回 `false` 且不做任何修改。
    pub fn transition(&self, next: JobState) -> bool {
        let mut rec = self.lock();
        if !rec.state.can_advance_to(next) {
            return false;
        }
        if next == JobState::Downloading {
            rec.progress = Progress::default();
        }
        rec.state = next;
        rec.updated_ms = now_ms();
        true
    }

    /// 进入 `Failed` 并记录错误信息。
    pub fn fail(&self, message: impl Into<String>) -> bool {
        let mut rec = self.lock();
        if !rec.state.can_advance_to(JobState::Failed) {
            return false;
        }
        rec.state = JobState::Failed;
        rec.error = Some(message.into());
        rec.updated_ms = now_ms();
        true
    }

    /// 标题只设置一次，之后的调用被忽略。
    pub fn set_title(&self, title: &str) -> bool {
        let mut rec = self.lock();
        if !rec.title.is_empty() {
            return false;
        }
        rec.title = title.trim().to_string();
        rec.updated_ms = now_ms();
        !rec.title.is_empty()
    }

    pub fn set_status(&self, status: &str) {
        let mut rec = self.lock();
        rec.status = status.to_string();
        rec.updated_ms = now_ms();
    }

    /// 写入一次下载进度。只在 `Downloading` 中生效；百分比不会倒退。
    /// 返回实际保存的进度。
    pub fn update_progress(&self, mut progress: Progress, filename: Option<&str>) -> Option<Progress> {
        let mut rec = self.lock();
        if rec.state != JobState::Downloading {
            return None;
        }
        progress.percent = progress.percent.clamp(0.0, 100.0).max(rec.progress.percent);
        rec.progress = progress;
        if let Some(name) = filename {
            rec.filename = Some(name.to_string());
        }
        rec.updated_ms = now_ms();
        Some(progress)
    }

    /// 进入后处理：百分比固定为 100。
    pub fn enter_post_processing(&self) -> Option<Progress> {
        let mut rec = self.lock();
        if !rec.state.can_advance_to(JobState::PostProcessing) {
            return None;
        }
        rec.state = JobState::PostProcessing;
        rec.progress.percent = 100.0;
        rec.progress.eta_seconds = Some(0);
        if let Some(total) = rec.progress.total_bytes {
            rec.progress.downloaded_bytes = rec.progress.downloaded_bytes.max(total);
        }
        rec.updated_ms = now_ms();
        Some(rec.progress)
    }

    /// 设置取消标记。返回这次调用是否是第一次设置。
    pub fn request_cancel(&self) -> bool {
        !self.cancel.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// 尚未被下载线程接手的任务直接进入 `Cancelled`。
    pub fn cancel_if_pending(&self) -> bool {
        let mut rec = self.lock();
        if rec.state != JobState::Pending {
            return false;
        }
        self.cancel.store(true, Ordering::SeqCst);
        rec.state = JobState::Cancelled;
        rec.updated_ms = now_ms();
        true
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let rec = self.lock();
        JobSnapshot {
            id: self.id.clone(),
            title: rec.title.clone(),
            quality: self.quality.name().to_string(),
            destination: self.destination.to_string_lossy().to_string(),
            use_accelerator: self.use_accelerator,
            state: rec.state,
            progress: rec.progress,
            filename: rec.filename.clone(),
            status: rec.status.clone(),
            error: rec.error.clone(),
            cancel_requested: self.cancel.load(Ordering::SeqCst),
            created_ms: self.created_ms,
            updated_ms: rec.updated_ms,
        }
    }
}

/// 任务的只读快照（用于列表显示 / JSON 输出）。
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub title: String,
    pub quality: String,
    pub destination: String,
    pub use_accelerator: bool,
    pub state: JobState,
    pub progress: Progress,
    pub filename: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub created_ms: u64,
    pub updated_ms: u64,
}

/// `yt-dlp --dump-single-json` 输出中用到的部分。
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct VideoMeta {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub formats: Vec<AvailableFormat>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AvailableFormat {
    #[serde(default)]
    pub format_id: String,
    #[serde(default)]
    pub ext: String,
    #[serde(default)]
    pub height: Option<u32>,
    /// `"none"` 表示没有视频流。
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub tbr: Option<f64>,
}

impl AvailableFormat {
    pub fn has_video(&self) -> bool {
        codec_present(self.vcodec.as_deref())
    }

    pub fn has_audio(&self) -> bool {
        codec_present(self.acodec.as_deref())
    }
}

fn codec_present(codec: Option<&str>) -> bool {
    matches!(codec, Some(c) if !c.is_empty() && c != "none")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("metadata fetch failed: {0}")]
    MetadataFetchFailed(String),
    #[error("transfer failed: {0}")]
    TransferFailed(String),
    #[error("post-processing failed: {0}")]
    PostProcessFailed(String),
    #[error("cancelled")]
    Cancelled,
    #[error("tool unavailable: {0}")]
    ToolUnavailable(String),
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            "https://www.youtube.com/watch?v=abc".to_string(),
            &SubmitOptions::new(Quality::P720, PathBuf::from("/tmp/out"), true),
        )
    }

    fn at(percent: f64) -> Progress {
        Progress {
            percent,
            ..Progress::default()
        }
    }

    #[test]
    fn lifecycle_only_moves_forward() {
        let job = job();
        assert!(job.transition(JobState::FetchingMetadata));
        assert!(job.transition(JobState::Downloading));
        assert!(!job.transition(JobState::FetchingMetadata));
        assert!(!job.transition(JobState::Pending));
        assert!(job.transition(JobState::PostProcessing));
        assert!(job.transition(JobState::Completed));
        assert_eq!(job.state(), JobState::Completed);
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let job = job();
        assert!(job.transition(JobState::Cancelled));
        assert!(!job.transition(JobState::Completed));
        assert!(!job.fail("late"));
        assert!(!job.transition(JobState::Failed));
        assert_eq!(job.state(), JobState::Cancelled);
        assert_eq!(job.error(), None);
    }

    #[test]
    fn failure_records_message() {
        let job = job();
        job.transition(JobState::FetchingMetadata);
        assert!(job.fail("boom"));
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.error().as_deref(), Some("boom"));
    }

    #[test]
    fn title_is_set_once() {
        let job = job();
        assert!(job.set_title("First"));
        assert!(!job.set_title("Second"));
        assert_eq!(job.title(), "First");
    }

    #[test]
    fn progress_is_ignored_outside_downloading() {
        let job = job();
        assert_eq!(job.update_progress(at(10.0), None), None);
        job.transition(JobState::FetchingMetadata);
        assert_eq!(job.update_progress(at(10.0), None), None);
    }

    #[test]
    fn percent_never_decreases_while_downloading() {
        let job = job();
        job.transition(JobState::FetchingMetadata);
        job.transition(JobState::Downloading);
        assert_eq!(job.update_progress(at(40.0), Some("a.mp4")).unwrap().percent, 40.0);
        assert_eq!(job.update_progress(at(5.0), Some("b.m4a")).unwrap().percent, 40.0);
        assert_eq!(job.update_progress(at(250.0), None).unwrap().percent, 100.0);
        assert_eq!(job.snapshot().filename.as_deref(), Some("b.m4a"));
    }

    #[test]
    fn post_processing_pins_percent_to_full() {
        let job = job();
        job.transition(JobState::FetchingMetadata);
        job.transition(JobState::Downloading);
        job.update_progress(at(63.0), None);
        let p = job.enter_post_processing().unwrap();
        assert_eq!(p.percent, 100.0);
        assert!(job.enter_post_processing().is_none());
        assert_eq!(job.state(), JobState::PostProcessing);
    }

    #[test]
    fn cancel_flag_is_set_once() {
        let job = job();
        assert!(job.request_cancel());
        assert!(!job.request_cancel());
        assert!(job.is_cancel_requested());
    }

    #[test]
    fn only_pending_jobs_are_cancelled_directly() {
        let pending = job();
        assert!(pending.cancel_if_pending());
        assert_eq!(pending.state(), JobState::Cancelled);

        let running = job();
        running.transition(JobState::FetchingMetadata);
        assert!(!running.cancel_if_pending());
        assert_eq!(running.state(), JobState::FetchingMetadata);
    }

    #[test]
    fn metadata_json_treats_none_codec_as_absent() {
        let raw = r#"{
            "title": "Clip",
            "duration": 12.5,
            "uploader": "someone",
            "formats": [
                {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2", "tbr": 129.5},
                {"format_id": "137", "ext": "mp4", "height": 1080, "vcodec": "avc1", "acodec": "none"},
                {"format_id": "sb0", "ext": "mhtml", "height": null}
            ]
        }"#;
        let meta: VideoMeta = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.title, "Clip");
        assert!(meta.formats[0].has_audio() && !meta.formats[0].has_video());
        assert!(meta.formats[1].has_video() && !meta.formats[1].has_audio());
        assert!(!meta.formats[2].has_video() && !meta.formats[2].has_audio());
    }

    #[test]
    fn result_counts_terminal_states() {
        let mut r = DownloadResult::default();
        for s in [
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
            JobState::Completed,
            JobState::Downloading,
        ] {
            r.record(s);
        }
        assert_eq!(r, DownloadResult { success: 2, failed: 1, canceled: 1 });
        assert_eq!(r.total(), 4);
    }
}
