//! 进度上报：把下载器的原始回调换算成任务进度并发出事件。

use std::sync::Arc;

use super::events::{EventSender, JobEvent};
use super::models::{Job, Progress, ProgressPhase, ProgressUpdate};

/// 已知总大小时按 `downloaded / total * 100` 计算，否则为 0。
pub fn percent_of(downloaded: u64, total: Option<u64>) -> f64 {
    match total {
        Some(t) if t > 0 => (downloaded as f64 / t as f64 * 100.0).clamp(0.0, 100.0),
        _ => 0.0,
    }
}

pub(crate) struct ProgressReporter {
    job: Arc<Job>,
    events: EventSender,
    filename: Option<String>,
    processing: bool,
}

impl ProgressReporter {
    pub(crate) fn new(job: Arc<Job>, events: EventSender) -> Self {
        Self {
            job,
            events,
            filename: None,
            processing: false,
        }
    }

    fn emit(&self, progress: Progress, phase: ProgressPhase) {
        self.events.emit(JobEvent::Progress {
            id: self.job.id.clone(),
            update: ProgressUpdate {
                progress,
                filename: self.filename.clone(),
                phase,
            },
        });
    }

    pub(crate) fn downloading(
        &mut self,
        downloaded: u64,
        total: Option<u64>,
        speed: Option<f64>,
        eta: Option<u64>,
        filename: Option<String>,
    ) {
        if filename.is_some() {
            self.filename = filename;
        }
        let raw = Progress {
            percent: percent_of(downloaded, total),
            downloaded_bytes: downloaded,
            total_bytes: total,
            speed_bytes_per_sec: speed,
            eta_seconds: eta,
        };
        if let Some(saved) = self.job.update_progress(raw, self.filename.as_deref()) {
            self.emit(saved, ProgressPhase::Downloading);
        }
    }

    pub(crate) fn stream_finished(&mut self, filename: Option<String>) {
        if filename.is_some() {
            self.filename = filename;
        }
        self.status("正在合并/转档...");
    }

    /// 传输结束，进入后处理。重复调用无效果。
    pub(crate) fn enter_processing(&mut self) {
        if self.processing {
            return;
        }
        self.processing = true;
        if let Some(progress) = self.job.enter_post_processing() {
            self.emit(progress, ProgressPhase::Processing);
            self.status("正在合并/转档...");
        }
    }

    pub(crate) fn status(&self, message: &str) {
        self.job.set_status(message);
        self.events.status(&self.job.id, message);
    }
}
