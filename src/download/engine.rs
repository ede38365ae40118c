//! 单个任务的下载主流程：获取信息 → 下载 → 后处理 → 终态。
//!
//! 引擎捕获所有错误并转换为任务终态，调度器只会看到终态事件。

use std::fs;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use super::backend::{
    AcceleratorSpec, MediaBackend, OUTPUT_CONTAINER, OUTPUT_TEMPLATE, PostProcessSpec, TickControl,
    TransferRequest, TransferTick,
};
use super::events::{EventSender, JobEvent};
use super::models::{EngineError, Job, JobState, VideoMeta};
use super::progress::ProgressReporter;
use super::ytdlp::describe_destination;
use crate::base_system::tool_locator::{ACCELERATOR, TRANSCODER, Toolchain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// aria2c 每服务器连接数 / 分片数 / 并发数
    pub accelerator_connections: u32,
    pub audio_bitrate_kbps: u32,
    /// 缺少转码器时直接失败，而不是退化为单文件下载
    pub require_transcoder: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            accelerator_connections: 16,
            audio_bitrate_kbps: 192,
            require_transcoder: false,
        }
    }
}

pub struct Engine {
    backend: Arc<dyn MediaBackend>,
    tools: Toolchain,
    settings: EngineSettings,
    events: EventSender,
}

impl Engine {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        tools: Toolchain,
        settings: EngineSettings,
        events: EventSender,
    ) -> Self {
        Self {
            backend,
            tools,
            settings,
            events,
        }
    }

    /// 只取影片信息并写入标题。失败时任务进入 `Failed`。
    pub fn fetch_metadata(&self, job: &Arc<Job>) -> Result<VideoMeta, EngineError> {
        match self.backend.fetch_metadata(&job.id, &self.tools) {
            Ok(meta) => {
                if job.set_title(&meta.title) {
                    self.events.emit(JobEvent::Title {
                        id: job.id.clone(),
                        title: job.title(),
                    });
                }
                Ok(meta)
            }
            Err(err) => {
                let err = match err {
                    _ if job.is_cancel_requested() => EngineError::Cancelled,
                    EngineError::MetadataFetchFailed(_) | EngineError::Cancelled => err,
                    other => EngineError::MetadataFetchFailed(other.to_string()),
                };
                self.finish(job, Err(err.clone()));
                Err(err)
            }
        }
    }

    /// 驱动一个任务直到终态，返回最终状态。
    pub fn run(&self, job: &Arc<Job>) -> JobState {
        if job.is_cancel_requested() {
            return self.finish(job, Err(EngineError::Cancelled));
        }
        if !job.transition(JobState::FetchingMetadata) {
            // 已在别处结束（例如排队时被取消）
            return job.state();
        }
        self.status(job, "正在获取影片信息...");

        let meta = match self.fetch_metadata(job) {
            Ok(meta) => meta,
            Err(_) => return job.state(),
        };
        if job.is_cancel_requested() {
            return self.finish(job, Err(EngineError::Cancelled));
        }

        let result = self.download(job, &meta);
        self.finish(job, result)
    }

    pub fn cancel(&self, job: &Job) -> bool {
        job.request_cancel()
    }

    fn download(&self, job: &Arc<Job>, meta: &VideoMeta) -> Result<(), EngineError> {
        fs::create_dir_all(&job.destination).map_err(|e| {
            EngineError::TransferFailed(format!(
                "cannot create {}: {e}",
                job.destination.display()
            ))
        })?;

        let request = self.build_request(job)?;
        if !job.transition(JobState::Downloading) {
            return Err(EngineError::Cancelled);
        }
        let title = if meta.title.is_empty() {
            job.id.as_str()
        } else {
            meta.title.as_str()
        };
        self.status(job, &format!("开始下载: {title}"));

        let chain = if request.post_process.is_some() {
            job.quality.format_chain()
        } else {
            job.quality.combined_chain()
        };
        match chain.resolve(&meta.formats) {
            Some(resolved) => debug!(
                target: "engine",
                id = %job.id,
                tier = resolved.tier_index,
                formats = ?resolved.format_ids,
                "predicted format"
            ),
            None => debug!(target: "engine", id = %job.id, "no format prediction available"),
        }

        if job.use_accelerator {
            if request.accelerator.is_some() {
                self.status(job, &format!("使用 {ACCELERATOR} 加速下载中..."));
            } else {
                self.status(job, &format!("{ACCELERATOR} 未找到，使用预设下载器..."));
            }
        } else {
            self.status(job, "下载中...");
        }
        debug!(target: "engine", id = %job.id, output = %describe_destination(&request).display(), "transfer start");

        let cancel = job.cancel_token();
        let mut reporter = ProgressReporter::new(job.clone(), self.events.clone());
        let mut on_tick = |tick: TransferTick| {
            if cancel.load(Ordering::SeqCst) {
                return TickControl::Abort;
            }
            match tick {
                TransferTick::Downloading {
                    downloaded,
                    total,
                    speed,
                    eta,
                    filename,
                } => reporter.downloading(downloaded, total, speed, eta, filename),
                TransferTick::StreamFinished { filename } => reporter.stream_finished(filename),
                TransferTick::Finished => reporter.enter_processing(),
                TransferTick::Status(message) => reporter.status(&message),
            }
            TickControl::Continue
        };
        let outcome = self.backend.transfer(&request, &self.tools, &mut on_tick);

        // 传输结束后才到达的取消同样生效
        if job.is_cancel_requested() {
            return Err(EngineError::Cancelled);
        }
        outcome?;
        reporter.enter_processing();
        Ok(())
    }

    pub(crate) fn build_request(&self, job: &Job) -> Result<TransferRequest, EngineError> {
        let transcoder = self.tools.transcoder.as_ref();
        if transcoder.is_none() && self.settings.require_transcoder {
            return Err(EngineError::PostProcessFailed(format!(
                "{TRANSCODER} is required but was not found"
            )));
        }

        let (format, merge_container, post_process) = match transcoder {
            Some(tool) => (
                job.quality.format_chain().expression(),
                Some(OUTPUT_CONTAINER.to_string()),
                Some(PostProcessSpec::remux_with_aac(
                    OUTPUT_CONTAINER,
                    self.settings.audio_bitrate_kbps,
                    Some(tool.path.clone()),
                )),
            ),
            None => (job.quality.combined_chain().expression(), None, None),
        };

        let accelerator = if job.use_accelerator {
            self.tools
                .accelerator
                .as_ref()
                .map(|tool| AcceleratorSpec::aria2c(tool.path.clone(), self.settings.accelerator_connections))
        } else {
            None
        };

        Ok(TransferRequest {
            url: job.id.clone(),
            destination: job.destination.clone(),
            output_template: OUTPUT_TEMPLATE.to_string(),
            format,
            merge_container,
            post_process,
            accelerator,
        })
    }

    fn status(&self, job: &Job, message: &str) {
        job.set_status(message);
        self.events.status(&job.id, message);
    }

    /// 把结果写成终态并发出终态事件；任务已是终态时不重复发出。
    fn finish(&self, job: &Job, result: Result<(), EngineError>) -> JobState {
        let moved = match &result {
            Ok(()) => job.transition(JobState::Completed),
            Err(EngineError::Cancelled) => job.transition(JobState::Cancelled),
            Err(err) => job.fail(err.to_string()),
        };
        if !moved {
            return job.state();
        }

        let state = job.state();
        match &result {
            Ok(()) => {
                info!(target: "engine", id = %job.id, "下载完成: {}", job.title());
                self.status(job, "下载完成!");
            }
            Err(EngineError::Cancelled) => {
                info!(target: "engine", id = %job.id, "已取消");
                self.status(job, "已取消");
            }
            Err(err) => {
                warn!(target: "engine", id = %job.id, "下载失败: {err}");
                self.status(job, &format!("下载失败: {err}"));
            }
        }
        self.events.emit(JobEvent::Terminal {
            id: job.id.clone(),
            state,
            error: job.error(),
        });
        state
    }
}
