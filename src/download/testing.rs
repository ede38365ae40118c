//! 测试用的脚本化下载器：不启动任何外部进程。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::backend::{MediaBackend, TickControl, TransferRequest, TransferTick};
use super::models::{EngineError, Job, VideoMeta};
use crate::base_system::tool_locator::Toolchain;

#[derive(Debug, Clone)]
pub(crate) struct Script {
    pub title: String,
    pub metadata_error: Option<String>,
    pub transfer_error: Option<EngineError>,
    /// 下载阶段回调的次数
    pub ticks: usize,
    pub tick_delay: Duration,
    /// 一直回调直到收到 `Abort`
    pub until_abort: bool,
    /// 第 N 次回调前对挂接的任务发出取消
    pub cancel_after_ticks: Option<usize>,
    /// 传输成功返回前对挂接的任务发出取消
    pub cancel_at_end: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            title: "Scripted clip".to_string(),
            metadata_error: None,
            transfer_error: None,
            ticks: 4,
            tick_delay: Duration::ZERO,
            until_abort: false,
            cancel_after_ticks: None,
            cancel_at_end: false,
        }
    }
}

pub(crate) struct ScriptedBackend {
    script: Script,
    cancel_target: Mutex<Option<Arc<Job>>>,
    requests: Mutex<Vec<TransferRequest>>,
    metadata_calls: AtomicUsize,
    ticks_delivered: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedBackend {
    pub(crate) fn new(script: Script) -> Self {
        Self {
            script,
            cancel_target: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            metadata_calls: AtomicUsize::new(0),
            ticks_delivered: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub(crate) fn attach_cancel(&self, job: Arc<Job>) {
        *self.cancel_target.lock().unwrap() = Some(job);
    }

    pub(crate) fn last_request(&self) -> Option<TransferRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub(crate) fn transfer_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn ticks_delivered(&self) -> usize {
        self.ticks_delivered.load(Ordering::SeqCst)
    }

    /// 同时处于传输中的最大任务数。
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn cancel_attached(&self) {
        if let Some(job) = self.cancel_target.lock().unwrap().as_ref() {
            job.request_cancel();
        }
    }

    fn play(&self, on_tick: &mut dyn FnMut(TransferTick) -> TickControl) -> Result<(), EngineError> {
        let total = 1000 * self.script.ticks.max(1) as u64;
        let mut i = 0usize;
        loop {
            let limit = if self.script.until_abort { 100_000 } else { self.script.ticks };
            if i >= limit {
                break;
            }
            if self.script.cancel_after_ticks == Some(i) {
                self.cancel_attached();
            }
            self.ticks_delivered.fetch_add(1, Ordering::SeqCst);
            let tick = TransferTick::Downloading {
                downloaded: ((i as u64 + 1) * 1000).min(total),
                total: Some(total),
                speed: Some(1000.0),
                eta: Some((self.script.ticks.saturating_sub(i + 1)) as u64),
                filename: Some("clip.f137.mp4".to_string()),
            };
            if on_tick(tick) == TickControl::Abort {
                return Err(EngineError::Cancelled);
            }
            if !self.script.tick_delay.is_zero() {
                thread::sleep(self.script.tick_delay);
            }
            i += 1;
        }

        if let Some(err) = self.script.transfer_error.clone() {
            return Err(err);
        }
        for tick in [
            TransferTick::StreamFinished {
                filename: Some("clip.f137.mp4".to_string()),
            },
            TransferTick::Finished,
        ] {
            if on_tick(tick) == TickControl::Abort {
                return Err(EngineError::Cancelled);
            }
        }
        if self.script.cancel_at_end {
            self.cancel_attached();
        }
        Ok(())
    }
}

impl MediaBackend for ScriptedBackend {
    fn fetch_metadata(&self, _url: &str, _tools: &Toolchain) -> Result<VideoMeta, EngineError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        match &self.script.metadata_error {
            Some(msg) => Err(EngineError::MetadataFetchFailed(msg.clone())),
            None => Ok(VideoMeta {
                title: self.script.title.clone(),
                ..VideoMeta::default()
            }),
        }
    }

    fn transfer(
        &self,
        request: &TransferRequest,
        _tools: &Toolchain,
        on_tick: &mut dyn FnMut(TransferTick) -> TickControl,
    ) -> Result<(), EngineError> {
        self.requests.lock().unwrap().push(request.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.play(on_tick);
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
