//! 任务事件与订阅者（EventSink）。
//!
//! 下载线程只负责把事件写入一个有界队列；由单独的分发线程按写入顺序
//! 依次交给所有订阅者，因此同一任务的事件顺序与产生顺序一致。

use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

use crossbeam_channel as channel;
use tracing::{debug, info, warn};

use super::models::{JobState, ProgressUpdate};
use crate::base_system::tool_locator::PreflightReport;

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Preflight(PreflightReport),
    Title {
        id: String,
        title: String,
    },
    Progress {
        id: String,
        update: ProgressUpdate,
    },
    Status {
        id: String,
        message: String,
    },
    Terminal {
        id: String,
        state: JobState,
        error: Option<String>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Preflight(_) => None,
            Self::Title { id, .. }
            | Self::Progress { id, .. }
            | Self::Status { id, .. }
            | Self::Terminal { id, .. } => Some(id),
        }
    }
}

/// 事件订阅者。回调在分发线程上执行，不应长时间阻塞。
pub trait EventSink: Send + Sync {
    fn on_preflight(&self, _report: &PreflightReport) {}
    fn on_title(&self, id: &str, title: &str);
    fn on_progress(&self, id: &str, update: &ProgressUpdate);
    fn on_status(&self, id: &str, message: &str);
    fn on_terminal(&self, id: &str, state: JobState, error: Option<&str>);
}

pub type SinkList = Arc<RwLock<Vec<Arc<dyn EventSink>>>>;

pub fn deliver(sink: &dyn EventSink, event: &JobEvent) {
    match event {
        JobEvent::Preflight(report) => sink.on_preflight(report),
        JobEvent::Title { id, title } => sink.on_title(id, title),
        JobEvent::Progress { id, update } => sink.on_progress(id, update),
        JobEvent::Status { id, message } => sink.on_status(id, message),
        JobEvent::Terminal { id, state, error } => sink.on_terminal(id, *state, error.as_deref()),
    }
}

/// 事件队列的写端。队列满时阻塞写入者，分发线程退出后静默丢弃。
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: channel::Sender<JobEvent>,
}

impl EventSender {
    pub fn bounded(capacity: usize) -> (Self, channel::Receiver<JobEvent>) {
        let (tx, rx) = channel::bounded(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: JobEvent) {
        if self.tx.send(event).is_err() {
            debug!(target: "orchestrator", "event dropped: dispatcher stopped");
        }
    }

    pub fn status(&self, id: &str, message: impl Into<String>) {
        self.emit(JobEvent::Status {
            id: id.to_string(),
            message: message.into(),
        });
    }
}

/// 启动分发线程；所有写端都被丢弃后线程退出，`done` 随之断开。
pub fn spawn_dispatcher(
    rx: channel::Receiver<JobEvent>,
    sinks: SinkList,
    done: channel::Sender<()>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("event-dispatch".to_string())
        .spawn(move || {
            let _done = done;
            for event in rx.iter() {
                let current: Vec<Arc<dyn EventSink>> = sinks
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for sink in &current {
                    deliver(sink.as_ref(), &event);
                }
            }
        })
}

/// 把事件原样转发到一个 channel，便于在其他线程上消费。
pub struct ChannelSink {
    tx: channel::Sender<JobEvent>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, channel::Receiver<JobEvent>) {
        let (tx, rx) = channel::unbounded();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_preflight(&self, report: &PreflightReport) {
        self.forward(JobEvent::Preflight(report.clone()));
    }

    fn on_title(&self, id: &str, title: &str) {
        self.forward(JobEvent::Title {
            id: id.to_string(),
            title: title.to_string(),
        });
    }

    fn on_progress(&self, id: &str, update: &ProgressUpdate) {
        self.forward(JobEvent::Progress {
            id: id.to_string(),
            update: update.clone(),
        });
    }

    fn on_status(&self, id: &str, message: &str) {
        self.forward(JobEvent::Status {
            id: id.to_string(),
            message: message.to_string(),
        });
    }

    fn on_terminal(&self, id: &str, state: JobState, error: Option<&str>) {
        self.forward(JobEvent::Terminal {
            id: id.to_string(),
            state,
            error: error.map(str::to_string),
        });
    }
}

/// 只写日志的订阅者（Web 模式下使用，进度事件不记录）。
pub struct LogSink;

impl EventSink for LogSink {
    fn on_preflight(&self, report: &PreflightReport) {
        for w in &report.warnings {
            warn!(target: "orchestrator", "{w}");
        }
    }

    fn on_title(&self, id: &str, title: &str) {
        info!(target: "orchestrator", id, "标题: {title}");
    }

    fn on_progress(&self, _id: &str, _update: &ProgressUpdate) {}

    fn on_status(&self, id: &str, message: &str) {
        debug!(target: "orchestrator", id, "{message}");
    }

    fn on_terminal(&self, id: &str, state: JobState, error: Option<&str>) {
        match error {
            Some(e) => warn!(target: "orchestrator", id, "任务结束: {} ({e})", state.label()),
            None => info!(target: "orchestrator", id, "任务结束: {}", state.label()),
        }
    }
}
