//! 任务调度：提交去重、固定大小的下载线程池、取消、清理与退出。
//!
//! 每个任务从开始到结束只由一个下载线程驱动；登记表（id → Job）是唯一
//! 会被多个线程同时修改的结构，所有修改都在锁内完成。

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::backend::MediaBackend;
use super::engine::{Engine, EngineSettings};
use super::events::{self, EventSender, EventSink, JobEvent, SinkList};
use super::models::{Job, JobSnapshot, JobState, SubmitOptions};
use crate::base_system::tool_locator::{PreflightReport, Toolchain};
use crate::base_system::video_url::normalize_video_url;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub shutdown_grace: Duration,
    pub event_capacity: usize,
    pub host_markers: Vec<String>,
    pub engine: EngineSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: 6,
            shutdown_grace: Duration::from_secs(3),
            event_capacity: 1024,
            host_markers: vec!["youtube.com".to_string(), "youtu.be".to_string()],
            engine: EngineSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("not a supported video url")]
    InvalidUrl,
    #[error("already queued or downloading")]
    Duplicate,
    #[error("downloader is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejected {
    pub input: String,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubmitOutcome {
    /// 被接受的任务 ID（规范化后的 URL）
    pub accepted: Vec<String>,
    pub rejected: Vec<Rejected>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub cancelled: usize,
    pub abandoned_workers: usize,
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<String, Arc<Job>>,
    order: Vec<String>,
}

struct Worker {
    name: String,
    handle: thread::JoinHandle<()>,
    done: channel::Receiver<()>,
}

pub struct Orchestrator {
    settings: PoolSettings,
    preflight: PreflightReport,
    registry: Mutex<Registry>,
    work_tx: Mutex<Option<channel::Sender<Arc<Job>>>>,
    events: Mutex<Option<EventSender>>,
    sinks: SinkList,
    workers: Mutex<Vec<Worker>>,
    dispatcher: Mutex<Option<Worker>>,
    shutting_down: AtomicBool,
}

impl Orchestrator {
    /// 启动分发线程与 `settings.workers` 个下载线程，并向订阅者发出启动检查结果。
    pub fn start(
        settings: PoolSettings,
        backend: Arc<dyn MediaBackend>,
        tools: Toolchain,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> io::Result<Self> {
        let preflight = tools.preflight(settings.engine.require_transcoder);
        let sinks: SinkList = Arc::new(RwLock::new(sinks));

        let (events, event_rx) = EventSender::bounded(settings.event_capacity);
        let (dispatch_done_tx, dispatch_done_rx) = channel::bounded::<()>(0);
        let dispatch_handle = events::spawn_dispatcher(event_rx, sinks.clone(), dispatch_done_tx)?;
        events.emit(JobEvent::Preflight(preflight.clone()));

        let (work_tx, work_rx) = channel::unbounded::<Arc<Job>>();
        let worker_count = settings.workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let engine = Engine::new(
                backend.clone(),
                tools.clone(),
                settings.engine,
                events.clone(),
            );
            let rx = work_rx.clone();
            let (done_tx, done_rx) = channel::bounded::<()>(0);
            let name = format!("download-{idx}");
            let handle = thread::Builder::new().name(name.clone()).spawn(move || {
                let _done = done_tx;
                for job in rx.iter() {
                    let state = engine.run(&job);
                    debug!(target: "orchestrator", id = %job.id, ?state, "job finished");
                }
            })?;
            workers.push(Worker {
                name,
                handle,
                done: done_rx,
            });
        }
        info!(target: "orchestrator", "下载线程池已启动: {worker_count} 个线程");

        Ok(Self {
            settings,
            preflight,
            registry: Mutex::new(Registry::default()),
            work_tx: Mutex::new(Some(work_tx)),
            events: Mutex::new(Some(events)),
            sinks,
            workers: Mutex::new(workers),
            dispatcher: Mutex::new(Some(Worker {
                name: "event-dispatch".to_string(),
                handle: dispatch_handle,
                done: dispatch_done_rx,
            })),
            shutting_down: AtomicBool::new(false),
        })
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: JobEvent) {
        let sender = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sender) = sender {
            sender.emit(event);
        }
    }

    /// 追加订阅者；立即收到一次启动检查结果。
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        sink.on_preflight(&self.preflight);
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    pub fn preflight(&self) -> &PreflightReport {
        &self.preflight
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// 提交一批 URL。无效链接与未结束的重复任务被拒绝；
    /// 已结束的同 ID 任务会被新任务替换。
    pub fn submit<I, S>(&self, urls: I, options: &SubmitOptions) -> SubmitOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut outcome = SubmitOutcome::default();
        let mut queued: Vec<Arc<Job>> = Vec::new();
        let shutting_down = self.shutting_down.load(Ordering::SeqCst);

        {
            let mut reg = self.registry();
            for raw in urls {
                let input = raw.as_ref().trim();
                if input.is_empty() {
                    continue;
                }
                let reject = |reason| Rejected {
                    input: input.to_string(),
                    reason,
                };
                if shutting_down {
                    outcome.rejected.push(reject(RejectReason::ShuttingDown));
                    continue;
                }
                let Some(id) = normalize_video_url(input, &self.settings.host_markers) else {
                    outcome.rejected.push(reject(RejectReason::InvalidUrl));
                    continue;
                };
                if let Some(existing) = reg.jobs.get(&id) {
                    if !existing.is_terminal() {
                        outcome.rejected.push(reject(RejectReason::Duplicate));
                        continue;
                    }
                    reg.order.retain(|k| k != &id);
                }

                let job = Arc::new(Job::new(id.clone(), options));
                reg.jobs.insert(id.clone(), job.clone());
                reg.order.push(id.clone());
                outcome.accepted.push(id);
                queued.push(job);
            }
        }

        let tx = self
            .work_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for job in queued {
            let sent = match &tx {
                Some(tx) => tx.send(job.clone()).is_ok(),
                None => false,
            };
            if !sent && job.cancel_if_pending() {
                self.emit_cancelled(&job);
            }
        }

        if !outcome.accepted.is_empty() {
            info!(target: "orchestrator", "已加入 {} 个任务", outcome.accepted.len());
        }
        for r in &outcome.rejected {
            debug!(target: "orchestrator", input = %r.input, reason = %r.reason, "submission rejected");
        }
        outcome
    }

    /// 请求取消；任务不存在或已结束时返回 `false`。
    pub fn cancel(&self, id: &str) -> bool {
        let Some(job) = self.get_job(id) else {
            return false;
        };
        if job.is_terminal() {
            return false;
        }
        job.request_cancel();
        if job.cancel_if_pending() {
            self.emit_cancelled(&job);
        }
        true
    }

    fn emit_cancelled(&self, job: &Job) {
        job.set_status("已取消");
        self.emit(JobEvent::Status {
            id: job.id.clone(),
            message: "已取消".to_string(),
        });
        self.emit(JobEvent::Terminal {
            id: job.id.clone(),
            state: JobState::Cancelled,
            error: None,
        });
    }

    /// 移除所有已结束的任务，返回移除的数量。
    pub fn clear_terminal(&self) -> usize {
        let mut reg = self.registry();
        let before = reg.jobs.len();
        reg.jobs.retain(|_, job| !job.is_terminal());
        let Registry { jobs, order } = &mut *reg;
        order.retain(|id| jobs.contains_key(id));
        before - jobs.len()
    }

    fn get_job(&self, id: &str) -> Option<Arc<Job>> {
        self.registry().jobs.get(id).cloned()
    }

    pub fn get(&self, id: &str) -> Option<JobSnapshot> {
        self.get_job(id).map(|j| j.snapshot())
    }

    /// 按提交顺序返回所有任务的快照。
    pub fn list(&self) -> Vec<JobSnapshot> {
        let reg = self.registry();
        reg.order
            .iter()
            .filter_map(|id| reg.jobs.get(id))
            .map(|j| j.snapshot())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.registry()
            .jobs
            .values()
            .filter(|j| !j.is_terminal())
            .count()
    }

    /// 取消全部任务并在宽限期内等待下载线程退出；超时的线程被放弃。
    pub fn shutdown(&self) -> ShutdownReport {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }
        let deadline = Instant::now() + self.settings.shutdown_grace;

        let jobs: Vec<Arc<Job>> = self.registry().jobs.values().cloned().collect();
        let mut report = ShutdownReport::default();
        for job in jobs.iter().filter(|j| !j.is_terminal()) {
            job.request_cancel();
            report.cancelled += 1;
            if job.cancel_if_pending() {
                self.emit_cancelled(job);
            }
        }
        if report.cancelled > 0 {
            info!(target: "orchestrator", "正在停止 {} 个任务...", report.cancelled);
        }

        // 队列关闭后，线程处理完手上的任务即退出
        drop(
            self.work_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if wait_until(&worker, deadline) {
                let _ = worker.handle.join();
            } else {
                warn!(target: "orchestrator", "{} 未在宽限期内退出，已放弃", worker.name);
                report.abandoned_workers += 1;
            }
        }

        drop(self.events.lock().unwrap_or_else(PoisonError::into_inner).take());
        if report.abandoned_workers == 0
            && let Some(dispatcher) = self
                .dispatcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            && wait_until(&dispatcher, deadline.max(Instant::now() + Duration::from_millis(500)))
        {
            let _ = dispatcher.handle.join();
        }

        info!(
            target: "orchestrator",
            cancelled = report.cancelled,
            abandoned = report.abandoned_workers,
            "调度器已停止"
        );
        report
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 等待线程退出（其持有的 `done` 发送端被丢弃）。
fn wait_until(worker: &Worker, deadline: Instant) -> bool {
    matches!(
        worker.done.recv_deadline(deadline),
        Err(channel::RecvTimeoutError::Disconnected)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_system::tool_locator::ResolvedTool;
    use crate::download::events::ChannelSink;
    use crate::download::quality::Quality;
    use crate::download::testing::{Script, ScriptedBackend};
    use std::collections::HashSet;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(10);

    fn tools(accelerator: bool) -> Toolchain {
        let t = |p: &str| {
            Some(ResolvedTool {
                path: PathBuf::from(p),
                on_default_path: true,
            })
        };
        Toolchain {
            extractor: t("/usr/bin/yt-dlp"),
            accelerator: if accelerator { t("/usr/bin/aria2c") } else { None },
            transcoder: t("/usr/bin/ffmpeg"),
        }
    }

    fn start(
        workers: usize,
        script: Script,
        tools: Toolchain,
    ) -> (Orchestrator, Arc<ScriptedBackend>, channel::Receiver<JobEvent>) {
        let backend = Arc::new(ScriptedBackend::new(script));
        let (sink, rx) = ChannelSink::new();
        let settings = PoolSettings {
            workers,
            ..PoolSettings::default()
        };
        let sinks: Vec<Arc<dyn EventSink>> = vec![sink];
        let orch = Orchestrator::start(settings, backend.clone(), tools, sinks).unwrap();
        (orch, backend, rx)
    }

    fn options(dir: &TempDir) -> SubmitOptions {
        SubmitOptions::new(Quality::P720, dir.path().to_path_buf(), true)
    }

    fn url(n: usize) -> String {
        format!("https://www.youtube.com/watch?v=vid{n}")
    }

    /// 等到给定 ID 全部收到终态事件，返回各自的终态。
    fn wait_terminals(rx: &channel::Receiver<JobEvent>, ids: &[String]) -> HashMap<String, JobState> {
        let mut out = HashMap::new();
        let deadline = Instant::now() + WAIT;
        while out.len() < ids.len() {
            match rx.recv_deadline(deadline) {
                Ok(JobEvent::Terminal { id, state, .. }) => {
                    out.insert(id, state);
                }
                Ok(_) => {}
                Err(e) => panic!("timed out waiting for terminals: {e:?}, got {out:?}"),
            }
        }
        out
    }

    fn wait_for_state(orch: &Orchestrator, id: &str, state: JobState) {
        let deadline = Instant::now() + WAIT;
        while orch.get(id).map(|s| s.state) != Some(state) {
            assert!(Instant::now() < deadline, "{id} never reached {state:?}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn blocking_script() -> Script {
        Script {
            until_abort: true,
            tick_delay: Duration::from_millis(5),
            ..Script::default()
        }
    }

    #[test]
    fn mixed_batch_accepts_one_normalized_job() {
        let dir = TempDir::new().unwrap();
        let (orch, _backend, rx) = start(2, Script::default(), tools(true));

        let outcome = orch.submit(
            [
                "https://www.youtube.com/watch?v=abc",
                "not-a-url",
                "https://youtu.be/abc",
            ],
            &options(&dir),
        );
        assert_eq!(outcome.accepted, vec!["https://www.youtube.com/watch?v=abc".to_string()]);
        assert_eq!(
            outcome.rejected,
            vec![
                Rejected {
                    input: "not-a-url".into(),
                    reason: RejectReason::InvalidUrl
                },
                Rejected {
                    input: "https://youtu.be/abc".into(),
                    reason: RejectReason::Duplicate
                },
            ]
        );
        assert_eq!(orch.list().len(), 1);
        wait_terminals(&rx, &outcome.accepted);
    }

    #[test]
    fn duplicate_of_running_job_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (orch, backend, rx) = start(1, blocking_script(), tools(true));
        let first = orch.submit([url(1)], &options(&dir));
        wait_for_state(&orch, &url(1), JobState::Downloading);

        let again = orch.submit([url(1)], &options(&dir));
        assert!(again.accepted.is_empty());
        assert_eq!(again.rejected[0].reason, RejectReason::Duplicate);
        assert_eq!(orch.list().len(), 1);

        assert!(orch.cancel(&url(1)));
        wait_terminals(&rx, &first.accepted);
        assert_eq!(backend.transfer_count(), 1);
    }

    #[test]
    fn finished_job_can_be_resubmitted() {
        let dir = TempDir::new().unwrap();
        let (orch, backend, rx) = start(1, Script::default(), tools(true));
        let first = orch.submit([url(7)], &options(&dir));
        wait_terminals(&rx, &first.accepted);

        let second = orch.submit([url(7)], &options(&dir));
        assert_eq!(second.accepted, first.accepted);
        wait_terminals(&rx, &second.accepted);
        assert_eq!(backend.transfer_count(), 2);
        assert_eq!(orch.list().len(), 1);
    }

    #[test]
    fn cancel_while_downloading_ends_cancelled() {
        let dir = TempDir::new().unwrap();
        let (orch, _backend, rx) = start(1, blocking_script(), tools(true));
        let out = orch.submit([url(2)], &options(&dir));
        wait_for_state(&orch, &url(2), JobState::Downloading);

        assert!(orch.cancel(&url(2)));
        let states = wait_terminals(&rx, &out.accepted);
        assert_eq!(states[&url(2)], JobState::Cancelled);
        assert!(!orch.cancel(&url(2)));
        assert!(!orch.cancel("https://www.youtube.com/watch?v=unknown"));
    }

    #[test]
    fn cancel_of_queued_job_skips_it() {
        let dir = TempDir::new().unwrap();
        let (orch, backend, rx) = start(1, blocking_script(), tools(true));
        let out = orch.submit([url(3), url(4)], &options(&dir));
        wait_for_state(&orch, &url(3), JobState::Downloading);

        assert!(orch.cancel(&url(4)));
        assert_eq!(orch.get(&url(4)).unwrap().state, JobState::Cancelled);
        assert!(orch.cancel(&url(3)));
        let states = wait_terminals(&rx, &out.accepted);
        assert_eq!(states[&url(3)], JobState::Cancelled);
        assert_eq!(states[&url(4)], JobState::Cancelled);
        assert_eq!(backend.transfer_count(), 1);
    }

    #[test]
    fn clear_terminal_keeps_in_flight_jobs() {
        let dir = TempDir::new().unwrap();
        let (orch, _backend, rx) = start(1, blocking_script(), tools(true));
        orch.submit([url(10), url(11), url(12)], &options(&dir));
        wait_for_state(&orch, &url(10), JobState::Downloading);

        orch.cancel(&url(10));
        wait_terminals(&rx, &[url(10)]);
        wait_for_state(&orch, &url(11), JobState::Downloading);

        assert_eq!(orch.clear_terminal(), 1);
        let remaining: Vec<(String, JobState)> =
            orch.list().into_iter().map(|s| (s.id, s.state)).collect();
        assert_eq!(
            remaining,
            vec![(url(11), JobState::Downloading), (url(12), JobState::Pending)]
        );
        assert_eq!(orch.active_count(), 2);
        assert_eq!(orch.clear_terminal(), 0);
    }

    #[test]
    fn pool_size_bounds_concurrent_transfers() {
        let dir = TempDir::new().unwrap();
        let script = Script {
            ticks: 10,
            tick_delay: Duration::from_millis(5),
            ..Script::default()
        };
        let (orch, backend, rx) = start(2, script, tools(true));
        let urls: Vec<String> = (0..6).map(|n| url(100 + n)).collect();
        let out = orch.submit(&urls, &options(&dir));
        assert_eq!(out.accepted.len(), 6);

        let states = wait_terminals(&rx, &out.accepted);
        assert!(states.values().all(|s| *s == JobState::Completed));
        assert!(backend.peak_concurrency() <= 2);
        assert_eq!(backend.transfer_count(), 6);
    }

    #[test]
    fn per_job_percent_is_monotonic_and_ordered() {
        let dir = TempDir::new().unwrap();
        let script = Script {
            ticks: 20,
            ..Script::default()
        };
        let (orch, _backend, rx) = start(3, script, tools(true));
        let urls: Vec<String> = (0..3).map(|n| url(200 + n)).collect();
        orch.submit(&urls, &options(&dir));

        let mut last: HashMap<String, f64> = HashMap::new();
        let mut done: HashSet<String> = HashSet::new();
        let deadline = Instant::now() + WAIT;
        while done.len() < urls.len() {
            match rx.recv_deadline(deadline).expect("events") {
                JobEvent::Progress { id, update } => {
                    assert!(!done.contains(&id), "progress after terminal for {id}");
                    let prev = last.insert(id, update.progress.percent).unwrap_or(0.0);
                    assert!(update.progress.percent >= prev);
                }
                JobEvent::Terminal { id, .. } => {
                    done.insert(id);
                }
                _ => {}
            }
        }
        assert!(last.values().all(|p| *p == 100.0));
    }

    #[test]
    fn missing_accelerator_degrades_without_error() {
        let dir = TempDir::new().unwrap();
        let (orch, backend, rx) = start(1, Script::default(), tools(false));
        assert!(orch.preflight().accelerator_degraded);

        match rx.recv_timeout(WAIT).unwrap() {
            JobEvent::Preflight(report) => assert!(report.accelerator_degraded),
            other => panic!("expected preflight first, got {other:?}"),
        }

        let out = orch.submit([url(300)], &options(&dir));
        let states = wait_terminals(&rx, &out.accepted);
        assert_eq!(states[&url(300)], JobState::Completed);
        assert!(backend.last_request().unwrap().accelerator.is_none());
    }

    #[test]
    fn shutdown_cancels_everything_and_rejects_new_work() {
        let dir = TempDir::new().unwrap();
        let (orch, _backend, _rx) = start(1, blocking_script(), tools(true));
        orch.submit([url(400), url(401)], &options(&dir));
        wait_for_state(&orch, &url(400), JobState::Downloading);

        let report = orch.shutdown();
        assert_eq!(report.cancelled, 2);
        assert_eq!(report.abandoned_workers, 0);
        assert!(orch.list().iter().all(|s| s.state == JobState::Cancelled));

        let late = orch.submit([url(402)], &options(&dir));
        assert_eq!(late.rejected[0].reason, RejectReason::ShuttingDown);
        assert_eq!(orch.shutdown(), ShutdownReport::default());
    }
}
