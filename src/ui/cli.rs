//! 命令行批量下载：每个任务一条进度条，全部结束后打印汇总。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use crossbeam_channel::{self as channel, Receiver, Sender};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::info;

use crate::base_system::tool_locator::PreflightReport;
use crate::download::events::EventSink;
use crate::download::models::{DownloadResult, JobState, ProgressPhase, ProgressUpdate, SubmitOptions};
use crate::download::orchestrator::Orchestrator;

const BAR_SCALE: u64 = 1000;
const TITLE_WIDTH: usize = 28;

pub struct CliSink {
    mp: MultiProgress,
    style: ProgressStyle,
    bars: Mutex<HashMap<String, ProgressBar>>,
    done_tx: Sender<(String, JobState)>,
}

impl CliSink {
    pub fn new() -> (Arc<Self>, Receiver<(String, JobState)>) {
        let style = ProgressStyle::with_template(
            "{prefix:<28} [{elapsed_precise}] {bar:30} {percent:>3}% {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
        let (done_tx, done_rx) = channel::unbounded();
        let sink = Self {
            mp: MultiProgress::with_draw_target(ProgressDrawTarget::stderr()),
            style,
            bars: Mutex::new(HashMap::new()),
            done_tx,
        };
        (Arc::new(sink), done_rx)
    }

    fn bar(&self, id: &str) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        bars.entry(id.to_string())
            .or_insert_with(|| {
                let bar = self.mp.add(ProgressBar::new(BAR_SCALE));
                bar.set_style(self.style.clone());
                bar.set_prefix(shorten(id, TITLE_WIDTH));
                bar
            })
            .clone()
    }

    fn println(&self, line: &str) {
        if self.mp.println(line).is_err() {
            eprintln!("{line}");
        }
    }
}

impl EventSink for CliSink {
    fn on_preflight(&self, report: &PreflightReport) {
        for w in &report.warnings {
            self.println(&format!("警告: {w}"));
        }
    }

    fn on_title(&self, id: &str, title: &str) {
        self.bar(id).set_prefix(shorten(title, TITLE_WIDTH));
    }

    fn on_progress(&self, id: &str, update: &ProgressUpdate) {
        let bar = self.bar(id);
        bar.set_position((update.progress.percent * BAR_SCALE as f64 / 100.0) as u64);
        if update.phase == ProgressPhase::Processing {
            bar.set_message("正在合并/转档...");
            return;
        }
        let mut msg = String::from("下载中");
        if let Some(speed) = update.progress.speed_bytes_per_sec.map(format_speed)
            && !speed.is_empty()
        {
            msg.push_str(" | ");
            msg.push_str(&speed);
        }
        if let Some(eta) = update.progress.eta_seconds.map(format_eta)
            && !eta.is_empty()
        {
            msg.push_str(" | 剩余 ");
            msg.push_str(&eta);
        }
        bar.set_message(msg);
    }

    fn on_status(&self, id: &str, message: &str) {
        self.bar(id).set_message(message.to_string());
    }

    fn on_terminal(&self, id: &str, state: JobState, error: Option<&str>) {
        let bar = self.bar(id);
        let msg = match (state, error) {
            (JobState::Completed, _) => {
                bar.set_position(BAR_SCALE);
                "下载完成".to_string()
            }
            (_, Some(e)) => format!("失败: {}", shorten(e, 60)),
            _ => state.label().to_string(),
        };
        bar.abandon_with_message(msg);
        let _ = self.done_tx.send((id.to_string(), state));
    }
}

/// 提交一批 URL 并阻塞到它们全部结束。
pub fn run(
    orchestrator: &Orchestrator,
    done_rx: &Receiver<(String, JobState)>,
    urls: &[String],
    options: &SubmitOptions,
) -> Result<DownloadResult> {
    let outcome = orchestrator.submit(urls, options);
    for r in &outcome.rejected {
        eprintln!("已跳过 {}: {}", r.input, r.reason);
    }
    if outcome.accepted.is_empty() {
        return Err(anyhow!("没有可下载的链接"));
    }
    println!(
        "共 {} 个任务，保存到 {}",
        outcome.accepted.len(),
        options.destination.display()
    );

    let mut pending: HashSet<String> = outcome.accepted.iter().cloned().collect();
    let mut result = DownloadResult::default();
    while !pending.is_empty() {
        let (id, state) = done_rx
            .recv()
            .map_err(|_| anyhow!("事件通道已关闭"))?;
        if pending.remove(&id) {
            result.record(state);
        }
    }

    println!(
        "\n下载结束：成功 {}，失败 {}，取消 {}",
        result.success, result.failed, result.canceled
    );
    for snap in orchestrator.list() {
        if let Some(err) = snap.error.as_deref() {
            let name = if snap.title.is_empty() { &snap.id } else { &snap.title };
            println!("  ✗ {name}: {err}");
        }
    }
    info!("batch finished: {result:?}");
    Ok(result)
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    if !(bytes_per_sec > 0.0) {
        return String::new();
    }
    if bytes_per_sec < 1024.0 {
        format!("{bytes_per_sec:.0} B/s")
    } else if bytes_per_sec < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1024.0)
    } else {
        format!("{:.2} MB/s", bytes_per_sec / (1024.0 * 1024.0))
    }
}

pub fn format_eta(seconds: u64) -> String {
    match seconds {
        0 => String::new(),
        s if s < 60 => format!("{s}秒"),
        s if s < 3600 => format!("{}分{}秒", s / 60, s % 60),
        s => format!("{}小时{}分", s / 3600, (s % 3600) / 60),
    }
}

fn shorten(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_units() {
        assert_eq!(format_speed(0.0), "");
        assert_eq!(format_speed(f64::NAN), "");
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(2048.0), "2.0 KB/s");
        assert_eq!(format_speed(3.5 * 1024.0 * 1024.0), "3.50 MB/s");
    }

    #[test]
    fn eta_units() {
        assert_eq!(format_eta(0), "");
        assert_eq!(format_eta(42), "42秒");
        assert_eq!(format_eta(125), "2分5秒");
        assert_eq!(format_eta(7260), "2小时1分");
    }

    #[test]
    fn long_titles_are_shortened() {
        assert_eq!(shorten("short", 10), "short");
        assert_eq!(shorten("abcdefghijkl", 8), "abcde...");
    }

    #[test]
    fn terminal_events_reach_the_waiter() {
        let (sink, rx) = CliSink::new();
        sink.on_status("a", "下载中...");
        sink.on_terminal("a", JobState::Failed, Some("boom"));
        assert_eq!(rx.try_recv().unwrap(), ("a".to_string(), JobState::Failed));
    }
}
