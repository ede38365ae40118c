//! 基于 yt-dlp 子进程的 [`MediaBackend`] 实现。
//!
//! 进度通过 `--newline --progress-template` 按行输出到 stdout，逐行解析为
//! [`TransferTick`]；stderr 在单独线程里读取，只保留最后若干行作为错误信息。

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::{debug, warn};

use super::backend::{MediaBackend, TickControl, TransferRequest, TransferTick};
use super::models::{EngineError, VideoMeta};
use crate::base_system::tool_locator::{EXTRACTOR, Toolchain};

const STDERR_TAIL_LINES: usize = 40;
const DOWNLOAD_PREFIX: &str = "[dl] ";
const POSTPROCESS_PREFIX: &str = "[pp] ";

const DOWNLOAD_TEMPLATE: &str = "download:[dl] %(progress.status)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s|%(progress.eta)s|%(progress.filename)s";
const POSTPROCESS_TEMPLATE: &str =
    "postprocess:[pp] %(progress.status)s|%(progress.postprocessor)s";

/// yt-dlp 自身输出的后处理器标记（模板未生效的旧版本也能识别）。
const POSTPROCESSOR_TAGS: [&str; 4] = ["[Merger]", "[VideoRemuxer]", "[VideoConvertor]", "[FFmpeg"];

#[derive(Debug, Clone, Default)]
pub struct YtDlpBackend {
    /// 工具链中没有解析到 yt-dlp 时使用的命令名。
    fallback_program: Option<String>,
}

impl YtDlpBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            fallback_program: Some(program.into()),
        }
    }

    fn command(&self, tools: &Toolchain) -> Command {
        let program: OsString = match (&tools.extractor, &self.fallback_program) {
            (Some(tool), _) => tool.path.clone().into_os_string(),
            (None, Some(name)) => OsString::from(name),
            (None, None) => OsString::from(EXTRACTOR),
        };
        let mut cmd = Command::new(program);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        if let Some(path) = tools.child_path_env() {
            cmd.env("PATH", path);
        }
        cmd.stdin(Stdio::null());
        cmd
    }
}

impl MediaBackend for YtDlpBackend {
    fn fetch_metadata(&self, url: &str, tools: &Toolchain) -> Result<VideoMeta, EngineError> {
        let output = self
            .command(tools)
            .args([
                "--dump-single-json",
                "--flat-playlist",
                "--no-download",
                "--no-warnings",
                "--encoding",
                "utf-8",
            ])
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| spawn_error(&e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: VecDeque<String> = stderr.lines().map(str::to_string).collect();
            return Err(EngineError::MetadataFetchFailed(summarize_stderr(
                &lines,
                output.status.code(),
            )));
        }

        serde_json::from_slice::<VideoMeta>(&output.stdout)
            .map_err(|e| EngineError::MetadataFetchFailed(format!("unreadable metadata: {e}")))
    }

    fn transfer(
        &self,
        request: &TransferRequest,
        tools: &Toolchain,
        on_tick: &mut dyn FnMut(TransferTick) -> TickControl,
    ) -> Result<(), EngineError> {
        let mut child = self
            .command(tools)
            .args(build_transfer_args(request))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&e))?;

        let tail = Arc::new(Mutex::new(VecDeque::<String>::new()));
        let stderr_reader = child.stderr.take().map(|stream| {
            let tail = Arc::clone(&tail);
            thread::spawn(move || {
                for_each_line(stream, |line| {
                    debug!(target: "engine", "yt-dlp stderr: {line}");
                    let mut lines = tail.lock().unwrap_or_else(PoisonError::into_inner);
                    lines.push_back(line);
                    if lines.len() > STDERR_TAIL_LINES {
                        lines.pop_front();
                    }
                    true
                });
            })
        });

        let mut finished = false;
        let mut aborted = false;
        if let Some(stdout) = child.stdout.take() {
            for_each_line(stdout, |line| {
                let Some(parsed) = parse_line(&line) else {
                    debug!(target: "engine", "yt-dlp: {line}");
                    return true;
                };
                let tick = match parsed {
                    ParsedLine::Tick(tick) => tick,
                    ParsedLine::PostProcess(name) => {
                        debug!(target: "engine", "postprocessor: {name}");
                        if finished {
                            // 转码可能持续很久，后续行也要经过回调以便检查取消
                            TransferTick::Status(postprocess_status(&name))
                        } else {
                            finished = true;
                            TransferTick::Finished
                        }
                    }
                };
                if on_tick(tick) == TickControl::Abort {
                    aborted = true;
                    return false;
                }
                true
            });
        }

        if aborted {
            kill_tree(&mut child);
            // 孙进程可能仍持有 stderr，不等待读取线程
            drop(stderr_reader);
            return Err(EngineError::Cancelled);
        }

        let status = child
            .wait()
            .map_err(|e| EngineError::TransferFailed(format!("wait for yt-dlp failed: {e}")))?;
        join_reader(stderr_reader);

        if status.success() {
            if !finished && on_tick(TransferTick::Finished) == TickControl::Abort {
                return Err(EngineError::Cancelled);
            }
            return Ok(());
        }

        let lines = tail.lock().unwrap_or_else(PoisonError::into_inner);
        let message = summarize_stderr(&lines, status.code());
        if finished {
            Err(EngineError::PostProcessFailed(message))
        } else {
            Err(EngineError::TransferFailed(message))
        }
    }
}

fn spawn_error(err: &io::Error) -> EngineError {
    if err.kind() == io::ErrorKind::NotFound {
        EngineError::ToolUnavailable(format!("{EXTRACTOR} not found"))
    } else {
        EngineError::ToolUnavailable(format!("failed to start {EXTRACTOR}: {err}"))
    }
}

/// 按行读取，非 UTF-8 内容有损转换；回调返回 `false` 时停止。
fn for_each_line(stream: impl Read, mut f: impl FnMut(String) -> bool) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                if !f(line.trim_end_matches(['\r', '\n']).to_string()) {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(target: "engine", "read yt-dlp output failed: {err}");
                break;
            }
        }
    }
}

fn postprocess_status(name: &str) -> String {
    if name.is_empty() {
        "正在合并/转档...".to_string()
    } else {
        format!("正在合并/转档 ({name})...")
    }
}

/// 结束 yt-dlp 及其启动的 aria2c / ffmpeg。
fn kill_tree(child: &mut Child) {
    let pid = child.id().to_string();

    #[cfg(windows)]
    let status = Command::new("taskkill")
        .args(["/PID", pid.as_str(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    // 子进程以自身 pid 为进程组启动
    #[cfg(not(windows))]
    let status = Command::new("kill")
        .args(["-s", "KILL", "--", format!("-{pid}").as_str()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(s) if s.success() => {}
        Ok(s) => debug!(target: "engine", "kill process tree {pid}: {s}"),
        Err(err) => warn!(target: "engine", "kill process tree {pid} failed: {err}"),
    }
    // 兜底：至少结束 yt-dlp 本身
    let _ = child.kill();
    let _ = child.wait();
}

fn join_reader(handle: Option<thread::JoinHandle<()>>) {
    if let Some(h) = handle {
        let _ = h.join();
    }
}

/// 优先使用 `ERROR:` 开头的行；没有时取最后一行非空输出。
fn summarize_stderr(lines: &VecDeque<String>, code: Option<i32>) -> String {
    let error_line = lines
        .iter()
        .rev()
        .find(|l| l.trim_start().starts_with("ERROR:"))
        .or_else(|| lines.iter().rev().find(|l| !l.trim().is_empty()));
    match (error_line, code) {
        (Some(line), _) => line.trim().to_string(),
        (None, Some(code)) => format!("yt-dlp exited with code {code}"),
        (None, None) => "yt-dlp terminated by signal".to_string(),
    }
}

pub(crate) fn build_transfer_args(request: &TransferRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    let mut push = |s: &str| args.push(OsString::from(s));
    push("--newline");
    push("--no-color");
    push("--encoding");
    push("utf-8");
    push("--progress-template");
    push(DOWNLOAD_TEMPLATE);
    push("--progress-template");
    push(POSTPROCESS_TEMPLATE);
    push("-f");
    push(&request.format);
    push("-o");
    push(&request.output_template);
    if let Some(container) = &request.merge_container {
        push("--merge-output-format");
        push(container);
    }
    if let Some(pp) = &request.post_process {
        push("--remux-video");
        push(&pp.container);
        push("--postprocessor-args");
        push(&format!("ffmpeg:{}", pp.args.join(" ")));
    }
    if let Some(acc) = &request.accelerator {
        push("--downloader-args");
        push(&format!("aria2c:{}", acc.args.join(" ")));
    }

    args.push(OsString::from("-P"));
    args.push(request.destination.clone().into_os_string());
    if let Some(location) = request
        .post_process
        .as_ref()
        .and_then(|pp| pp.ffmpeg_location.clone())
    {
        args.push(OsString::from("--ffmpeg-location"));
        args.push(location.into_os_string());
    }
    if let Some(acc) = &request.accelerator {
        args.push(OsString::from("--downloader"));
        args.push(acc.path.clone().into_os_string());
    }
    args.push(OsString::from("--"));
    args.push(OsString::from(&request.url));
    args
}

#[derive(Debug, Clone, PartialEq)]
enum ParsedLine {
    Tick(TransferTick),
    PostProcess(String),
}

fn parse_line(line: &str) -> Option<ParsedLine> {
    let line = line.trim_end();
    if let Some(rest) = line.strip_prefix(DOWNLOAD_PREFIX) {
        return parse_download(rest).map(ParsedLine::Tick);
    }
    if let Some(rest) = line.strip_prefix(POSTPROCESS_PREFIX) {
        let mut parts = rest.splitn(2, '|');
        let _status = parts.next();
        let name = parts.next().unwrap_or_default().trim();
        return Some(ParsedLine::PostProcess(name.to_string()));
    }
    if let Some(tag) = POSTPROCESSOR_TAGS.iter().find(|t| line.starts_with(**t)) {
        return Some(ParsedLine::PostProcess(
            tag.trim_matches(|c: char| c == '[' || c == ']').to_string(),
        ));
    }
    if line.starts_with("[download]") && line.ends_with("has already been downloaded") {
        return Some(ParsedLine::Tick(TransferTick::Status(
            "文件已存在，跳过下载".to_string(),
        )));
    }
    None
}

fn parse_download(rest: &str) -> Option<TransferTick> {
    let fields: Vec<&str> = rest.splitn(7, '|').collect();
    if fields.len() < 7 {
        return None;
    }
    let filename = non_na(fields[6]).map(str::to_string);
    match fields[0].trim() {
        "downloading" => {
            let downloaded = parse_num(fields[1]).map(|v| v as u64).unwrap_or(0);
            let total = parse_num(fields[2])
                .or_else(|| parse_num(fields[3]))
                .filter(|t| *t > 0.0)
                .map(|t| t as u64);
            Some(TransferTick::Downloading {
                downloaded,
                total,
                speed: parse_num(fields[4]),
                eta: parse_num(fields[5]).map(|e| e.max(0.0) as u64),
                filename,
            })
        }
        "finished" => Some(TransferTick::StreamFinished { filename }),
        _ => None,
    }
}

fn non_na(raw: &str) -> Option<&str> {
    let s = raw.trim();
    if s.is_empty() || s == "NA" || s == "None" {
        None
    } else {
        Some(s)
    }
}

fn parse_num(raw: &str) -> Option<f64> {
    non_na(raw)?.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// 以 `PathBuf` 形式返回下载文件所在目录，供日志使用。
pub(crate) fn describe_destination(request: &TransferRequest) -> PathBuf {
    request.destination.join(&request.output_template)
}
