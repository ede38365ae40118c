//! 外部下载器接口。
//!
//! 引擎只通过 [`MediaBackend`] 与提取 / 下载 / 转码工具交互；
//! 默认实现是 [`super::ytdlp::YtDlpBackend`]，测试中使用脚本化的假实现。

use std::path::PathBuf;

use super::models::{EngineError, VideoMeta};
use crate::base_system::tool_locator::Toolchain;

pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
pub const OUTPUT_CONTAINER: &str = "mp4";

/// 后处理：转封装为 `container`，并把参数交给 ffmpeg。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostProcessSpec {
    pub container: String,
    pub ffmpeg_location: Option<PathBuf>,
    pub args: Vec<String>,
}

impl PostProcessSpec {
    /// 视频流原样复制，音频转 AAC，moov 前置便于边下边播。
    pub fn remux_with_aac(container: &str, audio_bitrate_kbps: u32, ffmpeg: Option<PathBuf>) -> Self {
        let bitrate = format!("{audio_bitrate_kbps}k");
        let args = [
            "-c:v",
            "copy",
            "-c:a",
            "aac",
            "-b:a",
            bitrate.as_str(),
            "-strict",
            "experimental",
            "-movflags",
            "+faststart",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        Self {
            container: container.to_string(),
            ffmpeg_location: ffmpeg,
            args,
        }
    }
}

/// 切片加速器（aria2c）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorSpec {
    pub path: PathBuf,
    pub args: Vec<String>,
}

impl AcceleratorSpec {
    pub fn aria2c(path: PathBuf, connections: u32) -> Self {
        let n = connections.max(1);
        Self {
            path,
            args: vec![
                "--min-split-size=1M".to_string(),
                format!("--max-connection-per-server={n}"),
                format!("--split={n}"),
                format!("--max-concurrent-downloads={n}"),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub destination: PathBuf,
    pub output_template: String,
    /// `-f` 格式表达式
    pub format: String,
    pub merge_container: Option<String>,
    pub post_process: Option<PostProcessSpec>,
    pub accelerator: Option<AcceleratorSpec>,
}

/// 下载过程中的回调事件。
#[derive(Debug, Clone, PartialEq)]
pub enum TransferTick {
    Downloading {
        downloaded: u64,
        total: Option<u64>,
        speed: Option<f64>,
        eta: Option<u64>,
        filename: Option<String>,
    },
    /// 单个流（视频或音频）下载完毕。
    StreamFinished { filename: Option<String> },
    /// 全部传输完成，进入合并 / 转码。
    Finished,
    Status(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    /// 请求中止；实现应尽快停止并返回 [`EngineError::Cancelled`]。
    Abort,
}

pub trait MediaBackend: Send + Sync {
    /// 只取信息，不下载。
    fn fetch_metadata(&self, url: &str, tools: &Toolchain) -> Result<VideoMeta, EngineError>;

    /// 下载并后处理。每次进度回调后检查返回值，收到 `Abort` 即中止。
    fn transfer(
        &self,
        request: &TransferRequest,
        tools: &Toolchain,
        on_tick: &mut dyn FnMut(TransferTick) -> TickControl,
    ) -> Result<(), EngineError>;
}
