//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息，以及把配置转换成
//! 下载池 / 提交选项 / 工具查找参数的辅助方法。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigError, ConfigSpec, FieldMeta};
use super::tool_locator::{ToolOverrides, ToolSearch};
use crate::download::engine::EngineSettings;
use crate::download::models::SubmitOptions;
use crate::download::orchestrator::PoolSettings;
use crate::download::quality::Quality;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 下载配置
    #[serde(default)]
    pub save_path: String,
    #[serde(default = "default_quality")]
    pub default_quality: String,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_true")]
    pub use_accelerator: bool,
    #[serde(default = "default_accelerator_connections")]
    pub accelerator_connections: u32,
    #[serde(default = "default_audio_bitrate_kbps")]
    pub audio_bitrate_kbps: u32,
    #[serde(default = "default_false")]
    pub require_transcoder: bool,

    // 调度配置
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    #[serde(default = "default_url_host_markers")]
    pub url_host_markers: Vec<String>,

    // 外部工具配置
    #[serde(default = "default_extractor_binary")]
    pub extractor_binary: String,
    #[serde(default)]
    pub accelerator_binary: String,
    #[serde(default)]
    pub transcoder_binary: String,
    #[serde(default)]
    pub extra_tool_dirs: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            save_path: String::new(),
            default_quality: default_quality(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            use_accelerator: default_true(),
            accelerator_connections: default_accelerator_connections(),
            audio_bitrate_kbps: default_audio_bitrate_kbps(),
            require_transcoder: default_false(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            url_host_markers: default_url_host_markers(),
            extractor_binary: default_extractor_binary(),
            accelerator_binary: String::new(),
            transcoder_binary: String::new(),
            extra_tool_dirs: Vec::new(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 14] = [
            FieldMeta {
                name: "save_path",
                description: "保存路径（留空则使用 ~/Downloads/VideoDownloader）",
            },
            FieldMeta {
                name: "default_quality",
                description: "默认画质, 可选: [best, 1080p, 720p, 480p, 360p]",
            },
            FieldMeta {
                name: "max_concurrent_downloads",
                description: "最大同时下载数",
            },
            FieldMeta {
                name: "use_accelerator",
                description: "是否使用 aria2c 切片加速下载（未安装时自动退回默认下载器）",
            },
            FieldMeta {
                name: "accelerator_connections",
                description: "aria2c 每服务器连接数 / 分片数 / 并发数",
            },
            FieldMeta {
                name: "audio_bitrate_kbps",
                description: "后处理时音频转为 AAC 的码率（kbit/s）",
            },
            FieldMeta {
                name: "require_transcoder",
                description: "缺少 ffmpeg 时是否直接判定任务失败（否则降级为单文件下载）",
            },
            FieldMeta {
                name: "shutdown_grace_secs",
                description: "退出时等待下载线程结束的最长时间（秒）",
            },
            FieldMeta {
                name: "event_channel_capacity",
                description: "进度事件队列容量",
            },
            FieldMeta {
                name: "url_host_markers",
                description: "允许提交的链接域名标记（包含匹配）",
            },
            FieldMeta {
                name: "extractor_binary",
                description: "yt-dlp 可执行文件（名称或完整路径）",
            },
            FieldMeta {
                name: "accelerator_binary",
                description: "aria2c 可执行文件完整路径（留空自动查找）",
            },
            FieldMeta {
                name: "transcoder_binary",
                description: "ffmpeg 可执行文件完整路径（留空自动查找）",
            },
            FieldMeta {
                name: "extra_tool_dirs",
                description: "额外的工具搜索目录",
            },
        ];
        &FIELDS
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_downloads == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        self.default_quality
            .parse::<Quality>()
            .map(|_| ())
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }
}

impl Config {
    pub fn default_save_dir(&self) -> PathBuf {
        if self.save_path.trim().is_empty() {
            dirs::download_dir()
                .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
                .unwrap_or_else(|| PathBuf::from("."))
                .join("VideoDownloader")
        } else {
            PathBuf::from(self.save_path.trim())
        }
    }

    pub fn quality(&self) -> Quality {
        self.default_quality.parse().unwrap_or_default()
    }

    pub fn submit_options(&self) -> SubmitOptions {
        SubmitOptions::new(self.quality(), self.default_save_dir(), self.use_accelerator)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            accelerator_connections: self.accelerator_connections.max(1),
            audio_bitrate_kbps: self.audio_bitrate_kbps.max(32),
            require_transcoder: self.require_transcoder,
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            workers: self.max_concurrent_downloads.max(1),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            event_capacity: self.event_channel_capacity.max(16),
            host_markers: self.url_host_markers.clone(),
            engine: self.engine_settings(),
        }
    }

    pub fn tool_search(&self) -> ToolSearch {
        let extra: Vec<PathBuf> = self
            .extra_tool_dirs
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        ToolSearch::from_env(&extra)
    }

    pub fn tool_overrides(&self) -> ToolOverrides {
        ToolOverrides {
            extractor: self.extractor_binary.clone(),
            accelerator: self.accelerator_binary.clone(),
            transcoder: self.transcoder_binary.clone(),
        }
    }
}

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

fn default_quality() -> String {
    Quality::Best.name().to_string()
}

fn default_max_concurrent_downloads() -> usize {
    6
}

fn default_accelerator_connections() -> u32 {
    16
}

fn default_audio_bitrate_kbps() -> u32 {
    192
}

fn default_shutdown_grace_secs() -> u64 {
    3
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_url_host_markers() -> Vec<String> {
    vec!["youtube.com".to_string(), "youtu.be".to_string()]
}

fn default_extractor_binary() -> String {
    "yt-dlp".to_string()
}
