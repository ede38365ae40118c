//! Video Batch Downloader：基于 yt-dlp 的批量视频下载器。
//!
//! 本 crate 负责：配置加载、外部工具定位、下载调度与进度事件、命令行与 Web 两种交互方式。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/链接规范化/工具定位等基础设施
//! - `download`：任务模型、画质选择、yt-dlp 调用、下载池
//! - `ui`：命令行进度条与 Web API

use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::info;

mod base_system;
mod download;
mod ui;

use base_system::config::load_or_create_with_base;
use base_system::context::Config;
use base_system::logging::{LogOptions, LogSystem};
use base_system::tool_locator::Toolchain;
use base_system::video_url::split_batch;
use download::events::{EventSink, LogSink};
use download::models::SubmitOptions;
use download::orchestrator::Orchestrator;
use download::quality::Quality;
use download::ytdlp::YtDlpBackend;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "video-batch-downloader")]
#[command(about = "Batch video downloader built on yt-dlp")]
struct Cli {
    /// 要下载的视频或播放列表链接
    urls: Vec<String>,

    /// 从文件读取链接（每行一个，也可用逗号分隔）
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// 画质：best / 1080p / 720p / 480p / 360p
    #[arg(short, long)]
    quality: Option<String>,

    /// 保存目录（覆盖配置文件中的 save_path）
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 不使用 aria2c 加速
    #[arg(long, default_value_t = false)]
    no_accelerator: bool,

    /// 同时下载的任务数
    #[arg(short, long)]
    workers: Option<usize>,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 启用服务器模式（Web API）
    #[arg(long, default_value_t = false)]
    server: bool,

    /// 数据目录路径（用于存放 config.yml 和 logs 等文件，方便 Docker 挂载）
    #[arg(long)]
    data_dir: Option<String>,

    /// 显示版本信息后退出
    #[arg(long, default_value_t = false)]
    version: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("Video Batch Downloader v{}", VERSION);
        return Ok(());
    }

    let data_dir = cli.data_dir.as_deref().map(Path::new);
    let log = init_logging(&cli, data_dir)?;
    info!(target: "startup", "当前版本: v{}", VERSION);

    let mut config =
        load_or_create_with_base::<Config>(data_dir).map_err(|e| anyhow!(e.to_string()))?;
    if let Some(workers) = cli.workers {
        config.max_concurrent_downloads = workers.max(1);
    }
    let options = submit_options(&cli, &config)?;

    let tools = Toolchain::probe(&config.tool_search(), &config.tool_overrides());
    let backend = Arc::new(YtDlpBackend::with_program(config.extractor_binary.clone()));

    if cli.server {
        return run_server(&log, &config, backend, tools, options);
    }

    let urls = collect_urls(&cli)?;
    if urls.is_empty() {
        println!("没有输入任何链接。");
        return Ok(());
    }

    let (cli_sink, done_rx) = ui::cli::CliSink::new();
    let sinks: Vec<Arc<dyn EventSink>> = vec![cli_sink, Arc::new(LogSink)];
    let orchestrator = Arc::new(Orchestrator::start(
        config.pool_settings(),
        backend,
        tools,
        sinks,
    )?);
    register_shutdown(&log, &orchestrator);

    let result = ui::cli::run(&orchestrator, &done_rx, &urls, &options)?;
    orchestrator.shutdown();
    if result.failed > 0 {
        return Err(anyhow!("{} 个任务下载失败", result.failed));
    }
    Ok(())
}

#[cfg(feature = "web")]
fn run_server(
    log: &LogSystem,
    config: &Config,
    backend: Arc<YtDlpBackend>,
    tools: Toolchain,
    options: SubmitOptions,
) -> Result<()> {
    let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(LogSink)];
    let orchestrator = Arc::new(Orchestrator::start(
        config.pool_settings(),
        backend,
        tools,
        sinks,
    )?);
    register_shutdown(log, &orchestrator);
    ui::web::run(orchestrator, options)
}

#[cfg(not(feature = "web"))]
fn run_server(
    _log: &LogSystem,
    _config: &Config,
    _backend: Arc<YtDlpBackend>,
    _tools: Toolchain,
    _options: SubmitOptions,
) -> Result<()> {
    Err(anyhow!("此版本未启用 web 功能，请使用 --features web 重新编译"))
}

fn init_logging(cli: &Cli, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug: cli.debug,
        use_color: io::stderr().is_terminal(),
        archive_on_exit: true,
        // 命令行模式下进度条占用终端
        console: cli.server || cli.debug,
    };
    LogSystem::init_with_base(opts, base_dir).map_err(|e| anyhow!(e))
}

fn register_shutdown(log: &LogSystem, orchestrator: &Arc<Orchestrator>) {
    let orchestrator = Arc::clone(orchestrator);
    log.add_exit_hook(move || {
        let report = orchestrator.shutdown();
        if report.cancelled > 0 || report.abandoned_workers > 0 {
            info!(
                target: "startup",
                "已取消 {} 个任务，{} 个下载线程未及时退出",
                report.cancelled,
                report.abandoned_workers
            );
        }
    });
}

fn submit_options(cli: &Cli, config: &Config) -> Result<SubmitOptions> {
    let mut options = config.submit_options();
    if let Some(raw) = cli.quality.as_deref() {
        options.quality = raw.parse::<Quality>()?;
    }
    if let Some(dir) = &cli.output {
        options.destination = dir.clone();
    }
    if cli.no_accelerator {
        options.use_accelerator = false;
    }
    Ok(options)
}

/// 链接来源依次为：命令行参数、`--file`、标准输入。
fn collect_urls(cli: &Cli) -> Result<Vec<String>> {
    let mut urls: Vec<String> = cli.urls.iter().flat_map(|u| split_batch(u)).collect();
    if let Some(path) = &cli.file {
        let text = fs::read_to_string(path)
            .with_context(|| format!("读取链接文件失败: {}", path.display()))?;
        urls.extend(split_batch(&text));
    }
    if !urls.is_empty() {
        return Ok(urls);
    }

    let stdin = io::stdin();
    if stdin.is_terminal() {
        println!("请输入视频链接（每行一个，空行结束）：");
        io::stdout().flush()?;
        for line in stdin.lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                break;
            }
            urls.extend(split_batch(&line));
        }
    } else {
        let text = io::read_to_string(stdin)?;
        urls.extend(split_batch(&text));
    }
    Ok(urls)
}
