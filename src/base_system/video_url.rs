//! 视频链接解析与规范化。
//!
//! 同一个视频可能以多种链接形式提交（watch / youtu.be / shorts ...），
//! 这里统一成一个规范 URL，作为任务 ID 与去重依据。

use regex::Regex;
use std::sync::OnceLock;

static RE_URL: OnceLock<Regex> = OnceLock::new();
static RE_WATCH: OnceLock<Regex> = OnceLock::new();
static RE_SHORT: OnceLock<Regex> = OnceLock::new();
static RE_PATH: OnceLock<Regex> = OnceLock::new();
static RE_LIST: OnceLock<Regex> = OnceLock::new();

fn re_url() -> &'static Regex {
    RE_URL.get_or_init(|| Regex::new(r"(?i)https?://\S+").expect("compile RE_URL"))
}

fn re_watch() -> &'static Regex {
    RE_WATCH.get_or_init(|| {
        Regex::new(r"(?i)youtube\.com/watch\S*?[?&]v=([A-Za-z0-9_-]+)").expect("compile RE_WATCH")
    })
}

fn re_short() -> &'static Regex {
    RE_SHORT.get_or_init(|| Regex::new(r"(?i)youtu\.be/([A-Za-z0-9_-]+)").expect("compile RE_SHORT"))
}

fn re_path() -> &'static Regex {
    RE_PATH.get_or_init(|| {
        Regex::new(r"(?i)youtube\.com/(?:shorts|live|embed|v)/([A-Za-z0-9_-]+)")
            .expect("compile RE_PATH")
    })
}

fn re_list() -> &'static Regex {
    RE_LIST.get_or_init(|| {
        Regex::new(r"(?i)youtube\.com/\S*?[?&]list=([A-Za-z0-9_-]+)").expect("compile RE_LIST")
    })
}

pub const WATCH_PREFIX: &str = "https://www.youtube.com/watch?v=";
pub const PLAYLIST_PREFIX: &str = "https://www.youtube.com/playlist?list=";

/// 把一行输入规范化为任务 ID。
///
/// 输入必须包含 `host_markers` 中的任一域名标记，否则视为无效链接返回 `None`。
/// YouTube 的各种单视频链接统一为 `watch?v=<id>`，纯播放列表链接统一为
/// `playlist?list=<id>`；其它带域名标记的链接原样保留（补全 scheme）。
pub fn normalize_video_url(input: &str, host_markers: &[String]) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    // If user pasted extra text around the URL, try to extract URL first.
    let target = re_url()
        .find(trimmed)
        .map(|m| m.as_str())
        .unwrap_or_else(|| trimmed.split_whitespace().next().unwrap_or(trimmed));

    let lower = target.to_ascii_lowercase();
    if !host_markers
        .iter()
        .map(|m| m.trim().to_ascii_lowercase())
        .any(|m| !m.is_empty() && lower.contains(&m))
    {
        return None;
    }

    if let Some(caps) = re_short().captures(target) {
        return Some(format!("{WATCH_PREFIX}{}", &caps[1]));
    }
    if let Some(caps) = re_path().captures(target) {
        return Some(format!("{WATCH_PREFIX}{}", &caps[1]));
    }
    if let Some(caps) = re_watch().captures(target) {
        return Some(format!("{WATCH_PREFIX}{}", &caps[1]));
    }
    if let Some(caps) = re_list().captures(target) {
        return Some(format!("{PLAYLIST_PREFIX}{}", &caps[1]));
    }

    if lower.starts_with("http://") || lower.starts_with("https://") {
        Some(target.to_string())
    } else {
        Some(format!("https://{target}"))
    }
}

/// 拆分批量输入：按行（以及逗号/空白）切分，去掉空项。
pub fn split_batch(text: &str) -> Vec<String> {
    text.split(|c: char| c == '\n' || c == '\r' || c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
