//! 画质档位与 yt-dlp 格式选择表达式。
//!
//! 每个档位对应一条按顺序回退的格式链，第一项可用的即被选中：
//! 1. mp4 视频 + m4a 音频（不超过目标高度）
//! 2. 任意视频 + m4a 音频
//! 3. 任意视频 + 任意音频
//! 4. 不超过目标高度的单文件
//! 5. 任意单文件
//!
//! 偏好 m4a 是因为后处理统一把音频转成 AAC，输入已是 AAC 时少一次重编码。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::models::AvailableFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Quality {
    #[default]
    Best,
    P1080,
    P720,
    P480,
    P360,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown quality profile '{0}', expected one of: best, 1080p, 720p, 480p, 360p")]
pub struct UnknownQuality(pub String);

impl Quality {
    pub const ALL: [Quality; 5] = [
        Quality::Best,
        Quality::P1080,
        Quality::P720,
        Quality::P480,
        Quality::P360,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::P1080 => "1080p",
            Self::P720 => "720p",
            Self::P480 => "480p",
            Self::P360 => "360p",
        }
    }

    pub fn height_ceiling(self) -> Option<u32> {
        match self {
            Self::Best => None,
            Self::P1080 => Some(1080),
            Self::P720 => Some(720),
            Self::P480 => Some(480),
            Self::P360 => Some(360),
        }
    }

    /// 需要合并 / 转码能力的完整格式链。
    pub fn format_chain(self) -> FormatChain {
        let h = self.height_ceiling();
        let mut tiers = vec![
            FormatTier::Pair {
                video: StreamFilter::new(h, Some("mp4")),
                audio: StreamFilter::new(None, Some("m4a")),
            },
            FormatTier::Pair {
                video: StreamFilter::new(h, None),
                audio: StreamFilter::new(None, Some("m4a")),
            },
            FormatTier::Pair {
                video: StreamFilter::new(h, None),
                audio: StreamFilter::any(),
            },
        ];
        tiers.extend(single_tiers(h));
        FormatChain { tiers }
    }

    /// 没有转码器时只能选择音视频合一的单文件。
    pub fn combined_chain(self) -> FormatChain {
        FormatChain {
            tiers: single_tiers(self.height_ceiling()),
        }
    }
}

fn single_tiers(h: Option<u32>) -> Vec<FormatTier> {
    match h {
        Some(_) => vec![
            FormatTier::Single(StreamFilter::new(h, None)),
            FormatTier::Single(StreamFilter::any()),
        ],
        None => vec![FormatTier::Single(StreamFilter::any())],
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Quality {
    type Err = UnknownQuality;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best" | "highest" | "最高画质" => Ok(Self::Best),
            "1080p" | "1080" => Ok(Self::P1080),
            "720p" | "720" => Ok(Self::P720),
            "480p" | "480" => Ok(Self::P480),
            "360p" | "360" => Ok(Self::P360),
            _ => Err(UnknownQuality(s.trim().to_string())),
        }
    }
}

impl From<Quality> for String {
    fn from(q: Quality) -> Self {
        q.name().to_string()
    }
}

impl TryFrom<String> for Quality {
    type Error = UnknownQuality;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFilter {
    pub max_height: Option<u32>,
    pub ext: Option<&'static str>,
}

impl StreamFilter {
    pub const fn new(max_height: Option<u32>, ext: Option<&'static str>) -> Self {
        Self { max_height, ext }
    }

    pub const fn any() -> Self {
        Self::new(None, None)
    }

    fn render(&self, out: &mut String) {
        if let Some(h) = self.max_height {
            out.push_str(&format!("[height<={h}]"));
        }
        if let Some(ext) = self.ext {
            out.push_str(&format!("[ext={ext}]"));
        }
    }

    /// 与 yt-dlp 一致：设置了高度上限时，未知高度的格式不匹配。
    fn matches(&self, f: &AvailableFormat) -> bool {
        if let Some(max) = self.max_height {
            match f.height {
                Some(h) if h <= max => {}
                _ => return false,
            }
        }
        match self.ext {
            Some(ext) => f.ext.eq_ignore_ascii_case(ext),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatTier {
    /// `bestvideo[...]+bestaudio[...]`
    Pair {
        video: StreamFilter,
        audio: StreamFilter,
    },
    /// `best[...]`
    Single(StreamFilter),
}

impl FormatTier {
    pub fn expression(&self) -> String {
        let mut out = String::new();
        match self {
            Self::Pair { video, audio } => {
                out.push_str("bestvideo");
                video.render(&mut out);
                out.push_str("+bestaudio");
                audio.render(&mut out);
            }
            Self::Single(filter) => {
                out.push_str("best");
                filter.render(&mut out);
            }
        }
        out
    }

    pub fn needs_merge(&self) -> bool {
        matches!(self, Self::Pair { .. })
    }

    fn pick(&self, formats: &[AvailableFormat]) -> Option<Vec<String>> {
        match self {
            Self::Pair { video, audio } => {
                let v = best_by(formats, |f| f.has_video() && !f.has_audio() && video.matches(f))?;
                let a = best_by(formats, |f| f.has_audio() && !f.has_video() && audio.matches(f))?;
                Some(vec![v.format_id.clone(), a.format_id.clone()])
            }
            Self::Single(filter) => {
                let f = best_by(formats, |f| f.has_video() && f.has_audio() && filter.matches(f))?;
                Some(vec![f.format_id.clone()])
            }
        }
    }
}

/// 高度优先，其次码率；都相同时取列表中靠后的（yt-dlp 的格式列表按质量升序）。
fn best_by<F>(formats: &[AvailableFormat], accept: F) -> Option<&AvailableFormat>
where
    F: Fn(&AvailableFormat) -> bool,
{
    formats.iter().filter(|f| accept(f)).max_by(|a, b| {
        let ka = (a.height.unwrap_or(0), a.tbr.unwrap_or(0.0));
        let kb = (b.height.unwrap_or(0), b.tbr.unwrap_or(0.0));
        ka.0.cmp(&kb.0)
            .then(ka.1.partial_cmp(&kb.1).unwrap_or(std::cmp::Ordering::Equal))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatChain {
    tiers: Vec<FormatTier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFormat {
    pub tier_index: usize,
    pub tier: FormatTier,
    pub format_ids: Vec<String>,
}

impl FormatChain {
    pub fn tiers(&self) -> &[FormatTier] {
        &self.tiers
    }

    /// 传给 `yt-dlp -f` 的完整表达式。
    pub fn expression(&self) -> String {
        self.tiers
            .iter()
            .map(FormatTier::expression)
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn needs_merge(&self) -> bool {
        self.tiers.iter().any(FormatTier::needs_merge)
    }

    /// 针对已知的格式列表离线求出会命中的档位。
    pub fn resolve(&self, formats: &[AvailableFormat]) -> Option<ResolvedFormat> {
        self.tiers.iter().enumerate().find_map(|(idx, tier)| {
            tier.pick(formats).map(|ids| ResolvedFormat {
                tier_index: idx,
                tier: *tier,
                format_ids: ids,
            })
        })
    }
}
