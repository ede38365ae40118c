//! 外部工具（yt-dlp / aria2c / ffmpeg）定位。
//!
//! 查找顺序：
//! 1. 配置中显式指定的可执行文件路径；
//! 2. 默认 `PATH`；
//! 3. 各平台的包管理器 / 手动安装目录。
//!
//! 找到但不在 `PATH` 中的工具，其目录会记录在 [`Toolchain`] 里，
//! 由下载引擎在启动子进程时拼进子进程的 `PATH`，不修改本进程的环境变量。

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

pub const EXTRACTOR: &str = "yt-dlp";
pub const ACCELERATOR: &str = "aria2c";
pub const TRANSCODER: &str = "ffmpeg";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTool {
    pub path: PathBuf,
    /// 是否能直接通过默认 `PATH` 找到。
    pub on_default_path: bool,
}

impl ResolvedTool {
    pub fn dir(&self) -> Option<&Path> {
        self.path.parent().filter(|p| !p.as_os_str().is_empty())
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
enum Candidate {
    /// 直接在该目录下找 `<tool>` 可执行文件。
    Dir(PathBuf),
    /// 在 `root` 下名字以 `prefix` 开头的子目录（及其下一层）里找，
    /// 对应 WinGet 之类按版本号命名的安装目录。
    PackageRoot { root: PathBuf, prefix: String },
}

/// 一次查找所用的搜索范围。
#[derive(Debug, Clone, Default)]
pub struct ToolSearch {
    path_var: Option<OsString>,
    extra_dirs: Vec<PathBuf>,
    use_system_fallbacks: bool,
}

impl ToolSearch {
    /// 使用当前进程的 `PATH`，再加上平台默认的安装目录。
    pub fn from_env(extra_dirs: &[PathBuf]) -> Self {
        Self {
            path_var: env::var_os("PATH"),
            extra_dirs: extra_dirs.to_vec(),
            use_system_fallbacks: true,
        }
    }

    /// 只在给定的 `PATH` 字符串与额外目录中查找（不含平台默认目录）。
    pub fn isolated(path_var: Option<OsString>, extra_dirs: &[PathBuf]) -> Self {
        Self {
            path_var,
            extra_dirs: extra_dirs.to_vec(),
            use_system_fallbacks: false,
        }
    }

    /// `resolve(tool_name)`：先查 `PATH`，再按顺序探测候选目录。找不到返回 `None`。
    pub fn resolve(&self, tool: &str) -> Option<ResolvedTool> {
        let names = executable_names(tool);

        if let Some(path_var) = self.path_var.as_ref() {
            for dir in env::split_paths(path_var) {
                if let Some(found) = find_in_dir(&dir, &names) {
                    return Some(ResolvedTool {
                        path: found,
                        on_default_path: true,
                    });
                }
            }
        }

        for candidate in self.candidates(tool) {
            let found = match &candidate {
                Candidate::Dir(dir) => find_in_dir(dir, &names),
                Candidate::PackageRoot { root, prefix } => find_in_package_root(root, prefix, &names),
            };
            if let Some(path) = found {
                debug!(target: "tools", tool, path = %path.display(), "found outside PATH");
                return Some(ResolvedTool {
                    path,
                    on_default_path: false,
                });
            }
        }

        None
    }

    /// 解析用户显式配置的可执行文件。文件名不要求与工具名一致。
    pub fn resolve_explicit(&self, configured: &str) -> Option<ResolvedTool> {
        let configured = configured.trim();
        if configured.is_empty() {
            return None;
        }
        let path = PathBuf::from(configured);
        if path.components().count() > 1 || path.is_absolute() {
            return is_executable(&path).then(|| ResolvedTool {
                on_default_path: false,
                path,
            });
        }
        self.resolve(configured)
    }

    fn candidates(&self, tool: &str) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = self.extra_dirs.iter().cloned().map(Candidate::Dir).collect();
        if self.use_system_fallbacks {
            out.extend(system_candidates(tool));
        }
        out
    }
}

fn package_name(tool: &str) -> &str {
    match tool {
        ACCELERATOR => "aria2",
        other => other,
    }
}

#[cfg(windows)]
fn system_candidates(tool: &str) -> Vec<Candidate> {
    let pkg = package_name(tool);
    let mut out = Vec::new();
    if let Some(local) = env::var_os("LOCALAPPDATA").map(PathBuf::from) {
        let winget = local.join("Microsoft").join("WinGet");
        out.push(Candidate::PackageRoot {
            root: winget.join("Packages"),
            prefix: pkg.to_string(),
        });
        out.push(Candidate::Dir(winget.join("Links")));
    }
    out.push(Candidate::Dir(PathBuf::from(r"C:\ProgramData\chocolatey\bin")));
    if let Some(home) = env::var_os("USERPROFILE").map(PathBuf::from) {
        let scoop = home.join("scoop");
        out.push(Candidate::Dir(scoop.join("apps").join(pkg).join("current")));
        out.push(Candidate::Dir(scoop.join("apps").join(pkg).join("current").join("bin")));
        out.push(Candidate::Dir(scoop.join("shims")));
    }
    out.push(Candidate::Dir(PathBuf::from(r"C:\Program Files").join(pkg)));
    out.push(Candidate::Dir(PathBuf::from(r"C:\Program Files").join(pkg).join("bin")));
    out.push(Candidate::Dir(PathBuf::from(r"C:\").join(pkg)));
    out.push(Candidate::Dir(PathBuf::from(r"C:\").join(pkg).join("bin")));
    out
}

#[cfg(not(windows))]
fn system_candidates(tool: &str) -> Vec<Candidate> {
    let pkg = package_name(tool);
    let mut out = vec![
        Candidate::Dir(PathBuf::from("/usr/local/bin")),
        Candidate::Dir(PathBuf::from("/opt/homebrew/bin")),
        Candidate::Dir(PathBuf::from("/usr/bin")),
        Candidate::Dir(PathBuf::from("/snap/bin")),
        Candidate::Dir(PathBuf::from("/opt/local/bin")),
        Candidate::Dir(PathBuf::from("/opt").join(pkg).join("bin")),
    ];
    if let Some(home) = dirs::home_dir() {
        out.push(Candidate::Dir(home.join(".local").join("bin")));
        out.push(Candidate::Dir(home.join("bin")));
    }
    out
}

fn executable_names(tool: &str) -> Vec<String> {
    let has_ext = Path::new(tool).extension().is_some();
    if cfg!(windows) && !has_ext {
        vec![format!("{tool}.exe"), format!("{tool}.EXE"), tool.to_string()]
    } else {
        vec![tool.to_string()]
    }
}

fn find_in_dir(dir: &Path, names: &[String]) -> Option<PathBuf> {
    if dir.as_os_str().is_empty() {
        return None;
    }
    names
        .iter()
        .map(|n| dir.join(n))
        .find(|p| is_executable(p))
}

fn find_in_package_root(root: &Path, prefix: &str, names: &[String]) -> Option<PathBuf> {
    let Ok(rd) = fs::read_dir(root) else {
        return None;
    };
    let prefix = prefix.to_ascii_lowercase();
    let mut dirs: Vec<PathBuf> = rd
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .to_ascii_lowercase()
                .starts_with(&prefix)
        })
        .map(|e| e.path())
        .collect();
    dirs.sort();

    for pkg_dir in dirs {
        if let Some(found) = find_in_dir(&pkg_dir, names) {
            return Some(found);
        }
        let Ok(sub) = fs::read_dir(&pkg_dir) else {
            continue;
        };
        let mut subdirs: Vec<PathBuf> = sub
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        subdirs.sort();
        if let Some(found) = subdirs.iter().find_map(|d| find_in_dir(d, names)) {
            return Some(found);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// ffmpeg 的可执行文件名不是 `ffmpeg(.exe)` 时（例如 `ffmpeg-linux64-v4.2`），
/// 在同目录下复制一份标准文件名，供下游按名字查找。
///
/// 失败只记录日志并返回原路径。
pub fn ensure_conventional_name(tool: &ResolvedTool, conventional: &str) -> ResolvedTool {
    let stem = tool
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if stem == conventional.to_ascii_lowercase() {
        return tool.clone();
    }
    let Some(dir) = tool.dir() else {
        return tool.clone();
    };

    let file_name = if cfg!(windows) {
        format!("{conventional}.exe")
    } else {
        conventional.to_string()
    };
    let standard = dir.join(file_name);
    if !standard.exists() {
        match fs::copy(&tool.path, &standard) {
            Ok(_) => info!(target: "tools", "已创建 {}: {}", conventional, standard.display()),
            Err(err) => {
                warn!(target: "tools", "无法创建 {} 副本 {}: {}", conventional, standard.display(), err);
                return tool.clone();
            }
        }
    }
    ResolvedTool {
        path: standard,
        on_default_path: tool.on_default_path,
    }
}

/// 启动时解析一次的外部工具集合；按值传给每个下载线程。
#[derive(Debug, Clone, Default, Serialize)]
pub struct Toolchain {
    pub extractor: Option<ResolvedTool>,
    pub accelerator: Option<ResolvedTool>,
    pub transcoder: Option<ResolvedTool>,
}

/// 各工具的显式配置路径（空字符串表示自动查找）。
#[derive(Debug, Clone, Default)]
pub struct ToolOverrides {
    pub extractor: String,
    pub accelerator: String,
    pub transcoder: String,
}

impl Toolchain {
    pub fn probe(search: &ToolSearch, overrides: &ToolOverrides) -> Self {
        let lookup = |configured: &str, name: &str| {
            search
                .resolve_explicit(configured)
                .or_else(|| search.resolve(name))
        };

        let extractor = lookup(&overrides.extractor, EXTRACTOR);
        let accelerator = lookup(&overrides.accelerator, ACCELERATOR);
        let transcoder = lookup(&overrides.transcoder, TRANSCODER)
            .map(|t| ensure_conventional_name(&t, TRANSCODER));

        for (name, tool) in [
            (EXTRACTOR, &extractor),
            (ACCELERATOR, &accelerator),
            (TRANSCODER, &transcoder),
        ] {
            match tool {
                Some(t) => info!(target: "tools", "{name}: {}", t.path.display()),
                None => warn!(target: "tools", "{name}: 未找到"),
            }
        }

        Self {
            extractor,
            accelerator,
            transcoder,
        }
    }

    /// 不在默认 `PATH` 上的工具目录，按发现顺序去重。
    pub fn extra_path_dirs(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Vec::new();
        for tool in [&self.extractor, &self.accelerator, &self.transcoder]
            .into_iter()
            .flatten()
        {
            if tool.on_default_path {
                continue;
            }
            if let Some(dir) = tool.dir()
                && !out.iter().any(|d| d == dir)
            {
                out.push(dir.to_path_buf());
            }
        }
        out
    }

    /// 子进程使用的 `PATH`：额外目录在前，原 `PATH` 在后。无额外目录时返回 `None`。
    pub fn child_path_env(&self) -> Option<OsString> {
        let extra = self.extra_path_dirs();
        if extra.is_empty() {
            return None;
        }
        let current = env::var_os("PATH").unwrap_or_default();
        let mut all = extra;
        all.extend(env::split_paths(&current));
        env::join_paths(all).ok()
    }

    /// 启动前的依赖检查结果。
    pub fn preflight(&self, require_transcoder: bool) -> PreflightReport {
        let mut warnings = Vec::new();
        if self.extractor.is_none() {
            warnings.push(format!("未找到 {EXTRACTOR}，将尝试直接调用，下载可能全部失败"));
        }
        if self.accelerator.is_none() {
            warnings.push(format!("{ACCELERATOR} 未安装，将使用默认下载器"));
        }
        if self.transcoder.is_none() {
            if require_transcoder {
                warnings.push(format!("未检测到 {TRANSCODER}，需要转码的任务将失败"));
            } else {
                warnings.push(format!(
                    "未检测到 {TRANSCODER}，将只下载单文件格式且不做转码"
                ));
            }
        }
        PreflightReport {
            extractor: self.extractor.as_ref().map(|t| t.path.clone()),
            accelerator: self.accelerator.as_ref().map(|t| t.path.clone()),
            transcoder: self.transcoder.as_ref().map(|t| t.path.clone()),
            accelerator_degraded: self.accelerator.is_none(),
            transcoder_missing: self.transcoder.is_none(),
            warnings,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreflightReport {
    pub extractor: Option<PathBuf>,
    pub accelerator: Option<PathBuf>,
    pub transcoder: Option<PathBuf>,
    /// 加速器不可用，启用加速的任务会退回默认下载器。
    pub accelerator_degraded: bool,
    pub transcoder_missing: bool,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_exe(dir: &Path, name: &str) -> PathBuf {
        let file = if cfg!(windows) && Path::new(name).extension().is_none() {
            format!("{name}.exe")
        } else {
            name.to_string()
        };
        let path = dir.join(file);
        fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[test]
    fn finds_tool_on_path_first() {
        let on_path = TempDir::new().unwrap();
        let fallback = TempDir::new().unwrap();
        let expected = fake_exe(on_path.path(), "aria2c");
        fake_exe(fallback.path(), "aria2c");

        let search = ToolSearch::isolated(
            Some(env::join_paths([on_path.path()]).unwrap()),
            &[fallback.path().to_path_buf()],
        );
        let found = search.resolve("aria2c").unwrap();
        assert_eq!(found.path, expected);
        assert!(found.on_default_path);
    }

    #[test]
    fn falls_back_to_extra_dirs_in_order() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        fake_exe(second.path(), "ffmpeg");
        let expected = fake_exe(first.path(), "ffmpeg");

        let search = ToolSearch::isolated(
            None,
            &[first.path().to_path_buf(), second.path().to_path_buf()],
        );
        let found = search.resolve("ffmpeg").unwrap();
        assert_eq!(found.path, expected);
        assert!(!found.on_default_path);
    }

    #[test]
    fn missing_tool_is_none_not_error() {
        let empty = TempDir::new().unwrap();
        let search = ToolSearch::isolated(
            Some(env::join_paths([empty.path()]).unwrap()),
            &[empty.path().to_path_buf()],
        );
        assert_eq!(search.resolve("aria2c"), None);
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("aria2c"), b"not executable").unwrap();
        let search = ToolSearch::isolated(None, &[dir.path().to_path_buf()]);
        assert_eq!(search.resolve("aria2c"), None);
    }

    #[test]
    fn package_root_matches_versioned_subdirectory() {
        let root = TempDir::new().unwrap();
        let nested = root.path().join("aria2.aria2_abc123").join("aria2-1.37.0-win-64bit");
        fs::create_dir_all(&nested).unwrap();
        let expected = fake_exe(&nested, "aria2c");

        let names = executable_names("aria2c");
        let found = find_in_package_root(root.path(), "aria2", &names);
        assert_eq!(found, Some(expected));
    }

    #[test]
    fn transcoder_gets_conventional_copy() {
        let dir = TempDir::new().unwrap();
        let odd = fake_exe(dir.path(), "ffmpeg-linux64-v4.2.2");
        let tool = ResolvedTool {
            path: odd,
            on_default_path: false,
        };

        let fixed = ensure_conventional_name(&tool, "ffmpeg");
        assert_eq!(
            fixed.path.file_stem().unwrap().to_string_lossy(),
            "ffmpeg"
        );
        assert!(fixed.path.exists());
        assert_eq!(fixed.dir(), Some(dir.path()));
    }

    #[test]
    fn conventional_name_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let path = fake_exe(dir.path(), "ffmpeg");
        let tool = ResolvedTool {
            path: path.clone(),
            on_default_path: true,
        };
        assert_eq!(ensure_conventional_name(&tool, "ffmpeg").path, path);
    }

    #[test]
    fn extra_path_dirs_skip_default_path_tools_and_dedupe() {
        let chain = Toolchain {
            extractor: Some(ResolvedTool {
                path: PathBuf::from("/usr/bin/yt-dlp"),
                on_default_path: true,
            }),
            accelerator: Some(ResolvedTool {
                path: PathBuf::from("/opt/tools/aria2c"),
                on_default_path: false,
            }),
            transcoder: Some(ResolvedTool {
                path: PathBuf::from("/opt/tools/ffmpeg"),
                on_default_path: false,
            }),
        };
        assert_eq!(chain.extra_path_dirs(), vec![PathBuf::from("/opt/tools")]);
        assert!(chain.child_path_env().is_some());
    }

    #[test]
    fn preflight_marks_missing_accelerator_as_degraded() {
        let chain = Toolchain {
            extractor: Some(ResolvedTool {
                path: PathBuf::from("/usr/bin/yt-dlp"),
                on_default_path: true,
            }),
            accelerator: None,
            transcoder: Some(ResolvedTool {
                path: PathBuf::from("/usr/bin/ffmpeg"),
                on_default_path: true,
            }),
        };
        let report = chain.preflight(false);
        assert!(report.accelerator_degraded);
        assert!(!report.transcoder_missing);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains(ACCELERATOR));
    }

    #[test]
    fn preflight_warns_when_transcoder_missing() {
        let report = Toolchain::default().preflight(true);
        assert!(report.transcoder_missing);
        assert!(report.warnings.iter().any(|w| w.contains(TRANSCODER)));
    }
}
