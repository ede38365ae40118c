//! 交互层入口。
//!
//! 包含命令行进度条与 Web API 两套交互实现。

pub mod cli;
#[cfg(feature = "web")]
pub mod web;
