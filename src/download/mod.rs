//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`        — 数据模型（Job / 状态 / 进度 / 元数据 / 错误）
//! - `quality`       — 画质档位与格式选择表达式
//! - `backend`       — 外部下载器接口
//! - `ytdlp`         — 基于 yt-dlp 子进程的实现
//! - `progress`      — 进度换算与上报
//! - `events`        — 任务事件与订阅者
//! - `engine`        — 单个任务的下载主流程
//! - `orchestrator`  — 提交、调度、取消与退出

#![allow(dead_code)]

pub mod backend;
pub mod engine;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod quality;
pub mod ytdlp;

#[cfg(test)]
pub(crate) mod testing;
