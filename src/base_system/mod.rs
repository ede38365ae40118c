#![allow(dead_code)]

pub mod config;
pub mod context;
pub mod logging;
pub mod tool_locator;
pub mod video_url;
