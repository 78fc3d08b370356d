//! minifetch: 可重试的 HTTP 请求执行引擎
//!
//! 引擎把声明式的请求描述交给可插拔的传输层执行，失败后询问重试器，
//! 由同一个 [`Request`] 跨越多次底层尝试，调用方看到的始终只有最后一次尝试的结果。

pub mod cli;
pub mod config;
pub mod core;
pub mod ui;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use crate::config::Config;
pub use crate::core::{
    DataResponse, DownloadResponse, Error, ExponentialBackoffRetrier, FetchResult, HttpTransport,
    Request, RequestDescription, SessionManager,
};
