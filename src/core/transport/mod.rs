//! Transport: 底层网络原语的抽象
//!
//! 引擎本身不解析 HTTP，也不做 TLS 或连接池；这些都交给实现了 [`Transport`] 的原语。
//! 原语负责创建带稳定编号的任务、执行恢复/暂停/取消，并把回调投递给唯一注册的
//! [`TransportEvents`] 接收端。同一任务的回调必须按 响应 → 数据块 → 完成 的顺序串行投递。

pub mod client;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use thiserror::Error;
use url::Url;

use crate::core::description::RequestDescription;

pub use self::client::HttpTransport;

/// 底层任务的不透明编号，传输层保证注册期间不会复用
pub type TaskId = u64;

/// 传输错误的分类
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Timeout,
    Reset,
    Read,
    Redirect,
    Cancelled,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Timeout => "timeout",
            Self::Reset => "reset",
            Self::Read => "read",
            Self::Redirect => "redirect",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// 断点续传所需的状态
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    pub url: Url,
    /// 已写入部分数据的临时文件
    pub partial_path: PathBuf,
    pub bytes_received: u64,
    /// ETag 或 Last-Modified，用作 If-Range
    pub validator: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    /// 下载任务失败时传输层能提供的续传状态
    pub resume_data: Option<ResumeData>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), resume_data: None }
    }

    pub fn cancelled() -> Self {
        Self::new(TransportErrorKind::Cancelled, "任务已取消")
    }

    pub fn with_resume_data(mut self, resume_data: ResumeData) -> Self {
        self.resume_data = Some(resume_data);
        self
    }
}

/// 任务类型，决定传输层如何处理响应体
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskKind {
    Data,
    Download { resume: Option<ResumeData> },
}

/// 传输层收到的响应头
#[derive(Clone, Debug)]
pub struct ResponseHead {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap) -> Self {
        Self { url, status, headers }
    }

    /// 响应声明的内容长度，未声明时为 None
    pub fn expected_content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
    }
}

/// 认证质询
#[derive(Clone, Debug)]
pub struct AuthChallenge {
    pub url: Url,
    /// WWW-Authenticate 的原始值
    pub scheme: String,
    pub realm: Option<String>,
    pub previous_failure_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub password: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChallengeDisposition {
    UseCredential,
    PerformDefaultHandling,
    CancelAuthenticationChallenge,
    RejectProtectionSpace,
}

/// 一次网络操作
pub trait TransportTask: Send + Sync {
    fn id(&self) -> TaskId;
    fn resume(&self);
    fn suspend(&self);
    fn cancel(&self);
}

/// 传输层回调的唯一接收端
pub trait TransportEvents: Send + Sync {
    fn did_receive_response(&self, task: TaskId, response: ResponseHead);

    fn did_receive_data(&self, task: TaskId, chunk: Bytes);

    /// 返回 false 表示不缓存该响应
    fn will_cache_response(&self, task: TaskId, response: &ResponseHead) -> bool;

    /// 返回 None 表示拒绝跟随重定向
    fn will_perform_redirection(
        &self,
        task: TaskId,
        response: &ResponseHead,
        request: RequestDescription,
    ) -> Option<RequestDescription>;

    fn did_receive_challenge(
        &self,
        task: TaskId,
        challenge: &AuthChallenge,
    ) -> (ChallengeDisposition, Option<Credential>);

    fn did_finish_downloading(&self, task: TaskId, location: PathBuf);

    fn did_complete(&self, task: TaskId, error: Option<TransportError>);
}

/// 底层网络原语
pub trait Transport: Send + Sync + 'static {
    /// 注册唯一的回调接收端，由 SessionManager 在构造时调用一次
    fn register(&self, events: Weak<dyn TransportEvents>);

    /// 创建一个处于暂停状态的任务
    fn create_task(
        &self,
        request: &RequestDescription,
        kind: &TaskKind,
    ) -> Result<Arc<dyn TransportTask>, TransportError>;

    /// 会话失效，取消所有未完成的任务
    fn invalidate_and_cancel(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_content_length() {
        let mut headers = HeaderMap::new();
        let url = Url::parse("https://example.com/a").unwrap();
        let head = ResponseHead::new(url.clone(), StatusCode::OK, headers.clone());
        assert_eq!(head.expected_content_length(), None);

        headers.insert(http::header::CONTENT_LENGTH, "1024".parse().unwrap());
        let head = ResponseHead::new(url, StatusCode::OK, headers);
        assert_eq!(head.expected_content_length(), Some(1024));
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::new(TransportErrorKind::Timeout, "读取超时");
        assert_eq!(err.to_string(), "timeout: 读取超时");
        assert!(TransportError::cancelled().resume_data.is_none());
    }
}
