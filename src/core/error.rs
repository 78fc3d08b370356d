use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::core::transport::{TransportError, TransportErrorKind};

/// 适配器拒绝请求时返回的错误
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct AdaptationError {
    pub message: String,
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl AdaptationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), source: None }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self { message: message.into(), source: Some(Arc::new(source)) }
    }
}

/// 下载移动失败的具体原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// 目标目录不存在，且未要求创建中间目录
    MissingDirectory,
    /// 目标文件已存在，且未要求删除旧文件
    FileExists,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::MissingDirectory => write!(f, "目标目录不存在"),
            ConflictReason::FileExists => write!(f, "目标文件已存在"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("请求适配失败: {0}")]
    Adaptation(#[from] AdaptationError),

    #[error("传输错误: {0}")]
    Transport(#[from] TransportError),

    #[error("重试器放弃了决定: {source}")]
    RetrierDeclined { source: Box<Error> },

    #[error("下载目标冲突 {path:?}: {reason}")]
    DestinationConflict { path: PathBuf, reason: ConflictReason },

    #[error("响应校验失败 (状态码 {status}): {reason}")]
    ResponseValidation { status: u16, reason: String },

    #[error("IO错误 {path:?}: {source}")]
    Io { path: PathBuf, source: Arc<io::Error> },

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("无效的请求头 {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("参数编码失败: {0}")]
    Encoding(String),

    #[error("流式消费者只能在收到任何数据之前、且仅对数据请求挂载一次")]
    StreamAttach,

    #[error("配置错误: {0}")]
    Config(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io { path: path.into(), source: Arc::new(source) }
    }

    /// 该错误是否允许交给重试器决定
    pub fn is_retry_eligible(&self) -> bool {
        match self {
            Error::Adaptation(_) => true,
            Error::Transport(e) => e.kind != TransportErrorKind::Cancelled,
            Error::ResponseValidation { .. } => true,
            Error::Io { .. } => true,
            Error::RetrierDeclined { .. }
            | Error::DestinationConflict { .. }
            | Error::InvalidUrl(_)
            | Error::InvalidHeader { .. }
            | Error::Encoding(_)
            | Error::StreamAttach
            | Error::Config(_) => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Transport(e) if e.kind == TransportErrorKind::Cancelled)
    }

    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Error::Transport(e) => Some(e.kind),
            _ => None,
        }
    }
}

pub type FetchResult<T> = Result<T, Error>;
