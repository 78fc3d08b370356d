//! Core: 请求执行引擎
//!
//! - `session_manager`: 请求工厂，负责适配、派发、重试
//! - `session_delegate`: 传输层回调的唯一接收端，按任务编号分发
//! - `request`: 一次逻辑请求（可能跨越多个底层任务）的生命周期
//! - `task`: 单个底层任务累计的数据、进度与错误
//! - `transport`: 底层网络原语及其 reqwest 实现

pub mod description;
pub mod encoding;
pub mod error;
pub mod observe;
pub mod policy;
pub mod request;
pub mod response;
pub mod retry;
pub mod session_delegate;
pub mod session_manager;
pub mod task;
pub mod transport;

pub use description::RequestDescription;
pub use encoding::{ParameterEncoding, Parameters};
pub use error::{AdaptationError, ConflictReason, Error, FetchResult};
pub use observe::{LoggingObserver, RequestObserver};
pub use policy::{
    AsyncRequestRetrier, AsyncRetrier, HeaderAdapter, RequestAdapter, RequestRetrier,
    RetryResponder, RetryVerdict,
};
pub use request::{Request, RequestPhase, Validation, ValidationContext};
pub use response::{DataResponse, DownloadResponse, Timeline};
pub use retry::ExponentialBackoffRetrier;
pub use session_delegate::{CacheHandler, ChallengeHandler, RedirectHandler, SessionDelegate, SessionHooks};
pub use session_manager::{SessionManager, SessionManagerBuilder};
pub use task::{
    fixed_destination, suggested_destination, suggested_filename, DownloadDestination,
    DownloadOptions, Progress,
};
pub use transport::{HttpTransport, ResumeData, Transport, TransportError, TransportErrorKind};
